//! `${{ ... }}` expression substitution and secret masking.

use regex::Regex;
use std::collections::HashMap;
use std::sync::LazyLock;

static EXPRESSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*([^}]+?)\s*\}\}").expect("expression pattern is valid")
});

/// Values visible to expressions for a single job instance.
#[derive(Debug, Clone, Default)]
pub struct InterpolationContext {
    /// Pipeline and job variables
    pub variables: HashMap<String, String>,
    /// Matrix values for the current instance
    pub matrix: HashMap<String, String>,
    /// Secrets to mask in output
    pub secrets: HashMap<String, String>,
}

impl InterpolationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_variables(mut self, variables: HashMap<String, String>) -> Self {
        self.variables.extend(variables);
        self
    }

    pub fn with_matrix(mut self, matrix: HashMap<String, String>) -> Self {
        self.matrix = matrix;
        self
    }

    pub fn with_secrets(mut self, secrets: HashMap<String, String>) -> Self {
        self.secrets = secrets;
        self
    }

    /// Interpolate expressions in a string.
    ///
    /// Supports:
    /// - `${{ name }}` - variable lookup
    /// - `${{ env.NAME }}` - variable lookup falling back to the process environment
    /// - `${{ matrix.axis }}` - matrix value
    /// - `${{ secrets.NAME }}` - secret value
    ///
    /// Unknown names resolve to an empty string.
    pub fn interpolate(&self, input: &str) -> String {
        EXPRESSION
            .replace_all(input, |caps: &regex::Captures| {
                let expr = caps.get(1).map_or("", |m| m.as_str()).trim();
                self.resolve_expression(expr)
            })
            .to_string()
    }

    fn resolve_expression(&self, expr: &str) -> String {
        if let Some(var_name) = expr.strip_prefix("env.") {
            return self
                .variables
                .get(var_name)
                .cloned()
                .or_else(|| std::env::var(var_name).ok())
                .unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("matrix.") {
            return self.matrix.get(key).cloned().unwrap_or_default();
        }

        if let Some(key) = expr.strip_prefix("secrets.") {
            return self.secrets.get(key).cloned().unwrap_or_default();
        }

        self.variables.get(expr).cloned().unwrap_or_default()
    }

    /// Mask secrets in the input string.
    pub fn mask_secrets(&self, input: &str) -> String {
        mask(input, self.secrets.values())
    }
}

/// Replace every occurrence of each non-empty secret with `***`.
pub fn mask<'a>(input: &str, secrets: impl IntoIterator<Item = &'a String>) -> String {
    let mut output = input.to_string();
    for value in secrets {
        if !value.is_empty() {
            output = output.replace(value.as_str(), "***");
        }
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> InterpolationContext {
        InterpolationContext::new()
            .with_variables(HashMap::from([("TARGET".to_string(), "release".to_string())]))
            .with_matrix(HashMap::from([("os".to_string(), "ubuntu".to_string())]))
            .with_secrets(HashMap::from([("TOKEN".to_string(), "s3cr3t".to_string())]))
    }

    #[test]
    fn test_interpolate_expressions() {
        let ctx = context();
        assert_eq!(ctx.interpolate("core-${{ matrix.os }}"), "core-ubuntu");
        assert_eq!(ctx.interpolate("${{TARGET}}/${{ env.TARGET }}"), "release/release");
        assert_eq!(ctx.interpolate("x${{ matrix.arch }}y"), "xy");
        assert_eq!(ctx.interpolate("no expressions"), "no expressions");
    }

    #[test]
    fn test_mask_secrets() {
        let ctx = context();
        let line = ctx.interpolate("token=${{ secrets.TOKEN }}");
        assert_eq!(ctx.mask_secrets(&line), "token=***");
    }
}
