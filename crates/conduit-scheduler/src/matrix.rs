//! Matrix build expansion.

use crate::dag::DagError;
use conduit_core::pipeline::{JobTemplate, MatrixAssignment, MatrixConfig};
use std::collections::HashSet;

/// Upper bound on the instances a single template may expand into.
pub const MAX_COMBINATIONS: usize = 256;

/// Matrix expander for generating job variants.
#[derive(Debug, Clone, Default)]
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Expand a template into its ordered matrix assignments.
    ///
    /// A template without a matrix yields one empty assignment.
    pub fn expand(&self, template: &JobTemplate) -> Result<Vec<MatrixAssignment>, DagError> {
        let Some(matrix) = &template.matrix else {
            return Ok(vec![MatrixAssignment::new()]);
        };
        let invalid = |reason: String| DagError::InvalidMatrix {
            job: template.name.clone(),
            reason,
        };

        let mut seen = HashSet::new();
        for axis in matrix.dimensions.iter() {
            if !seen.insert(axis.name.as_str()) {
                return Err(invalid(format!("axis '{}' is declared twice", axis.name)));
            }
            if axis.values.is_empty() {
                return Err(invalid(format!("axis '{}' has no values", axis.name)));
            }
        }

        let mut combinations = if matrix.dimensions.is_empty() {
            Vec::new()
        } else {
            self.generate_combinations(matrix)
        };

        combinations.retain(|combo| !matrix.exclude.iter().any(|ex| combo.contains(ex)));

        for include in &matrix.include {
            let include = self.normalize(matrix, include);
            if !combinations.contains(&include) {
                combinations.push(include);
            }
        }

        if combinations.is_empty() {
            return Err(invalid("every combination is excluded".to_string()));
        }
        if combinations.len() > MAX_COMBINATIONS {
            return Err(invalid(format!(
                "{} combinations exceed the limit of {}",
                combinations.len(),
                MAX_COMBINATIONS
            )));
        }

        Ok(combinations)
    }

    /// Cartesian product in axis order, last axis varying fastest.
    fn generate_combinations(&self, matrix: &MatrixConfig) -> Vec<MatrixAssignment> {
        let mut result = vec![MatrixAssignment::new()];

        for axis in matrix.dimensions.iter() {
            let mut next = Vec::with_capacity(result.len() * axis.values.len());
            for combo in &result {
                for value in &axis.values {
                    let mut extended = combo.clone();
                    extended.push(axis.name.clone(), value.clone());
                    next.push(extended);
                }
            }
            result = next;
        }

        result
    }

    /// Reorder an include entry so declared axes come first, in axis order.
    fn normalize(&self, matrix: &MatrixConfig, include: &MatrixAssignment) -> MatrixAssignment {
        let mut normalized = MatrixAssignment::new();
        for axis in matrix.dimensions.iter() {
            if let Some(value) = include.get(&axis.name) {
                normalized.push(axis.name.clone(), value);
            }
        }
        for (axis, value) in include.iter() {
            if !matrix.dimensions.iter().any(|a| a.name == axis) {
                normalized.push(axis, value);
            }
        }
        normalized
    }
}
