//! Cache key and digest utilities.

use sha2::{Digest, Sha256};
use std::path::Path;

/// Build a cache key from an (already interpolated) template and the
/// contents of `hash_files`, resolved relative to `workspace`.
///
/// Without hash files the template is the key. Otherwise the first eight
/// bytes of the content hash are appended, so a lockfile change yields a
/// new key. Missing files contribute only their name.
pub fn cache_key(template: &str, workspace: &Path, hash_files: &[String]) -> String {
    if hash_files.is_empty() {
        return template.to_string();
    }

    let mut hasher = Sha256::new();
    for file in hash_files {
        hasher.update(file.as_bytes());
        if let Ok(contents) = std::fs::read(workspace.join(file)) {
            hasher.update(&contents);
        }
    }
    let hash = hasher.finalize();
    format!("{}-{}", template, hex::encode(&hash[..8]))
}

/// Hex sha256 of a payload.
pub fn digest(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Check if a key matches a prefix pattern.
pub fn matches_prefix(key: &str, prefix: &str) -> bool {
    key.starts_with(prefix)
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            _ => c,
        })
        .collect();
    match sanitized.as_str() {
        "" | "." | ".." => format!("_{}", sanitized),
        _ => sanitized,
    }
}

/// Encode a name as a single path segment, one-to-one.
///
/// ASCII alphanumerics and `-` pass through; every other byte becomes
/// `_xx`. The empty name encodes as a lone `_`.
pub fn encode_segment(name: &str) -> String {
    if name.is_empty() {
        return "_".to_string();
    }
    let mut encoded = String::with_capacity(name.len());
    for byte in name.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            encoded.push(byte as char);
        } else {
            encoded.push_str(&format!("_{:02x}", byte));
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_follows_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Cargo.lock"), "v1").unwrap();

        let files = vec!["Cargo.lock".to_string()];
        let first = cache_key("cargo-linux", dir.path(), &files);
        assert!(first.starts_with("cargo-linux-"));
        assert_eq!(first, cache_key("cargo-linux", dir.path(), &files));

        std::fs::write(dir.path().join("Cargo.lock"), "v2").unwrap();
        assert_ne!(first, cache_key("cargo-linux", dir.path(), &files));
    }

    #[test]
    fn test_cache_key_without_hash_files() {
        assert_eq!(cache_key("deps-v1", Path::new("/nowhere"), &[]), "deps-v1");
    }

    #[test]
    fn test_digest() {
        assert_eq!(
            digest(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_matches_prefix() {
        assert!(matches_prefix("cargo-abc123", "cargo-"));
        assert!(!matches_prefix("npm-abc123", "cargo-"));
    }

    #[test]
    fn test_sanitize_key() {
        assert_eq!(sanitize_key("my/cache/key"), "my_cache_key");
        assert_eq!(sanitize_key("cache:key"), "cache_key");
        assert_eq!(sanitize_key(".."), "_..");
    }

    #[test]
    fn test_encode_segment_is_distinct_per_name() {
        assert_eq!(encode_segment("core-linux"), "core-linux");
        assert_eq!(encode_segment("bin/app"), "bin_2fapp");
        assert_eq!(encode_segment("bin_app"), "bin_5fapp");
        assert_eq!(encode_segment(".."), "_2e_2e");
        assert_eq!(encode_segment(""), "_");

        let names = ["bin/app", "bin_app", "bin:app", "bin_2fapp", "", "_"];
        let encoded: std::collections::HashSet<String> = names.iter().map(|n| encode_segment(n)).collect();
        assert_eq!(encoded.len(), names.len());
    }
}
