//! Glob pattern utilities
//!
//! Rule read-sets and the incremental pattern table are both lists of globs
//! matched against repository-relative, `/`-separated paths.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::path::Path;

/// Check if a string contains glob pattern characters
pub fn is_glob_pattern(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?') || pattern.contains('[') || pattern.contains('{')
}

/// Create a GlobSet from a list of patterns for efficient batch matching
pub fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob =
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {pattern}"))?;
        builder.add(glob);
    }

    Ok(builder.build()?)
}

/// Repository-relative path rendered with `/` separators
pub fn path_key(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_is_glob_pattern() {
        assert!(is_glob_pattern("*.rs"));
        assert!(is_glob_pattern("src/**/*.js"));
        assert!(is_glob_pattern("test?.txt"));
        assert!(is_glob_pattern("file[123].txt"));
        assert!(!is_glob_pattern("simple.txt"));
        assert!(!is_glob_pattern("path/to/file.rs"));
    }

    #[test]
    fn test_build_globset() -> Result<()> {
        let set = build_globset(&["**/*.rs".to_string(), "Cargo.toml".to_string()])?;
        assert!(set.is_match("src/main.rs"));
        assert!(set.is_match("Cargo.toml"));
        assert!(!set.is_match("README.md"));
        Ok(())
    }

    #[test]
    fn test_path_key_uses_forward_slashes() {
        let path: PathBuf = ["src", "rules", "mod.rs"].iter().collect();
        assert_eq!(path_key(&path), "src/rules/mod.rs");
    }

    #[test]
    fn test_invalid_glob_is_reported() {
        assert!(build_globset(&["[".to_string()]).is_err());
    }
}
