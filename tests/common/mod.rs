//! Shared helpers for the integration test suites

use std::path::PathBuf;

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// A dispatcher configuration that passes validation
pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

/// A dispatcher configuration that fails validation
pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_files_present() {
        assert!(fixtures_dir().exists(), "fixtures directory is missing");
        assert!(valid_config_fixture().exists());
        assert!(invalid_config_fixture().exists());
    }
}
