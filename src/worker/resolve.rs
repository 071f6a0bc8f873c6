//! Worker executable resolution and trust policy
//!
//! Bare names are searched on PATH; paths containing a separator are
//! used directly. When the secure policy is active, anything outside
//! /usr must be owned by the invoking user and live in their home
//! directory.

use std::env;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::unistd::geteuid;
use tracing::debug;

use crate::error::{Error, Result, TrustViolation};

/// Resolve a worker executable and apply the trust policy.
pub fn resolve_executable(path: &str, secure: bool) -> Result<PathBuf> {
    let resolved = locate(path)?;

    debug!(requested = path, resolved = %resolved.display(), "Resolved worker executable");

    let home = dirs::home_dir();
    apply_policy(&resolved, secure, home.as_deref(), geteuid().as_raw())?;

    Ok(resolved)
}

/// Locate the executable without applying any policy
fn locate(path: &str) -> Result<PathBuf> {
    if path.is_empty() {
        return Err(Error::worker_not_found(path));
    }

    // A path with a separator is used as-is; relative paths are made
    // absolute so the trust policy sees their real location
    if path.contains('/') {
        let candidate = PathBuf::from(path);
        if !is_executable_file(&candidate) {
            return Err(Error::worker_not_found(path));
        }
        if candidate.is_absolute() {
            return Ok(candidate);
        }
        return candidate
            .canonicalize()
            .map_err(|_| Error::worker_not_found(path));
    }

    // Bare name: search PATH
    let path_var = env::var("PATH").unwrap_or_default();
    search_path_list(path, &path_var).ok_or_else(|| Error::worker_not_found(path))
}

/// Search a PATH-style list of directories for an executable name
fn search_path_list(name: &str, path_var: &str) -> Option<PathBuf> {
    env::split_paths(path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| is_executable_file(candidate))
}

/// Whether the path is a regular file with any execute bit set
fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Apply the trust policy to a resolved executable.
///
/// Paths under /usr are always trusted. Everything else must exist, be
/// owned by `euid` and live under `home`.
fn apply_policy(resolved: &Path, secure: bool, home: Option<&Path>, euid: u32) -> Result<()> {
    if !secure {
        return Ok(());
    }

    if resolved.starts_with("/usr") {
        return Ok(());
    }

    let meta = std::fs::metadata(resolved)
        .map_err(|_| Error::worker_not_trusted(resolved, TrustViolation::Missing))?;

    if meta.uid() != euid {
        return Err(Error::worker_not_trusted(resolved, TrustViolation::WrongOwner));
    }

    match home {
        Some(home) if resolved.starts_with(home) => Ok(()),
        _ => Err(Error::worker_not_trusted(resolved, TrustViolation::OutsideHome)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// Create an executable file under `dir`
    fn make_executable(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn test_locate_absolute_path() {
        let dir = TempDir::new().unwrap();
        let exe = make_executable(dir.path(), "worker");

        let located = locate(exe.to_str().unwrap()).unwrap();
        assert_eq!(located, exe);
    }

    #[test]
    fn test_locate_missing() {
        let err = locate("/nonexistent/worker").unwrap_err();
        assert!(matches!(err, Error::WorkerNotFound { .. }));
    }

    #[test]
    fn test_locate_rejects_non_executable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data.txt");
        fs::write(&path, "not a program").unwrap();

        let err = locate(path.to_str().unwrap()).unwrap_err();
        assert!(matches!(err, Error::WorkerNotFound { .. }));
    }

    #[test]
    fn test_locate_empty_path() {
        assert!(matches!(locate(""), Err(Error::WorkerNotFound { .. })));
    }

    #[test]
    fn test_search_path_list() {
        let first = TempDir::new().unwrap();
        let second = TempDir::new().unwrap();
        let exe = make_executable(second.path(), "worker");

        let path_var = format!(
            "{}:{}",
            first.path().display(),
            second.path().display()
        );
        assert_eq!(search_path_list("worker", &path_var), Some(exe));
        assert_eq!(search_path_list("missing", &path_var), None);
    }

    #[test]
    fn test_policy_disabled_accepts_anything() {
        let dir = TempDir::new().unwrap();
        let exe = make_executable(dir.path(), "worker");

        // Wrong owner and outside home, but secure is off
        assert!(apply_policy(&exe, false, Some(Path::new("/elsewhere")), 99999).is_ok());
    }

    #[test]
    fn test_policy_trusts_usr_prefix() {
        // No stat is performed for /usr paths
        assert!(apply_policy(Path::new("/usr/bin/true"), true, None, 0).is_ok());
        assert!(apply_policy(Path::new("/usr/local/bin/worker"), true, None, 0).is_ok());
    }

    #[test]
    fn test_policy_missing_file() {
        let err = apply_policy(
            Path::new("/nonexistent/worker"),
            true,
            Some(Path::new("/nonexistent")),
            0,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::WorkerNotTrusted {
                reason: TrustViolation::Missing,
                ..
            }
        ));
    }

    #[test]
    fn test_policy_wrong_owner() {
        let dir = TempDir::new().unwrap();
        let exe = make_executable(dir.path(), "worker");
        let our_uid = geteuid().as_raw();

        let err = apply_policy(&exe, true, Some(dir.path()), our_uid + 1).unwrap_err();
        assert!(matches!(
            err,
            Error::WorkerNotTrusted {
                reason: TrustViolation::WrongOwner,
                ..
            }
        ));
    }

    #[test]
    fn test_policy_outside_home() {
        let dir = TempDir::new().unwrap();
        let fake_home = TempDir::new().unwrap();
        let exe = make_executable(dir.path(), "worker");
        let our_uid = geteuid().as_raw();

        let err = apply_policy(&exe, true, Some(fake_home.path()), our_uid).unwrap_err();
        assert!(matches!(
            err,
            Error::WorkerNotTrusted {
                reason: TrustViolation::OutsideHome,
                ..
            }
        ));
    }

    #[test]
    fn test_policy_under_home_accepted() {
        let fake_home = TempDir::new().unwrap();
        let exe = make_executable(fake_home.path(), "worker");
        let our_uid = geteuid().as_raw();

        assert!(apply_policy(&exe, true, Some(fake_home.path()), our_uid).is_ok());
    }

    #[test]
    fn test_resolve_insecure_end_to_end() {
        let dir = TempDir::new().unwrap();
        let exe = make_executable(dir.path(), "worker");

        let resolved = resolve_executable(exe.to_str().unwrap(), false).unwrap();
        assert_eq!(resolved, exe);
    }
}
