//! Small shared helpers: atomic file replacement and name validation.

use crate::error::{Error, Result};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Maximum length of a snapshot or VM name.
pub const MAX_NAME_LEN: usize = 63;

/// Current UTC time, used for creation timestamps.
pub fn now() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

/// Path of the temporary sibling used while atomically replacing `path`.
fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Replace the contents of `path` atomically.
///
/// Writes to a temp file next to the target, syncs it, then renames it over
/// the target. Readers see either the old or the new contents, never a mix.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| {
            Error::storage(
                format!("create directory {}", parent.display()),
                e.to_string(),
            )
        })?;
    }

    let temp_path = temp_path_for(path);
    let result = write_and_sync(&temp_path, contents).and_then(|()| {
        fs::rename(&temp_path, path).map_err(|e| {
            Error::storage(format!("rename into {}", path.display()), e.to_string())
        })
    });

    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result
}

fn write_and_sync(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .map_err(|e| Error::storage(format!("create {}", path.display()), e.to_string()))?;
    file.write_all(contents)
        .map_err(|e| Error::storage(format!("write {}", path.display()), e.to_string()))?;
    file.sync_all()
        .map_err(|e| Error::storage(format!("sync {}", path.display()), e.to_string()))
}

/// Validate a resource name.
///
/// Rules:
/// - Length: 1..=63 characters
/// - Allowed characters: alphanumeric, hyphen (-), underscore (_)
/// - Must start with a letter or digit
/// - Cannot end with a hyphen
/// - No consecutive hyphens
///
/// Returns the violated rule on failure.
pub fn check_name(name: &str) -> std::result::Result<(), String> {
    let first_char = name
        .chars()
        .next()
        .ok_or_else(|| "name cannot be empty".to_string())?;

    if name.len() > MAX_NAME_LEN {
        return Err(format!(
            "name too long: {} characters (max {})",
            name.len(),
            MAX_NAME_LEN
        ));
    }

    if !first_char.is_ascii_alphanumeric() {
        return Err("name must start with a letter or digit".into());
    }

    if name.ends_with('-') {
        return Err("name cannot end with a hyphen".into());
    }

    let mut prev_was_hyphen = false;
    for c in name.chars() {
        if c == '-' {
            if prev_was_hyphen {
                return Err("name cannot contain consecutive hyphens".into());
            }
            prev_was_hyphen = true;
        } else {
            prev_was_hyphen = false;
        }

        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' {
            if c == '/' || c == '\\' {
                return Err("name cannot contain path separators".into());
            }
            return Err(format!("name contains invalid character: '{}'", c));
        }
    }

    Ok(())
}

/// Validate a snapshot name, producing a typed error.
pub fn validate_snapshot_name(name: &str) -> Result<()> {
    check_name(name).map_err(|reason| Error::InvalidSnapshotName {
        name: name.to_string(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_atomic_replaces_contents() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("snapshot-head");

        write_atomic(&path, b"first").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "first");

        write_atomic(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_write_atomic_fails_when_target_is_directory() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("blocked");
        fs::create_dir_all(path.join("inner")).unwrap();

        let err = write_atomic(&path, b"data").unwrap_err();
        assert!(matches!(err, Error::Storage { .. }));
        assert!(!temp_path_for(&path).exists());
    }

    #[test]
    fn test_valid_names() {
        for name in ["snapshot1", "a", "pre-upgrade", "with_underscore", "9lives"] {
            assert!(check_name(name).is_ok(), "{} should be valid", name);
        }
    }

    #[test]
    fn test_invalid_names() {
        let long = "a".repeat(MAX_NAME_LEN + 1);
        let cases = [
            ("", "empty"),
            ("-leading", "start with"),
            ("trailing-", "end with"),
            ("double--hyphen", "consecutive"),
            ("has/slash", "path separators"),
            ("has space", "invalid character"),
            ("%$@#*&", "start with"),
            (long.as_str(), "too long"),
        ];
        for (name, expected) in cases {
            let reason = check_name(name).unwrap_err();
            assert!(
                reason.contains(expected),
                "{:?}: expected '{}' in '{}'",
                name,
                expected,
                reason
            );
        }
    }

    #[test]
    fn test_validate_snapshot_name_is_validation_error() {
        let err = validate_snapshot_name("no.can.do").unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Validation);
        assert!(err.to_string().contains("no.can.do"));
    }
}
