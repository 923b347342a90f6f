use crate::error::{MarshalError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Directory constants
// ---------------------------------------------------------------------------

pub const MARSHAL_DIR: &str = ".marshal";
pub const AUDIT_DIR: &str = ".marshal/audit";
pub const RECOVERY_DIR: &str = ".marshal/recovery";
pub const CACHE_DIR: &str = ".marshal/cache";

pub const CONFIG_FILE: &str = ".marshal/config.yaml";
pub const RECORDS_DB: &str = ".marshal/records.redb";
pub const DLQ_DB: &str = ".marshal/dlq.redb";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn marshal_dir(root: &Path) -> PathBuf {
    root.join(MARSHAL_DIR)
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn records_db_path(root: &Path) -> PathBuf {
    root.join(RECORDS_DB)
}

pub fn dlq_db_path(root: &Path) -> PathBuf {
    root.join(DLQ_DB)
}

pub fn audit_dir(root: &Path) -> PathBuf {
    root.join(AUDIT_DIR)
}

pub fn recovery_dir(root: &Path) -> PathBuf {
    root.join(RECOVERY_DIR)
}

pub fn cache_dir(root: &Path) -> PathBuf {
    root.join(CACHE_DIR)
}

/// True once `marshal init` has run at `root`.
pub fn is_initialized(root: &Path) -> bool {
    marshal_dir(root).is_dir()
}

// ---------------------------------------------------------------------------
// Action-type validation
// ---------------------------------------------------------------------------

static ACTION_TYPE_RE: OnceLock<Regex> = OnceLock::new();

fn action_type_re() -> &'static Regex {
    ACTION_TYPE_RE.get_or_init(|| Regex::new(r"^[a-z0-9][a-z0-9\-]*[a-z0-9]$|^[a-z0-9]$").unwrap())
}

/// Action types are lowercase kebab-case slugs, max 64 chars. They key the
/// handler registry and the per-type timeout map, so typos must fail early.
pub fn validate_action_type(action_type: &str) -> Result<()> {
    if action_type.is_empty() || action_type.len() > 64 || !action_type_re().is_match(action_type) {
        return Err(MarshalError::InvalidActionType(action_type.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_action_types() {
        for t in ["send-email", "a", "post-update-2", "x1"] {
            validate_action_type(t).unwrap_or_else(|_| panic!("expected valid: {t}"));
        }
    }

    #[test]
    fn invalid_action_types() {
        for t in ["", "-leading", "trailing-", "has spaces", "UPPER", "a_b"] {
            assert!(validate_action_type(t).is_err(), "expected invalid: {t}");
        }
    }

    #[test]
    fn path_helpers() {
        let root = Path::new("/tmp/ws");
        assert_eq!(
            config_path(root),
            PathBuf::from("/tmp/ws/.marshal/config.yaml")
        );
        assert_eq!(
            records_db_path(root),
            PathBuf::from("/tmp/ws/.marshal/records.redb")
        );
        assert_eq!(audit_dir(root), PathBuf::from("/tmp/ws/.marshal/audit"));
    }
}
