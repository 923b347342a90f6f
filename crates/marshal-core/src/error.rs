use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum MarshalError {
    #[error("not initialized: run 'marshal init'")]
    NotInitialized,

    #[error("record not found: {0}")]
    RecordNotFound(Uuid),

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("version conflict on {id}: expected {expected}, found {found}")]
    VersionConflict {
        id: Uuid,
        expected: u64,
        found: u64,
    },

    #[error("invalid action type '{0}': must be lowercase alphanumeric with hyphens")]
    InvalidActionType(String),

    #[error("no handler registered for action type: {0}")]
    HandlerMissing(String),

    #[error("handler already registered for action type: {0}")]
    HandlerDuplicate(String),

    #[error("task not scheduled: {0}")]
    TaskNotScheduled(String),

    #[error("task already scheduled: {0}")]
    TaskExists(String),

    #[error("invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("process not tracked: {0}")]
    ProcessNotFound(String),

    #[error("source '{source_name}' failed: {message}")]
    Source {
        source_name: String,
        message: String,
    },

    #[error("store error: {0}")]
    Store(String),

    #[error("task failed: {0}")]
    Task(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MarshalError>;

// ---------------------------------------------------------------------------
// ErrorClass — failure taxonomy consumed by the execution engine
// ---------------------------------------------------------------------------

/// Classification of a handler failure, driving the retry policy.
///
/// `Transient` is retried up to the retry budget, `System` exactly once,
/// everything else terminates the attempt immediately. `Data` additionally
/// quarantines the record instead of failing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Transient,
    Auth,
    Logic,
    Data,
    System,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Auth => "auth",
            Self::Logic => "logic",
            Self::Data => "data",
            Self::System => "system",
        }
    }

    /// Infer a class from an error message when the handler didn't supply one.
    ///
    /// Keyword matching is deliberately coarse; a handler that cares should
    /// classify explicitly.
    pub fn infer(message: &str) -> Self {
        let msg = message.to_lowercase();
        let has = |keys: &[&str]| keys.iter().any(|k| msg.contains(k));

        if has(&["timeout", "timed out", "connection", "unavailable", "rate limit", "too many requests"]) {
            Self::Transient
        } else if has(&["credential", "unauthorized", "forbidden", "auth", "expired token", "invalid token"]) {
            Self::Auth
        } else if has(&["malformed", "missing field", "parse", "invalid payload", "schema"]) {
            Self::Data
        } else if has(&["disk", "i/o", "io error", "no space", "read-only"]) {
            Self::System
        } else {
            Self::Logic
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
