use thiserror::Error;

/// Convenience alias for `Result<T, ShrikeError>`.
pub type ShrikeResult<T> = Result<T, ShrikeError>;

/// Error classification for recovery decisions.
///
/// - `Absent`    — the key does not exist (or no longer counts as existing);
///   callers treat this as a normal outcome, never a client error
/// - `Retryable` — optimistic commit conflict; the caller reopens a
///   transaction and reapplies, up to a bounded retry count
/// - `Transient` — a lock or resource was unavailable; client MAY retry
/// - `Misuse`    — lifecycle or argument misuse; surfaced as-is
/// - `Internal`  — codec failures, I/O, unreachable branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Absent,
    Retryable,
    Transient,
    Misuse,
    Internal,
}

/// Core error type shared by the storage and command layers.
///
/// `NotFound`, `Expired` and `CommitRetry` carry recovery semantics and are
/// handled locally by the expiration protocol; everything else bubbles to
/// the command handler which converts it to a wire-protocol error.
#[derive(Error, Debug)]
pub enum ShrikeError {
    #[error("key not found")]
    NotFound,

    #[error("key expired")]
    Expired,

    #[error("optimistic conflict at commit, retry")]
    CommitRetry,

    #[error("busy: {0}")]
    Busy(String),

    #[error("backup already in progress")]
    BackupInProgress,

    #[error("bad state: {op} not allowed while store is {state}")]
    BadState {
        op: &'static str,
        state: &'static str,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl ShrikeError {
    /// Classify this error for recovery decisions.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ShrikeError::NotFound | ShrikeError::Expired => ErrorKind::Absent,
            ShrikeError::CommitRetry => ErrorKind::Retryable,
            ShrikeError::Busy(_) => ErrorKind::Transient,
            ShrikeError::BackupInProgress
            | ShrikeError::BadState { .. }
            | ShrikeError::InvalidArgument(_) => ErrorKind::Misuse,
            ShrikeError::Codec(_) | ShrikeError::Io(_) | ShrikeError::Internal(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// True for `NotFound` — the plain absence outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, ShrikeError::NotFound)
    }

    /// True for `Expired` — present but past-TTL at probe time.
    pub fn is_expired(&self) -> bool {
        matches!(self, ShrikeError::Expired)
    }

    /// True when the key should be treated as nonexistent by the caller
    /// (`NotFound` or `Expired`).
    pub fn is_absent(&self) -> bool {
        self.kind() == ErrorKind::Absent
    }

    /// True for an optimistic commit conflict.
    pub fn is_commit_retry(&self) -> bool {
        matches!(self, ShrikeError::CommitRetry)
    }

    /// Construct a `Codec` error.
    pub fn codec(msg: impl Into<String>) -> Self {
        ShrikeError::Codec(msg.into())
    }

    /// Construct an `Internal` error.
    pub fn internal(msg: impl Into<String>) -> Self {
        ShrikeError::Internal(msg.into())
    }

    /// Construct an `InvalidArgument` error.
    pub fn invalid(msg: impl Into<String>) -> Self {
        ShrikeError::InvalidArgument(msg.into())
    }
}
