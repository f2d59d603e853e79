use thiserror::Error;

/// Errors raised by probes, targets and the bundle that owns them.
///
/// Everything here is per-handler: a failing handler is reported, its
/// siblings keep running.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("capability {kind} is not supported on this platform")]
    Unsupported { kind: String },

    #[error("unknown capability kind: {0}")]
    UnknownKind(String),

    #[error("capability kind already registered: {0}")]
    DuplicateKind(String),

    #[error("failed to construct {kind}: {reason}")]
    Construction { kind: String, reason: String },

    #[error("invalid options for {kind}: {reason}")]
    InvalidOptions { kind: String, reason: String },

    #[error("failed to start {kind}: {reason}")]
    Start { kind: String, reason: String },

    #[error("{kind} has been stopped and cannot be restarted")]
    AlreadyStopped { kind: String },

    #[error("handler id already present in bundle: {0}")]
    DuplicateId(String),

    #[error("handler id not found in bundle: {0}")]
    NotFound(String),
}

impl ProbeError {
    pub fn unsupported(kind: impl Into<String>) -> Self {
        ProbeError::Unsupported { kind: kind.into() }
    }

    pub fn construction(kind: impl Into<String>, reason: impl ToString) -> Self {
        ProbeError::Construction {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }

    pub fn start(kind: impl Into<String>, reason: impl ToString) -> Self {
        ProbeError::Start {
            kind: kind.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the capability simply has no implementation here
    pub fn is_unsupported(&self) -> bool {
        matches!(self, ProbeError::Unsupported { .. })
    }
}
