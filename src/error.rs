/// Error kinds shared across the bot.
///
/// Transfer-level errors are recorded into the owning transfer and never
/// propagate past the engine; session and control-plane errors surface
/// through `/info` and HTTP responses.
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BotError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("network unavailable: {0}")]
    NetworkUnavailable(String),

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("transfer already active: {0}")]
    AlreadyActive(String),

    #[error("timed out waiting for DCC ACCEPT")]
    ResumeTimeout,

    #[error("short read: peer closed after {received} of {size} bytes")]
    ShortRead { received: u64, size: u64 },

    #[error("disallowed mimetype: {0}")]
    DisallowedMimeType(String),

    #[error("file size {size} exceeds limit {limit}")]
    FileSizeExceeded { size: u64, limit: u64 },

    #[error("md5 mismatch: advertised {advertised}, computed {computed}")]
    ChecksumMismatch {
        advertised: String,
        computed: String,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl BotError {
    /// Stable kind tag used in control-plane error bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConfigInvalid(_) => "ConfigInvalid",
            Self::NetworkUnavailable(_) => "NetworkUnavailable",
            Self::ProtocolViolation(_) => "ProtocolViolation",
            Self::AuthFailed(_) => "AuthFailed",
            Self::AlreadyActive(_) => "AlreadyActive",
            Self::ResumeTimeout => "ResumeTimeout",
            Self::ShortRead { .. } => "ShortRead",
            Self::DisallowedMimeType(_) => "DisallowedMimeType",
            Self::FileSizeExceeded { .. } => "FileSizeExceeded",
            Self::ChecksumMismatch { .. } => "ChecksumMismatch",
            Self::Cancelled => "Cancelled",
            Self::Internal(_) => "Internal",
        }
    }
}
