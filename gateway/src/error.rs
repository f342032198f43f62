//! Error type shared by the relay core and its transports.

use thiserror::Error;

use crate::wire::DecodeError;

/// Reason codes carried by an SSH channel-open failure (RFC 4254 §5.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpenFailureReason {
    AdministrativelyProhibited,
    ConnectFailed,
    UnknownChannelType,
    ResourceShortage,
    Other(u32),
}

impl std::fmt::Display for OpenFailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AdministrativelyProhibited => f.write_str("administratively prohibited"),
            Self::ConnectFailed => f.write_str("connect failed"),
            Self::UnknownChannelType => f.write_str("unknown channel type"),
            Self::ResourceShortage => f.write_str("resource shortage"),
            Self::Other(code) => write!(f, "unknown reason {code}"),
        }
    }
}

/// Errors produced while relaying between a source and a target session.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("target missing")]
    TargetMissing,

    #[error("requests source missing")]
    RequestsMissing,

    #[error("channel source missing")]
    ChannelsMissing,

    #[error("relay cancelled: {0}")]
    Cancelled(String),

    #[error("channel open refused ({reason}): {message}")]
    OpenRefused {
        reason: OpenFailureReason,
        message: String,
    },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("requester no longer waiting for a reply")]
    ReplyDropped,

    #[error("channel closed")]
    ChannelClosed,

    #[error("malformed payload: {0}")]
    Decode(#[from] DecodeError),
}

impl RelayError {
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }

    /// Reason and message to reject a source channel with when opening its
    /// counterpart failed with this error.
    pub fn rejection(&self) -> (OpenFailureReason, String) {
        match self {
            Self::OpenRefused { reason, message } => (*reason, message.clone()),
            Self::Cancelled(reason) => (OpenFailureReason::AdministrativelyProhibited, reason.clone()),
            other => (OpenFailureReason::ConnectFailed, other.to_string()),
        }
    }
}

pub type Result<T, E = RelayError> = std::result::Result<T, E>;
