use arkdrop_entities::{DropId, FailureReason, PeerId};
use thiserror::Error;

use crate::request::DropState;

pub type Result<T> = std::result::Result<T, DropError>;

/// Errors returned synchronously by the coordinator API.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropError {
    #[error("Unknown peer: {0}")]
    UnknownPeer(PeerId),
    #[error("No drop request with id {0}")]
    NotFound(DropId),
    #[error("Drop request {id} is {state:?}, cannot {action}")]
    InvalidState {
        id: DropId,
        state: DropState,
        action: &'static str,
    },
    #[error("A drop needs at least one file")]
    EmptyManifest,
    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),
    #[error("Network error: {0}")]
    Network(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Cancelled")]
    Cancelled,
    #[error("Config error: {0}")]
    Config(String),
    #[error("The coordinator has shut down")]
    Shutdown,
}

impl From<std::io::Error> for DropError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<toml::de::Error> for DropError {
    fn from(e: toml::de::Error) -> Self {
        Self::Config(e.to_string())
    }
}

impl From<TransportError> for DropError {
    fn from(e: TransportError) -> Self {
        match e {
            TransportError::Unreachable(msg) => Self::TransportUnavailable(msg),
            TransportError::Closed => Self::Network(e.to_string()),
            TransportError::Timeout => Self::Network(e.to_string()),
            TransportError::Io(msg) => Self::Network(msg),
            TransportError::Frame(msg) => Self::Network(msg),
        }
    }
}

/// Errors reported by [`crate::transport::Transport`] implementations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("peer unreachable: {0}")]
    Unreachable(String),
    #[error("link closed")]
    Closed,
    #[error("timed out")]
    Timeout,
    #[error("IO error: {0}")]
    Io(String),
    #[error("frame error: {0}")]
    Frame(String),
}

impl TransportError {
    /// How a transfer that hit this error is recorded.
    pub fn failure_reason(&self) -> FailureReason {
        match self {
            TransportError::Unreachable(_) => {
                FailureReason::TransportUnavailable
            }
            other => FailureReason::NetworkError(other.to_string()),
        }
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<arkdropx_common::FrameError> for TransportError {
    fn from(e: arkdropx_common::FrameError) -> Self {
        match e {
            arkdropx_common::FrameError::Io(io) => Self::Io(io.to_string()),
            other => Self::Frame(other.to_string()),
        }
    }
}
