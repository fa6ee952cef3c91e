use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a drop ended in `Failed`.
///
/// Travels on the wire inside `Fail` messages so both sides can show the
/// same explanation.
#[derive(Clone, Debug, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum FailureReason {
    #[error("the peer could not be reached")]
    TransportUnavailable,
    #[error("network error: {0}")]
    NetworkError(String),
    #[error("file error: {0}")]
    IoError(String),
    #[error("the transfer was cancelled")]
    Cancelled,
}
