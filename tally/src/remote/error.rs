//! Remote failure taxonomy
//!
//! Failures are tagged where they happen (the transport), so callers never
//! have to guess from message text whether a failure is worth retrying.

use thiserror::Error;

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// The remote could not be reached at all (no network, DNS, refused, timeout)
    #[error("Remote unreachable: {0}")]
    Connectivity(String),

    /// The remote answered but is temporarily unable to serve the request
    #[error("Remote unavailable ({status}): {message}")]
    Unavailable { status: u16, message: String },

    /// The remote refused the request (validation, authorization, conflict)
    #[error("Remote rejected request ({code}): {message}")]
    Rejected { code: String, message: String },
}

impl RemoteError {
    pub fn connectivity(message: impl Into<String>) -> Self {
        Self::Connectivity(message.into())
    }

    pub fn rejected(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Rejected {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Whether the failure should degrade to an optimistic write plus retry
    pub fn is_offline_like(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Unavailable { .. })
    }

    /// The remote was not reached at all, as opposed to answering with an error
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }

    /// Unique-key violation: the row already exists remotely
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Rejected { code, .. } if code == "23505" || code == "409")
    }

    /// Tag an HTTP error status.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        match status {
            408 | 425 | 429 | 500..=599 => Self::Unavailable {
                status,
                message: message.into(),
            },
            _ => Self::Rejected {
                code: status.to_string(),
                message: message.into(),
            },
        }
    }
}
