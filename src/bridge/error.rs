//! Bridge error types.

use std::fmt;

use crate::remote::RemoteError;

/// Errors returned by bridge operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// `start` called while already configured
    AlreadyConfigured,
    /// `stop` called while not configured
    AlreadyUnconfigured,
    /// Bad cloud URL or topic rule
    InvalidConfiguration(String),
    /// Connection-phase failure; the bridge keeps retrying
    Remote(RemoteError),
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyConfigured => write!(f, "Already configured"),
            Self::AlreadyUnconfigured => write!(f, "Already unconfigured"),
            Self::InvalidConfiguration(msg) => write!(f, "Invalid configuration: {}", msg),
            Self::Remote(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for BridgeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Remote(e) => Some(e),
            _ => None,
        }
    }
}

impl From<RemoteError> for BridgeError {
    fn from(err: RemoteError) -> Self {
        Self::Remote(err)
    }
}
