//! Reconnect Backoff
//!
//! Two-bucket policy: credential rejections wait longer than everything else.

use std::time::Duration;

use super::error::BridgeError;
use crate::remote::{FailureClass, RemoteError};

/// Delay before the next reconnect attempt, by failure class
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    transient: Duration,
    credential_rejected: Duration,
}

impl BackoffPolicy {
    /// Credential backoff must be strictly longer than the transient one
    pub fn new(transient: Duration, credential_rejected: Duration) -> Result<Self, BridgeError> {
        if credential_rejected <= transient {
            return Err(BridgeError::InvalidConfiguration(format!(
                "credential backoff ({:?}) must be longer than transient backoff ({:?})",
                credential_rejected, transient
            )));
        }
        Ok(Self {
            transient,
            credential_rejected,
        })
    }

    pub fn delay_for(&self, reason: &RemoteError) -> Duration {
        match reason.class() {
            FailureClass::CredentialRejected => self.credential_rejected,
            FailureClass::Transient => self.transient,
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            transient: Duration::from_secs(5),
            credential_rejected: Duration::from_secs(30),
        }
    }
}
