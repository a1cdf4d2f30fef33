//! Environment validity flag.
//!
//! Once an unrecoverable condition is detected (a failed log write, a
//! checksum failure outside the log tail, a broken tree invariant) every
//! further operation on the environment and its handles fails with
//! `RunRecovery` until the environment is closed and reopened.

use parking_lot::RwLock;
use tracing::error;

#[derive(Debug, Default)]
pub(crate) struct Validity {
    reason: RwLock<Option<String>>,
}

impl Validity {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invalidates the environment. The first reason is kept.
    pub fn invalidate(&self, reason: &str) {
        let mut current = self.reason.write();
        if current.is_none() {
            error!(reason, "environment invalidated, recovery required");
            *current = Some(reason.to_string());
        }
    }

    pub fn invalid_reason(&self) -> Option<String> {
        self.reason.read().clone()
    }

    pub fn is_valid(&self) -> bool {
        self.reason.read().is_none()
    }
}
