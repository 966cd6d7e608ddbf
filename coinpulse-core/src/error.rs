//! Error classification shared by the collaborator error types

use serde::{Deserialize, Serialize};

/// Coarse classification used by callers (scheduler, CLI) to decide whether a
/// failed run is worth retrying on the next tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Recoverable,
    Fatal,
    RateLimit,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        !matches!(self, ErrorKind::Fatal)
    }
}
