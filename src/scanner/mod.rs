//! Malware scanner port (C2) — streams bytes to an external AV daemon and
//! classifies the result as clean, infected, or (non-terminally) errored.

use async_trait::async_trait;

pub mod clamav;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanErrorKind {
    /// The daemon could not be reached or the connection dropped mid-scan.
    Unreachable,
    /// The scan did not complete within the configured timeout.
    Timeout,
    /// The daemon responded with something the client couldn't parse.
    Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanOutcome {
    Clean,
    Infected { signature_name: String },
    Error { kind: ScanErrorKind },
}

impl ScanOutcome {
    /// An `error` outcome is explicitly **not** equivalent to clean (spec
    /// §4.2): callers must check this instead of just matching `Clean`.
    pub fn is_clean(&self) -> bool {
        matches!(self, ScanOutcome::Clean)
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ScanOutcome::Error { .. })
    }
}

#[async_trait]
pub trait MalwareScanner: Send + Sync {
    async fn scan(&self, bytes: &[u8]) -> ScanOutcome;
}
