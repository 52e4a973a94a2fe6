//! Typed publish failures.
//!
//! Phase plugins, validators and extractors return a [`PublishError`]
//! instead of aborting. The phase loops store it in the session's results
//! log, and only the outermost layer (`fpub`) turns a terminal error into a
//! process exit code.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What stage of the publish a failure belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorKind {
    /// No publishable instance was found, or a collector failed.
    Collection,
    /// A validation check failed.
    Validation,
    /// An extractor failed.
    Extraction,
    /// The contractor backend rejected a job.
    Submission,
    /// A dump could not be loaded on the resuming side.
    Resume,
    /// Committing to the versioned store failed.
    Integration,
    /// Anything else (I/O, store connection, programming errors).
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ErrorKind::Collection => "collection error",
            ErrorKind::Validation => "validation failure",
            ErrorKind::Extraction => "extraction failure",
            ErrorKind::Submission => "submission failure",
            ErrorKind::Resume => "resume failure",
            ErrorKind::Integration => "integration failure",
            ErrorKind::Internal => "internal error",
        };
        f.write_str(label)
    }
}

/// A failure carrying its kind and a human-readable message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{kind}: {message}")]
pub struct PublishError {
    pub kind: ErrorKind,
    pub message: String,
}

pub type PublishResult<T> = Result<T, PublishError>;

impl PublishError {
    pub fn new(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
        }
    }

    pub fn collection(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Collection, msg)
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, msg)
    }

    pub fn extraction(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Extraction, msg)
    }

    pub fn submission(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Submission, msg)
    }

    pub fn resume(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Resume, msg)
    }

    pub fn integration(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Integration, msg)
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, msg)
    }

    /// Wrap an `anyhow` chain, keeping every context layer in the message.
    pub fn from_anyhow(kind: ErrorKind, err: &anyhow::Error) -> Self {
        Self::new(kind, format!("{:#}", err))
    }

    /// Process exit code for `fpub`. Zero is reserved for success.
    pub fn exit_code(&self) -> i32 {
        match self.kind {
            ErrorKind::Internal => 1,
            ErrorKind::Collection => 2,
            ErrorKind::Validation => 3,
            ErrorKind::Extraction => 4,
            ErrorKind::Submission => 5,
            ErrorKind::Resume => 6,
            ErrorKind::Integration => 7,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_prefixes_are_stable() {
        assert_eq!(
            PublishError::validation("x").to_string(),
            "validation failure: x"
        );
        assert!(PublishError::submission("rejected")
            .to_string()
            .starts_with("submission failure:"));
        assert!(PublishError::resume("gone")
            .to_string()
            .starts_with("resume failure:"));
    }

    #[test]
    fn test_exit_codes_are_non_zero_and_distinct() {
        let kinds = [
            ErrorKind::Collection,
            ErrorKind::Validation,
            ErrorKind::Extraction,
            ErrorKind::Submission,
            ErrorKind::Resume,
            ErrorKind::Integration,
            ErrorKind::Internal,
        ];
        let mut codes: Vec<i32> = kinds
            .iter()
            .map(|k| PublishError::new(*k, "x").exit_code())
            .collect();
        assert!(codes.iter().all(|c| *c != 0));
        codes.sort();
        codes.dedup();
        assert_eq!(codes.len(), kinds.len());
    }

    #[test]
    fn test_from_anyhow_keeps_context_chain() {
        let err = anyhow::anyhow!("disk full").context("Failed to write dump");
        let pe = PublishError::from_anyhow(ErrorKind::Internal, &err);
        assert!(pe.message.contains("Failed to write dump"));
        assert!(pe.message.contains("disk full"));
    }
}
