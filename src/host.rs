//! Host adapter for runs outside any DCC (the CLI and farm workers).

use std::path::PathBuf;

use crate::error::PublishError;
use crate::traits::Host;

pub struct StandaloneHost {
    current_file: Option<PathBuf>,
    error_trigger: Option<String>,
}

impl StandaloneHost {
    pub fn new(current_file: Option<PathBuf>, error_trigger: Option<String>) -> Self {
        Self {
            current_file,
            error_trigger,
        }
    }

    /// The line a farm job watcher scans for, if a trigger is configured.
    pub fn failure_line(&self, error: &PublishError) -> Option<String> {
        self.error_trigger
            .as_deref()
            .filter(|t| !t.is_empty())
            .map(|trigger| format!("{}: {}", trigger, error))
    }
}

impl Host for StandaloneHost {
    fn name(&self) -> &str {
        "standalone"
    }

    fn current_file(&self) -> Option<PathBuf> {
        self.current_file.clone()
    }

    fn signal_failure(&self, error: &PublishError) {
        tracing::error!(kind = ?error.kind, "{}", error.message);
        if let Some(line) = self.failure_line(error) {
            eprintln!("{}", line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_line_uses_trigger() {
        let host = StandaloneHost::new(None, Some("FPUB_FATAL".into()));
        let err = PublishError::submission("farm rejected job");
        assert_eq!(
            host.failure_line(&err).unwrap(),
            "FPUB_FATAL: submission failure: farm rejected job"
        );
    }

    #[test]
    fn test_no_trigger_no_line() {
        let host = StandaloneHost::new(None, Some(String::new()));
        assert!(host.failure_line(&PublishError::internal("x")).is_none());
        assert!(StandaloneHost::new(None, None)
            .failure_line(&PublishError::internal("x"))
            .is_none());
    }
}
