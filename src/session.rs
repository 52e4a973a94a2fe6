//! Publish session state.
//!
//! A [`PublishSession`] is constructed at publish start, passed by reference
//! to every phase, and discarded at the end. It owns its instances and an
//! append-only results log that decides whether atomicity still holds.
//!
//! ```text
//! Collecting ─▶ Validating ─▶ Extracting ─┬─▶ Integrating ─▶ Done
//!                                         └─▶ Delegated (resumed elsewhere)
//!        any state ─▶ Aborted
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;

use crate::error::PublishError;
use crate::ids::new_id;
use crate::instance::InstanceRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Collecting,
    Validating,
    Extracting,
    Integrating,
    Done,
    /// Remaining work was handed to contractors; this process is finished.
    Delegated,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Done | SessionState::Delegated | SessionState::Aborted
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Collecting => "collecting",
            SessionState::Validating => "validating",
            SessionState::Extracting => "extracting",
            SessionState::Integrating => "integrating",
            SessionState::Done => "done",
            SessionState::Delegated => "delegated",
            SessionState::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Collect,
    Validate,
    Extract,
    Delegate,
    Integrate,
}

/// Outcome of one plugin (optionally against one instance).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseResult {
    pub phase: Phase,
    pub instance_id: Option<String>,
    pub plugin: String,
    pub success: bool,
    pub error: Option<PublishError>,
}

impl PhaseResult {
    pub fn ok(phase: Phase, plugin: &str, instance_id: Option<&str>) -> Self {
        Self {
            phase,
            instance_id: instance_id.map(str::to_string),
            plugin: plugin.to_string(),
            success: true,
            error: None,
        }
    }

    pub fn failed(
        phase: Phase,
        plugin: &str,
        instance_id: Option<&str>,
        error: PublishError,
    ) -> Self {
        Self {
            phase,
            instance_id: instance_id.map(str::to_string),
            plugin: plugin.to_string(),
            success: false,
            error: Some(error),
        }
    }

    pub fn from_result(
        phase: Phase,
        plugin: &str,
        instance_id: Option<&str>,
        result: Result<(), PublishError>,
    ) -> Self {
        match result {
            Ok(()) => Self::ok(phase, plugin, instance_id),
            Err(e) => Self::failed(phase, plugin, instance_id, e),
        }
    }
}

/// Session-scope metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionContext {
    pub user: String,
    /// Work file being published.
    pub source_file: Option<PathBuf>,
    #[serde(default)]
    pub comment: String,
    pub project: Option<String>,
    pub asset: Option<String>,
    /// Publish root (output tree and dumps).
    pub root: PathBuf,
    #[serde(default)]
    pub data: Map<String, Value>,
}

#[derive(Debug)]
pub struct PublishSession {
    /// Time-sortable session id; also names the context dump.
    pub id: String,
    pub state: SessionState,
    pub instances: Vec<InstanceRecord>,
    pub results: Vec<PhaseResult>,
    pub context: SessionContext,
}

impl PublishSession {
    pub fn new(context: SessionContext) -> Self {
        Self::with_id(new_id(), context)
    }

    pub fn with_id(id: String, context: SessionContext) -> Self {
        Self {
            id,
            state: SessionState::Collecting,
            instances: Vec::new(),
            results: Vec::new(),
            context,
        }
    }

    /// Append an instance; insertion order is processing order.
    pub fn add_instance(&mut self, instance: InstanceRecord) {
        self.instances.push(instance);
    }

    pub fn instance(&self, id: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.id == id)
    }

    pub fn instance_mut(&mut self, id: &str) -> Option<&mut InstanceRecord> {
        self.instances.iter_mut().find(|i| i.id == id)
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&InstanceRecord> {
        self.instances.iter().find(|i| i.name == name)
    }

    pub fn record(&mut self, result: PhaseResult) {
        if let Some(err) = &result.error {
            tracing::warn!(
                plugin = %result.plugin,
                instance = result.instance_id.as_deref().unwrap_or("-"),
                "{}",
                err
            );
        }
        self.results.push(result);
    }

    /// No failure has been recorded so far.
    pub fn atomicity_held(&self) -> bool {
        self.results.iter().all(|r| r.success)
    }

    pub fn failures(&self) -> Vec<&PhaseResult> {
        self.results.iter().filter(|r| !r.success).collect()
    }

    /// Fold every recorded failure into one error of the given kind.
    pub fn failure_summary(&self, kind: crate::error::ErrorKind) -> PublishError {
        let lines: Vec<String> = self
            .failures()
            .iter()
            .map(|r| {
                let who = match &r.instance_id {
                    Some(id) => match self.instance(id) {
                        Some(inst) => format!("{} [{}]", r.plugin, inst.name),
                        None => format!("{} [{}]", r.plugin, id),
                    },
                    None => r.plugin.clone(),
                };
                let msg = r
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                format!("{}: {}", who, msg)
            })
            .collect();
        PublishError::new(
            kind,
            format!("atomicity not held, aborting; {}", lines.join("; ")),
        )
    }

    pub fn advance(&mut self, next: SessionState) {
        tracing::debug!(session = %self.id, from = %self.state, to = %next, "session state");
        self.state = next;
    }

    pub fn abort(&mut self) {
        self.advance(SessionState::Aborted);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_new_session_is_collecting() {
        let s = PublishSession::new(SessionContext::default());
        assert_eq!(s.state, SessionState::Collecting);
        assert!(s.atomicity_held());
        assert!(!s.state.is_terminal());
    }

    #[test]
    fn test_any_failure_breaks_atomicity() {
        let mut s = PublishSession::new(SessionContext::default());
        let inst = InstanceRecord::new("modelDefault", "model");
        let id = inst.id.clone();
        s.add_instance(inst);

        s.record(PhaseResult::ok(Phase::Validate, "ValidateA", Some(&id)));
        assert!(s.atomicity_held());
        s.record(PhaseResult::failed(
            Phase::Validate,
            "ValidateB",
            Some(&id),
            PublishError::validation("no members"),
        ));
        s.record(PhaseResult::ok(Phase::Validate, "ValidateC", None));
        assert!(!s.atomicity_held());
        assert_eq!(s.failures().len(), 1);

        let summary = s.failure_summary(ErrorKind::Validation);
        assert_eq!(summary.kind, ErrorKind::Validation);
        assert!(summary.message.contains("ValidateB [modelDefault]: no members"));
    }

    #[test]
    fn test_instance_lookup_preserves_order() {
        let mut s = PublishSession::new(SessionContext::default());
        s.add_instance(InstanceRecord::new("b", "model"));
        s.add_instance(InstanceRecord::new("a", "model"));
        let names: Vec<&str> = s.instances.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a"]);
        assert!(s.instance_by_name("a").is_some());
        let id = s.instances[0].id.clone();
        s.instance_mut(&id).unwrap().members.push("|geo".to_string());
        assert_eq!(s.instance(&id).unwrap().members.len(), 1);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Done.is_terminal());
        assert!(SessionState::Delegated.is_terminal());
        assert!(SessionState::Aborted.is_terminal());
        assert!(!SessionState::Integrating.is_terminal());
    }
}
