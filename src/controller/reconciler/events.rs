//! # Events
//!
//! Kubernetes events recorded against Terraform objects. The reason is the
//! Ready condition's reason when there is one.

use crate::constants::{FIELD_MANAGER, TERRAFORM_GROUP};
use crate::crd::Terraform;
use async_trait::async_trait;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};
use tracing::warn;

/// Event notes are capped at this many bytes
const MAX_EVENT_NOTE_LENGTH: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSeverity {
    Info,
    Error,
}

impl EventSeverity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Error => "error",
        }
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Record an event; failures are logged, never returned
    async fn publish(
        &self,
        terraform: &Terraform,
        severity: EventSeverity,
        revision: &str,
        message: &str,
    );
}

/// Event reason: the Ready reason, or the severity without a Ready condition
pub fn event_reason(terraform: &Terraform, severity: EventSeverity) -> String {
    terraform
        .condition(crate::crd::CONDITION_READY)
        .map(|c| c.reason.clone())
        .filter(|r| !r.is_empty())
        .unwrap_or_else(|| severity.as_str().to_string())
}

/// Event note: the message, truncated, followed by the revision
pub fn event_note(revision: &str, message: &str) -> String {
    let mut note = message.to_string();
    if note.len() > MAX_EVENT_NOTE_LENGTH {
        let mut cut = MAX_EVENT_NOTE_LENGTH;
        while !note.is_char_boundary(cut) {
            cut -= 1;
        }
        note.truncate(cut);
        note.push_str("...");
    }
    if !revision.is_empty() {
        note.push_str(&format!("\n{TERRAFORM_GROUP}/revision: {revision}"));
    }
    note
}

#[derive(Clone)]
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl std::fmt::Debug for KubeEventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeEventPublisher").finish_non_exhaustive()
    }
}

impl KubeEventPublisher {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        terraform: &Terraform,
        severity: EventSeverity,
        revision: &str,
        message: &str,
    ) {
        let event = Event {
            type_: match severity {
                EventSeverity::Info => EventType::Normal,
                EventSeverity::Error => EventType::Warning,
            },
            reason: event_reason(terraform, severity),
            note: Some(event_note(revision, message)),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, &terraform.object_ref(&())).await {
            warn!("Failed to publish event for {}: {}", terraform.key(), e);
        }
    }
}
