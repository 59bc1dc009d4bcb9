//! # Reconciler Types
//!
//! Core types shared by the reconciliation components.

use super::artifact::ArtifactFetcher;
use super::cluster::{ClusterStore, StoreError};
use super::events::EventPublisher;
use crate::config::ControllerConfig;
use crate::controller::backoff::FibonacciBackoff;
use crate::rotation::{RotationError, RotationHandle};
use crate::runner::{RunnerError, RunnerProvisioner};
use kube_runtime::controller::Action;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;

/// Errors returned to the watch loop; each one goes through the error backoff
#[derive(Debug, Error)]
pub enum ReconcilerError {
    #[error("certificate rotation: {0}")]
    Rotation(#[from] RotationError),
    #[error("cluster store: {0}")]
    Store(#[from] StoreError),
    #[error("failed to get runner: {0}")]
    Runner(#[from] RunnerError),
    #[error("finalize failed: {0}")]
    Finalize(String),
}

/// What the watch loop should do after a reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    After(Duration),
    /// No timed requeue; the next watch event wakes the object
    AwaitChange,
}

impl From<Requeue> for Action {
    fn from(requeue: Requeue) -> Self {
        match requeue {
            Requeue::After(delay) => Action::requeue(delay),
            Requeue::AwaitChange => Action::await_change(),
        }
    }
}

/// Per-resource backoff state for error handling
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(max: Duration) -> Self {
        Self {
            backoff: FibonacciBackoff::new(1, max.as_secs()),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.error_count = 0;
    }
}

/// Reconciler context shared by every worker
pub struct Reconciler {
    pub store: Arc<dyn ClusterStore>,
    pub runners: Arc<dyn RunnerProvisioner>,
    pub events: Arc<dyn EventPublisher>,
    pub rotation: RotationHandle,
    pub fetcher: ArtifactFetcher,
    pub config: ControllerConfig,
    /// Backoff state per resource (`namespace/name`)
    pub backoff_states: Mutex<HashMap<String, BackoffState>>,
}

impl fmt::Debug for Reconciler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reconciler")
            .field("rotation", &self.rotation)
            .field("fetcher", &self.fetcher)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        runners: Arc<dyn RunnerProvisioner>,
        events: Arc<dyn EventPublisher>,
        rotation: RotationHandle,
        fetcher: ArtifactFetcher,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            runners,
            events,
            rotation,
            fetcher,
            config,
            backoff_states: Mutex::new(HashMap::new()),
        }
    }

    /// Forget the error history of a resource after it reconciled successfully
    pub fn reset_backoff(&self, resource_key: &str) {
        if let Ok(mut states) = self.backoff_states.lock() {
            if let Some(state) = states.get_mut(resource_key) {
                state.reset();
            }
        }
    }
}
