//! # Runner
//!
//! The execution agent that runs terraform on behalf of one `Terraform` object.
//!
//! ## Implementations
//!
//! - `pod` - Finds or creates the runner pod and talks to it over mutual TLS (`remote`)
//! - `local` - Runs the terraform CLI in a scratch directory inside the controller
//!   (`INSECURE_LOCAL_RUNNER`, for development)

pub mod local;
pub mod pod;
pub mod remote;

pub use local::{LocalRunnerProvisioner, LocalTerraformRunner};
pub use pod::PodRunnerProvisioner;
pub use remote::HttpRunnerClient;

use crate::crd::{BackendConfigSpec, ResourceRef, Terraform};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    /// The terraform state is locked by another holder
    #[error("{message}")]
    StateLocked { lock_id: String, message: String },
    #[error("{0}")]
    Command(String),
    #[error("runner transport error: {0}")]
    Transport(String),
    #[error("runner not ready: {0}")]
    NotReady(String),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Everything the runner needs to prepare a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub name: String,
    pub namespace: String,
    pub revision: String,
    /// Directory inside the artifact holding the configuration
    pub path: String,
    pub workspace: String,
    /// Verified artifact tarball
    #[serde(with = "remote::base64_bytes")]
    pub artifact: Vec<u8>,
    /// Input variables, written as `generated.auto.tfvars.json`
    pub vars: serde_json::Map<String, serde_json::Value>,
    pub backend_config: Option<BackendConfigSpec>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    pub instance_id: String,
    pub destroy: bool,
    pub drift_detection: bool,
    pub refresh_before_apply: bool,
    pub targets: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanReply {
    pub has_changes: bool,
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyRequest {
    pub instance_id: String,
    pub enable_inventory: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyReply {
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub inventory: Vec<ResourceRef>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputValue {
    pub value: serde_json::Value,
    #[serde(default)]
    pub sensitive: bool,
}

/// Terraform operations, each bound to the workspace created by `setup`
#[async_trait]
pub trait TerraformRunner: Send + Sync {
    /// Unpack the artifact, write variables and backend, init and select the workspace
    async fn setup(&self, request: SetupRequest) -> Result<String, RunnerError>;

    async fn plan(&self, request: PlanRequest) -> Result<PlanReply, RunnerError>;

    /// Human readable rendering of the saved plan
    async fn show_plan(&self, instance_id: &str) -> Result<String, RunnerError>;

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, RunnerError>;

    async fn outputs(&self, instance_id: &str)
        -> Result<BTreeMap<String, OutputValue>, RunnerError>;

    async fn force_unlock(&self, instance_id: &str, lock_id: &str) -> Result<(), RunnerError>;

    async fn cleanup(&self, instance_id: &str) -> Result<(), RunnerError>;
}

type CloseFn = Box<dyn FnOnce() + Send>;

/// A runner bound to one object, with the callback that releases its channel
pub struct RunnerConnection {
    pub runner: Arc<dyn TerraformRunner>,
    close: Option<CloseFn>,
}

impl fmt::Debug for RunnerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunnerConnection")
            .field("has_close", &self.close.is_some())
            .finish_non_exhaustive()
    }
}

impl RunnerConnection {
    pub fn new(runner: Arc<dyn TerraformRunner>) -> Self {
        Self {
            runner,
            close: None,
        }
    }

    #[must_use]
    pub fn with_close(mut self, close: impl FnOnce() + Send + 'static) -> Self {
        self.close = Some(Box::new(close));
        self
    }

    pub fn close(mut self) {
        if let Some(close) = self.close.take() {
            close();
        }
    }
}

/// Finds or creates the runner for an object
#[async_trait]
pub trait RunnerProvisioner: Send + Sync {
    async fn lookup_or_create(&self, terraform: &Terraform) -> Result<RunnerConnection, RunnerError>;
}
