//! # Custom Resource Definitions
//!
//! The `Terraform` custom resource reconciled by this controller.
//!
//! A `Terraform` object points at a Flux source artifact and describes how the
//! Terraform configuration inside it is planned, approved, applied and checked.

mod duration;
mod status;
mod transitions;

pub use duration::{format_duration, parse_duration};
pub use status::*;
pub use transitions::plan_id_and_approve_message;

use crate::constants::{
    APPROVE_PLAN_AUTO, DEFAULT_HEALTH_CHECK_TIMEOUT_SECS, DEFAULT_RECONCILE_INTERVAL_SECS,
    DEFAULT_RUNNER_SERVICE_ACCOUNT, DEFAULT_RUNNER_TERMINATION_GRACE_PERIOD_SECS,
    DEFAULT_WORKSPACE_NAME, RUNNER_POD_SUFFIX,
};
use kube::{CustomResource, ResourceExt};
use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Terraform Custom Resource Definition
///
/// # Example
///
/// ```yaml
/// apiVersion: infra.contrib.fluxcd.io/v1alpha1
/// kind: Terraform
/// metadata:
///   name: helloworld
///   namespace: flux-system
/// spec:
///   interval: 1m
///   approvePlan: auto
///   path: ./terraform/helloworld
///   sourceRef:
///     kind: GitRepository
///     name: helloworld
///     namespace: flux-system
/// ```
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    kind = "Terraform",
    group = "infra.contrib.fluxcd.io",
    version = "v1alpha1",
    namespaced,
    status = "TerraformStatus",
    shortname = "tf",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}, {"name":"Status", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].message"}, {"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct TerraformSpec {
    /// Approval mode: empty for manual approval, `auto` to apply every plan,
    /// or the (short) id of the pending plan to approve it
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub approve_plan: String,
    /// Plan and apply a destroy instead of a normal run
    #[serde(default)]
    pub destroy: bool,
    /// Terraform backend configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend_config: Option<BackendConfigSpec>,
    /// Terraform workspace, `default` when empty
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub workspace: String,
    /// Input variables
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub vars: Vec<Variable>,
    /// Reconciliation interval (Go duration)
    pub interval: String,
    /// Interval used after a failed reconciliation, `interval` when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_interval: Option<String>,
    /// Path of the Terraform configuration inside the artifact
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,
    /// Source providing the artifact
    pub source_ref: SourceRef,
    /// Stop reconciling this object
    #[serde(default)]
    pub suspend: bool,
    /// Plan and apply on every reconciliation, ignoring approval
    #[serde(default)]
    pub force: bool,
    /// Secret receiving Terraform outputs after apply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub write_outputs_to_secret: Option<WriteOutputsToSecretSpec>,
    #[serde(default)]
    pub disable_drift_detection: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub health_checks: Vec<HealthCheck>,
    /// Destroy managed resources when this object is deleted
    #[serde(default)]
    pub destroy_resources_on_deletion: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub service_account_name: String,
    /// Delete the runner pod after every reconciliation (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub always_cleanup_runner_pod: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner_termination_grace_period_seconds: Option<i64>,
    #[serde(default)]
    pub refresh_before_apply: bool,
    /// Record applied resources in `status.inventory`
    #[serde(default)]
    pub enable_inventory: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tfstate: Option<TfStateSpec>,
    /// Resource addresses passed as `-target`
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub targets: Vec<String>,
    /// Terraform objects that must be ready before this one reconciles
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<DependencyReference>,
}

/// Reference to a Flux source object
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceRef {
    /// `GitRepository`, `Bucket` or `OCIRepository`
    pub kind: String,
    pub name: String,
    /// Defaults to the namespace of the Terraform object
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Reference to another Terraform object
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DependencyReference {
    pub name: String,
    /// Defaults to the namespace of the dependant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

/// Terraform input variable
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Variable {
    pub name: String,
    /// Any JSON value
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "any_json_value")]
    pub value: Option<serde_json::Value>,
}

/// Configuration of the Terraform Kubernetes backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfigSpec {
    /// Leave the backend to the Terraform configuration
    #[serde(default)]
    pub disable: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_suffix: String,
    #[serde(default)]
    pub in_cluster_config: bool,
    /// Raw backend block replacing the generated one
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub custom_configuration: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WriteOutputsToSecretSpec {
    pub name: String,
    /// Outputs to write, all outputs when empty
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<String>,
}

/// Health check run after a successful apply
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    pub name: String,
    /// `tcp` or `http`
    #[serde(rename = "type")]
    pub check_type: String,
    /// URL for `http` checks; `{{.output_name}}` is replaced by Terraform outputs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    /// `host:port` for `tcp` checks; `{{.output_name}}` is replaced by Terraform outputs
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// Go duration, 20s when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<String>,
}

impl HealthCheck {
    pub fn timeout(&self) -> Duration {
        self.timeout
            .as_deref()
            .and_then(|t| parse_duration(t).ok())
            .unwrap_or(Duration::from_secs(DEFAULT_HEALTH_CHECK_TIMEOUT_SECS))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TfStateSpec {
    #[serde(default)]
    pub force_unlock: ForceUnlock,
    /// Lock holder id to release when `forceUnlock` is `yes`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub lock_identifier: String,
}

/// State force-unlock policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum ForceUnlock {
    Yes,
    #[default]
    No,
    Auto,
}

/// Flux source kinds a Terraform object may reference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    GitRepository,
    Bucket,
    OciRepository,
}

impl SourceKind {
    pub const ALL: [SourceKind; 3] = [
        SourceKind::GitRepository,
        SourceKind::Bucket,
        SourceKind::OciRepository,
    ];

    /// Parse the `kind` field of a source reference
    pub fn from_kind(kind: &str) -> Option<Self> {
        match kind {
            "GitRepository" => Some(Self::GitRepository),
            "Bucket" => Some(Self::Bucket),
            "OCIRepository" => Some(Self::OciRepository),
            _ => None,
        }
    }

    pub fn kind(self) -> &'static str {
        match self {
            Self::GitRepository => "GitRepository",
            Self::Bucket => "Bucket",
            Self::OciRepository => "OCIRepository",
        }
    }

    pub fn group(self) -> &'static str {
        "source.toolkit.fluxcd.io"
    }

    pub fn version(self) -> &'static str {
        match self {
            Self::GitRepository => "v1",
            Self::Bucket | Self::OciRepository => "v1beta2",
        }
    }

    pub fn plural(self) -> &'static str {
        match self {
            Self::GitRepository => "gitrepositories",
            Self::Bucket => "buckets",
            Self::OciRepository => "ocirepositories",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Namespace-qualified identity of an object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Terraform {
    /// Identity of this object
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Identity of the referenced source; the namespace defaults to ours
    pub fn source_key(&self) -> ObjectKey {
        let namespace = self
            .spec
            .source_ref
            .namespace
            .clone()
            .filter(|ns| !ns.is_empty())
            .unwrap_or_else(|| self.namespace().unwrap_or_default());
        ObjectKey::new(namespace, self.spec.source_ref.name.clone())
    }

    /// Identities of the declared dependencies, namespaces defaulted to ours
    pub fn dependency_keys(&self) -> Vec<ObjectKey> {
        let own_namespace = self.namespace().unwrap_or_default();
        self.spec
            .depends_on
            .iter()
            .map(|d| {
                let namespace = d
                    .namespace
                    .clone()
                    .filter(|ns| !ns.is_empty())
                    .unwrap_or_else(|| own_namespace.clone());
                ObjectKey::new(namespace, d.name.clone())
            })
            .collect()
    }

    pub fn interval(&self) -> Duration {
        parse_duration(&self.spec.interval).unwrap_or_else(|e| {
            warn!(
                "Invalid interval '{}' on {}: {}, using {}s",
                self.spec.interval,
                self.key(),
                e,
                DEFAULT_RECONCILE_INTERVAL_SECS
            );
            Duration::from_secs(DEFAULT_RECONCILE_INTERVAL_SECS)
        })
    }

    /// Retry interval, falling back to the reconciliation interval
    pub fn retry_interval(&self) -> Duration {
        self.spec
            .retry_interval
            .as_deref()
            .and_then(|r| parse_duration(r).ok())
            .unwrap_or_else(|| self.interval())
    }

    pub fn workspace_name(&self) -> &str {
        if self.spec.workspace.is_empty() {
            DEFAULT_WORKSPACE_NAME
        } else {
            &self.spec.workspace
        }
    }

    pub fn service_account_name(&self) -> &str {
        if self.spec.service_account_name.is_empty() {
            DEFAULT_RUNNER_SERVICE_ACCOUNT
        } else {
            &self.spec.service_account_name
        }
    }

    pub fn always_cleanup_runner_pod(&self) -> bool {
        self.spec.always_cleanup_runner_pod.unwrap_or(true)
    }

    pub fn runner_termination_grace_period_seconds(&self) -> i64 {
        self.spec
            .runner_termination_grace_period_seconds
            .unwrap_or(DEFAULT_RUNNER_TERMINATION_GRACE_PERIOD_SECS)
    }

    /// Name of the runner pod bound to this object
    pub fn runner_pod_name(&self) -> String {
        format!("{}{}", self.name_any(), RUNNER_POD_SUFFIX)
    }

    /// TLS server name of the runner pod at `ip`
    pub fn runner_hostname(&self, ip: &str) -> String {
        format!(
            "{}.{}.pod.cluster.local",
            ip.replace('.', "-"),
            self.namespace().unwrap_or_default()
        )
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    pub fn status_or_default(&self) -> TerraformStatus {
        self.status.clone().unwrap_or_default()
    }

    pub fn status_mut(&mut self) -> &mut TerraformStatus {
        self.status.get_or_insert_with(TerraformStatus::default)
    }

    pub fn pending_plan(&self) -> &str {
        self.status.as_ref().map_or("", |s| s.plan.pending.as_str())
    }

    pub fn condition(&self, condition_type: &str) -> Option<&Condition> {
        self.status
            .as_ref()
            .and_then(|s| find_condition(&s.conditions, condition_type))
    }

    /// Status of the Ready condition, if any
    pub fn readiness(&self) -> Option<ConditionStatus> {
        self.condition(CONDITION_READY).map(|c| c.status)
    }

    pub fn is_auto_approve(&self) -> bool {
        self.spec.approve_plan == APPROVE_PLAN_AUTO
    }

    /// True when drift was detected after the last successful apply
    pub fn has_drift(&self) -> bool {
        let Some(status) = self.status.as_ref() else {
            return false;
        };
        let Some(drift_at) = status.last_drift_detected_at else {
            return false;
        };
        status.conditions.iter().any(|c| {
            c.r#type == CONDITION_APPLY
                && c.status == ConditionStatus::True
                && c.last_transition_time.is_none_or(|applied| drift_at > applied)
        })
    }
}

fn any_json_value(_gen: &mut SchemaGenerator) -> Schema {
    let schema_value = serde_json::json!({
        "nullable": true,
        "x-kubernetes-preserve-unknown-fields": true,
    });
    Schema::try_from(schema_value).expect("Failed to create Schema for Variable value")
}
