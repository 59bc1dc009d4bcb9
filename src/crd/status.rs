//! # Terraform Status
//!
//! Observed state of a Terraform object and the condition set that records
//! every reconciliation outcome.

use crate::constants::MAX_CONDITION_MESSAGE_LENGTH;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// Condition types
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPLY: &str = "Apply";
pub const CONDITION_HEALTH_CHECK: &str = "HealthCheck";
pub const CONDITION_OUTPUT: &str = "Output";
pub const CONDITION_PLAN: &str = "Plan";
pub const CONDITION_STATE_LOCKED: &str = "StateLocked";

// Reasons
pub const REASON_PROGRESSING: &str = "Progressing";
pub const REASON_ARTIFACT_FAILED: &str = "ArtifactFailed";
pub const REASON_DELETION_BLOCKED_BY_DEPENDANTS: &str = "DeletionBlockedByDependantsReason";
pub const REASON_DEPENDENCY_NOT_READY: &str = "DependencyNotReady";
pub const REASON_RUNNER_ACQUISITION_FAILED: &str = "RunnerAcquisitionFailed";
pub const REASON_INIT_FAILED: &str = "TFExecInitFailed";
pub const REASON_DRIFT_DETECTION_FAILED: &str = "DriftDetectionFailed";
pub const REASON_DRIFT_DETECTED: &str = "DriftDetected";
pub const REASON_NO_DRIFT: &str = "NoDrift";
pub const REASON_PLAN_FAILED: &str = "TFExecPlanFailed";
pub const REASON_PLANNED_WITH_CHANGES: &str = "TerraformPlannedWithChanges";
pub const REASON_PLANNED_NO_CHANGES: &str = "TerraformPlannedNoChanges";
pub const REASON_APPLY_FAILED: &str = "TFExecApplyFailed";
pub const REASON_APPLIED_FAIL: &str = "TerraformAppliedFail";
pub const REASON_APPLY_SUCCEEDED: &str = "TerraformAppliedSucceed";
pub const REASON_OUTPUT_FAILED: &str = "TFExecOutputFailed";
pub const REASON_OUTPUTS_WRITING_FAILED: &str = "OutputsWritingFailed";
pub const REASON_OUTPUTS_AVAILABLE: &str = "TerraformOutputsAvailable";
pub const REASON_OUTPUTS_WRITTEN: &str = "TerraformOutputsWritten";
pub const REASON_HEALTH_CHECKS_FAILED: &str = "HealthChecksFailed";
pub const REASON_HEALTH_CHECKS_SUCCEEDED: &str = "HealthChecksSucceed";
pub const REASON_LOCK_HELD: &str = "LockHeld";
pub const REASON_FORCE_UNLOCK: &str = "ForceUnlock";

/// Terraform status
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TerraformStatus {
    /// Last reconciled generation
    #[serde(default)]
    pub observed_generation: i64,
    #[serde(default)]
    pub conditions: Vec<Condition>,
    /// Last successfully applied source revision (`<branch>/<sha>` for Git)
    #[serde(default)]
    pub last_applied_revision: String,
    /// Revision of the last reconciliation attempt
    #[serde(default)]
    pub last_attempted_revision: String,
    /// Revision used by the last plan, with or without changes
    #[serde(default)]
    pub last_planned_revision: String,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_drift_detected_at: Option<DateTime<Utc>>,
    /// When an apply last corrected detected drift
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_applied_by_drift_detection_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub available_outputs: Vec<String>,
    #[serde(default)]
    pub plan: PlanStatus,
    /// Resources applied by the last apply, when inventory is enabled
    #[serde(default)]
    pub inventory: Option<ResourceInventory>,
    #[serde(default)]
    pub lock: LockStatus,
    /// Last handled value of the reconcile request annotation
    #[serde(default)]
    pub last_handled_reconcile_at: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanStatus {
    #[serde(default)]
    pub last_applied: String,
    /// Plan awaiting approval, empty when none
    #[serde(default)]
    pub pending: String,
    #[serde(default)]
    pub is_destroy_plan: bool,
    #[serde(default)]
    pub is_drift_detection_plan: bool,
    /// The last successful apply was a destroy
    #[serde(default)]
    pub is_destroy_applied: bool,
}

/// State lock holders
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LockStatus {
    #[serde(default)]
    pub last_applied: String,
    /// Lock holder id to use with force unlock
    #[serde(default)]
    pub pending: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInventory {
    #[serde(default)]
    pub entries: Vec<ResourceRef>,
}

/// A resource created by Terraform
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    /// Resource address, e.g. `aws_s3_bucket.logs`
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Provider identifier (ARN, id, ...)
    #[serde(default)]
    pub identifier: String,
}

/// Condition tri-state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        })
    }
}

/// Typed, timestamped status fact
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    #[schemars(with = "Option<String>")]
    pub last_transition_time: Option<DateTime<Utc>>,
}

impl Condition {
    pub fn new(
        condition_type: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            reason: reason.to_string(),
            message: trim_message(message.into()),
            last_transition_time: None,
        }
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.r#type == condition_type)
}

/// Upsert a condition by type
///
/// The transition time is kept when status, reason and message are unchanged and
/// stamped with `now` otherwise. New types are appended.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition, now: DateTime<Utc>) {
    match conditions
        .iter_mut()
        .find(|c| c.r#type == condition.r#type)
    {
        Some(existing) => {
            let unchanged = existing.status == condition.status
                && existing.reason == condition.reason
                && existing.message == condition.message;
            if unchanged && existing.last_transition_time.is_some() {
                return;
            }
            condition.last_transition_time = Some(now);
            *existing = condition;
        }
        None => {
            condition.last_transition_time = Some(now);
            conditions.push(condition);
        }
    }
}

/// Cap a condition message, appending `...` when cut
pub fn trim_message(message: String) -> String {
    if message.len() <= MAX_CONDITION_MESSAGE_LENGTH {
        return message;
    }
    let mut cut = MAX_CONDITION_MESSAGE_LENGTH;
    while !message.is_char_boundary(cut) {
        cut -= 1;
    }
    let mut trimmed = message;
    trimmed.truncate(cut);
    trimmed.push_str("...");
    trimmed
}
