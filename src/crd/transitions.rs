//! # Status Transitions
//!
//! Value-returning transforms over a `Terraform` snapshot. Each one consumes the
//! object, records a single outcome in its condition set and returns it; the
//! reconciler persists the result with one status patch.

use super::status::*;
use super::Terraform;
use chrono::Utc;

/// Derive the plan id and the manual approval message for a revision
///
/// The plan id is `plan-` followed by the revision with its first `/` turned
/// into `-`. The message names the short id (`plan-<branch>-<first 10 chars of
/// the commit>`), which approves the plan as a prefix of the full id.
pub fn plan_id_and_approve_message(revision: &str, message: &str) -> (String, String) {
    let plan_id = format!("plan-{}", revision.replacen('/', "-", 1));
    let short_plan_id = match revision.split_once('/') {
        Some((branch, commit)) if commit.len() >= 10 && commit.is_char_boundary(10) => {
            format!("plan-{}-{}", branch, &commit[..10])
        }
        _ => plan_id.clone(),
    };
    let approve_message =
        format!("{message}: set approvePlan: \"{short_plan_id}\" to approve this plan.");
    (plan_id, approve_message)
}

impl Terraform {
    fn set_status_condition(&mut self, condition: Condition) {
        set_condition(&mut self.status_mut().conditions, condition, Utc::now());
    }

    /// Set the Ready condition, stamping observed generation and attempted revision
    pub fn set_readiness(
        &mut self,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        revision: &str,
    ) {
        self.set_status_condition(Condition::new(CONDITION_READY, status, reason, message));
        let generation = self.generation();
        let st = self.status_mut();
        st.observed_generation = generation;
        st.last_attempted_revision = revision.to_string();
    }

    /// Readiness Unknown: work is about to start
    #[must_use]
    pub fn progressing(mut self, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_READY,
            ConditionStatus::Unknown,
            REASON_PROGRESSING,
            message,
        ));
        self
    }

    #[must_use]
    pub fn not_ready(mut self, revision: &str, reason: &str, message: impl Into<String>) -> Self {
        self.set_readiness(ConditionStatus::False, reason, message, revision);
        self
    }

    /// Readiness True outside of the plan/apply transitions
    #[must_use]
    pub fn ready(mut self, revision: &str, reason: &str, message: &str) -> Self {
        self.set_readiness(
            ConditionStatus::True,
            reason,
            format!("{message}: {revision}"),
            revision,
        );
        self
    }

    #[must_use]
    pub fn applying(mut self, revision: &str, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_APPLY,
            ConditionStatus::Unknown,
            REASON_PROGRESSING,
            message,
        ));
        if !revision.is_empty() {
            self.status_mut().last_attempted_revision = revision.to_string();
        }
        self
    }

    #[must_use]
    pub fn outputs_available(mut self, available_outputs: Vec<String>, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_OUTPUT,
            ConditionStatus::True,
            REASON_OUTPUTS_AVAILABLE,
            message,
        ));
        self.status_mut().available_outputs = available_outputs;
        self
    }

    #[must_use]
    pub fn outputs_written(mut self, revision: &str, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_OUTPUT,
            ConditionStatus::True,
            REASON_OUTPUTS_WRITTEN,
            message,
        ));
        self.set_readiness(
            ConditionStatus::True,
            REASON_OUTPUTS_WRITTEN,
            format!("{message}: {revision}"),
            revision,
        );
        self
    }

    /// Move the pending plan to last-applied
    ///
    /// Stamps `lastAppliedByDriftDetectionAt` when the applied plan was a
    /// drift-detection plan. The inventory is only replaced by non-empty entries.
    #[must_use]
    pub fn applied(
        mut self,
        revision: &str,
        message: &str,
        is_destroy_apply: bool,
        entries: Vec<ResourceRef>,
    ) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_APPLY,
            ConditionStatus::True,
            REASON_APPLY_SUCCEEDED,
            message,
        ));

        let st = self.status_mut();
        if st.plan.is_drift_detection_plan {
            st.last_applied_by_drift_detection_at = Some(Utc::now());
        }
        st.plan = PlanStatus {
            last_applied: std::mem::take(&mut st.plan.pending),
            pending: String::new(),
            is_destroy_plan: is_destroy_apply,
            is_drift_detection_plan: false,
            is_destroy_applied: is_destroy_apply,
        };
        if !revision.is_empty() {
            st.last_applied_revision = revision.to_string();
        }
        if !entries.is_empty() {
            st.inventory = Some(ResourceInventory { entries });
        }

        self.set_readiness(
            ConditionStatus::Unknown,
            REASON_APPLY_SUCCEEDED,
            format!("{message}: {revision}"),
            revision,
        );
        self
    }

    #[must_use]
    pub fn planned_with_changes(
        mut self,
        revision: &str,
        force_or_auto_apply: bool,
        message: &str,
    ) -> Self {
        let (plan_id, approve_message) = plan_id_and_approve_message(revision, message);
        self.set_status_condition(Condition::new(
            CONDITION_PLAN,
            ConditionStatus::True,
            REASON_PLANNED_WITH_CHANGES,
            message,
        ));

        let is_destroy_plan = self.spec.destroy;
        let is_drift_detection_plan = self.has_drift();
        let st = self.status_mut();
        st.plan = PlanStatus {
            last_applied: std::mem::take(&mut st.plan.last_applied),
            pending: plan_id,
            is_destroy_plan,
            is_drift_detection_plan,
            is_destroy_applied: st.plan.is_destroy_applied,
        };
        if !revision.is_empty() {
            st.last_attempted_revision = revision.to_string();
            st.last_planned_revision = revision.to_string();
        }

        let readiness_message = if force_or_auto_apply {
            message.to_string()
        } else {
            approve_message
        };
        self.set_readiness(
            ConditionStatus::Unknown,
            REASON_PLANNED_WITH_CHANGES,
            readiness_message,
            revision,
        );
        self
    }

    #[must_use]
    pub fn planned_no_changes(mut self, revision: &str, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_PLAN,
            ConditionStatus::False,
            REASON_PLANNED_NO_CHANGES,
            message,
        ));

        let is_destroy_plan = self.spec.destroy;
        let st = self.status_mut();
        st.plan = PlanStatus {
            last_applied: std::mem::take(&mut st.plan.last_applied),
            pending: String::new(),
            is_destroy_plan,
            is_drift_detection_plan: false,
            is_destroy_applied: st.plan.is_destroy_applied,
        };
        if !revision.is_empty() {
            st.last_attempted_revision = revision.to_string();
            st.last_planned_revision = revision.to_string();
        }

        self.set_readiness(
            ConditionStatus::True,
            REASON_PLANNED_NO_CHANGES,
            format!("{message}: {revision}"),
            revision,
        );
        self
    }

    /// Record a failed apply and drop the pending plan so the next cycle re-plans
    #[must_use]
    pub fn applied_fail_reset_plan_and_not_ready(
        mut self,
        revision: &str,
        reason: &str,
        message: &str,
    ) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_APPLY,
            ConditionStatus::False,
            REASON_APPLIED_FAIL,
            message,
        ));
        let mut terraform = self.not_ready(revision, reason, message);
        terraform.status_mut().plan.pending.clear();
        terraform
    }

    #[must_use]
    pub fn drift_detected(mut self, revision: &str, reason: &str, message: &str) -> Self {
        self.status_mut().last_drift_detected_at = Some(Utc::now());
        self.set_readiness(ConditionStatus::False, reason, message, revision);
        self
    }

    #[must_use]
    pub fn no_drift(mut self, revision: &str, reason: &str, message: &str) -> Self {
        self.set_readiness(
            ConditionStatus::True,
            reason,
            format!("{message}: {revision}"),
            revision,
        );
        self
    }

    #[must_use]
    pub fn health_check_failed(mut self, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_HEALTH_CHECK,
            ConditionStatus::False,
            REASON_HEALTH_CHECKS_FAILED,
            message,
        ));
        self
    }

    #[must_use]
    pub fn health_check_succeeded(mut self, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_HEALTH_CHECK,
            ConditionStatus::True,
            REASON_HEALTH_CHECKS_SUCCEEDED,
            message,
        ));
        self
    }

    /// Record a forced unlock; the released holder becomes `lock.lastApplied`
    #[must_use]
    pub fn force_unlocked(mut self, message: &str) -> Self {
        self.set_status_condition(Condition::new(
            CONDITION_STATE_LOCKED,
            ConditionStatus::False,
            REASON_FORCE_UNLOCK,
            message,
        ));
        let lock = &mut self.status_mut().lock;
        promote_pending_lock(lock);
        lock.pending.clear();
        self
    }

    /// Record the holder of a state lock that blocked planning
    #[must_use]
    pub fn state_locked(mut self, lock_id: &str, message: &str) -> Self {
        let condition = Condition::new(
            CONDITION_STATE_LOCKED,
            ConditionStatus::True,
            REASON_LOCK_HELD,
            message,
        );
        let readiness_message = condition.message.clone();
        self.set_status_condition(condition);
        self.set_readiness(ConditionStatus::False, REASON_LOCK_HELD, readiness_message, "");

        let lock = &mut self.status_mut().lock;
        promote_pending_lock(lock);
        lock.pending = lock_id.to_string();
        self
    }
}

fn promote_pending_lock(lock: &mut LockStatus) {
    if !lock.pending.is_empty() && lock.last_applied != lock.pending {
        lock.last_applied = lock.pending.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{SourceRef, TerraformSpec};
    use chrono::Duration;

    const REVISION: &str = "main/abcdefabcdefabcdefabcdefabcdefabcdefabcd";

    fn terraform() -> Terraform {
        let mut tf = Terraform::new(
            "helloworld",
            TerraformSpec {
                interval: "1m".to_string(),
                source_ref: SourceRef {
                    kind: "GitRepository".to_string(),
                    name: "helloworld".to_string(),
                    namespace: None,
                },
                ..Default::default()
            },
        );
        tf.metadata.namespace = Some("flux-system".to_string());
        tf.metadata.generation = Some(3);
        tf
    }

    #[test]
    fn test_plan_id_and_short_id() {
        let (plan_id, message) = plan_id_and_approve_message(REVISION, "Plan generated");
        assert_eq!(plan_id, "plan-main-abcdefabcdefabcdefabcdefabcdefabcdefabcd");
        assert_eq!(
            message,
            "Plan generated: set approvePlan: \"plan-main-abcdefabcd\" to approve this plan."
        );
    }

    #[test]
    fn test_plan_id_without_commit_suffix() {
        let (plan_id, message) = plan_id_and_approve_message("v1.0.0", "Plan generated");
        assert_eq!(plan_id, "plan-v1.0.0");
        assert!(message.contains("\"plan-v1.0.0\""));

        let (plan_id, message) = plan_id_and_approve_message("main/abc", "Plan generated");
        assert_eq!(plan_id, "plan-main-abc");
        assert!(message.contains("\"plan-main-abc\""));
    }

    #[test]
    fn test_planned_with_changes_manual_embeds_short_id() {
        let tf = terraform().planned_with_changes(REVISION, false, "Plan generated");
        let status = tf.status.clone().unwrap();
        assert_eq!(
            status.plan.pending,
            "plan-main-abcdefabcdefabcdefabcdefabcdefabcdefabcd"
        );
        assert_eq!(status.last_planned_revision, REVISION);
        assert_eq!(status.observed_generation, 3);
        let ready = tf.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::Unknown);
        assert!(ready.message.contains("plan-main-abcdefabcd"));
    }

    #[test]
    fn test_planned_with_changes_auto_keeps_plain_message() {
        let tf = terraform().planned_with_changes(REVISION, true, "Plan generated");
        let ready = tf.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.message, "Plan generated");
    }

    #[test]
    fn test_applied_moves_pending_to_last_applied() {
        let entries = vec![ResourceRef {
            name: "null_resource.hello".to_string(),
            resource_type: "null_resource".to_string(),
            identifier: "123".to_string(),
        }];
        let tf = terraform()
            .planned_with_changes(REVISION, true, "Plan generated")
            .applied(REVISION, "Applied successfully", false, entries.clone());
        let status = tf.status.clone().unwrap();
        assert_eq!(status.plan.pending, "");
        assert_eq!(
            status.plan.last_applied,
            "plan-main-abcdefabcdefabcdefabcdefabcdefabcdefabcd"
        );
        assert_eq!(status.last_applied_revision, REVISION);
        assert_eq!(status.inventory.unwrap().entries, entries);
        assert!(status.last_applied_by_drift_detection_at.is_none());
        assert_eq!(
            tf.condition(CONDITION_APPLY).unwrap().status,
            ConditionStatus::True
        );
    }

    #[test]
    fn test_applied_keeps_inventory_when_no_entries() {
        let mut tf = terraform();
        tf.status_mut().inventory = Some(ResourceInventory {
            entries: vec![ResourceRef::default()],
        });
        let tf = tf.applied(REVISION, "Applied successfully", false, Vec::new());
        assert_eq!(tf.status.unwrap().inventory.unwrap().entries.len(), 1);
    }

    #[test]
    fn test_applying_drift_plan_stamps_correction_time() {
        let mut tf = terraform().applied(REVISION, "Applied successfully", false, Vec::new());
        tf.status_mut().last_drift_detected_at = Some(Utc::now() + Duration::seconds(5));
        assert!(tf.has_drift());

        let tf = tf
            .planned_with_changes(REVISION, true, "Plan generated")
            .applied(REVISION, "Applied successfully", false, Vec::new());
        let status = tf.status.unwrap();
        assert!(status.last_applied_by_drift_detection_at.is_some());
        assert!(!status.plan.is_drift_detection_plan);
    }

    #[test]
    fn test_applied_fail_resets_pending_plan() {
        let tf = terraform()
            .planned_with_changes(REVISION, true, "Plan generated")
            .applied_fail_reset_plan_and_not_ready(REVISION, REASON_APPLY_FAILED, "boom");
        assert_eq!(tf.pending_plan(), "");
        assert_eq!(tf.readiness(), Some(ConditionStatus::False));
        assert_eq!(
            tf.condition(CONDITION_APPLY).unwrap().reason,
            REASON_APPLIED_FAIL
        );
    }

    #[test]
    fn test_has_drift_under_any_condition_order() {
        let applied_at = Utc::now();
        let apply = Condition {
            r#type: CONDITION_APPLY.to_string(),
            status: ConditionStatus::True,
            reason: REASON_APPLY_SUCCEEDED.to_string(),
            message: String::new(),
            last_transition_time: Some(applied_at),
        };
        let ready = Condition {
            r#type: CONDITION_READY.to_string(),
            status: ConditionStatus::False,
            reason: REASON_DRIFT_DETECTED.to_string(),
            message: String::new(),
            last_transition_time: Some(applied_at + Duration::seconds(60)),
        };
        let plan = Condition::new(CONDITION_PLAN, ConditionStatus::True, "x", "");

        let orderings = [
            vec![apply.clone(), ready.clone(), plan.clone()],
            vec![ready.clone(), apply.clone(), plan.clone()],
            vec![plan.clone(), ready.clone(), apply.clone()],
        ];
        for conditions in orderings {
            let mut tf = terraform();
            tf.status_mut().conditions = conditions.clone();

            tf.status_mut().last_drift_detected_at = Some(applied_at + Duration::seconds(1));
            assert!(tf.has_drift());

            tf.status_mut().last_drift_detected_at = Some(applied_at - Duration::seconds(1));
            assert!(!tf.has_drift());

            tf.status_mut().last_drift_detected_at = None;
            assert!(!tf.has_drift());
        }
    }

    #[test]
    fn test_has_drift_requires_true_apply() {
        let now = Utc::now();
        let mut tf = terraform();
        tf.status_mut().conditions = vec![Condition {
            r#type: CONDITION_APPLY.to_string(),
            status: ConditionStatus::False,
            reason: REASON_APPLIED_FAIL.to_string(),
            message: String::new(),
            last_transition_time: Some(now),
        }];
        tf.status_mut().last_drift_detected_at = Some(now + Duration::seconds(10));
        assert!(!tf.has_drift());
    }

    #[test]
    fn test_drift_detected_then_no_drift() {
        let tf = terraform().drift_detected(REVISION, REASON_DRIFT_DETECTED, "changes found");
        assert!(tf.status.as_ref().unwrap().last_drift_detected_at.is_some());
        assert_eq!(tf.readiness(), Some(ConditionStatus::False));

        let tf = tf.no_drift(REVISION, REASON_NO_DRIFT, "No drift");
        let ready = tf.condition(CONDITION_READY).unwrap();
        assert_eq!(ready.status, ConditionStatus::True);
        assert_eq!(ready.message, format!("No drift: {REVISION}"));
    }

    #[test]
    fn test_lock_transitions_promote_pending_holder() {
        let tf = terraform().state_locked("lock-a", "locked by a");
        let lock = tf.status.clone().unwrap().lock;
        assert_eq!(lock.pending, "lock-a");
        assert_eq!(lock.last_applied, "");
        assert_eq!(tf.readiness(), Some(ConditionStatus::False));

        let tf = tf.state_locked("lock-b", "locked by b");
        let lock = tf.status.clone().unwrap().lock;
        assert_eq!(lock.pending, "lock-b");
        assert_eq!(lock.last_applied, "lock-a");

        let tf = tf.force_unlocked("unlocked");
        let lock = tf.status.clone().unwrap().lock;
        assert_eq!(lock.pending, "");
        assert_eq!(lock.last_applied, "lock-b");
        assert_eq!(
            tf.condition(CONDITION_STATE_LOCKED).unwrap().status,
            ConditionStatus::False
        );
    }

    #[test]
    fn test_progressing_keeps_observed_generation() {
        let tf = terraform().progressing("Reconciliation in progress");
        let status = tf.status.clone().unwrap();
        assert_eq!(status.observed_generation, 0);
        assert_eq!(tf.readiness(), Some(ConditionStatus::Unknown));
    }
}
