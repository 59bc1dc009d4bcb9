//! # Approval
//!
//! Decisions that gate planning, applying and drift detection. `approvePlan`
//! is the only manual gate: empty means manual, `auto` applies every plan, and
//! any other value approves the pending plan it names (the short id printed in
//! the Ready message is a prefix of the full plan id).

use crate::crd::Terraform;

/// Plan when forced or when no plan is waiting for approval
pub fn should_plan(terraform: &Terraform) -> bool {
    terraform.spec.force || terraform.pending_plan().is_empty()
}

/// Apply the pending plan
pub fn should_apply(terraform: &Terraform) -> bool {
    if terraform.spec.force {
        return true;
    }
    let approve_plan = terraform.spec.approve_plan.as_str();
    if approve_plan.is_empty() {
        return false;
    }
    let pending = terraform.pending_plan();
    if pending.is_empty() {
        return false;
    }
    terraform.is_auto_approve() || approve_plan == pending || pending.starts_with(approve_plan)
}

pub fn force_or_auto_apply(terraform: &Terraform) -> bool {
    terraform.spec.force || terraform.is_auto_approve()
}

/// Run a drift-detection plan before the normal cycle
///
/// Only objects that have fully reconciled their current generation are
/// checked: either everything (attempted, planned, applied) is at the same
/// revision, or the current source revision was both attempted and planned.
pub fn should_detect_drift(terraform: &Terraform, revision: &str) -> bool {
    if terraform.spec.disable_drift_detection || terraform.spec.destroy {
        return false;
    }
    let Some(status) = terraform.status.as_ref() else {
        return false;
    };
    if status.last_attempted_revision.is_empty()
        && status.last_planned_revision.is_empty()
        && status.last_applied_revision.is_empty()
    {
        return false;
    }
    let settled =
        status.plan.pending.is_empty() && terraform.generation() == status.observed_generation;
    if !settled {
        return false;
    }

    let all_agree = status.last_attempted_revision == status.last_planned_revision
        && status.last_planned_revision == status.last_applied_revision;
    let current_planned = status.last_attempted_revision == revision
        && status.last_planned_revision == revision;
    all_agree || current_planned
}
