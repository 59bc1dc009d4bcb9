//! # Plan/Apply/Drift Cycle
//!
//! One pass of the state machine against a connected runner:
//!
//! 1. Download and verify the artifact, then set up a runner workspace
//! 2. Force-unlock the state when the object asks for it
//! 3. Drift detection on settled objects
//! 4. Plan, when no plan is pending (or forced)
//! 5. Apply, when the pending plan is approved
//! 6. Outputs and health checks after a successful apply
//!
//! Every outcome is recorded as a condition transition on the returned object.
//! Intermediate states (a fresh plan, an apply in progress) are persisted as
//! they happen; the caller persists the final state.

use super::approval::{force_or_auto_apply, should_apply, should_detect_drift, should_plan};
use super::cluster::StoreError;
use super::health::run_health_checks;
use super::source::Artifact;
use super::status::StatusWriter;
use super::types::Reconciler;
use crate::constants::APPROVE_PLAN_AUTO;
use crate::crd::{
    ConditionStatus, ForceUnlock, ObjectKey, Terraform, CONDITION_APPLY, CONDITION_HEALTH_CHECK,
    CONDITION_READY, REASON_APPLY_FAILED, REASON_APPLY_SUCCEEDED, REASON_ARTIFACT_FAILED,
    REASON_DRIFT_DETECTED, REASON_DRIFT_DETECTION_FAILED, REASON_FORCE_UNLOCK,
    REASON_HEALTH_CHECKS_FAILED, REASON_INIT_FAILED, REASON_NO_DRIFT, REASON_OUTPUTS_WRITING_FAILED,
    REASON_OUTPUT_FAILED, REASON_PLAN_FAILED,
};
use crate::runner::{ApplyRequest, PlanRequest, RunnerError, SetupRequest, TerraformRunner};
use kube::ResourceExt;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// How a cycle ended
#[derive(Debug)]
pub enum CycleOutcome {
    /// Nothing failed; the status says what happened (applied, planned, awaiting approval)
    Completed,
    /// Drift was found and is not corrected automatically
    Drifted { message: String },
    /// A step failed; the failure is recorded in the status
    Failed { message: String },
    /// An intermediate status write failed
    Interrupted(StoreError),
}

#[derive(Debug)]
pub struct CycleReport {
    pub terraform: Terraform,
    pub outcome: CycleOutcome,
}

impl CycleReport {
    fn completed(terraform: Terraform) -> Self {
        Self {
            terraform,
            outcome: CycleOutcome::Completed,
        }
    }

    fn failed(terraform: Terraform, message: String) -> Self {
        Self {
            terraform,
            outcome: CycleOutcome::Failed { message },
        }
    }

    fn interrupted(terraform: Terraform, error: StoreError) -> Self {
        Self {
            terraform,
            outcome: CycleOutcome::Interrupted(error),
        }
    }
}

/// Run one cycle for `terraform` at `artifact`'s revision
pub async fn run_cycle(
    ctx: &Reconciler,
    writer: &mut StatusWriter<'_>,
    runner: &dyn TerraformRunner,
    terraform: Terraform,
    artifact: &Artifact,
) -> CycleReport {
    let revision = artifact.revision.as_str();

    let bytes = match ctx.fetcher.fetch(artifact).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let message = e.to_string();
            warn!("❌ Artifact for {} rejected: {}", terraform.key(), message);
            let terraform = terraform.not_ready(revision, REASON_ARTIFACT_FAILED, message.as_str());
            return CycleReport::failed(terraform, message);
        }
    };

    let instance_id = match runner.setup(setup_request(&terraform, revision, bytes)).await {
        Ok(id) => id,
        Err(e) => {
            let message = format!("error running Init: {e}");
            let terraform = terraform.not_ready(revision, REASON_INIT_FAILED, message.as_str());
            return CycleReport::failed(terraform, message);
        }
    };
    debug!("Runner workspace {} ready for {}", instance_id, terraform.key());

    let report = run_steps(ctx, writer, runner, &instance_id, terraform, revision).await;

    if let Err(e) = runner.cleanup(&instance_id).await {
        warn!("Failed to clean up runner workspace {}: {}", instance_id, e);
    }
    report
}

/// Destroy everything the object manages, ahead of removing its finalizer
///
/// The cycle runs on a copy that plans a destroy and approves it; the pending
/// plan of the stored object is ignored.
pub async fn run_destroy_cycle(
    ctx: &Reconciler,
    writer: &mut StatusWriter<'_>,
    runner: &dyn TerraformRunner,
    terraform: &Terraform,
    artifact: &Artifact,
) -> CycleReport {
    let mut destroying = terraform.clone();
    destroying.spec.destroy = true;
    destroying.spec.approve_plan = APPROVE_PLAN_AUTO.to_string();
    destroying.spec.force = false;
    destroying.status_mut().plan.pending.clear();
    info!("💥 Destroying resources of {}", terraform.key());
    run_cycle(ctx, writer, runner, destroying, artifact).await
}

fn setup_request(terraform: &Terraform, revision: &str, artifact: Vec<u8>) -> SetupRequest {
    let vars = terraform
        .spec
        .vars
        .iter()
        .map(|v| {
            (
                v.name.clone(),
                v.value.clone().unwrap_or(serde_json::Value::Null),
            )
        })
        .collect();
    SetupRequest {
        name: terraform.name_any(),
        namespace: terraform.namespace().unwrap_or_default(),
        revision: revision.to_string(),
        path: terraform.spec.path.clone(),
        workspace: terraform.workspace_name().to_string(),
        artifact,
        vars,
        backend_config: terraform.spec.backend_config.clone(),
    }
}

async fn run_steps(
    ctx: &Reconciler,
    writer: &mut StatusWriter<'_>,
    runner: &dyn TerraformRunner,
    instance_id: &str,
    mut terraform: Terraform,
    revision: &str,
) -> CycleReport {
    // Force unlock
    if let Some(lock_id) = lock_to_release(&terraform) {
        match runner.force_unlock(instance_id, &lock_id).await {
            Ok(()) => {
                info!("🔓 Force unlocked state of {} (lock {})", terraform.key(), lock_id);
                terraform = terraform.force_unlocked(&format!(
                    "Terraform Force Unlock with Lock Identifier: {lock_id}"
                ));
            }
            Err(e) => {
                let message = format!("error running ForceUnlock: {e}");
                let terraform = terraform.not_ready(revision, REASON_FORCE_UNLOCK, message.as_str());
                return CycleReport::failed(terraform, message);
            }
        }
    }

    // Drift detection
    if should_detect_drift(&terraform, revision) {
        match detect_drift(runner, instance_id, &terraform).await {
            Ok(None) => {
                debug!("No drift for {}", terraform.key());
                terraform = terraform.no_drift(revision, REASON_NO_DRIFT, "No drift");
                if outputs_secret_missing(ctx, &terraform).await {
                    return match process_outputs(ctx, runner, instance_id, terraform, revision).await {
                        Ok((terraform, _)) => CycleReport::completed(terraform),
                        Err((terraform, message)) => CycleReport::failed(terraform, message),
                    };
                }
                return CycleReport::completed(terraform);
            }
            Ok(Some(message)) => {
                info!("🌊 Drift detected for {}", terraform.key());
                terraform = terraform.drift_detected(revision, REASON_DRIFT_DETECTED, &message);
                if !force_or_auto_apply(&terraform) {
                    return CycleReport {
                        terraform,
                        outcome: CycleOutcome::Drifted { message },
                    };
                }
                if let Err(e) = writer.persist(&terraform).await {
                    return CycleReport::interrupted(terraform, e);
                }
            }
            Err(RunnerError::StateLocked { lock_id, .. }) => {
                let (terraform, message) = record_state_lock(terraform, &lock_id);
                return CycleReport::failed(terraform, message);
            }
            Err(e) => {
                let message = format!("error running drift detection: {e}");
                let terraform =
                    terraform.not_ready(revision, REASON_DRIFT_DETECTION_FAILED, message.as_str());
                return CycleReport::failed(terraform, message);
            }
        }
    }

    // Plan
    if should_plan(&terraform) {
        let request = PlanRequest {
            instance_id: instance_id.to_string(),
            destroy: terraform.spec.destroy,
            drift_detection: false,
            refresh_before_apply: terraform.spec.refresh_before_apply,
            targets: terraform.spec.targets.clone(),
        };
        match runner.plan(request).await {
            Ok(reply) if reply.has_changes => {
                info!("📝 Plan with changes for {} at {}", terraform.key(), revision);
                let auto = force_or_auto_apply(&terraform);
                terraform = terraform.planned_with_changes(revision, auto, "Plan generated");
            }
            Ok(_) => {
                info!("📝 Plan without changes for {} at {}", terraform.key(), revision);
                terraform = terraform.planned_no_changes(revision, "Plan no changes");
            }
            Err(RunnerError::StateLocked { lock_id, .. }) => {
                let (terraform, message) = record_state_lock(terraform, &lock_id);
                return CycleReport::failed(terraform, message);
            }
            Err(e) => {
                let message = format!("error running Plan: {e}");
                let terraform = terraform.not_ready(revision, REASON_PLAN_FAILED, message.as_str());
                return CycleReport::failed(terraform, message);
            }
        }
        if let Err(e) = writer.persist(&terraform).await {
            return CycleReport::interrupted(terraform, e);
        }
    }

    if !should_apply(&terraform) {
        return CycleReport::completed(terraform);
    }

    // Apply
    terraform = terraform.applying(revision, "Apply started");
    if let Err(e) = writer.persist(&terraform).await {
        return CycleReport::interrupted(terraform, e);
    }

    let is_destroy = terraform.status_or_default().plan.is_destroy_plan;
    let request = ApplyRequest {
        instance_id: instance_id.to_string(),
        enable_inventory: terraform.spec.enable_inventory,
    };
    let applied_message = if is_destroy {
        "Destroy applied successfully"
    } else {
        "Applied successfully"
    };
    match runner.apply(request).await {
        Ok(reply) => {
            info!("✅ Applied {} at {}", terraform.key(), revision);
            let inventory = if terraform.spec.enable_inventory {
                reply.inventory
            } else {
                Vec::new()
            };
            terraform = terraform.applied(revision, applied_message, is_destroy, inventory);
        }
        Err(e) => {
            let message = format!("error running Apply: {e}");
            let terraform = terraform.applied_fail_reset_plan_and_not_ready(
                revision,
                REASON_APPLY_FAILED,
                &message,
            );
            return CycleReport::failed(terraform, message);
        }
    }

    let mut outputs = BTreeMap::new();
    if !is_destroy {
        match process_outputs(ctx, runner, instance_id, terraform, revision).await {
            Ok((processed, values)) => {
                terraform = processed;
                outputs = values;
            }
            Err((terraform, message)) => return CycleReport::failed(terraform, message),
        }
    }

    if should_run_health_checks(&terraform) {
        match run_health_checks(&terraform.spec.health_checks, &outputs).await {
            Ok(()) => {
                terraform = terraform.health_check_succeeded("Health checks succeeded");
            }
            Err(message) => {
                warn!("❌ Health checks failed for {}: {}", terraform.key(), message);
                let terraform = terraform.health_check_failed(&message).not_ready(
                    revision,
                    REASON_HEALTH_CHECKS_FAILED,
                    message.as_str(),
                );
                return CycleReport::failed(terraform, message);
            }
        }
    }

    let still_applying = terraform.condition(CONDITION_READY).is_some_and(|c| {
        c.status == ConditionStatus::Unknown && c.reason == REASON_APPLY_SUCCEEDED
    });
    if still_applying {
        terraform = terraform.ready(revision, REASON_APPLY_SUCCEEDED, applied_message);
    }
    CycleReport::completed(terraform)
}

/// Lock id to force-unlock, if the object's `tfstate` policy allows it
fn lock_to_release(terraform: &Terraform) -> Option<String> {
    let tfstate = terraform.spec.tfstate.as_ref()?;
    let pending = terraform.status.as_ref()?.lock.pending.clone();
    if pending.is_empty() {
        return None;
    }
    let allowed = match tfstate.force_unlock {
        ForceUnlock::Auto => true,
        ForceUnlock::Yes => tfstate.lock_identifier == pending,
        ForceUnlock::No => false,
    };
    allowed.then_some(pending)
}

fn record_state_lock(terraform: Terraform, lock_id: &str) -> (Terraform, String) {
    let message = format!("Terraform Locked with Lock Identifier: {lock_id}");
    warn!("🔒 State of {} is locked by {}", terraform.key(), lock_id);
    (terraform.state_locked(lock_id, &message), message)
}

/// Drift-detection plan; `Some` carries the human-readable plan of the drift
async fn detect_drift(
    runner: &dyn TerraformRunner,
    instance_id: &str,
    terraform: &Terraform,
) -> Result<Option<String>, RunnerError> {
    let reply = runner
        .plan(PlanRequest {
            instance_id: instance_id.to_string(),
            destroy: false,
            drift_detection: true,
            refresh_before_apply: false,
            targets: terraform.spec.targets.clone(),
        })
        .await?;
    if !reply.has_changes {
        return Ok(None);
    }
    let shown = runner.show_plan(instance_id).await?;
    Ok(Some(shown))
}

async fn outputs_secret_missing(ctx: &Reconciler, terraform: &Terraform) -> bool {
    let Some(spec) = terraform.spec.write_outputs_to_secret.as_ref() else {
        return false;
    };
    let key = ObjectKey::new(terraform.namespace().unwrap_or_default(), spec.name.clone());
    match ctx.store.secret_exists(&key).await {
        Ok(exists) => !exists,
        Err(e) => {
            warn!("Unable to check outputs secret {}: {}", key, e);
            false
        }
    }
}

/// Read outputs, record them, and write the selected ones to the outputs secret
///
/// Returns the outputs rendered as strings for health check placeholders.
async fn process_outputs(
    ctx: &Reconciler,
    runner: &dyn TerraformRunner,
    instance_id: &str,
    terraform: Terraform,
    revision: &str,
) -> Result<(Terraform, BTreeMap<String, String>), (Terraform, String)> {
    let outputs = match runner.outputs(instance_id).await {
        Ok(outputs) => outputs,
        Err(e) => {
            let message = format!("error running Output: {e}");
            return Err((
                terraform.not_ready(revision, REASON_OUTPUT_FAILED, message.as_str()),
                message,
            ));
        }
    };

    let names: Vec<String> = outputs.keys().cloned().collect();
    let mut terraform = terraform.outputs_available(names, "Outputs available");
    let values: BTreeMap<String, String> = outputs
        .iter()
        .map(|(name, output)| (name.clone(), output_to_string(&output.value)))
        .collect();

    let Some(spec) = terraform.spec.write_outputs_to_secret.clone() else {
        return Ok((terraform, values));
    };
    let data = select_outputs(&values, &spec.outputs);
    if let Err(e) = ctx.store.write_outputs_secret(&terraform, &spec.name, data).await {
        let message = format!("error writing outputs to secret {}: {e}", spec.name);
        return Err((
            terraform.not_ready(revision, REASON_OUTPUTS_WRITING_FAILED, message.as_str()),
            message,
        ));
    }
    debug!("Outputs of {} written to secret {}", terraform.key(), spec.name);
    terraform = terraform.outputs_written(revision, "Outputs written");
    Ok((terraform, values))
}

/// Strings go in verbatim; everything else as JSON
pub fn output_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Pick the outputs to write to the secret
///
/// An empty allow-list selects everything. Entries are `name` or
/// `name:alias`, the alias becoming the secret key. Unknown names are skipped.
pub fn select_outputs(
    values: &BTreeMap<String, String>,
    allow_list: &[String],
) -> BTreeMap<String, String> {
    if allow_list.is_empty() {
        return values.clone();
    }
    allow_list
        .iter()
        .filter_map(|entry| {
            let (name, alias) = entry.split_once(':').unwrap_or((entry, entry));
            match values.get(name) {
                Some(value) => Some((alias.to_string(), value.clone())),
                None => {
                    warn!("Output '{}' not found, not writing it to the secret", name);
                    None
                }
            }
        })
        .collect()
}

/// Checks run after a failed check, or after an apply that has not been checked yet
fn should_run_health_checks(terraform: &Terraform) -> bool {
    if terraform.spec.health_checks.is_empty() {
        return false;
    }
    match terraform.condition(CONDITION_HEALTH_CHECK) {
        Some(check) => check.status == ConditionStatus::False,
        None => terraform
            .condition(CONDITION_APPLY)
            .is_some_and(|c| c.reason == REASON_APPLY_SUCCEEDED),
    }
}
