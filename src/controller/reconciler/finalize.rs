//! # Finalize
//!
//! Deletion of a Terraform object once no dependant holds it: optionally
//! destroy what it manages, release the back-reference finalizers it placed on
//! its dependencies, then drop its own finalizer.

use super::cycle::{run_destroy_cycle, CycleOutcome};
use super::dependency::dependant_finalizer;
use super::source::Artifact;
use super::status::StatusWriter;
use super::types::{Reconciler, ReconcilerError, Requeue};
use crate::constants::TERRAFORM_FINALIZER;
use crate::crd::Terraform;
use crate::runner::TerraformRunner;
use kube::ResourceExt;
use tracing::{debug, info};

/// Deletion has to destroy resources before the finalizer can go
pub fn needs_destroy(terraform: &Terraform) -> bool {
    if !terraform.spec.destroy_resources_on_deletion {
        return false;
    }
    !terraform.status_or_default().plan.is_destroy_applied
}

/// Plan and apply a destroy, persisting the outcome
///
/// The returned object keeps its own spec; only the status reflects the destroy.
pub async fn destroy_resources(
    ctx: &Reconciler,
    writer: &mut StatusWriter<'_>,
    runner: &dyn TerraformRunner,
    terraform: Terraform,
    artifact: &Artifact,
) -> Result<Terraform, ReconcilerError> {
    let report = run_destroy_cycle(ctx, writer, runner, &terraform, artifact).await;
    let mut destroyed = report.terraform;
    destroyed.spec = terraform.spec;

    match report.outcome {
        CycleOutcome::Interrupted(e) => Err(e.into()),
        CycleOutcome::Failed { message } | CycleOutcome::Drifted { message } => {
            writer.persist(&destroyed).await?;
            Err(ReconcilerError::Finalize(message))
        }
        CycleOutcome::Completed => {
            writer.persist(&destroyed).await?;
            Ok(destroyed)
        }
    }
}

/// Release dependencies and remove the controlling finalizer
///
/// Dependencies that no longer exist are skipped.
pub async fn remove_finalizers(
    ctx: &Reconciler,
    terraform: &Terraform,
) -> Result<Requeue, ReconcilerError> {
    let finalizer = dependant_finalizer(&terraform.name_any());
    for dependency in terraform.dependency_keys() {
        match ctx.store.remove_finalizer(&dependency, &finalizer).await {
            Ok(()) => debug!("Released dependency {}", dependency),
            Err(e) if e.is_not_found() => {
                debug!("Dependency {} already gone", dependency);
            }
            Err(e) => return Err(e.into()),
        }
    }

    let key = terraform.key();
    match ctx.store.remove_finalizer(&key, TERRAFORM_FINALIZER).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }
    info!("🗑️  Finalized {}", key);
    Ok(Requeue::AwaitChange)
}
