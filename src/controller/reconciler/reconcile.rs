//! # Reconcile
//!
//! Per-object control loop. Each attempt re-reads the object and works only
//! from its stored status, so it can be re-run from any point:
//!
//! 1. Wait for certificate readiness and rotate an invalid CA
//! 2. Fetch the object and ensure the controlling finalizer
//! 3. Stop when suspended, or when deletion is blocked by dependants
//! 4. Resolve the source artifact and check dependencies
//! 5. Acquire a runner, run the cycle (or the finalize sequence), persist status
//! 6. Pick the requeue: interval, retry interval, or wait for a change

use super::approval::{force_or_auto_apply, should_apply};
use super::cycle::{run_cycle, CycleOutcome, CycleReport};
use super::dependency::{blocking_dependants, check_dependencies};
use super::events::EventSeverity;
use super::finalize::{destroy_resources, needs_destroy, remove_finalizers};
use super::runner::{acquire, release};
use super::source::{Artifact, SourceObject};
use super::status::StatusWriter;
use super::types::{Reconciler, ReconcilerError, Requeue};
use crate::constants::TERRAFORM_FINALIZER;
use crate::crd::{
    format_duration, ConditionStatus, ObjectKey, SourceKind, Terraform, CONDITION_READY,
    REASON_ARTIFACT_FAILED, REASON_DELETION_BLOCKED_BY_DEPENDANTS, REASON_DEPENDENCY_NOT_READY,
    REASON_NO_DRIFT, REASON_RUNNER_ACQUISITION_FAILED,
};
use crate::observability::metrics;
use crate::runner::TerraformRunner;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Watch loop entry point
pub async fn reconcile(
    terraform: Arc<Terraform>,
    ctx: Arc<Reconciler>,
) -> Result<Action, ReconcilerError> {
    let key = terraform.key();
    let loop_id = uuid::Uuid::new_v4().to_string();
    let span = info_span!(
        "controller.reconcile",
        resource.name = %key.name,
        resource.namespace = %key.namespace,
        loop.id = %loop_id
    );
    let start = Instant::now();

    async move {
        metrics::increment_reconciliations();
        let result = reconcile_object(&ctx, &key).await;
        metrics::observe_reconciliation_duration(start.elapsed().as_secs_f64());

        match result {
            Ok(requeue) => {
                ctx.reset_backoff(&key.to_string());
                if let Requeue::After(delay) = requeue {
                    debug!("Requeueing {} in {}", key, format_duration(delay));
                }
                Ok(requeue.into())
            }
            Err(e) => {
                metrics::increment_reconciliation_errors();
                error!("❌ Reconciliation of {} failed: {}", key, e);
                Err(e)
            }
        }
    }
    .instrument(span)
    .await
}

/// One reconciliation attempt for the object stored under `key`
pub async fn reconcile_object(
    ctx: &Reconciler,
    key: &ObjectKey,
) -> Result<Requeue, ReconcilerError> {
    ctx.rotation.wait_ready().await?;
    ctx.rotation.ensure_valid_ca(&key.namespace).await?;

    let Some(terraform) = ctx.store.get_terraform(key).await? else {
        debug!("{} not found, already deleted", key);
        return Ok(Requeue::AwaitChange);
    };

    if !terraform.is_deleting() && !terraform.finalizers().iter().any(|f| f == TERRAFORM_FINALIZER)
    {
        ctx.store.add_finalizer(key, TERRAFORM_FINALIZER).await?;
    }

    metrics::record_suspend(&key.namespace, &key.name, terraform.spec.suspend);
    if terraform.spec.suspend {
        info!("⏸️  Reconciliation is suspended for {}", key);
        return Ok(Requeue::AwaitChange);
    }

    let mut writer = StatusWriter::new(ctx, &terraform);
    let retry = terraform.retry_interval();

    if terraform.is_deleting() {
        let dependants = blocking_dependants(&terraform);
        if !dependants.is_empty() {
            let message = format!(
                "Deletion in progress, but blocked. Please delete {} to resume ...",
                dependants.join(", ")
            );
            info!("🚧 {}", message);
            let terraform = terraform.not_ready("", REASON_DELETION_BLOCKED_BY_DEPENDANTS, message);
            writer.persist(&terraform).await?;
            metrics::increment_requeues_total("deletion-blocked");
            return Ok(Requeue::After(retry));
        }
        if !needs_destroy(&terraform) {
            return remove_finalizers(ctx, &terraform).await;
        }
    }

    let source = match resolve_source(ctx, &terraform).await? {
        Ok(source) => source,
        Err(message) => {
            info!("📦 {}", message);
            let terraform = terraform.not_ready("", REASON_ARTIFACT_FAILED, message);
            writer.persist(&terraform).await?;
            metrics::increment_requeues_total("artifact");
            return Ok(Requeue::After(retry));
        }
    };
    let Some(artifact) = source.artifact.clone() else {
        let message = "Source is not ready, artifact not found";
        info!("📦 {} ({})", message, source.key);
        let terraform = terraform.not_ready("", REASON_ARTIFACT_FAILED, message);
        writer.persist(&terraform).await?;
        metrics::increment_requeues_total("artifact");
        return Ok(Requeue::After(retry));
    };
    let revision = artifact.revision.clone();

    if !terraform.is_deleting() && !terraform.spec.depends_on.is_empty() {
        if let Err(e) = check_dependencies(ctx.store.as_ref(), &source, &terraform).await {
            let terraform = terraform.not_ready(&revision, REASON_DEPENDENCY_NOT_READY, e.to_string());
            writer.persist(&terraform).await?;
            let message = format!(
                "Dependencies do not meet ready condition, retrying in {}",
                format_duration(retry)
            );
            info!("⏳ {}: {}", message, e);
            ctx.events
                .publish(&terraform, EventSeverity::Info, &revision, &message)
                .await;
            metrics::increment_requeues_total("dependency");
            return Ok(Requeue::After(retry));
        }
        info!("All dependencies are ready, proceeding with reconciliation");
    }

    let mut terraform = terraform;
    if terraform.readiness() != Some(ConditionStatus::Unknown) {
        let message = if terraform.is_deleting() {
            "Deletion in progress"
        } else {
            "Reconciliation in progress"
        };
        terraform = terraform.progressing(message);
        writer.persist(&terraform).await?;
    }

    let connection = match acquire(ctx, &terraform).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("❌ Unable to get a runner for {}: {}", key, e);
            let failed = terraform.not_ready(
                &revision,
                REASON_RUNNER_ACQUISITION_FAILED,
                format!("failed to get runner: {e}"),
            );
            writer.persist(&failed).await?;
            return Err(e.into());
        }
    };

    let runner = Arc::clone(&connection.runner);
    let cleanup_target = terraform.clone();
    let result = drive(ctx, &mut writer, runner.as_ref(), terraform, &artifact).await;
    release(ctx, &cleanup_target, connection).await;
    result
}

/// Source referenced by the object
///
/// The outer error is a transient store failure; the inner one is the message
/// for a source that is missing or of an unsupported kind.
async fn resolve_source(
    ctx: &Reconciler,
    terraform: &Terraform,
) -> Result<Result<SourceObject, String>, ReconcilerError> {
    let source_ref = &terraform.spec.source_ref;
    let source_key = terraform.source_key();
    let Some(kind) = SourceKind::from_kind(&source_ref.kind) else {
        return Ok(Err(format!(
            "source `{}` kind '{}' not supported",
            source_key, source_ref.kind
        )));
    };

    match ctx.store.get_source(kind, &source_key).await? {
        Some(source) => Ok(Ok(source)),
        None => Ok(Err(format!("Source '{}/{}' not found", source_ref.kind, source_key))),
    }
}

/// Everything after the runner is connected
async fn drive(
    ctx: &Reconciler,
    writer: &mut StatusWriter<'_>,
    runner: &dyn TerraformRunner,
    mut terraform: Terraform,
    artifact: &Artifact,
) -> Result<Requeue, ReconcilerError> {
    if terraform.is_deleting() {
        let destroyed = destroy_resources(ctx, writer, runner, terraform, artifact).await?;
        return remove_finalizers(ctx, &destroyed).await;
    }

    let revision = artifact.revision.as_str();
    let last_attempted = terraform.status_or_default().last_attempted_revision;
    if revision != last_attempted && !should_apply(&terraform) {
        if !terraform.pending_plan().is_empty() {
            info!(
                "New revision {} for {}, dropping pending plan {}",
                revision,
                terraform.key(),
                terraform.pending_plan()
            );
        }
        terraform.status_mut().plan.pending.clear();
        writer.persist(&terraform).await?;
    }

    if !terraform.pending_plan().is_empty() && !force_or_auto_apply(&terraform) && !should_apply(&terraform)
    {
        info!(
            "⏳ Plan {} of {} is waiting for approval",
            terraform.pending_plan(),
            terraform.key()
        );
        return Ok(Requeue::AwaitChange);
    }

    let CycleReport { terraform, outcome } = run_cycle(ctx, writer, runner, terraform, artifact).await;
    let retry = terraform.retry_interval();

    match outcome {
        CycleOutcome::Interrupted(e) => Err(e.into()),
        CycleOutcome::Drifted { message } => {
            writer.persist(&terraform).await?;
            info!(
                "🌊 Drift detected for {}, retrying in {}",
                terraform.key(),
                format_duration(retry)
            );
            debug!("Drift of {}:\n{}", terraform.key(), message);
            metrics::increment_requeues_total("drift");
            Ok(Requeue::After(retry))
        }
        CycleOutcome::Failed { message } => {
            writer.persist(&terraform).await?;
            error!(
                "❌ Reconciliation of {} failed, retrying in {}: {}",
                terraform.key(),
                format_duration(retry),
                message
            );
            ctx.events
                .publish(&terraform, EventSeverity::Error, revision, &message)
                .await;
            metrics::increment_requeues_total("retry");
            Ok(Requeue::After(retry))
        }
        CycleOutcome::Completed => {
            writer.persist(&terraform).await?;
            if let Some(ready) = terraform.condition(CONDITION_READY) {
                if ready.reason != REASON_NO_DRIFT {
                    let message = ready.message.clone();
                    ctx.events
                        .publish(&terraform, EventSeverity::Info, revision, &message)
                        .await;
                }
            }

            if !terraform.pending_plan().is_empty() && !force_or_auto_apply(&terraform) {
                info!(
                    "⏳ Plan {} of {} is waiting for approval",
                    terraform.pending_plan(),
                    terraform.key()
                );
                return Ok(Requeue::AwaitChange);
            }
            let interval = terraform.interval();
            info!(
                "✅ Reconciliation of {} finished, next run in {}",
                terraform.key(),
                format_duration(interval)
            );
            metrics::increment_requeues_total("interval");
            Ok(Requeue::After(interval))
        }
    }
}
