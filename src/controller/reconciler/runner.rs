//! # Runner Lifecycle
//!
//! Acquisition of a runner under the creation timeout, and the cleanup that
//! runs once a reconciliation attempt is over.

use super::types::Reconciler;
use crate::constants::RUNNER_POD_DELETE_GRACE_SECS;
use crate::crd::{ObjectKey, Terraform};
use crate::observability::metrics;
use crate::runner::{RunnerConnection, RunnerError};
use kube::ResourceExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Find or create the runner for `terraform`
///
/// The caller has already waited for certificate readiness.
pub async fn acquire(ctx: &Reconciler, terraform: &Terraform) -> Result<RunnerConnection, RunnerError> {
    let timeout = ctx.config.runner_creation_timeout;
    match tokio::time::timeout(timeout, ctx.runners.lookup_or_create(terraform)).await {
        Ok(Ok(connection)) => {
            metrics::increment_runner_acquisitions("success");
            info!("🏃 Runner is running for {}", terraform.key());
            Ok(connection)
        }
        Ok(Err(e)) => {
            metrics::increment_runner_acquisitions("error");
            Err(e)
        }
        Err(_elapsed) => {
            metrics::increment_runner_acquisitions("timeout");
            Err(RunnerError::Timeout(timeout))
        }
    }
}

/// Close the runner channel and delete the runner pod
///
/// Deletion is skipped for the local runner and when the object opts out of
/// cleanup. Otherwise the pod is deleted in the foreground with a one second
/// grace period, re-issued until it is gone or the cleanup timeout elapses.
/// A timeout is logged, not returned.
pub async fn release(ctx: &Reconciler, terraform: &Terraform, connection: RunnerConnection) {
    connection.close();

    if ctx.config.insecure_local_runner {
        debug!("Insecure local runner, no runner pod to delete");
        return;
    }
    if !terraform.always_cleanup_runner_pod() {
        return;
    }

    let key = ObjectKey::new(
        terraform.namespace().unwrap_or_default(),
        terraform.runner_pod_name(),
    );
    let poll = ctx.config.runner_cleanup_poll_interval;
    let deadline = Instant::now() + ctx.config.runner_cleanup_timeout;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let wait = remaining.min(poll);

        match ctx.store.delete_runner_pod(&key, RUNNER_POD_DELETE_GRACE_SECS).await {
            Ok(None) => {
                debug!("Runner pod {} is gone", key);
                return;
            }
            Ok(Some(uid)) => match ctx.store.wait_runner_pod_deleted(&key, &uid, wait).await {
                Ok(true) => {
                    debug!("Runner pod {} deleted", key);
                    return;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!("Failed watching runner pod {}: {}", key, e);
                    tokio::time::sleep(wait).await;
                }
            },
            Err(e) => {
                error!("Unable to delete runner pod {}: {}", key, e);
                tokio::time::sleep(wait).await;
            }
        }
    }

    metrics::increment_runner_cleanup_timeouts();
    error!(
        "❌ Failed waiting for the terminating runner pod {} after {:?}",
        key, ctx.config.runner_cleanup_timeout
    );
}
