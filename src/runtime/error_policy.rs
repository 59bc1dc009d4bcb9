//! # Error Policy
//!
//! Error handling for the controller watch loop: per-resource Fibonacci
//! backoff for failed reconciliations, and classification of the errors the
//! controller stream reports.

use crate::constants;
use crate::controller::reconciler::{BackoffState, Reconciler, ReconcilerError};
use crate::crd::Terraform;
use crate::observability;
use kube::runtime::controller;
use kube::runtime::watcher;
use kube::ResourceExt;
use kube_runtime::controller::Action;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Requeue a failed reconciliation with Fibonacci backoff
///
/// Backoff state is tracked per resource so one failing object does not slow
/// down the others. A successful reconciliation resets it.
pub fn handle_reconciliation_error(
    obj: Arc<Terraform>,
    error: &ReconcilerError,
    ctx: Arc<Reconciler>,
) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_default();

    let error_span = tracing::span!(
        tracing::Level::ERROR,
        "controller.watch.reconciliation_error",
        resource.name = %name,
        resource.namespace = %namespace,
        error = %error
    );
    let _error_guard = error_span.enter();

    error!("Reconciliation error for {}/{}: {:?}", namespace, name, error);

    let resource_key = format!("{namespace}/{name}");
    let (backoff_seconds, error_count) = match ctx.backoff_states.lock() {
        Ok(mut states) => {
            let state = states
                .entry(resource_key)
                .or_insert_with(|| BackoffState::new(ctx.config.error_backoff_max));
            state.increment_error();
            (state.backoff.next_backoff_seconds(), state.error_count)
        }
        Err(e) => {
            warn!("Failed to lock backoff_states: {}, using default backoff", e);
            (constants::DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS, 0)
        }
    };

    let next_trigger_time =
        chrono::Utc::now() + chrono::Duration::seconds(i64::try_from(backoff_seconds).unwrap_or(i64::MAX));
    info!(
        "🔄 Retrying with Fibonacci backoff: {}s (error count: {})",
        backoff_seconds, error_count
    );
    info!(
        "📅 Next retry scheduled: {} (in {}s)",
        next_trigger_time.to_rfc3339(),
        backoff_seconds
    );

    observability::metrics::increment_requeues_total("error-backoff");
    Action::requeue(Duration::from_secs(backoff_seconds))
}

/// Log an error reported by the controller stream
///
/// Reconciliation failures were already handled by the error policy; watch
/// errors are retried by the watcher backoff, so this only classifies them.
pub fn handle_controller_error(error: &controller::Error<ReconcilerError, watcher::Error>) {
    match error {
        controller::Error::ReconcilerFailed(e, obj) => {
            debug!("Reconciliation of {} failed: {}", obj, e);
        }
        controller::Error::ObjectNotFound(obj) => {
            debug!("Object {} not found (likely deleted), continuing watch...", obj);
        }
        controller::Error::QueueError(e) => handle_watch_error(e),
        other => warn!("Controller stream error: {}", other),
    }
}

fn handle_watch_error(error: &watcher::Error) {
    let error_string = error.to_string();
    let error_span = tracing::span!(
        tracing::Level::WARN,
        "controller.watch.error",
        error = %error_string
    );
    let _error_guard = error_span.enter();

    let is_401 = error_string.contains("401") || error_string.contains("Unauthorized");
    let is_410 = error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone");
    let is_429 = error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests");

    if is_401 {
        error!("❌ Watch authentication failed (401 Unauthorized) - RBAC may have been revoked or token expired");
        error!("🔍 SRE Diagnostics:");
        error!("   1. Verify the controller ClusterRole still grants terraforms and the source kinds:");
        error!("      kubectl auth can-i list terraforms.infra.contrib.fluxcd.io --all-namespaces --as=system:serviceaccount:flux-system:tf-controller");
        error!("   2. Verify the ServiceAccount still exists:");
        error!("      kubectl get sa tf-controller -n flux-system");
        error!("   3. If RBAC was recently changed, restart the controller pod");
    } else if is_410 {
        warn!("Watch resource version expired (410) - this is normal during pod restarts, watch will restart");
    } else if is_429 {
        warn!("API server storage reinitializing (429), watch will back off and restart");
    } else {
        error!("Watch stream error: {}", error_string);
    }
}
