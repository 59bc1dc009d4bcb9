//! # Status Persistence
//!
//! Writes the in-memory status snapshot back to the cluster.
//!
//! A writer remembers the last status it stored (starting from the status read
//! at the beginning of the attempt) and skips the patch when nothing changed,
//! so an unchanged status never produces a watch event.

use super::cluster::StoreError;
use super::types::Reconciler;
use crate::constants::RECONCILE_REQUEST_ANNOTATION;
use crate::crd::{ObjectKey, Terraform, TerraformStatus};
use crate::observability::metrics;
use kube::ResourceExt;
use tracing::debug;

pub struct StatusWriter<'a> {
    ctx: &'a Reconciler,
    key: ObjectKey,
    last: Option<TerraformStatus>,
}

impl std::fmt::Debug for StatusWriter<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter")
            .field("key", &self.key)
            .field("last", &self.last)
            .finish_non_exhaustive()
    }
}

impl<'a> StatusWriter<'a> {
    /// Writer for `terraform`, seeded with the status it was read with
    pub fn new(ctx: &'a Reconciler, terraform: &Terraform) -> Self {
        Self {
            ctx,
            key: terraform.key(),
            last: terraform.status.clone(),
        }
    }

    /// Patch the status of `terraform` if it differs from the last one written
    ///
    /// The reconcile request annotation is acknowledged in
    /// `lastHandledReconcileAt` and the readiness gauge is refreshed.
    pub async fn persist(&mut self, terraform: &Terraform) -> Result<(), StoreError> {
        let mut status = terraform.status_or_default();
        if let Some(requested_at) = terraform.annotations().get(RECONCILE_REQUEST_ANNOTATION) {
            status.last_handled_reconcile_at = Some(requested_at.clone());
        }

        metrics::record_readiness(
            &self.key.namespace,
            &self.key.name,
            terraform.readiness(),
        );

        if self.last.as_ref() == Some(&status) {
            debug!("Skipping status update for {} - unchanged", self.key);
            return Ok(());
        }

        self.ctx.store.patch_status(&self.key, &status).await?;
        self.last = Some(status);
        Ok(())
    }
}
