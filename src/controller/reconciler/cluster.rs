//! # Cluster Store
//!
//! Everything the reconciler reads from or writes to the API server goes
//! through `ClusterStore`, so the control loop can run against an in-memory
//! store in tests.

use super::source::SourceObject;
use crate::constants::{FIELD_MANAGER, RUNNER_LABEL};
use crate::crd::{ObjectKey, SourceKind, Terraform, TerraformStatus};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{
    ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ObjectMeta, Patch, PatchParams,
    PropagationPolicy,
};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} '{key}' not found")]
    NotFound { kind: String, key: ObjectKey },
    #[error(transparent)]
    Api(#[from] kube::Error),
    #[error("{0}")]
    Invalid(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }
}

#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// Latest stored version of a Terraform object
    async fn get_terraform(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError>;

    /// Add a finalizer if absent
    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError>;

    /// Remove a finalizer if present; `NotFound` when the object is gone
    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError>;

    /// Merge-patch the status subresource
    async fn patch_status(&self, key: &ObjectKey, status: &TerraformStatus) -> Result<(), StoreError>;

    async fn get_source(
        &self,
        kind: SourceKind,
        key: &ObjectKey,
    ) -> Result<Option<SourceObject>, StoreError>;

    async fn secret_exists(&self, key: &ObjectKey) -> Result<bool, StoreError>;

    /// Write Terraform outputs to a secret owned by `owner`
    async fn write_outputs_secret(
        &self,
        owner: &Terraform,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), StoreError>;

    /// Foreground-delete the runner pod; returns its uid when it existed
    async fn delete_runner_pod(
        &self,
        key: &ObjectKey,
        grace_period_secs: u32,
    ) -> Result<Option<String>, StoreError>;

    /// Wait up to `timeout` for the runner pod with `uid` to disappear
    async fn wait_runner_pod_deleted(
        &self,
        key: &ObjectKey,
        uid: &str,
        timeout: Duration,
    ) -> Result<bool, StoreError>;
}

/// `ClusterStore` backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeClusterStore {
    client: Client,
}

impl std::fmt::Debug for KubeClusterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeClusterStore").finish_non_exhaustive()
    }
}

impl KubeClusterStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn terraform_api(&self, namespace: &str) -> Api<Terraform> {
        Api::namespaced(self.client.clone(), namespace)
    }

    async fn patch_finalizers(
        &self,
        key: &ObjectKey,
        edit: impl FnOnce(&mut Vec<String>) -> bool + Send,
    ) -> Result<(), StoreError> {
        let api = self.terraform_api(&key.namespace);
        let Some(terraform) = api.get_opt(&key.name).await? else {
            return Err(StoreError::NotFound {
                kind: "Terraform".to_string(),
                key: key.clone(),
            });
        };
        let mut finalizers = terraform.finalizers().to_vec();
        if !edit(&mut finalizers) {
            return Ok(());
        }
        // resourceVersion makes the patch fail on a concurrent edit instead of dropping it
        let patch = serde_json::json!({
            "metadata": {
                "finalizers": finalizers,
                "resourceVersion": terraform.resource_version(),
            }
        });
        api.patch(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER),
            &Patch::Merge(patch),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterStore for KubeClusterStore {
    async fn get_terraform(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError> {
        Ok(self.terraform_api(&key.namespace).get_opt(&key.name).await?)
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError> {
        self.patch_finalizers(key, |finalizers| {
            if finalizers.iter().any(|f| f == finalizer) {
                return false;
            }
            finalizers.push(finalizer.to_string());
            true
        })
        .await
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError> {
        self.patch_finalizers(key, |finalizers| {
            let before = finalizers.len();
            finalizers.retain(|f| f != finalizer);
            finalizers.len() != before
        })
        .await
    }

    async fn patch_status(&self, key: &ObjectKey, status: &TerraformStatus) -> Result<(), StoreError> {
        let patch = serde_json::json!({
            "status": status
        });
        self.terraform_api(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::apply(FIELD_MANAGER),
                &Patch::Merge(patch),
            )
            .await?;
        Ok(())
    }

    async fn get_source(
        &self,
        kind: SourceKind,
        key: &ObjectKey,
    ) -> Result<Option<SourceObject>, StoreError> {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), &key.namespace, &resource);
        Ok(api
            .get_opt(&key.name)
            .await?
            .map(|object| SourceObject::from_dynamic(kind, &object)))
    }

    async fn secret_exists(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &key.namespace);
        Ok(api.get_opt(&key.name).await?.is_some())
    }

    async fn write_outputs_secret(
        &self,
        owner: &Terraform,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let namespace = owner
            .namespace()
            .ok_or_else(|| StoreError::Invalid("Terraform object has no namespace".to_string()))?;
        let owner_ref = owner
            .controller_owner_ref(&())
            .ok_or_else(|| StoreError::Invalid("Terraform object has no uid".to_string()))?;

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.clone()),
                labels: Some(BTreeMap::from([(RUNNER_LABEL.to_string(), owner.name_any())])),
                owner_references: Some(vec![owner_ref]),
                ..Default::default()
            },
            type_: Some("Opaque".to_string()),
            string_data: Some(data),
            ..Default::default()
        };

        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        api.patch(
            name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await?;
        Ok(())
    }

    async fn delete_runner_pod(
        &self,
        key: &ObjectKey,
        grace_period_secs: u32,
    ) -> Result<Option<String>, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        let params = DeleteParams {
            grace_period_seconds: Some(grace_period_secs),
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..Default::default()
        };
        match api.delete(&key.name, &params).await {
            // Left: the pod is still terminating. Right: it is already gone.
            Ok(either) => Ok(either.left().and_then(|pod| {
                debug!("Runner pod {} is terminating", key);
                pod.uid()
            })),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn wait_runner_pod_deleted(
        &self,
        key: &ObjectKey,
        uid: &str,
        timeout: Duration,
    ) -> Result<bool, StoreError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), &key.namespace);
        match tokio::time::timeout(timeout, await_condition(api, &key.name, conditions::is_deleted(uid)))
            .await
        {
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(StoreError::Invalid(format!("runner pod watch failed: {e}"))),
            Err(_elapsed) => Ok(false),
        }
    }
}
