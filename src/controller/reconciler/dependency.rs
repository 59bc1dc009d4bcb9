//! # Dependencies
//!
//! `dependsOn` handling: readiness checks before a dependant reconciles, the
//! back-reference finalizers that keep a dependency alive while dependants
//! exist, and dependency-first ordering of source change requests.

use super::cluster::{ClusterStore, StoreError};
use super::source::SourceObject;
use crate::constants::DEPENDENCY_OF_PREFIX;
use crate::crd::{ConditionStatus, ObjectKey, Terraform};
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum DependencyError {
    #[error("unable to get '{key}' dependency: {source}")]
    Fetch { key: ObjectKey, source: StoreError },
    #[error("unable to get '{key}' dependency: not found")]
    NotFound { key: ObjectKey },
    #[error("unable to add finalizer to '{key}' dependency: {source}")]
    Finalizer { key: ObjectKey, source: StoreError },
    #[error("dependency '{key}' is not ready")]
    NotReady { key: ObjectKey },
    #[error("dependency '{key}' is not updated yet")]
    NotUpdated { key: ObjectKey },
    #[error("dependency output secret: '{secret}' of '{key}' is not ready yet")]
    OutputSecretMissing { key: ObjectKey, secret: String },
}

#[derive(Debug, Error)]
#[error("circular dependency detected involving '{0}'")]
pub struct CircularDependencyError(pub ObjectKey);

/// Finalizer a dependant places on each of its dependencies
pub fn dependant_finalizer(dependant_name: &str) -> String {
    format!("{DEPENDENCY_OF_PREFIX}{dependant_name}")
}

/// Names of the dependants still holding this object
pub fn blocking_dependants(terraform: &Terraform) -> Vec<String> {
    terraform
        .metadata
        .finalizers
        .iter()
        .flatten()
        .filter_map(|f| f.strip_prefix(DEPENDENCY_OF_PREFIX))
        .map(str::to_string)
        .collect()
}

/// Confirm every declared dependency is satisfied
///
/// Checks run in declaration order and the first failure is returned. The
/// back-reference finalizer is added before readiness is judged, so a
/// dependency cannot be deleted out from under a dependant that is waiting.
pub async fn check_dependencies(
    store: &dyn ClusterStore,
    source: &SourceObject,
    terraform: &Terraform,
) -> Result<(), DependencyError> {
    let finalizer = dependant_finalizer(&terraform.name_any());
    let own_source = (terraform.spec.source_ref.kind.as_str(), terraform.source_key());

    for key in terraform.dependency_keys() {
        let dependency = match store.get_terraform(&key).await {
            Ok(Some(dependency)) => dependency,
            Ok(None) => return Err(DependencyError::NotFound { key }),
            Err(source) => return Err(DependencyError::Fetch { key, source }),
        };

        let has_finalizer = dependency
            .metadata
            .finalizers
            .iter()
            .flatten()
            .any(|f| *f == finalizer);
        if !has_finalizer {
            debug!("Adding finalizer {} to dependency {}", finalizer, key);
            if let Err(source) = store.add_finalizer(&key, &finalizer).await {
                return Err(DependencyError::Finalizer { key, source });
            }
        }

        let Some(status) = dependency.status.as_ref() else {
            return Err(DependencyError::NotReady { key });
        };
        if status.conditions.is_empty() || dependency.generation() != status.observed_generation {
            return Err(DependencyError::NotReady { key });
        }
        if dependency.readiness() != Some(ConditionStatus::True) {
            return Err(DependencyError::NotReady { key });
        }

        let revision = source.revision();
        let same_source = (dependency.spec.source_ref.kind.as_str(), dependency.source_key()) == own_source;
        if same_source
            && revision != status.last_applied_revision
            && revision != status.last_planned_revision
        {
            return Err(DependencyError::NotUpdated { key });
        }

        if let Some(outputs) = dependency.spec.write_outputs_to_secret.as_ref() {
            let secret_key = ObjectKey::new(key.namespace.clone(), outputs.name.clone());
            let exists = store.secret_exists(&secret_key).await.unwrap_or(false);
            if !exists {
                return Err(DependencyError::OutputSecretMissing {
                    key,
                    secret: outputs.name.clone(),
                });
            }
        }
    }
    Ok(())
}

/// Order objects so every dependency comes before its dependants
///
/// Only dependencies inside the set are considered. The result is
/// deterministic for a given input order.
pub fn sort_by_dependencies(
    objects: &[Arc<Terraform>],
) -> Result<Vec<Arc<Terraform>>, CircularDependencyError> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit(
        key: &ObjectKey,
        by_key: &BTreeMap<ObjectKey, &Arc<Terraform>>,
        marks: &mut BTreeMap<ObjectKey, Mark>,
        sorted: &mut Vec<Arc<Terraform>>,
    ) -> Result<(), CircularDependencyError> {
        match marks.get(key) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => return Err(CircularDependencyError(key.clone())),
            None => {}
        }
        let Some(terraform) = by_key.get(key) else {
            return Ok(());
        };
        marks.insert(key.clone(), Mark::Visiting);
        for dependency in terraform.dependency_keys() {
            if by_key.contains_key(&dependency) {
                visit(&dependency, by_key, marks, sorted)?;
            }
        }
        marks.insert(key.clone(), Mark::Done);
        sorted.push(Arc::clone(terraform));
        Ok(())
    }

    let by_key: BTreeMap<ObjectKey, &Arc<Terraform>> =
        objects.iter().map(|t| (t.key(), t)).collect();
    let mut marks = BTreeMap::new();
    let mut sorted = Vec::with_capacity(objects.len());
    for terraform in objects {
        visit(&terraform.key(), &by_key, &mut marks, &mut sorted)?;
    }
    Ok(sorted)
}

/// Requests to emit when `source` publishes a new revision
///
/// `dependants` are the objects referencing the source. Objects that already
/// attempted the revision are dropped; the rest are ordered dependencies
/// first. A dependency cycle yields no requests.
pub fn requests_for_revision_change(
    source: &SourceObject,
    dependants: &[Arc<Terraform>],
) -> Vec<ObjectKey> {
    let Some(artifact) = source.artifact.as_ref() else {
        return Vec::new();
    };
    let pending: Vec<Arc<Terraform>> = dependants
        .iter()
        .filter(|t| {
            t.status
                .as_ref()
                .is_none_or(|s| s.last_attempted_revision != artifact.revision)
        })
        .cloned()
        .collect();

    match sort_by_dependencies(&pending) {
        Ok(sorted) => sorted.iter().map(|t| t.key()).collect(),
        Err(e) => {
            warn!("Not requeueing dependants of {}: {}", source.key, e);
            Vec::new()
        }
    }
}

/// Objects in `all` that reference `source`
pub fn dependants_of_source(source: &SourceObject, all: &[Arc<Terraform>]) -> Vec<Arc<Terraform>> {
    all.iter()
        .filter(|t| t.spec.source_ref.kind == source.kind.kind() && t.source_key() == source.key)
        .cloned()
        .collect()
}
