//! # Watch Loop
//!
//! Runs the `kube-runtime` controller over Terraform objects in all namespaces.
//!
//! Terraform events are filtered down to the changes that call for a new
//! attempt (spec generation, a reconcile request, deletion), since the
//! reconciler's own status patches would otherwise wake it again. Source
//! objects are watched too: a new artifact revision requeues the objects
//! using that source, dependencies ahead of their dependants. Deleting an
//! outputs secret wakes the Terraform object that owns it.

use super::error_policy::{handle_controller_error, handle_reconciliation_error};
use super::initialization::InitializationResult;
use crate::constants::{RECONCILE_REQUEST_ANNOTATION, RUNNER_LABEL};
use crate::controller::reconciler::dependency::{
    dependants_of_source, requests_for_revision_change,
};
use crate::controller::reconciler::{reconcile, SourceObject};
use crate::crd::{SourceKind, Terraform};
use anyhow::Result;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{ApiResource, DynamicObject, GroupVersionKind};
use kube::runtime::controller::{self, Controller};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Api, ResourceExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use tracing::{debug, info};

/// Fields whose change triggers a reconciliation
#[derive(Debug, Clone, PartialEq, Eq)]
struct Trigger {
    generation: Option<i64>,
    requested_at: Option<String>,
    deleting: bool,
}

impl Trigger {
    fn of(terraform: &Terraform) -> Self {
        Self {
            generation: terraform.metadata.generation,
            requested_at: terraform
                .annotations()
                .get(RECONCILE_REQUEST_ANNOTATION)
                .cloned(),
            deleting: terraform.is_deleting(),
        }
    }
}

/// Last trigger seen per object uid
///
/// Entries are dropped on delete events and pruned after a relist, so a
/// re-created object with the same name starts from a clean slate.
#[derive(Debug, Default)]
struct TriggerFilter {
    seen: HashMap<String, Trigger>,
    relisted: Option<HashSet<String>>,
}

impl TriggerFilter {
    fn identity(terraform: &Terraform) -> String {
        terraform
            .uid()
            .unwrap_or_else(|| terraform.key().to_string())
    }

    /// Whether the event should reach the controller queue
    fn admit(&mut self, event: &watcher::Event<Terraform>) -> bool {
        match event {
            watcher::Event::Apply(terraform) => self.observe(terraform),
            watcher::Event::InitApply(terraform) => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(Self::identity(terraform));
                }
                self.observe(terraform)
            }
            watcher::Event::Delete(terraform) => {
                self.seen.remove(&Self::identity(terraform));
                false
            }
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                true
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    self.seen.retain(|id, _| relisted.contains(id));
                }
                true
            }
        }
    }

    fn observe(&mut self, terraform: &Terraform) -> bool {
        let trigger = Trigger::of(terraform);
        self.seen.insert(Self::identity(terraform), trigger.clone()) != Some(trigger)
    }
}

/// Keep only deletions from a watch stream
fn deleted_objects<K>(
    event: Result<watcher::Event<K>, watcher::Error>,
) -> Option<Result<K, watcher::Error>> {
    match event {
        Ok(watcher::Event::Delete(object)) => Some(Ok(object)),
        Ok(_) => None,
        Err(e) => Some(Err(e)),
    }
}

/// Run the controller until a shutdown signal arrives
pub async fn run_watch_loop(init: InitializationResult) -> Result<()> {
    let InitializationResult {
        client,
        reconciler,
        server_state,
    } = init;

    let terraforms: Api<Terraform> = Api::all(client.clone());
    let (reader, writer) = reflector::store::<Terraform>();

    let mut filter = TriggerFilter::default();
    let trigger_stream = watcher(terraforms, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .filter(move |event| {
            let keep = match event {
                Ok(event) => filter.admit(event),
                Err(_) => true,
            };
            std::future::ready(keep)
        })
        .applied_objects();

    let mut controller = Controller::for_stream(trigger_stream, reader.clone()).with_config(
        controller::Config::default().concurrency(reconciler.config.max_concurrent_reconciles),
    );

    for kind in SourceKind::ALL {
        let gvk = GroupVersionKind::gvk(kind.group(), kind.version(), kind.kind());
        let resource = ApiResource::from_gvk_with_plural(&gvk, kind.plural());
        let sources: Api<DynamicObject> = Api::all_with(client.clone(), &resource);
        let store = reader.clone();
        controller = controller.watches_with(
            sources,
            resource,
            watcher::Config::default(),
            move |object| source_change_requests(kind, &object, &store),
        );
        debug!("Watching {} sources", kind.kind());
    }

    let secrets: Api<Secret> = Api::all(client.clone());
    let deleted_secrets = watcher(secrets, watcher::Config::default().labels(RUNNER_LABEL))
        .default_backoff()
        .filter_map(|event| std::future::ready(deleted_objects(event)));
    controller = controller.owns_stream(deleted_secrets);

    info!(
        "👀 Watching Terraform objects in all namespaces (concurrency {})",
        reconciler.config.max_concurrent_reconciles
    );

    controller
        .shutdown_on_signal()
        .run(reconcile, handle_reconciliation_error, reconciler)
        .for_each(|result| async move {
            match result {
                Ok((object, action)) => debug!("Reconciled {}: {:?}", object, action),
                Err(e) => handle_controller_error(&e),
            }
        })
        .await;

    server_state.is_ready.store(false, Ordering::Relaxed);
    info!("Controller stopped");
    Ok(())
}

/// Terraform objects to requeue when a source object changes
fn source_change_requests(
    kind: SourceKind,
    object: &DynamicObject,
    store: &Store<Terraform>,
) -> Vec<ObjectRef<Terraform>> {
    let source = SourceObject::from_dynamic(kind, object);
    let dependants = dependants_of_source(&source, &store.state());
    let requests = requests_for_revision_change(&source, &dependants);
    if !requests.is_empty() {
        info!(
            "📦 New revision of {} {}, requeueing {} object(s)",
            kind.kind(),
            source.key,
            requests.len()
        );
    }
    requests
        .into_iter()
        .map(|key| ObjectRef::new(&key.name).within(&key.namespace))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::TerraformSpec;

    fn terraform(uid: &str, generation: i64) -> Terraform {
        let mut tf = Terraform::new("app", TerraformSpec::default());
        tf.metadata.namespace = Some("flux-system".to_string());
        tf.metadata.uid = Some(uid.to_string());
        tf.metadata.generation = Some(generation);
        tf
    }

    #[test]
    fn test_status_only_updates_are_filtered() {
        let mut filter = TriggerFilter::default();
        let tf = terraform("uid-1", 1);

        assert!(filter.admit(&watcher::Event::Apply(tf.clone())));
        assert!(!filter.admit(&watcher::Event::Apply(tf.clone())));
        assert!(filter.admit(&watcher::Event::Apply(terraform("uid-1", 2))));
    }

    #[test]
    fn test_reconcile_request_passes() {
        let mut filter = TriggerFilter::default();
        let mut tf = terraform("uid-1", 1);
        assert!(filter.admit(&watcher::Event::Apply(tf.clone())));

        tf.annotations_mut().insert(
            RECONCILE_REQUEST_ANNOTATION.to_string(),
            "2024-05-01T10:00:00Z".to_string(),
        );
        assert!(filter.admit(&watcher::Event::Apply(tf)));
    }

    #[test]
    fn test_delete_forgets_object() {
        let mut filter = TriggerFilter::default();
        let tf = terraform("uid-1", 1);
        filter.admit(&watcher::Event::Apply(tf.clone()));

        assert!(!filter.admit(&watcher::Event::Delete(tf.clone())));
        assert!(filter.seen.is_empty());
        assert!(filter.admit(&watcher::Event::Apply(tf)));
    }

    #[test]
    fn test_recreated_object_is_admitted() {
        let mut filter = TriggerFilter::default();
        filter.admit(&watcher::Event::Apply(terraform("uid-1", 1)));

        assert!(filter.admit(&watcher::Event::Apply(terraform("uid-2", 1))));
    }

    #[test]
    fn test_relist_prunes_vanished_objects() {
        let mut filter = TriggerFilter::default();
        filter.admit(&watcher::Event::Apply(terraform("uid-1", 1)));
        filter.admit(&watcher::Event::Apply(terraform("uid-2", 1)));

        filter.admit(&watcher::Event::Init);
        assert!(!filter.admit(&watcher::Event::InitApply(terraform("uid-2", 1))));
        filter.admit(&watcher::Event::InitDone);

        assert_eq!(filter.seen.len(), 1);
        assert!(filter.seen.contains_key("uid-2"));
    }

    #[test]
    fn test_only_deleted_secrets_trigger_owner() {
        let secret = Secret::default();

        assert!(deleted_objects(Ok(watcher::Event::Apply(secret.clone()))).is_none());
        assert!(deleted_objects(Ok(watcher::Event::<Secret>::InitDone)).is_none());
        assert!(matches!(
            deleted_objects(Ok(watcher::Event::Delete(secret))),
            Some(Ok(_))
        ));
    }
}
