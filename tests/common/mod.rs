//! In-memory stand-ins for the cluster, the runner and the event recorder,
//! plus a wiremock source controller serving artifacts.

#![allow(dead_code, reason = "each test crate uses a different subset")]

use async_trait::async_trait;
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tf_controller::config::ControllerConfig;
use tf_controller::controller::reconciler::events::event_reason;
use tf_controller::controller::reconciler::{
    Artifact, ArtifactFetcher, ClusterStore, EventPublisher, EventSeverity, Reconciler,
    RetryPolicy, SourceObject, StoreError,
};
use tf_controller::crd::{ObjectKey, SourceKind, SourceRef, Terraform, TerraformSpec, TerraformStatus};
use tf_controller::rotation::RotationHandle;
use tf_controller::runner::{
    ApplyReply, ApplyRequest, OutputValue, PlanReply, PlanRequest, RunnerConnection, RunnerError,
    RunnerProvisioner, SetupRequest, TerraformRunner,
};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const NAMESPACE: &str = "flux-system";
pub const SOURCE_NAME: &str = "podinfo";

/// Terraform object referencing the `podinfo` GitRepository
pub fn terraform(name: &str, approve_plan: &str) -> Terraform {
    let mut tf = Terraform::new(
        name,
        TerraformSpec {
            approve_plan: approve_plan.to_string(),
            interval: "10m".to_string(),
            retry_interval: Some("30s".to_string()),
            path: "./terraform".to_string(),
            source_ref: SourceRef {
                kind: "GitRepository".to_string(),
                name: SOURCE_NAME.to_string(),
                namespace: None,
            },
            ..Default::default()
        },
    );
    tf.metadata.namespace = Some(NAMESPACE.to_string());
    tf.metadata.generation = Some(1);
    tf
}

pub fn key(name: &str) -> ObjectKey {
    ObjectKey::new(NAMESPACE, name)
}

pub fn sha256_hex(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

#[derive(Debug, Default)]
pub struct FakeStore {
    terraforms: Mutex<BTreeMap<ObjectKey, Terraform>>,
    sources: Mutex<Vec<SourceObject>>,
    secrets: Mutex<BTreeMap<ObjectKey, BTreeMap<String, String>>>,
    pods: Mutex<BTreeMap<ObjectKey, String>>,
    pub deleted_pods: Mutex<Vec<ObjectKey>>,
    pub status_patches: AtomicUsize,
}

impl FakeStore {
    pub fn insert_terraform(&self, terraform: Terraform) {
        self.terraforms
            .lock()
            .unwrap()
            .insert(terraform.key(), terraform);
    }

    pub fn terraform(&self, name: &str) -> Option<Terraform> {
        self.terraforms.lock().unwrap().get(&key(name)).cloned()
    }

    /// Edit a stored object the way a user would, bumping its generation
    pub fn edit_spec(&self, name: &str, edit: impl FnOnce(&mut TerraformSpec)) {
        let mut terraforms = self.terraforms.lock().unwrap();
        let terraform = terraforms.get_mut(&key(name)).unwrap();
        edit(&mut terraform.spec);
        terraform.metadata.generation = Some(terraform.generation() + 1);
    }

    pub fn insert_source(&self, source: SourceObject) {
        let mut sources = self.sources.lock().unwrap();
        sources.retain(|s| !(s.kind == source.kind && s.key == source.key));
        sources.push(source);
    }

    pub fn secret(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.secrets.lock().unwrap().get(&key(name)).cloned()
    }

    pub fn insert_secret(&self, name: &str) {
        self.secrets
            .lock()
            .unwrap()
            .insert(key(name), BTreeMap::new());
    }

    pub fn add_runner_pod(&self, terraform: &Terraform) {
        self.pods.lock().unwrap().insert(
            key(&terraform.runner_pod_name()),
            "7d1f0e2a-runner-uid".to_string(),
        );
    }

    pub fn has_runner_pod(&self, terraform: &Terraform) -> bool {
        self.pods
            .lock()
            .unwrap()
            .contains_key(&key(&terraform.runner_pod_name()))
    }

    fn not_found(key: &ObjectKey) -> StoreError {
        StoreError::NotFound {
            kind: "Terraform".to_string(),
            key: key.clone(),
        }
    }
}

#[async_trait]
impl ClusterStore for FakeStore {
    async fn get_terraform(&self, key: &ObjectKey) -> Result<Option<Terraform>, StoreError> {
        Ok(self.terraforms.lock().unwrap().get(key).cloned())
    }

    async fn add_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError> {
        let mut terraforms = self.terraforms.lock().unwrap();
        let terraform = terraforms.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let finalizers = terraform.metadata.finalizers.get_or_insert_with(Vec::new);
        if !finalizers.iter().any(|f| f == finalizer) {
            finalizers.push(finalizer.to_string());
        }
        Ok(())
    }

    async fn remove_finalizer(&self, key: &ObjectKey, finalizer: &str) -> Result<(), StoreError> {
        let mut terraforms = self.terraforms.lock().unwrap();
        let terraform = terraforms.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        let finalizers = terraform.metadata.finalizers.get_or_insert_with(Vec::new);
        finalizers.retain(|f| f != finalizer);
        // The API server drops a deleting object once its last finalizer is gone
        if finalizers.is_empty() && terraform.is_deleting() {
            terraforms.remove(key);
        }
        Ok(())
    }

    async fn patch_status(&self, key: &ObjectKey, status: &TerraformStatus) -> Result<(), StoreError> {
        let mut terraforms = self.terraforms.lock().unwrap();
        let terraform = terraforms.get_mut(key).ok_or_else(|| Self::not_found(key))?;
        terraform.status = Some(status.clone());
        self.status_patches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn get_source(
        &self,
        kind: SourceKind,
        key: &ObjectKey,
    ) -> Result<Option<SourceObject>, StoreError> {
        Ok(self
            .sources
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.kind == kind && &s.key == key)
            .cloned())
    }

    async fn secret_exists(&self, key: &ObjectKey) -> Result<bool, StoreError> {
        Ok(self.secrets.lock().unwrap().contains_key(key))
    }

    async fn write_outputs_secret(
        &self,
        owner: &Terraform,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let key = ObjectKey::new(owner.namespace().unwrap_or_default(), name);
        self.secrets.lock().unwrap().insert(key, data);
        Ok(())
    }

    async fn delete_runner_pod(
        &self,
        key: &ObjectKey,
        _grace_period_secs: u32,
    ) -> Result<Option<String>, StoreError> {
        let uid = self.pods.lock().unwrap().remove(key);
        if uid.is_some() {
            self.deleted_pods.lock().unwrap().push(key.clone());
        }
        Ok(uid)
    }

    async fn wait_runner_pod_deleted(
        &self,
        key: &ObjectKey,
        _uid: &str,
        _timeout: Duration,
    ) -> Result<bool, StoreError> {
        Ok(!self.pods.lock().unwrap().contains_key(key))
    }
}

/// Scriptable runner recording every call it receives
#[derive(Debug, Default)]
pub struct FakeRunner {
    pub plan_changes: AtomicBool,
    /// Rendered drift plan; `None` means no drift
    pub drift: Mutex<Option<String>>,
    pub apply_error: Mutex<Option<String>>,
    /// Lock id reported by the next plans
    pub lock_held: Mutex<Option<String>>,
    pub outputs: Mutex<BTreeMap<String, OutputValue>>,
    calls: Mutex<Vec<String>>,
    plans: Mutex<VecDeque<PlanRequest>>,
    setups: Mutex<Vec<SetupRequest>>,
}

impl FakeRunner {
    pub fn with_changes() -> Self {
        let runner = Self::default();
        runner.plan_changes.store(true, Ordering::SeqCst);
        runner
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn called(&self, operation: &str) -> bool {
        self.calls().iter().any(|c| c == operation)
    }

    pub fn plans(&self) -> Vec<PlanRequest> {
        self.plans.lock().unwrap().iter().cloned().collect()
    }

    pub fn setups(&self) -> Vec<SetupRequest> {
        self.setups.lock().unwrap().clone()
    }

    pub fn set_output(&self, name: &str, value: serde_json::Value, sensitive: bool) {
        self.outputs
            .lock()
            .unwrap()
            .insert(name.to_string(), OutputValue { value, sensitive });
    }

    fn record(&self, call: &str) {
        self.calls.lock().unwrap().push(call.to_string());
    }
}

#[async_trait]
impl TerraformRunner for FakeRunner {
    async fn setup(&self, request: SetupRequest) -> Result<String, RunnerError> {
        self.record("setup");
        let instance_id = format!("{}-{}", request.namespace, request.name);
        self.setups.lock().unwrap().push(request);
        Ok(instance_id)
    }

    async fn plan(&self, request: PlanRequest) -> Result<PlanReply, RunnerError> {
        let drift_detection = request.drift_detection;
        self.record(if drift_detection { "plan:drift" } else { "plan" });
        self.plans.lock().unwrap().push_back(request);

        if let Some(lock_id) = self.lock_held.lock().unwrap().clone() {
            return Err(RunnerError::StateLocked {
                message: format!("state is locked by {lock_id}"),
                lock_id,
            });
        }
        let has_changes = if drift_detection {
            self.drift.lock().unwrap().is_some()
        } else {
            self.plan_changes.load(Ordering::SeqCst)
        };
        Ok(PlanReply {
            has_changes,
            message: String::new(),
        })
    }

    async fn show_plan(&self, _instance_id: &str) -> Result<String, RunnerError> {
        self.record("show_plan");
        Ok(self.drift.lock().unwrap().clone().unwrap_or_default())
    }

    async fn apply(&self, _request: ApplyRequest) -> Result<ApplyReply, RunnerError> {
        self.record("apply");
        match self.apply_error.lock().unwrap().clone() {
            Some(message) => Err(RunnerError::Command(message)),
            None => Ok(ApplyReply::default()),
        }
    }

    async fn outputs(
        &self,
        _instance_id: &str,
    ) -> Result<BTreeMap<String, OutputValue>, RunnerError> {
        self.record("outputs");
        Ok(self.outputs.lock().unwrap().clone())
    }

    async fn force_unlock(&self, _instance_id: &str, lock_id: &str) -> Result<(), RunnerError> {
        self.record(&format!("force_unlock:{lock_id}"));
        *self.lock_held.lock().unwrap() = None;
        Ok(())
    }

    async fn cleanup(&self, _instance_id: &str) -> Result<(), RunnerError> {
        self.record("cleanup");
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeProvisioner {
    runner: Arc<FakeRunner>,
    pub fail: AtomicBool,
    pub closed: Arc<AtomicUsize>,
}

impl FakeProvisioner {
    pub fn new(runner: Arc<FakeRunner>) -> Self {
        Self {
            runner,
            fail: AtomicBool::new(false),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }
}

#[async_trait]
impl RunnerProvisioner for FakeProvisioner {
    async fn lookup_or_create(&self, _terraform: &Terraform) -> Result<RunnerConnection, RunnerError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(RunnerError::NotReady("runner pod has no IP".to_string()));
        }
        let runner: Arc<dyn TerraformRunner> = Arc::<FakeRunner>::clone(&self.runner);
        let closed = Arc::clone(&self.closed);
        Ok(RunnerConnection::new(runner).with_close(move || {
            closed.fetch_add(1, Ordering::SeqCst);
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    pub severity: EventSeverity,
    pub reason: String,
    pub message: String,
}

#[derive(Debug, Default)]
pub struct FakeEvents {
    events: Mutex<Vec<RecordedEvent>>,
}

impl FakeEvents {
    pub fn recorded(&self) -> Vec<RecordedEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventPublisher for FakeEvents {
    async fn publish(
        &self,
        terraform: &Terraform,
        severity: EventSeverity,
        _revision: &str,
        message: &str,
    ) {
        self.events.lock().unwrap().push(RecordedEvent {
            severity,
            reason: event_reason(terraform, severity),
            message: message.to_string(),
        });
    }
}

/// Fast retries so failure paths do not slow the suite down
pub fn test_retry_policy() -> RetryPolicy {
    RetryPolicy {
        max_retries: 1,
        min_wait: Duration::from_millis(10),
        max_wait: Duration::from_millis(20),
    }
}

/// A reconciler wired to fakes and a mock source controller
#[derive(Debug)]
pub struct Harness {
    pub server: MockServer,
    pub store: Arc<FakeStore>,
    pub runner: Arc<FakeRunner>,
    pub provisioner: Arc<FakeProvisioner>,
    pub events: Arc<FakeEvents>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub async fn start(runner: FakeRunner) -> Self {
        let server = MockServer::start().await;
        let store = Arc::new(FakeStore::default());
        let runner = Arc::new(runner);
        let provisioner = Arc::new(FakeProvisioner::new(Arc::clone(&runner)));
        let events = Arc::new(FakeEvents::default());

        let config = ControllerConfig {
            runner_creation_timeout: Duration::from_secs(5),
            runner_cleanup_poll_interval: Duration::from_millis(10),
            runner_cleanup_timeout: Duration::from_millis(200),
            ..ControllerConfig::default()
        };
        let reconciler = Reconciler::new(
            Arc::clone(&store) as Arc<dyn ClusterStore>,
            Arc::clone(&provisioner) as Arc<dyn RunnerProvisioner>,
            Arc::clone(&events) as Arc<dyn EventPublisher>,
            RotationHandle::always_ready(),
            ArtifactFetcher::new(reqwest::Client::new(), test_retry_policy(), None),
            config,
        );

        Self {
            server,
            store,
            runner,
            provisioner,
            events,
            reconciler,
        }
    }

    /// Serve `body` as the artifact of the `podinfo` source at `revision`
    pub async fn publish_artifact(&self, revision: &str, body: &[u8]) -> Artifact {
        let artifact_path = format!(
            "/gitrepository/{NAMESPACE}/{SOURCE_NAME}/{}.tar.gz",
            revision.replace('/', "-")
        );
        Mock::given(method("GET"))
            .and(path(artifact_path.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
            .mount(&self.server)
            .await;

        let artifact = Artifact {
            url: format!("{}{}", self.server.uri(), artifact_path),
            revision: revision.to_string(),
            checksum: sha256_hex(body),
        };
        self.store.insert_source(SourceObject {
            kind: SourceKind::GitRepository,
            key: ObjectKey::new(NAMESPACE, SOURCE_NAME),
            artifact: Some(artifact.clone()),
        });
        artifact
    }
}
