//! # Initialization
//!
//! Controller startup: rustls provider, tracing, metrics, the probe server,
//! the Kubernetes client, certificate rotation and the reconciler context.

use crate::config::{load_config, ControllerConfig, ServerConfig};
use crate::controller::reconciler::{
    ArtifactFetcher, KubeClusterStore, KubeEventPublisher, Reconciler,
};
use crate::controller::server::{start_server, ServerState};
use crate::crd::Terraform;
use crate::observability;
use crate::rotation::{RotationHandle, SecretCertRotator, TlsStore};
use crate::runner::{LocalRunnerProvisioner, PodRunnerProvisioner, RunnerProvisioner};
use anyhow::{Context, Result};
use kube::{api::Api, api::ListParams, Client, ResourceExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Pending rotation requests before senders wait
const ROTATION_REQUEST_BUFFER: usize = 64;

/// Everything the watch loop needs
pub struct InitializationResult {
    pub client: Client,
    pub reconciler: Arc<Reconciler>,
    pub server_state: Arc<ServerState>,
}

impl std::fmt::Debug for InitializationResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitializationResult")
            .field("reconciler", &self.reconciler)
            .finish_non_exhaustive()
    }
}

/// Initialize the controller runtime
///
/// Handles:
/// - rustls crypto provider setup
/// - tracing subscriber setup
/// - metrics registration and the probe server
/// - Kubernetes client creation
/// - certificate rotation and runner provisioning
/// - reconciler setup
pub async fn initialize() -> Result<InitializationResult> {
    // Must happen before anything opens a TLS connection
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_existing| anyhow::anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tf_controller=info".into()),
        )
        .init();

    info!("Starting Terraform Controller");
    info!(
        "Build info: timestamp={}, datetime={}, git_hash={}",
        env!("BUILD_TIMESTAMP"),
        env!("BUILD_DATETIME"),
        env!("BUILD_GIT_HASH")
    );

    let (controller_config, server_config) = load_config();

    observability::metrics::register_metrics()?;

    let server_state = Arc::new(ServerState {
        is_ready: Arc::new(AtomicBool::new(false)),
    });
    let server_state_clone = Arc::clone(&server_state);
    let server_port = server_config.metrics_port;
    let server_handle = tokio::spawn(async move {
        if let Err(e) = start_server(server_port, server_state_clone).await {
            error!("HTTP server error: {}", e);
        }
    });
    wait_for_server_ready(&server_state, &server_handle, &server_config).await?;

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let (rotation, runners) = runner_stack(&client, &controller_config)?;
    let fetcher = ArtifactFetcher::from_config(&controller_config)?;

    let reconciler = Arc::new(Reconciler::new(
        Arc::new(KubeClusterStore::new(client.clone())),
        runners,
        Arc::new(KubeEventPublisher::new(client.clone())),
        rotation,
        fetcher,
        controller_config,
    ));

    log_existing_resources(&Api::<Terraform>::all(client.clone())).await;

    info!("Controller initialized, starting watch loop...");
    Ok(InitializationResult {
        client,
        reconciler,
        server_state,
    })
}

/// Rotation capability and runner provisioner for the configured mode
///
/// The insecure local runner runs terraform in-process and needs no
/// certificates. Otherwise the rotator owns the TLS bundle shared with the
/// pod provisioner.
fn runner_stack(
    client: &Client,
    config: &ControllerConfig,
) -> Result<(RotationHandle, Arc<dyn RunnerProvisioner>)> {
    if config.insecure_local_runner {
        warn!("⚠️  INSECURE_LOCAL_RUNNER is set, terraform runs inside the controller process");
        let provisioner = LocalRunnerProvisioner::from_path()?;
        return Ok((RotationHandle::always_ready(), Arc::new(provisioner)));
    }

    let store = TlsStore::default();
    let (handle, signals) =
        RotationHandle::channel(Arc::new(store.clone()), ROTATION_REQUEST_BUFFER);
    let rotator = SecretCertRotator::new(
        client.clone(),
        &config.runtime_namespace,
        &config.ca_secret_name,
        store.clone(),
        config.ca_refresh_interval,
    );
    tokio::spawn(rotator.run(signals));

    let provisioner = PodRunnerProvisioner::new(client.clone(), store, config);
    Ok((handle, Arc::new(provisioner)))
}

/// Wait for the HTTP server to become ready
async fn wait_for_server_ready(
    server_state: &Arc<ServerState>,
    server_handle: &tokio::task::JoinHandle<()>,
    config: &ServerConfig,
) -> Result<()> {
    let startup_timeout = config.startup_timeout;
    let poll_interval = config.readiness_poll;
    let start_time = std::time::Instant::now();

    loop {
        if server_handle.is_finished() {
            return Err(anyhow::anyhow!("HTTP server failed to start"));
        }
        if server_state.is_ready.load(Ordering::Relaxed) {
            info!("HTTP server is ready and accepting connections");
            return Ok(());
        }
        if start_time.elapsed() > startup_timeout {
            return Err(anyhow::anyhow!(
                "HTTP server failed to become ready within {} seconds",
                startup_timeout.as_secs()
            ));
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Log the Terraform objects present at startup, grouped by namespace
///
/// A failed list usually means the CRD is not installed; the watch loop keeps
/// retrying either way.
async fn log_existing_resources(terraforms: &Api<Terraform>) {
    let existing_resources_span = tracing::span!(
        tracing::Level::INFO,
        "controller.startup.existing_resources",
        operation = "log_existing_resources"
    );
    let _guard = existing_resources_span.enter();

    let list = match terraforms.list(&ListParams::default()).await {
        Ok(list) => list,
        Err(e) => {
            error!("CRD is not queryable; {:?}. Is the CRD installed?", e);
            error!("Installation: crdgen | kubectl apply -f -");
            warn!("Continuing despite CRD queryability check failure - controller will retry");
            return;
        }
    };

    if list.items.is_empty() {
        info!("No existing Terraform resources found, watch will pick up new resources");
        return;
    }

    let mut by_namespace: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for item in &list.items {
        by_namespace
            .entry(item.namespace().unwrap_or_default())
            .or_default()
            .push(item.name_any());
    }

    info!("Terraform Controller - Startup Resource Summary");
    info!("Total Resources: {}", list.items.len());
    info!("Namespaces: {}", by_namespace.len());
    for (namespace, mut names) in by_namespace {
        names.sort();
        let shown = if names.len() <= 3 {
            names.join(", ")
        } else {
            format!("{}, ... ({} total)", names[..3].join(", "), names.len())
        };
        info!("Namespace: {}", namespace);
        info!("  Resources ({}): {}", names.len(), shown);
    }
}
