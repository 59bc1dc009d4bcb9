//! # Reconciler Configuration
//!
//! Settings that shape reconciliation: concurrency, artifact retries, runner
//! provisioning and cleanup, certificate material and error backoff.

use super::{env_flag, env_var_or_default};
use std::time::Duration;

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Upper bound on concurrently running reconciliations
    pub max_concurrent_reconciles: u16,
    /// Number of retries for an artifact download
    pub http_retry: u32,
    /// Host (`host[:port]`) that replaces the artifact URL host, for running outside the cluster
    pub source_controller_localhost: Option<String>,
    /// Time allowed to find or create a runner
    pub runner_creation_timeout: Duration,
    /// Port the runner listens on
    pub runner_grpc_port: u16,
    /// Image used for runner pods
    pub runner_image: String,
    /// Run terraform in-process instead of inside runner pods
    pub insecure_local_runner: bool,
    /// Namespace the controller runs in (home of the CA secret)
    pub runtime_namespace: String,
    /// Name of the CA secret
    pub ca_secret_name: String,
    /// How often the CA secret is re-read without a request
    pub ca_refresh_interval: Duration,
    /// Runner pod deletion re-check interval
    pub runner_cleanup_poll_interval: Duration,
    /// Runner pod deletion deadline
    pub runner_cleanup_timeout: Duration,
    /// Cap for the per-resource error backoff
    pub error_backoff_max: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        use crate::constants::*;
        Self {
            max_concurrent_reconciles: DEFAULT_MAX_CONCURRENT_RECONCILES,
            http_retry: DEFAULT_HTTP_RETRY,
            source_controller_localhost: None,
            runner_creation_timeout: Duration::from_secs(DEFAULT_RUNNER_CREATION_TIMEOUT_SECS),
            runner_grpc_port: DEFAULT_RUNNER_GRPC_PORT,
            runner_image: DEFAULT_RUNNER_IMAGE.to_string(),
            insecure_local_runner: false,
            runtime_namespace: DEFAULT_RUNTIME_NAMESPACE.to_string(),
            ca_secret_name: DEFAULT_CA_SECRET_NAME.to_string(),
            ca_refresh_interval: Duration::from_secs(DEFAULT_CA_REFRESH_INTERVAL_SECS),
            runner_cleanup_poll_interval: Duration::from_secs(DEFAULT_RUNNER_CLEANUP_POLL_SECS),
            runner_cleanup_timeout: Duration::from_secs(DEFAULT_RUNNER_CLEANUP_TIMEOUT_SECS),
            error_backoff_max: Duration::from_secs(DEFAULT_ERROR_BACKOFF_MAX_SECS),
        }
    }
}

impl ControllerConfig {
    /// Load configuration from environment variables with defaults
    pub fn from_env() -> Self {
        use crate::constants::*;
        Self {
            max_concurrent_reconciles: env_var_or_default(
                "MAX_CONCURRENT_RECONCILES",
                DEFAULT_MAX_CONCURRENT_RECONCILES,
            )
            .max(1),
            http_retry: env_var_or_default("HTTP_RETRY", DEFAULT_HTTP_RETRY),
            source_controller_localhost: std::env::var("SOURCE_CONTROLLER_LOCALHOST")
                .ok()
                .filter(|v| !v.is_empty()),
            runner_creation_timeout: Duration::from_secs(env_var_or_default(
                "RUNNER_CREATION_TIMEOUT_SECS",
                DEFAULT_RUNNER_CREATION_TIMEOUT_SECS,
            )),
            runner_grpc_port: env_var_or_default("RUNNER_GRPC_PORT", DEFAULT_RUNNER_GRPC_PORT),
            runner_image: env_var_or_default("RUNNER_IMAGE", DEFAULT_RUNNER_IMAGE.to_string()),
            insecure_local_runner: env_flag("INSECURE_LOCAL_RUNNER"),
            runtime_namespace: env_var_or_default(
                "RUNTIME_NAMESPACE",
                DEFAULT_RUNTIME_NAMESPACE.to_string(),
            ),
            ca_secret_name: env_var_or_default("CA_SECRET_NAME", DEFAULT_CA_SECRET_NAME.to_string()),
            ca_refresh_interval: Duration::from_secs(env_var_or_default(
                "CA_REFRESH_INTERVAL_SECS",
                DEFAULT_CA_REFRESH_INTERVAL_SECS,
            )),
            runner_cleanup_poll_interval: Duration::from_secs(env_var_or_default(
                "RUNNER_CLEANUP_POLL_SECS",
                DEFAULT_RUNNER_CLEANUP_POLL_SECS,
            )),
            runner_cleanup_timeout: Duration::from_secs(env_var_or_default(
                "RUNNER_CLEANUP_TIMEOUT_SECS",
                DEFAULT_RUNNER_CLEANUP_TIMEOUT_SECS,
            )),
            error_backoff_max: Duration::from_secs(env_var_or_default(
                "ERROR_BACKOFF_MAX_SECS",
                DEFAULT_ERROR_BACKOFF_MAX_SECS,
            )),
        }
    }
}
