//! # Constants
//!
//! Shared names, defaults and wire strings used across the controller.

/// Field manager and event reporter for every write this controller makes
pub const FIELD_MANAGER: &str = "tf-controller";

/// API group of the Terraform resource
pub const TERRAFORM_GROUP: &str = "infra.contrib.fluxcd.io";

/// Finalizer that gates deletion of every reconciled Terraform object
pub const TERRAFORM_FINALIZER: &str = "finalizers.tf.contrib.fluxcd.io";

/// Prefix of the back-reference finalizer placed on a dependency by each dependant
pub const DEPENDENCY_OF_PREFIX: &str = "tf.dependency.of.";

/// Annotation set by `tfctl reconcile` and `flux reconcile` to request a reconciliation
pub const RECONCILE_REQUEST_ANNOTATION: &str = "reconcile.fluxcd.io/requestedAt";

/// Label identifying the runner pod of a Terraform object
pub const RUNNER_LABEL: &str = "infra.contrib.fluxcd.io/terraform";

/// Suffix of the runner pod name (`<terraform>-tf-runner`)
pub const RUNNER_POD_SUFFIX: &str = "-tf-runner";

/// Annotation on the CA secret carrying the CA expiry (RFC3339)
pub const CA_NOT_AFTER_ANNOTATION: &str = "infra.contrib.fluxcd.io/ca-not-after";

/// Condition messages are capped at this many bytes before `...` is appended
pub const MAX_CONDITION_MESSAGE_LENGTH: usize = 20000;

/// Approval value that applies every plan automatically
pub const APPROVE_PLAN_AUTO: &str = "auto";

/// Workspace used when the spec leaves it empty
pub const DEFAULT_WORKSPACE_NAME: &str = "default";

/// Service account the runner pod runs as when the spec leaves it empty
pub const DEFAULT_RUNNER_SERVICE_ACCOUNT: &str = "tf-runner";

/// Runner termination grace period when the spec leaves it empty
pub const DEFAULT_RUNNER_TERMINATION_GRACE_PERIOD_SECS: i64 = 30;

/// Interval used when a Terraform object carries an unparsable interval
pub const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 60;

/// Default health check timeout
pub const DEFAULT_HEALTH_CHECK_TIMEOUT_SECS: u64 = 20;

// Controller defaults

/// Default number of concurrent reconciliations
pub const DEFAULT_MAX_CONCURRENT_RECONCILES: u16 = 4;

/// Default number of artifact download retries
pub const DEFAULT_HTTP_RETRY: u32 = 9;

/// Artifact download backoff window
pub const HTTP_RETRY_MIN_WAIT_SECS: u64 = 5;
pub const HTTP_RETRY_MAX_WAIT_SECS: u64 = 30;

/// Artifact download timeout per attempt
pub const DEFAULT_ARTIFACT_TIMEOUT_SECS: u64 = 60;

/// Default timeout for finding or creating a runner
pub const DEFAULT_RUNNER_CREATION_TIMEOUT_SECS: u64 = 120;

/// Default port the runner listens on
pub const DEFAULT_RUNNER_GRPC_PORT: u16 = 30000;

/// Default runner image
pub const DEFAULT_RUNNER_IMAGE: &str = "ghcr.io/weaveworks/tf-runner:latest";

/// Default namespace the controller runs in
pub const DEFAULT_RUNTIME_NAMESPACE: &str = "flux-system";

/// Default name of the CA secret shared with the runners
pub const DEFAULT_CA_SECRET_NAME: &str = "tf-controller.tls";

/// Secret in each runner namespace holding the runner's certificate material
pub const RUNNER_TLS_SECRET_NAME: &str = "tf-runner.tls";

/// Default CA refresh period
pub const DEFAULT_CA_REFRESH_INTERVAL_SECS: u64 = 300;

/// Runner pod cleanup polling
pub const DEFAULT_RUNNER_CLEANUP_POLL_SECS: u64 = 5;
pub const DEFAULT_RUNNER_CLEANUP_TIMEOUT_SECS: u64 = 120;

/// Grace period used when deleting a runner pod
pub const RUNNER_POD_DELETE_GRACE_SECS: u32 = 1;

/// Error backoff cap
pub const DEFAULT_ERROR_BACKOFF_MAX_SECS: u64 = 300;

/// Fallback requeue when the backoff state cannot be read
pub const DEFAULT_RECONCILIATION_ERROR_REQUEUE_SECS: u64 = 30;

// Server defaults

/// Default metrics and probe port
pub const DEFAULT_METRICS_PORT: u16 = 8080;

/// Default HTTP server startup timeout
pub const DEFAULT_SERVER_STARTUP_TIMEOUT_SECS: u64 = 10;

/// Default HTTP server readiness poll interval
pub const DEFAULT_SERVER_POLL_INTERVAL_MS: u64 = 50;
