//! # Reconciler
//!
//! The per-object control loop and the components it sequences.
//!
//! ## Sub-modules
//!
//! - `types` - Shared reconciler context, errors and requeue directives
//! - `cluster` - Cluster object store seam (Terraform objects, sources, secrets, runner pods)
//! - `source` - Flux source objects and their artifacts
//! - `artifact` - Artifact download with checksum verification
//! - `dependency` - Dependency readiness checks and source-change ordering
//! - `approval` - Plan, apply and drift-detection decisions
//! - `health` - Post-apply health checks
//! - `events` - Kubernetes event publishing
//! - `runner` - Runner acquisition and cleanup
//! - `status` - Status persistence with change detection
//! - `cycle` - Plan/apply/drift cycle against a runner
//! - `finalize` - Deletion sequence
//! - `reconcile` - Orchestrator entry point

pub mod approval;
pub mod artifact;
pub mod cluster;
pub mod cycle;
pub mod dependency;
pub mod events;
pub mod finalize;
pub mod health;
pub mod reconcile;
pub mod runner;
pub mod source;
pub mod status;
pub mod types;

pub use artifact::{ArtifactError, ArtifactFetcher, RetryPolicy};
pub use cluster::{ClusterStore, KubeClusterStore, StoreError};
pub use events::{EventPublisher, EventSeverity, KubeEventPublisher};
pub use cycle::{CycleOutcome, CycleReport};
pub use reconcile::{reconcile, reconcile_object};
pub use source::{Artifact, SourceObject};
pub use status::StatusWriter;
pub use types::{BackoffState, Reconciler, ReconcilerError, Requeue};
