//! # Terraform Controller
//!
//! A Kubernetes controller that reconciles `Terraform` objects: it fetches the
//! Flux source artifact they point at, plans and applies the Terraform
//! configuration inside it through a runner, and records every outcome as a
//! status condition.
//!
//! ## Overview
//!
//! 1. **Watching sources** - `GitRepository`, `Bucket` and `OCIRepository` revisions requeue
//!    the Terraform objects that reference them, dependencies first
//! 2. **Verifying artifacts** - Tarballs are checksummed while they download
//! 3. **Ordering dependencies** - `dependsOn` blocks reconciliation until dependencies are ready
//!    and blocks deletion of a dependency while dependants remain
//! 4. **Plan, approve, apply** - Manual, automatic or forced approval of pending plans
//! 5. **Drift detection** - Re-plans applied revisions and reports divergence
//!
//! ## Binaries
//!
//! - `tf-controller` - the controller process
//! - `crdgen` - prints the CustomResourceDefinition
//! - `tfctl` - operator CLI

pub mod config;
pub mod constants;
pub mod controller;
pub mod crd;
pub mod observability;
pub mod rotation;
pub mod runner;
pub mod runtime;

pub use controller::reconciler::{Reconciler, ReconcilerError};
pub use crd::{Terraform, TerraformSpec, TerraformStatus};
