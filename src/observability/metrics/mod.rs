//! # Metrics Module
//!
//! Prometheus metrics for monitoring the controller, organized by responsibility.
//!
//! ## Sub-modules
//!
//! - `registry` - Metrics registry setup, registration and text encoding
//! - `controller_metrics` - Reconciliations, requeues, readiness and suspension per object
//! - `runner_metrics` - Artifact downloads and runner lifecycle

pub mod controller_metrics;
pub mod registry;
pub mod runner_metrics;

pub use controller_metrics::*;
pub use registry::*;
pub use runner_metrics::*;
