//! # Controller
//!
//! Reconciliation logic and the process-level pieces around it.

pub mod backoff;
pub mod reconciler;
pub mod server;
