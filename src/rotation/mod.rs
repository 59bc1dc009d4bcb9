//! # Certificate Rotation
//!
//! Process-wide capability shared by every reconciliation worker:
//!
//! - a broadcast-once readiness signal, flipped by the rotation process when the
//!   first certificate authority is available
//! - a CA validity check
//! - a request channel; each request carries the target namespace and its own
//!   completion channel
//!
//! No runner is provisioned before readiness, and an invalid CA is rotated
//! before it is used.

mod secret;

pub use secret::{SecretCertRotator, TlsBundle, TlsStore};

use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RotationError {
    #[error("certificate rotation process stopped")]
    Closed,
    #[error("certificate rotation failed: {0}")]
    Failed(String),
}

/// Validity of the current certificate authority
pub trait CaValidity: Send + Sync {
    fn is_ca_valid(&self) -> anyhow::Result<bool>;
}

/// Rotation request for a namespace, answered on `reply`
#[derive(Debug)]
pub struct RotationRequest {
    pub namespace: String,
    pub reply: oneshot::Sender<Result<(), String>>,
}

/// The rotation process' side of the capability
#[derive(Debug)]
pub struct RotationSignals {
    pub ready: watch::Sender<bool>,
    pub requests: mpsc::Receiver<RotationRequest>,
}

/// Worker side of the rotation capability
#[derive(Clone)]
pub struct RotationHandle {
    ready: watch::Receiver<bool>,
    trigger: Option<mpsc::Sender<RotationRequest>>,
    validity: Arc<dyn CaValidity>,
}

impl fmt::Debug for RotationHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RotationHandle")
            .field("ready", &*self.ready.borrow())
            .field("has_trigger", &self.trigger.is_some())
            .finish_non_exhaustive()
    }
}

impl RotationHandle {
    /// Create the capability and the rotation process' end of it
    pub fn channel(validity: Arc<dyn CaValidity>, buffer: usize) -> (Self, RotationSignals) {
        let (ready_tx, ready_rx) = watch::channel(false);
        let (request_tx, request_rx) = mpsc::channel(buffer.max(1));
        (
            Self {
                ready: ready_rx,
                trigger: Some(request_tx),
                validity,
            },
            RotationSignals {
                ready: ready_tx,
                requests: request_rx,
            },
        )
    }

    /// A capability that is ready from the start and never rotates
    ///
    /// Used with the insecure local runner, which opens no TLS channel.
    pub fn always_ready() -> Self {
        let (_ready_tx, ready_rx) = watch::channel(true);
        Self {
            ready: ready_rx,
            trigger: None,
            validity: Arc::new(AlwaysValid),
        }
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Block until the rotation process has signalled readiness once
    pub async fn wait_ready(&self) -> Result<(), RotationError> {
        let mut ready = self.ready.clone();
        ready
            .wait_for(|is_ready| *is_ready)
            .await
            .map(|_| ())
            .map_err(|_closed| RotationError::Closed)
    }

    /// Rotate the CA first when it is not valid
    ///
    /// A failing validity check counts as invalid. The call blocks until the
    /// rotation process answers this request.
    pub async fn ensure_valid_ca(&self, namespace: &str) -> Result<(), RotationError> {
        let valid = self.validity.is_ca_valid().unwrap_or_else(|e| {
            warn!("CA validity check failed: {}", e);
            false
        });
        if valid {
            return Ok(());
        }
        let Some(trigger) = self.trigger.as_ref() else {
            return Ok(());
        };

        info!("🔐 CA is not valid, requesting rotation for namespace {}", namespace);
        let (reply_tx, reply_rx) = oneshot::channel();
        trigger
            .send(RotationRequest {
                namespace: namespace.to_string(),
                reply: reply_tx,
            })
            .await
            .map_err(|_closed| RotationError::Closed)?;

        reply_rx
            .await
            .map_err(|_closed| RotationError::Closed)?
            .map_err(RotationError::Failed)
    }
}

struct AlwaysValid;

impl CaValidity for AlwaysValid {
    fn is_ca_valid(&self) -> anyhow::Result<bool> {
        Ok(true)
    }
}
