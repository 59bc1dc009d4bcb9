//! # Secret-backed Rotator
//!
//! Loads the CA and the client certificate shared with the runners from a TLS
//! secret in the runtime namespace and serves rotation requests by reloading it.
//! Certificates are issued outside the controller (cert-manager or the install
//! tooling); rotating here means picking up the renewed bundle.

use super::{CaValidity, RotationSignals};
use crate::constants::CA_NOT_AFTER_ANNOTATION;
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{debug, error, info, warn};

const CA_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const KEY_KEY: &str = "tls.key";

/// Delay between attempts to load the first bundle
const INITIAL_LOAD_RETRY: Duration = Duration::from_secs(5);

/// PEM material for the runner channel
#[derive(Clone, PartialEq, Eq)]
pub struct TlsBundle {
    pub ca_pem: Vec<u8>,
    pub cert_pem: Vec<u8>,
    pub key_pem: Vec<u8>,
    pub not_after: Option<DateTime<Utc>>,
}

impl std::fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca_pem_len", &self.ca_pem.len())
            .field("cert_pem_len", &self.cert_pem.len())
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl TlsBundle {
    /// Read the bundle from a TLS secret
    pub fn from_secret(secret: &Secret) -> Result<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| anyhow!("secret has no data"))?;
        let field = |key: &str| -> Result<Vec<u8>> {
            data.get(key)
                .map(|v| v.0.clone())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| anyhow!("secret is missing '{}'", key))
        };

        let not_after = secret
            .metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(CA_NOT_AFTER_ANNOTATION))
            .map(|raw| {
                DateTime::parse_from_rfc3339(raw)
                    .map(|t| t.with_timezone(&Utc))
                    .with_context(|| format!("invalid {} annotation '{}'", CA_NOT_AFTER_ANNOTATION, raw))
            })
            .transpose()?;

        Ok(Self {
            ca_pem: field(CA_KEY)?,
            cert_pem: field(CERT_KEY)?,
            key_pem: field(KEY_KEY)?,
            not_after,
        })
    }

    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_after.is_none_or(|not_after| not_after > now)
    }

    /// Client certificate followed by its key, the form `reqwest::Identity::from_pem` expects
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut pem = self.cert_pem.clone();
        if !pem.ends_with(b"\n") {
            pem.push(b'\n');
        }
        pem.extend_from_slice(&self.key_pem);
        pem
    }
}

/// Shared view of the current bundle
#[derive(Debug, Clone, Default)]
pub struct TlsStore(Arc<RwLock<Option<Arc<TlsBundle>>>>);

impl TlsStore {
    pub fn current(&self) -> Option<Arc<TlsBundle>> {
        self.0.read().ok().and_then(|guard| guard.clone())
    }

    /// Install a bundle, returning true when it differs from the previous one
    pub fn replace(&self, bundle: TlsBundle) -> bool {
        match self.0.write() {
            Ok(mut guard) => {
                let changed = guard.as_deref() != Some(&bundle);
                *guard = Some(Arc::new(bundle));
                changed
            }
            Err(_poisoned) => false,
        }
    }
}

impl CaValidity for TlsStore {
    fn is_ca_valid(&self) -> Result<bool> {
        let bundle = self
            .current()
            .ok_or_else(|| anyhow!("no certificate bundle loaded"))?;
        Ok(bundle.is_valid_at(Utc::now()))
    }
}

/// Process that owns the TLS bundle
#[derive(Debug)]
pub struct SecretCertRotator {
    api: Api<Secret>,
    namespace: String,
    secret_name: String,
    store: TlsStore,
    refresh_interval: Duration,
}

impl SecretCertRotator {
    pub fn new(
        client: Client,
        namespace: &str,
        secret_name: &str,
        store: TlsStore,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            namespace: namespace.to_string(),
            secret_name: secret_name.to_string(),
            store,
            refresh_interval,
        }
    }

    /// Load the first bundle, signal readiness, then serve rotation requests
    ///
    /// Requests queued together are answered by a single reload. Returns when
    /// every `RotationHandle` has been dropped.
    pub async fn run(self, signals: RotationSignals) {
        let RotationSignals {
            ready,
            mut requests,
        } = signals;

        loop {
            match self.reload().await {
                Ok(()) => break,
                Err(e) => {
                    warn!(
                        "⏳ Waiting for certificate secret {}/{}: {:#}",
                        self.namespace, self.secret_name, e
                    );
                    tokio::time::sleep(INITIAL_LOAD_RETRY).await;
                }
            }
        }
        ready.send_replace(true);
        info!(
            "🔐 Certificate bundle loaded from {}/{}, runners can be provisioned",
            self.namespace, self.secret_name
        );

        let mut refresh = tokio::time::interval(self.refresh_interval);
        refresh.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        refresh.tick().await;

        loop {
            tokio::select! {
                request = requests.recv() => {
                    let Some(first) = request else {
                        debug!("Rotation request channel closed, stopping rotator");
                        return;
                    };
                    let mut batch = vec![first];
                    while let Ok(next) = requests.try_recv() {
                        batch.push(next);
                    }
                    let namespaces: Vec<&str> = batch.iter().map(|r| r.namespace.as_str()).collect();
                    info!("🔄 Rotating certificates for namespaces {:?}", namespaces);

                    let result = self.reload().await.map_err(|e| format!("{e:#}"));
                    if let Err(e) = &result {
                        error!("❌ Certificate rotation failed: {}", e);
                    }
                    for request in batch {
                        let _ = request.reply.send(result.clone());
                    }
                }
                _ = refresh.tick() => {
                    if let Err(e) = self.reload().await {
                        warn!("Periodic certificate refresh failed: {:#}", e);
                    }
                }
            }
        }
    }

    /// Read the secret and install its bundle; an expired CA is rejected
    async fn reload(&self) -> Result<()> {
        let secret = self
            .api
            .get(&self.secret_name)
            .await
            .with_context(|| format!("Failed to read secret {}/{}", self.namespace, self.secret_name))?;
        let bundle = TlsBundle::from_secret(&secret)?;
        if !bundle.is_valid_at(Utc::now()) {
            return Err(anyhow!(
                "CA in {}/{} expired at {}",
                self.namespace,
                self.secret_name,
                bundle
                    .not_after
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_default()
            ));
        }
        let not_after = bundle.not_after;
        if self.store.replace(bundle) {
            info!("🔐 Installed certificate bundle (CA valid until {:?})", not_after);
        }
        Ok(())
    }
}
