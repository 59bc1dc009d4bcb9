//! # Runner Client
//!
//! JSON over HTTPS to the runner pod. The channel is mutually authenticated
//! with the bundle loaded by the rotator; the server name is the pod's DNS name
//! and is resolved straight to the pod IP.

use super::{
    ApplyReply, ApplyRequest, OutputValue, PlanReply, PlanRequest, RunnerError, SetupRequest,
    TerraformRunner,
};
use crate::rotation::TlsBundle;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use tracing::debug;

/// Serde adapter carrying bytes as standard base64 text
pub(crate) mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Body of a 409 reply
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LockedReply {
    lock_id: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceRequest<'a> {
    instance_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetupReply {
    instance_id: String,
}

#[derive(Debug, Deserialize)]
struct ShowPlanReply {
    plan: String,
}

#[derive(Debug, Deserialize)]
struct OutputsReply {
    outputs: BTreeMap<String, OutputValue>,
}

#[derive(Debug, Clone)]
pub struct HttpRunnerClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpRunnerClient {
    /// Client for the runner at `ip:port`, presenting as `hostname`
    pub fn connect(
        bundle: &TlsBundle,
        hostname: &str,
        ip: IpAddr,
        port: u16,
    ) -> Result<Self, RunnerError> {
        let ca = reqwest::Certificate::from_pem(&bundle.ca_pem)
            .map_err(|e| RunnerError::Transport(format!("invalid CA certificate: {e}")))?;
        let identity = reqwest::Identity::from_pem(&bundle.identity_pem())
            .map_err(|e| RunnerError::Transport(format!("invalid client certificate: {e}")))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .tls_built_in_root_certs(false)
            .add_root_certificate(ca)
            .identity(identity)
            .resolve(hostname, SocketAddr::new(ip, port))
            .build()
            .map_err(|e| RunnerError::Transport(format!("failed to build runner client: {e}")))?;

        Ok(Self {
            client,
            base_url: format!("https://{hostname}:{port}"),
        })
    }

    /// Plain client against `base_url`, used by tests against a mock runner
    pub fn with_client(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    async fn call<B, R>(&self, operation: &str, body: &B) -> Result<R, RunnerError>
    where
        B: Serialize + ?Sized + Sync,
        R: DeserializeOwned,
    {
        let url = format!("{}/v1/{}", self.base_url, operation);
        debug!("Runner call {}", url);
        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| RunnerError::Transport(format!("{operation}: {e}")))?;

        let status = response.status();
        if status == StatusCode::CONFLICT {
            let locked: LockedReply = response
                .json()
                .await
                .map_err(|e| RunnerError::Transport(format!("{operation}: invalid lock reply: {e}")))?;
            let message = if locked.message.is_empty() {
                format!("state is locked by {}", locked.lock_id)
            } else {
                locked.message
            };
            return Err(RunnerError::StateLocked {
                lock_id: locked.lock_id,
                message,
            });
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(RunnerError::Command(format!(
                "{operation} failed with status {status}: {text}"
            )));
        }

        response
            .json()
            .await
            .map_err(|e| RunnerError::Transport(format!("{operation}: invalid reply: {e}")))
    }
}

#[async_trait]
impl TerraformRunner for HttpRunnerClient {
    async fn setup(&self, request: SetupRequest) -> Result<String, RunnerError> {
        let reply: SetupReply = self.call("setup", &request).await?;
        Ok(reply.instance_id)
    }

    async fn plan(&self, request: PlanRequest) -> Result<PlanReply, RunnerError> {
        self.call("plan", &request).await
    }

    async fn show_plan(&self, instance_id: &str) -> Result<String, RunnerError> {
        let reply: ShowPlanReply = self
            .call(
                "show-plan",
                &InstanceRequest {
                    instance_id,
                    lock_id: None,
                },
            )
            .await?;
        Ok(reply.plan)
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, RunnerError> {
        self.call("apply", &request).await
    }

    async fn outputs(
        &self,
        instance_id: &str,
    ) -> Result<BTreeMap<String, OutputValue>, RunnerError> {
        let reply: OutputsReply = self
            .call(
                "outputs",
                &InstanceRequest {
                    instance_id,
                    lock_id: None,
                },
            )
            .await?;
        Ok(reply.outputs)
    }

    async fn force_unlock(&self, instance_id: &str, lock_id: &str) -> Result<(), RunnerError> {
        let _: serde_json::Value = self
            .call(
                "force-unlock",
                &InstanceRequest {
                    instance_id,
                    lock_id: Some(lock_id),
                },
            )
            .await?;
        Ok(())
    }

    async fn cleanup(&self, instance_id: &str) -> Result<(), RunnerError> {
        let _: serde_json::Value = self
            .call(
                "cleanup",
                &InstanceRequest {
                    instance_id,
                    lock_id: None,
                },
            )
            .await?;
        Ok(())
    }
}
