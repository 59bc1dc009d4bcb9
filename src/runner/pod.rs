//! # Runner Pods
//!
//! One runner pod per `Terraform` object, named `<name>-tf-runner` and living
//! in the object's namespace. The runner's certificate material is mirrored
//! into that namespace before the pod is created.

use super::{HttpRunnerClient, RunnerConnection, RunnerError, RunnerProvisioner};
use crate::config::ControllerConfig;
use crate::constants::{FIELD_MANAGER, RUNNER_LABEL, RUNNER_TLS_SECRET_NAME};
use crate::crd::Terraform;
use crate::rotation::{TlsBundle, TlsStore};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret};
use k8s_openapi::ByteString;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, ResourceExt};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Clone)]
pub struct PodRunnerProvisioner {
    client: Client,
    tls: TlsStore,
    image: String,
    port: u16,
}

impl std::fmt::Debug for PodRunnerProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PodRunnerProvisioner")
            .field("image", &self.image)
            .field("port", &self.port)
            .finish_non_exhaustive()
    }
}

fn kube_err(context: &str, e: impl std::fmt::Display) -> RunnerError {
    RunnerError::Transport(format!("{context}: {e}"))
}

impl PodRunnerProvisioner {
    pub fn new(client: Client, tls: TlsStore, config: &ControllerConfig) -> Self {
        Self {
            client,
            tls,
            image: config.runner_image.clone(),
            port: config.runner_grpc_port,
        }
    }

    async fn ensure_tls_secret(&self, namespace: &str, bundle: &TlsBundle) -> Result<(), RunnerError> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = Secret {
            metadata: kube::api::ObjectMeta {
                name: Some(RUNNER_TLS_SECRET_NAME.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([(
                    "app.kubernetes.io/created-by".to_string(),
                    FIELD_MANAGER.to_string(),
                )])),
                ..Default::default()
            },
            type_: Some("kubernetes.io/tls".to_string()),
            data: Some(BTreeMap::from([
                ("ca.crt".to_string(), ByteString(bundle.ca_pem.clone())),
                ("tls.crt".to_string(), ByteString(bundle.cert_pem.clone())),
                ("tls.key".to_string(), ByteString(bundle.key_pem.clone())),
            ])),
            ..Default::default()
        };
        api.patch(
            RUNNER_TLS_SECRET_NAME,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&secret),
        )
        .await
        .map_err(|e| kube_err("failed to write runner TLS secret", e))?;
        Ok(())
    }

    fn runner_pod(&self, terraform: &Terraform) -> Result<Pod, RunnerError> {
        let name = terraform.runner_pod_name();
        let namespace = terraform.namespace().unwrap_or_default();
        let pod = serde_json::json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": namespace,
                "labels": {
                    RUNNER_LABEL: terraform.name_any(),
                    "app.kubernetes.io/created-by": FIELD_MANAGER,
                },
            },
            "spec": {
                "serviceAccountName": terraform.service_account_name(),
                "terminationGracePeriodSeconds": terraform.runner_termination_grace_period_seconds(),
                "containers": [{
                    "name": "tf-runner",
                    "image": self.image,
                    "args": ["--grpc-port", self.port.to_string(), "--tls-dir", "/runner.tls"],
                    "ports": [{ "name": "grpc", "containerPort": self.port }],
                    "env": [
                        { "name": "POD_NAME", "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } } },
                        { "name": "POD_NAMESPACE", "valueFrom": { "fieldRef": { "fieldPath": "metadata.namespace" } } },
                    ],
                    "volumeMounts": [
                        { "name": "temp", "mountPath": "/tmp" },
                        { "name": "runner-tls", "mountPath": "/runner.tls", "readOnly": true },
                    ],
                }],
                "volumes": [
                    { "name": "temp", "emptyDir": {} },
                    { "name": "runner-tls", "secret": { "secretName": RUNNER_TLS_SECRET_NAME } },
                ],
            },
        });
        serde_json::from_value(pod).map_err(|e| RunnerError::NotReady(format!("invalid runner pod: {e}")))
    }
}

#[async_trait]
impl RunnerProvisioner for PodRunnerProvisioner {
    async fn lookup_or_create(&self, terraform: &Terraform) -> Result<RunnerConnection, RunnerError> {
        let bundle = self
            .tls
            .current()
            .ok_or_else(|| RunnerError::NotReady("no certificate bundle loaded".to_string()))?;
        let namespace = terraform.namespace().unwrap_or_default();
        let name = terraform.runner_pod_name();

        self.ensure_tls_secret(&namespace, &bundle).await?;

        let api: Api<Pod> = Api::namespaced(self.client.clone(), &namespace);
        let existing = api
            .get_opt(&name)
            .await
            .map_err(|e| kube_err("failed to get runner pod", e))?;

        let create = match existing {
            Some(pod) if pod.metadata.deletion_timestamp.is_some() => {
                debug!("Runner pod {}/{} is terminating, waiting for it to go", namespace, name);
                let uid = pod.uid().unwrap_or_default();
                await_condition(api.clone(), &name, conditions::is_deleted(&uid))
                    .await
                    .map_err(|e| kube_err("failed waiting for runner pod deletion", e))?;
                true
            }
            Some(_) => false,
            None => true,
        };

        if create {
            info!("🚀 Creating runner pod {}/{}", namespace, name);
            let pod = self.runner_pod(terraform)?;
            let params = PostParams {
                field_manager: Some(FIELD_MANAGER.to_string()),
                ..Default::default()
            };
            match api.create(&params, &pod).await {
                Ok(_) => {}
                Err(kube::Error::Api(ae)) if ae.code == 409 => {
                    debug!("Runner pod {}/{} already exists", namespace, name);
                }
                Err(e) => return Err(kube_err("failed to create runner pod", e)),
            }
        }

        let pod = await_condition(api, &name, conditions::is_pod_running())
            .await
            .map_err(|e| kube_err("failed waiting for runner pod", e))?
            .ok_or_else(|| RunnerError::NotReady(format!("runner pod {namespace}/{name} disappeared")))?;

        let pod_ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.clone())
            .ok_or_else(|| RunnerError::NotReady(format!("runner pod {namespace}/{name} has no IP yet")))?;
        let ip: IpAddr = pod_ip
            .parse()
            .map_err(|e| RunnerError::NotReady(format!("invalid runner pod IP '{pod_ip}': {e}")))?;

        let hostname = terraform.runner_hostname(&pod_ip);
        let client = HttpRunnerClient::connect(&bundle, &hostname, ip, self.port)?;
        debug!("Connected to runner {} at {}", hostname, ip);
        Ok(RunnerConnection::new(Arc::new(client)))
    }
}
