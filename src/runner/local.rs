//! # Local Runner
//!
//! Runs the `terraform` CLI inside the controller process, one scratch
//! directory per setup. There is no TLS channel and no pod; this mode exists
//! for development against a local cluster.

use super::{
    ApplyReply, ApplyRequest, OutputValue, PlanReply, PlanRequest, RunnerConnection, RunnerError,
    RunnerProvisioner, SetupRequest, TerraformRunner,
};
use crate::crd::{BackendConfigSpec, ResourceRef, Terraform};
use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use std::collections::{BTreeMap, HashMap};
use std::path::{Component, Path, PathBuf};
use std::process::Output;
use std::sync::{Arc, LazyLock, Mutex};
use tempfile::TempDir;
use tokio::process::Command;
use tracing::{debug, info};

const PLAN_FILE: &str = "tfplan";
const TFVARS_FILE: &str = "generated.auto.tfvars.json";
const BACKEND_OVERRIDE_FILE: &str = "backend_override.tf";

static LOCK_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)Error acquiring the state lock.*?ID:\s+(\S+)")
        .expect("Failed to compile lock id regex")
});

/// Lock holder id from terraform's lock error output
pub fn parse_lock_id(stderr: &str) -> Option<String> {
    LOCK_ID_REGEX
        .captures(stderr)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

#[derive(Debug, Clone)]
pub struct LocalRunnerProvisioner {
    terraform_bin: PathBuf,
}

impl LocalRunnerProvisioner {
    /// Locate `terraform` on the PATH
    pub fn from_path() -> anyhow::Result<Self> {
        let terraform_bin =
            which::which("terraform").context("terraform binary not found on PATH")?;
        info!("Using local terraform binary at {}", terraform_bin.display());
        Ok(Self { terraform_bin })
    }
}

#[async_trait]
impl RunnerProvisioner for LocalRunnerProvisioner {
    async fn lookup_or_create(&self, _terraform: &Terraform) -> Result<RunnerConnection, RunnerError> {
        let runner = Arc::new(LocalTerraformRunner::new(self.terraform_bin.clone()));
        Ok(RunnerConnection::new(runner))
    }
}

#[derive(Debug)]
struct Workspace {
    _root: TempDir,
    working_dir: PathBuf,
}

#[derive(Debug)]
pub struct LocalTerraformRunner {
    terraform_bin: PathBuf,
    workspaces: Mutex<HashMap<String, Workspace>>,
}

impl LocalTerraformRunner {
    pub fn new(terraform_bin: PathBuf) -> Self {
        Self {
            terraform_bin,
            workspaces: Mutex::new(HashMap::new()),
        }
    }

    fn working_dir(&self, instance_id: &str) -> Result<PathBuf, RunnerError> {
        self.workspaces
            .lock()
            .map_err(|_poisoned| RunnerError::Command("workspace registry poisoned".to_string()))?
            .get(instance_id)
            .map(|w| w.working_dir.clone())
            .ok_or_else(|| RunnerError::NotReady(format!("unknown runner instance '{instance_id}'")))
    }

    async fn terraform(&self, dir: &Path, args: &[String]) -> Result<Output, RunnerError> {
        debug!("terraform {}", args.join(" "));
        Command::new(&self.terraform_bin)
            .args(args)
            .current_dir(dir)
            .env("TF_IN_AUTOMATION", "1")
            .output()
            .await
            .map_err(|e| RunnerError::Command(format!("failed to run terraform: {e}")))
    }

    /// Run a subcommand that must exit 0
    async fn terraform_ok(&self, dir: &Path, args: &[String]) -> Result<String, RunnerError> {
        let output = self.terraform(dir, args).await?;
        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(command_error(args, &output))
        }
    }
}

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

fn command_error(args: &[String], output: &Output) -> RunnerError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    if let Some(lock_id) = parse_lock_id(&stderr) {
        return RunnerError::StateLocked {
            lock_id,
            message: stderr.trim().to_string(),
        };
    }
    let subcommand = args.first().map_or("", String::as_str);
    RunnerError::Command(format!("terraform {} failed: {}", subcommand, stderr.trim()))
}

/// Resolve `path` inside `root`, refusing to leave it
fn resolve_working_dir(root: &Path, path: &str) -> Result<PathBuf, RunnerError> {
    let relative = Path::new(path.trim_start_matches('/'));
    if relative
        .components()
        .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(RunnerError::Command(format!("path '{path}' escapes the artifact")));
    }
    Ok(root.join(relative))
}

fn backend_override(backend: &BackendConfigSpec, name: &str, namespace: &str) -> Option<String> {
    if backend.disable {
        return None;
    }
    if !backend.custom_configuration.trim().is_empty() {
        return Some(backend.custom_configuration.clone());
    }
    let suffix = if backend.secret_suffix.is_empty() {
        name
    } else {
        backend.secret_suffix.as_str()
    };
    Some(format!(
        "terraform {{\n  backend \"kubernetes\" {{\n    secret_suffix     = \"{suffix}\"\n    in_cluster_config = {}\n    namespace         = \"{namespace}\"\n  }}\n}}\n",
        backend.in_cluster_config
    ))
}

/// Resource references from `terraform show -json`
fn inventory_from_state(state: &serde_json::Value) -> Vec<ResourceRef> {
    fn walk(module: &serde_json::Value, entries: &mut Vec<ResourceRef>) {
        if let Some(resources) = module.get("resources").and_then(|r| r.as_array()) {
            for resource in resources {
                let identifier = match resource.pointer("/values/id") {
                    Some(serde_json::Value::String(id)) => id.clone(),
                    Some(other) if !other.is_null() => other.to_string(),
                    _ => String::new(),
                };
                entries.push(ResourceRef {
                    name: resource["address"].as_str().unwrap_or_default().to_string(),
                    resource_type: resource["type"].as_str().unwrap_or_default().to_string(),
                    identifier,
                });
            }
        }
        if let Some(children) = module.get("child_modules").and_then(|c| c.as_array()) {
            for child in children {
                walk(child, entries);
            }
        }
    }

    let mut entries = Vec::new();
    if let Some(root) = state.pointer("/values/root_module") {
        walk(root, &mut entries);
    }
    entries
}

#[async_trait]
impl TerraformRunner for LocalTerraformRunner {
    async fn setup(&self, request: SetupRequest) -> Result<String, RunnerError> {
        let io = |context: &str, e: std::io::Error| RunnerError::Command(format!("{context}: {e}"));

        let root = tempfile::Builder::new()
            .prefix("tf-")
            .tempdir()
            .map_err(|e| io("failed to create workspace", e))?;
        let artifact_path = root.path().join("artifact.tar.gz");
        let source_dir = root.path().join("src");
        tokio::fs::write(&artifact_path, &request.artifact)
            .await
            .map_err(|e| io("failed to write artifact", e))?;
        tokio::fs::create_dir_all(&source_dir)
            .await
            .map_err(|e| io("failed to create source directory", e))?;

        let untar = Command::new("tar")
            .arg("-xzf")
            .arg(&artifact_path)
            .arg("-C")
            .arg(&source_dir)
            .output()
            .await
            .map_err(|e| io("failed to run tar", e))?;
        if !untar.status.success() {
            return Err(RunnerError::Command(format!(
                "failed to extract artifact: {}",
                String::from_utf8_lossy(&untar.stderr).trim()
            )));
        }

        let working_dir = resolve_working_dir(&source_dir, &request.path)?;
        if !working_dir.is_dir() {
            return Err(RunnerError::Command(format!(
                "path '{}' not found in artifact",
                request.path
            )));
        }

        if !request.vars.is_empty() {
            let tfvars = serde_json::to_vec_pretty(&request.vars)
                .map_err(|e| RunnerError::Command(format!("failed to encode variables: {e}")))?;
            tokio::fs::write(working_dir.join(TFVARS_FILE), tfvars)
                .await
                .map_err(|e| io("failed to write variables", e))?;
        }

        if let Some(backend) = request
            .backend_config
            .as_ref()
            .and_then(|b| backend_override(b, &request.name, &request.namespace))
        {
            tokio::fs::write(working_dir.join(BACKEND_OVERRIDE_FILE), backend)
                .await
                .map_err(|e| io("failed to write backend override", e))?;
        }

        self.terraform_ok(&working_dir, &args(&["init", "-input=false", "-no-color"]))
            .await?;
        if request.workspace != crate::constants::DEFAULT_WORKSPACE_NAME {
            self.terraform_ok(
                &working_dir,
                &args(&["workspace", "select", "-or-create", &request.workspace]),
            )
            .await?;
        }

        let instance_id = uuid::Uuid::new_v4().to_string();
        self.workspaces
            .lock()
            .map_err(|_poisoned| RunnerError::Command("workspace registry poisoned".to_string()))?
            .insert(
                instance_id.clone(),
                Workspace {
                    _root: root,
                    working_dir,
                },
            );
        info!(
            "Prepared local workspace {} for {}/{} at {}",
            instance_id, request.namespace, request.name, request.revision
        );
        Ok(instance_id)
    }

    async fn plan(&self, request: PlanRequest) -> Result<PlanReply, RunnerError> {
        let dir = self.working_dir(&request.instance_id)?;

        if request.refresh_before_apply {
            self.terraform_ok(
                &dir,
                &args(&["apply", "-refresh-only", "-auto-approve", "-input=false", "-no-color"]),
            )
            .await?;
        }

        let mut plan_args = args(&[
            "plan",
            "-input=false",
            "-no-color",
            "-detailed-exitcode",
        ]);
        plan_args.push(format!("-out={PLAN_FILE}"));
        if request.destroy {
            plan_args.push("-destroy".to_string());
        }
        plan_args.extend(request.targets.iter().map(|t| format!("-target={t}")));

        let output = self.terraform(&dir, &plan_args).await?;
        match output.status.code() {
            Some(0) => Ok(PlanReply {
                has_changes: false,
                message: "Plan no changes".to_string(),
            }),
            Some(2) => Ok(PlanReply {
                has_changes: true,
                message: "Plan generated".to_string(),
            }),
            _ => Err(command_error(&plan_args, &output)),
        }
    }

    async fn show_plan(&self, instance_id: &str) -> Result<String, RunnerError> {
        let dir = self.working_dir(instance_id)?;
        self.terraform_ok(&dir, &args(&["show", "-no-color", PLAN_FILE]))
            .await
    }

    async fn apply(&self, request: ApplyRequest) -> Result<ApplyReply, RunnerError> {
        let dir = self.working_dir(&request.instance_id)?;
        self.terraform_ok(&dir, &args(&["apply", "-input=false", "-no-color", PLAN_FILE]))
            .await?;

        let inventory = if request.enable_inventory {
            let state = self.terraform_ok(&dir, &args(&["show", "-json"])).await?;
            let state: serde_json::Value = serde_json::from_str(&state)
                .map_err(|e| RunnerError::Command(format!("invalid state json: {e}")))?;
            inventory_from_state(&state)
        } else {
            Vec::new()
        };

        Ok(ApplyReply {
            message: "Applied successfully".to_string(),
            inventory,
        })
    }

    async fn outputs(
        &self,
        instance_id: &str,
    ) -> Result<BTreeMap<String, OutputValue>, RunnerError> {
        let dir = self.working_dir(instance_id)?;
        let raw = self
            .terraform_ok(&dir, &args(&["output", "-json", "-no-color"]))
            .await?;
        serde_json::from_str(&raw)
            .map_err(|e| RunnerError::Command(format!("invalid output json: {e}")))
    }

    async fn force_unlock(&self, instance_id: &str, lock_id: &str) -> Result<(), RunnerError> {
        let dir = self.working_dir(instance_id)?;
        self.terraform_ok(&dir, &args(&["force-unlock", "-force", lock_id]))
            .await?;
        Ok(())
    }

    async fn cleanup(&self, instance_id: &str) -> Result<(), RunnerError> {
        self.workspaces
            .lock()
            .map_err(|_poisoned| RunnerError::Command("workspace registry poisoned".to_string()))?
            .remove(instance_id);
        Ok(())
    }
}
