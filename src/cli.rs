//! # tfctl
//!
//! Operator CLI for Terraform objects reconciled by the controller.
//!
//! ## Usage
//!
//! ```bash
//! # List Terraform objects in all namespaces
//! tfctl list
//!
//! # Show status and conditions
//! tfctl status helloworld --namespace flux-system
//!
//! # Request a reconciliation now
//! tfctl reconcile helloworld
//!
//! # Approve the pending plan
//! tfctl approve helloworld
//!
//! # Pause and resume reconciliation
//! tfctl suspend helloworld
//! tfctl resume helloworld
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use kube::{
    api::{Api, ListParams, Patch, PatchParams},
    Client, ResourceExt,
};
use serde_json::json;
use tf_controller::constants::RECONCILE_REQUEST_ANNOTATION;
use tf_controller::crd::{Terraform, CONDITION_READY};

const FIELD_MANAGER: &str = "tfctl";

/// Terraform controller CLI
#[derive(Debug, Parser)]
#[command(name = "tfctl")]
#[command(about = "Operate Terraform objects reconciled by tf-controller", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Kubernetes namespace (defaults to `flux-system`, or all namespaces for `list`)
    #[arg(short, long, global = true)]
    namespace: Option<String>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List Terraform objects
    List,
    /// Show status and conditions of a Terraform object
    Status { name: String },
    /// Request a reconciliation through the reconcile annotation
    Reconcile { name: String },
    /// Approve the pending plan
    Approve { name: String },
    /// Suspend reconciliation
    Suspend { name: String },
    /// Resume reconciliation
    Resume { name: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tfctl=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client. Ensure kubeconfig is configured.")?;

    if let Commands::List = cli.command {
        return list_command(client, cli.namespace.as_deref()).await;
    }

    let namespace = cli.namespace.as_deref().unwrap_or("flux-system");
    let api: Api<Terraform> = Api::namespaced(client, namespace);
    match cli.command {
        Commands::List => Ok(()),
        Commands::Status { name } => status_command(&api, namespace, &name).await,
        Commands::Reconcile { name } => {
            let requested_at = chrono::Utc::now().to_rfc3339();
            patch(&api, &name, reconcile_patch(&requested_at)).await?;
            println!("✅ Reconciliation requested for {namespace}/{name} at {requested_at}");
            Ok(())
        }
        Commands::Approve { name } => {
            let terraform = api
                .get(&name)
                .await
                .with_context(|| format!("Failed to get Terraform '{namespace}/{name}'"))?;
            let pending = terraform.pending_plan();
            if pending.is_empty() {
                anyhow::bail!("Terraform '{namespace}/{name}' has no pending plan");
            }
            patch(&api, &name, approve_patch(pending)).await?;
            println!("✅ Approved plan {pending} for {namespace}/{name}");
            Ok(())
        }
        Commands::Suspend { name } => {
            patch(&api, &name, suspend_patch(true)).await?;
            println!("⏸️  Suspended {namespace}/{name}");
            Ok(())
        }
        Commands::Resume { name } => {
            patch(&api, &name, suspend_patch(false)).await?;
            println!("▶️  Resumed {namespace}/{name}");
            Ok(())
        }
    }
}

fn reconcile_patch(requested_at: &str) -> serde_json::Value {
    json!({
        "metadata": {
            "annotations": {
                RECONCILE_REQUEST_ANNOTATION: requested_at
            }
        }
    })
}

fn approve_patch(plan_id: &str) -> serde_json::Value {
    json!({ "spec": { "approvePlan": plan_id } })
}

fn suspend_patch(suspend: bool) -> serde_json::Value {
    json!({ "spec": { "suspend": suspend } })
}

async fn patch(api: &Api<Terraform>, name: &str, body: serde_json::Value) -> Result<()> {
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(body))
        .await
        .with_context(|| format!("Failed to patch Terraform '{name}'"))?;
    Ok(())
}

/// Table row: name, namespace, ready, reason, pending plan
fn list_row(terraform: &Terraform) -> [String; 5] {
    let (ready, reason) = terraform
        .condition(CONDITION_READY)
        .map(|c| (c.status.to_string(), c.reason.clone()))
        .unwrap_or_else(|| ("Unknown".to_string(), "-".to_string()));
    let pending = match terraform.pending_plan() {
        "" => "-".to_string(),
        plan => plan.to_string(),
    };
    [
        terraform.name_any(),
        terraform.namespace().unwrap_or_default(),
        ready,
        reason,
        pending,
    ]
}

async fn list_command(client: Client, namespace: Option<&str>) -> Result<()> {
    let api: Api<Terraform> = match namespace {
        Some(ns) => Api::namespaced(client, ns),
        None => Api::all(client),
    };
    let terraforms = api
        .list(&ListParams::default())
        .await
        .context("Failed to list Terraform resources")?;

    if terraforms.items.is_empty() {
        println!("No Terraform resources found.");
        return Ok(());
    }

    println!(
        "{:<30} {:<20} {:<8} {:<32} PENDING PLAN",
        "NAME", "NAMESPACE", "READY", "REASON"
    );
    for terraform in &terraforms.items {
        let [name, ns, ready, reason, pending] = list_row(terraform);
        println!("{name:<30} {ns:<20} {ready:<8} {reason:<32} {pending}");
    }
    Ok(())
}

async fn status_command(api: &Api<Terraform>, namespace: &str, name: &str) -> Result<()> {
    let terraform = api
        .get(name)
        .await
        .with_context(|| format!("Failed to get Terraform '{namespace}/{name}'"))?;

    println!("Terraform {namespace}/{name}");
    println!("  Generation: {}", terraform.generation());
    println!(
        "  Source: {}/{}",
        terraform.spec.source_ref.kind,
        terraform.source_key()
    );
    let approve_plan = match terraform.spec.approve_plan.as_str() {
        "" => "<manual>",
        plan => plan,
    };
    println!("  Approve Plan: {approve_plan}");
    println!("  Suspended: {}", terraform.spec.suspend);

    let Some(status) = terraform.status.as_ref() else {
        println!("\nStatus: not reconciled yet");
        return Ok(());
    };
    println!("\nStatus:");
    println!("  Observed Generation: {}", status.observed_generation);
    println!("  Last Applied Revision: {}", status.last_applied_revision);
    println!("  Last Attempted Revision: {}", status.last_attempted_revision);
    println!("  Last Planned Revision: {}", status.last_planned_revision);
    if !status.plan.pending.is_empty() {
        println!("  Pending Plan: {}", status.plan.pending);
    }
    if !status.lock.pending.is_empty() {
        println!("  State Lock: {}", status.lock.pending);
    }
    if !status.available_outputs.is_empty() {
        println!("  Outputs: {}", status.available_outputs.join(", "));
    }

    if !status.conditions.is_empty() {
        println!("\nConditions:");
        for condition in &status.conditions {
            println!("  {}: {} ({})", condition.r#type, condition.status, condition.reason);
            if !condition.message.is_empty() {
                println!("    Message: {}", condition.message);
            }
            if let Some(time) = condition.last_transition_time {
                println!("    Last Transition: {}", time.to_rfc3339());
            }
        }
    }
    Ok(())
}
