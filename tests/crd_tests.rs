//! Terraform resource schema and manifest parsing
//!
//! Run with: `cargo test --test crd_tests`

use chrono::{TimeZone, Utc};
use kube::CustomResourceExt;
use serde_json::json;
use std::time::Duration;
use tf_controller::crd::{
    BackendConfigSpec, Condition, ConditionStatus, DependencyReference, ForceUnlock, HealthCheck,
    LockStatus, ObjectKey, PlanStatus, ResourceInventory, ResourceRef, SourceRef, Terraform,
    TerraformSpec, TerraformStatus, TfStateSpec, Variable, WriteOutputsToSecretSpec,
    CONDITION_APPLY, CONDITION_READY, REASON_APPLY_SUCCEEDED, REASON_OUTPUTS_WRITTEN,
};

const MANIFEST: &str = r#"
apiVersion: infra.contrib.fluxcd.io/v1alpha1
kind: Terraform
metadata:
  name: helloworld
  namespace: flux-system
spec:
  interval: 1m
  retryInterval: 20s
  approvePlan: auto
  path: ./terraform/helloworld
  sourceRef:
    kind: GitRepository
    name: helloworld
  vars:
    - name: subject
      value: world
    - name: replicas
      value: 3
  writeOutputsToSecret:
    name: helloworld-output
    outputs:
      - greeting:GREETING
  dependsOn:
    - name: network
      namespace: infra
  tfstate:
    forceUnlock: "yes"
    lockIdentifier: f2ab685b-f84d-ac0b-a125-378a22877e8d
  healthChecks:
    - name: web
      type: http
      url: "https://{{.hostname}}/healthz"
      timeout: 5s
"#;

#[test]
fn test_crd_definition() {
    let crd = Terraform::crd();

    assert_eq!(crd.spec.group, "infra.contrib.fluxcd.io");
    assert_eq!(crd.spec.names.kind, "Terraform");
    assert_eq!(crd.spec.names.plural, "terraforms");
    assert_eq!(crd.spec.names.short_names, Some(vec!["tf".to_string()]));

    let version = &crd.spec.versions[0];
    assert_eq!(version.name, "v1alpha1");
    assert!(version
        .subresources
        .as_ref()
        .and_then(|s| s.status.as_ref())
        .is_some());

    let yaml = serde_yaml::to_string(&crd).unwrap();
    assert!(yaml.contains("approvePlan"));
    assert!(yaml.contains("writeOutputsToSecret"));
}

#[test]
fn test_manifest_parses() {
    let tf: Terraform = serde_yaml::from_str(MANIFEST).unwrap();

    assert_eq!(tf.key(), ObjectKey::new("flux-system", "helloworld"));
    assert!(tf.is_auto_approve());
    assert_eq!(tf.interval(), Duration::from_secs(60));
    assert_eq!(tf.retry_interval(), Duration::from_secs(20));
    assert_eq!(tf.source_key(), ObjectKey::new("flux-system", "helloworld"));
    assert_eq!(tf.dependency_keys(), vec![ObjectKey::new("infra", "network")]);
    assert_eq!(tf.spec.vars[1].value, Some(serde_json::json!(3)));
    assert_eq!(tf.workspace_name(), "default");
    assert!(tf.always_cleanup_runner_pod());
    assert_eq!(tf.runner_pod_name(), "helloworld-tf-runner");

    let tfstate = tf.spec.tfstate.as_ref().unwrap();
    assert_eq!(tfstate.force_unlock, ForceUnlock::Yes);
    assert_eq!(
        tf.spec.health_checks[0].timeout(),
        Duration::from_secs(5)
    );
    assert!(tf.status.is_none());
}

#[test]
fn test_status_serializes_camel_case() {
    let tf: Terraform = serde_yaml::from_str(MANIFEST).unwrap();
    let planned = tf.planned_with_changes("main/abc", true, "Plan generated");

    let value = serde_json::to_value(planned.status.as_ref().unwrap()).unwrap();

    assert_eq!(value["plan"]["pending"], "plan-main-abc");
    assert_eq!(value["lastPlannedRevision"], "main/abc");
    assert_eq!(value["conditions"][0]["type"], "Plan");
    assert!(value["conditions"][0]["lastTransitionTime"].is_string());
}

fn fully_populated() -> Terraform {
    let spec = TerraformSpec {
        approve_plan: "plan-main-6f2d4c0e1a".to_string(),
        destroy: true,
        backend_config: Some(BackendConfigSpec {
            disable: false,
            secret_suffix: "helloworld".to_string(),
            in_cluster_config: true,
            custom_configuration: "backend \"s3\" {}".to_string(),
        }),
        workspace: "staging".to_string(),
        vars: vec![
            Variable {
                name: "subject".to_string(),
                value: Some(json!("world")),
            },
            Variable {
                name: "tags".to_string(),
                value: Some(json!({"team": "platform", "replicas": 3, "zones": ["a", "b"]})),
            },
        ],
        interval: "1h30m".to_string(),
        retry_interval: Some("45s".to_string()),
        path: "./terraform/helloworld".to_string(),
        source_ref: SourceRef {
            kind: "OCIRepository".to_string(),
            name: "helloworld".to_string(),
            namespace: Some("sources".to_string()),
        },
        suspend: true,
        force: true,
        write_outputs_to_secret: Some(WriteOutputsToSecretSpec {
            name: "helloworld-output".to_string(),
            outputs: vec!["greeting".to_string(), "endpoint:ENDPOINT".to_string()],
        }),
        disable_drift_detection: true,
        health_checks: vec![
            HealthCheck {
                name: "web".to_string(),
                check_type: "http".to_string(),
                url: "https://{{.hostname}}/healthz".to_string(),
                address: String::new(),
                timeout: Some("5s".to_string()),
            },
            HealthCheck {
                name: "db".to_string(),
                check_type: "tcp".to_string(),
                url: String::new(),
                address: "{{.db_host}}:5432".to_string(),
                timeout: None,
            },
        ],
        destroy_resources_on_deletion: true,
        service_account_name: "custom-runner".to_string(),
        always_cleanup_runner_pod: Some(false),
        runner_termination_grace_period_seconds: Some(90),
        refresh_before_apply: true,
        enable_inventory: true,
        tfstate: Some(TfStateSpec {
            force_unlock: ForceUnlock::Auto,
            lock_identifier: "f2ab685b-f84d-ac0b-a125-378a22877e8d".to_string(),
        }),
        targets: vec!["aws_s3_bucket.logs".to_string()],
        depends_on: vec![
            DependencyReference {
                name: "network".to_string(),
                namespace: Some("infra".to_string()),
            },
            DependencyReference {
                name: "dns".to_string(),
                namespace: None,
            },
        ],
    };

    let applied_at = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
    let status = TerraformStatus {
        observed_generation: 4,
        conditions: vec![
            Condition {
                r#type: CONDITION_READY.to_string(),
                status: ConditionStatus::True,
                reason: REASON_OUTPUTS_WRITTEN.to_string(),
                message: "Outputs written: main/6f2d4c0e1a9b8f7e3c21".to_string(),
                last_transition_time: Some(applied_at),
            },
            Condition {
                r#type: CONDITION_APPLY.to_string(),
                status: ConditionStatus::Unknown,
                reason: REASON_APPLY_SUCCEEDED.to_string(),
                message: "Applied successfully".to_string(),
                last_transition_time: Some(Utc.with_ymd_and_hms(2024, 5, 1, 9, 59, 30).unwrap()),
            },
        ],
        last_applied_revision: "main/6f2d4c0e1a9b8f7e3c21".to_string(),
        last_attempted_revision: "main/6f2d4c0e1a9b8f7e3c21".to_string(),
        last_planned_revision: "main/6f2d4c0e1a9b8f7e3c21".to_string(),
        last_drift_detected_at: Some(Utc.with_ymd_and_hms(2024, 4, 30, 8, 15, 0).unwrap()),
        last_applied_by_drift_detection_at: Some(applied_at),
        available_outputs: vec!["endpoint".to_string(), "greeting".to_string()],
        plan: PlanStatus {
            last_applied: "plan-main-6f2d4c0e1a9b8f7e3c21".to_string(),
            pending: "plan-main-7a1b2c3d4e".to_string(),
            is_destroy_plan: true,
            is_drift_detection_plan: true,
            is_destroy_applied: true,
        },
        inventory: Some(ResourceInventory {
            entries: vec![ResourceRef {
                name: "aws_s3_bucket.logs".to_string(),
                resource_type: "aws_s3_bucket".to_string(),
                identifier: "helloworld-logs".to_string(),
            }],
        }),
        lock: LockStatus {
            last_applied: "0c1d2e3f".to_string(),
            pending: "f2ab685b-f84d-ac0b-a125-378a22877e8d".to_string(),
        },
        last_handled_reconcile_at: Some("2024-05-01T09:58:00Z".to_string()),
    };

    let mut tf = Terraform::new("helloworld", spec);
    tf.metadata.namespace = Some("flux-system".to_string());
    tf.metadata.generation = Some(4);
    tf.status = Some(status);
    tf
}

#[test]
fn test_object_survives_json_round_trip() {
    let original = fully_populated();

    let encoded = serde_json::to_string(&original).unwrap();
    let decoded: Terraform = serde_json::from_str(&encoded).unwrap();

    assert_eq!(decoded.spec, original.spec);
    assert_eq!(decoded.status, original.status);
    assert_eq!(decoded, original);
}

#[test]
fn test_object_survives_yaml_round_trip() {
    let original = fully_populated();

    let encoded = serde_yaml::to_string(&original).unwrap();
    let decoded: Terraform = serde_yaml::from_str(&encoded).unwrap();

    assert_eq!(decoded.spec, original.spec);
    assert_eq!(decoded.status, original.status);
    assert!(encoded.contains("isDestroyApplied: true"));
}
