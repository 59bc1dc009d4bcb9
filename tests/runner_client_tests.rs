//! Runner wire protocol against a mock runner
//!
//! Run with: `cargo test --test runner_client_tests`

use serde_json::json;
use tf_controller::runner::{
    ApplyRequest, HttpRunnerClient, PlanRequest, RunnerError, SetupRequest, TerraformRunner,
};
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer) -> HttpRunnerClient {
    HttpRunnerClient::with_client(reqwest::Client::new(), server.uri())
}

#[tokio::test]
async fn test_setup_sends_artifact_as_base64() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/setup"))
        .and(body_partial_json(json!({
            "name": "app",
            "namespace": "flux-system",
            "workspace": "default",
            "artifact": "dGFyYmFsbA==",
            "vars": {"region": "eu-west-1"}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"instanceId": "ws-1"})))
        .expect(1)
        .mount(&server)
        .await;

    let mut vars = serde_json::Map::new();
    vars.insert("region".to_string(), json!("eu-west-1"));
    let instance_id = client(&server)
        .setup(SetupRequest {
            name: "app".to_string(),
            namespace: "flux-system".to_string(),
            revision: "main/6f2d4c0e".to_string(),
            path: "./terraform".to_string(),
            workspace: "default".to_string(),
            artifact: b"tarball".to_vec(),
            vars,
            backend_config: None,
        })
        .await
        .unwrap();

    assert_eq!(instance_id, "ws-1");
}

#[tokio::test]
async fn test_plan_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/plan"))
        .and(body_partial_json(json!({"instanceId": "ws-1", "destroy": true})))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({"hasChanges": true, "message": "3 to destroy"})),
        )
        .mount(&server)
        .await;

    let reply = client(&server)
        .plan(PlanRequest {
            instance_id: "ws-1".to_string(),
            destroy: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(reply.has_changes);
    assert_eq!(reply.message, "3 to destroy");
}

#[tokio::test]
async fn test_conflict_is_state_locked() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/plan"))
        .respond_with(ResponseTemplate::new(409).set_body_json(json!({
            "lockId": "f2ab685b-f84d-ac0b-a125-378a22877e8d"
        })))
        .mount(&server)
        .await;

    let err = client(&server)
        .plan(PlanRequest {
            instance_id: "ws-1".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();

    match err {
        RunnerError::StateLocked { lock_id, message } => {
            assert_eq!(lock_id, "f2ab685b-f84d-ac0b-a125-378a22877e8d");
            assert_eq!(message, "state is locked by f2ab685b-f84d-ac0b-a125-378a22877e8d");
        }
        other => panic!("expected a state lock, got {other:?}"),
    }
}

#[tokio::test]
async fn test_server_error_is_command_failure() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/apply"))
        .respond_with(ResponseTemplate::new(500).set_body_string("Error: Invalid provider configuration"))
        .mount(&server)
        .await;

    let err = client(&server)
        .apply(ApplyRequest {
            instance_id: "ws-1".to_string(),
            enable_inventory: false,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RunnerError::Command(_)));
    assert!(err.to_string().contains("Invalid provider configuration"));
}

#[tokio::test]
async fn test_outputs_and_force_unlock() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/outputs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "outputs": {
                "endpoint": {"value": "db.internal"},
                "password": {"value": "hunter2", "sensitive": true}
            }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/force-unlock"))
        .and(body_partial_json(json!({"instanceId": "ws-1", "lockId": "lock-1"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .expect(1)
        .mount(&server)
        .await;

    let runner = client(&server);
    let outputs = runner.outputs("ws-1").await.unwrap();
    assert_eq!(outputs["endpoint"].value, json!("db.internal"));
    assert!(!outputs["endpoint"].sensitive);
    assert!(outputs["password"].sensitive);

    runner.force_unlock("ws-1", "lock-1").await.unwrap();
}

#[tokio::test]
async fn test_unreachable_runner_is_transport_error() {
    let runner = HttpRunnerClient::with_client(reqwest::Client::new(), "http://127.0.0.1:1");

    let err = runner.cleanup("ws-1").await.unwrap_err();

    assert!(matches!(err, RunnerError::Transport(_)));
}
