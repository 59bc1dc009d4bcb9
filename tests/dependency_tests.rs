//! `dependsOn` readiness checks and dependency-first requeue ordering
//!
//! Run with: `cargo test --test dependency_tests`

mod common;

use common::{key, terraform, FakeStore, NAMESPACE, SOURCE_NAME};
use std::sync::Arc;
use tf_controller::controller::reconciler::dependency::{
    blocking_dependants, check_dependencies, dependants_of_source, requests_for_revision_change,
    sort_by_dependencies, DependencyError,
};
use tf_controller::controller::reconciler::{Artifact, SourceObject};
use tf_controller::crd::{
    DependencyReference, ObjectKey, SourceKind, Terraform, WriteOutputsToSecretSpec,
    REASON_APPLY_SUCCEEDED,
};

const REVISION: &str = "main/6f2d4c0e1a9b8f7e3c21";

fn source(revision: &str) -> SourceObject {
    SourceObject {
        kind: SourceKind::GitRepository,
        key: ObjectKey::new(NAMESPACE, SOURCE_NAME),
        artifact: Some(Artifact {
            url: "http://source-controller/podinfo.tar.gz".to_string(),
            revision: revision.to_string(),
            checksum: String::new(),
        }),
    }
}

fn depends_on(mut tf: Terraform, names: &[&str]) -> Terraform {
    tf.spec.depends_on = names
        .iter()
        .map(|name| DependencyReference {
            name: (*name).to_string(),
            namespace: None,
        })
        .collect();
    tf
}

/// Applied at `revision` with the observed generation caught up
fn applied(tf: Terraform, revision: &str) -> Terraform {
    let mut tf = tf
        .applied(revision, "Applied successfully", false, Vec::new())
        .ready(revision, REASON_APPLY_SUCCEEDED, "Applied successfully");
    let status = tf.status_mut();
    status.last_planned_revision = revision.to_string();
    tf
}

fn names(keys: &[ObjectKey]) -> Vec<&str> {
    keys.iter().map(|k| k.name.as_str()).collect()
}

#[tokio::test]
async fn test_missing_dependency() {
    let store = FakeStore::default();
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    let err = check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap_err();

    assert!(matches!(err, DependencyError::NotFound { .. }));
    assert_eq!(
        err.to_string(),
        "unable to get 'flux-system/vpc' dependency: not found"
    );
}

#[tokio::test]
async fn test_ready_dependency_passes_and_gets_back_reference() {
    let store = FakeStore::default();
    store.insert_terraform(applied(terraform("vpc", "auto"), REVISION));
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap();

    let vpc = store.terraform("vpc").unwrap();
    assert_eq!(blocking_dependants(&vpc), vec!["app"]);
}

#[tokio::test]
async fn test_stale_generation_is_not_ready() {
    let store = FakeStore::default();
    let mut vpc = applied(terraform("vpc", "auto"), REVISION);
    vpc.metadata.generation = Some(2);
    store.insert_terraform(vpc);
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    let err = check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap_err();

    assert!(matches!(err, DependencyError::NotReady { .. }));
}

#[tokio::test]
async fn test_same_source_dependency_must_catch_up() {
    let store = FakeStore::default();
    store.insert_terraform(applied(terraform("vpc", "auto"), "main/0000000000"));
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    let err = check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap_err();

    assert!(matches!(err, DependencyError::NotUpdated { .. }));
    assert_eq!(err.to_string(), "dependency 'flux-system/vpc' is not updated yet");
}

#[tokio::test]
async fn test_other_source_dependency_is_not_compared() {
    let store = FakeStore::default();
    let mut vpc = terraform("vpc", "auto");
    vpc.spec.source_ref.name = "infra".to_string();
    store.insert_terraform(applied(vpc, "main/0000000000"));
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_output_secret_must_exist() {
    let store = FakeStore::default();
    let mut vpc = terraform("vpc", "auto");
    vpc.spec.write_outputs_to_secret = Some(WriteOutputsToSecretSpec {
        name: "vpc-outputs".to_string(),
        outputs: Vec::new(),
    });
    store.insert_terraform(applied(vpc, REVISION));
    let app = depends_on(terraform("app", "auto"), &["vpc"]);

    let err = check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_string(),
        "dependency output secret: 'vpc-outputs' of 'flux-system/vpc' is not ready yet"
    );

    store.insert_secret("vpc-outputs");
    check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_first_failing_dependency_is_reported() {
    let store = FakeStore::default();
    store.insert_terraform(applied(terraform("vpc", "auto"), REVISION));
    store.insert_terraform(terraform("dns", "auto"));
    let app = depends_on(terraform("app", "auto"), &["vpc", "dns", "db"]);

    let err = check_dependencies(&store, &source(REVISION), &app)
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "dependency 'flux-system/dns' is not ready");
}

#[test]
fn test_sort_puts_dependencies_first() {
    let objects: Vec<Arc<Terraform>> = vec![
        Arc::new(depends_on(terraform("app", "auto"), &["db", "vpc"])),
        Arc::new(depends_on(terraform("db", "auto"), &["vpc"])),
        Arc::new(terraform("vpc", "auto")),
        Arc::new(terraform("docs", "auto")),
    ];

    let sorted = sort_by_dependencies(&objects).unwrap();
    let keys: Vec<ObjectKey> = sorted.iter().map(|t| t.key()).collect();

    assert_eq!(names(&keys), vec!["vpc", "db", "app", "docs"]);
}

#[test]
fn test_sort_detects_cycles() {
    let objects: Vec<Arc<Terraform>> = vec![
        Arc::new(depends_on(terraform("a", "auto"), &["b"])),
        Arc::new(depends_on(terraform("b", "auto"), &["c"])),
        Arc::new(depends_on(terraform("c", "auto"), &["a"])),
    ];

    let err = sort_by_dependencies(&objects).unwrap_err();

    assert_eq!(err.0, key("a"));
}

#[test]
fn test_revision_change_skips_attempted_and_orders() {
    let mut done = terraform("done", "auto");
    done.status_mut().last_attempted_revision = REVISION.to_string();
    let all: Vec<Arc<Terraform>> = vec![
        Arc::new(depends_on(terraform("app", "auto"), &["vpc"])),
        Arc::new(terraform("vpc", "auto")),
        Arc::new(done),
    ];

    let requests = requests_for_revision_change(&source(REVISION), &all);

    assert_eq!(names(&requests), vec!["vpc", "app"]);
}

#[test]
fn test_revision_change_with_cycle_requests_nothing() {
    let all: Vec<Arc<Terraform>> = vec![
        Arc::new(depends_on(terraform("a", "auto"), &["b"])),
        Arc::new(depends_on(terraform("b", "auto"), &["a"])),
    ];

    assert!(requests_for_revision_change(&source(REVISION), &all).is_empty());
}

#[test]
fn test_dependants_of_source_match_kind_and_key() {
    let mut bucket = terraform("from-bucket", "auto");
    bucket.spec.source_ref.kind = "Bucket".to_string();
    let mut other = terraform("other", "auto");
    other.spec.source_ref.name = "infra".to_string();
    let all: Vec<Arc<Terraform>> = vec![
        Arc::new(terraform("app", "auto")),
        Arc::new(bucket),
        Arc::new(other),
    ];

    let dependants = dependants_of_source(&source(REVISION), &all);
    let keys: Vec<ObjectKey> = dependants.iter().map(|t| t.key()).collect();

    assert_eq!(names(&keys), vec!["app"]);
}
