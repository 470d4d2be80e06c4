use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use etcdform_common::{Error, KeyPath};
use etcdform_provider::{Provider, ResourceDecl};
use etcdform_reconcile::{Action, StateStore, TrackedResource};

fn existing_color() -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "action": "get",
        "node": {"key": "/app/color", "value": "blue", "modifiedIndex": 11, "createdIndex": 11}
    }))
}

/// State in which `/app/color` was created by an earlier apply.
fn tracked_color() -> StateStore {
    let mut tracked = TrackedResource::new("etcd_keys", KeyPath::parse("/app/color").unwrap());
    tracked.mark_read(Some(json!({"path": "/app/color", "value": "blue", "version": 11})));
    let mut state = StateStore::new();
    state.insert(tracked);
    state
}

fn not_found(key: &str) -> ResponseTemplate {
    ResponseTemplate::new(404).set_body_json(json!({
        "errorCode": 100,
        "message": "Key not found",
        "cause": key,
        "index": 10
    }))
}

#[tokio::test]
async fn test_apply_key_against_etcd() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/keys/app/color"))
        .respond_with(not_found("/app/color"))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/app/color"))
        .and(query_param("prevExist", "false"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "action": "create",
            "node": {"key": "/app/color", "value": "blue", "modifiedIndex": 11, "createdIndex": 11}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Provider::configure(json!({
        "endpoints": server.address().to_string(),
    }))
    .unwrap();

    let mut state = StateStore::new();
    let decls = vec![ResourceDecl::new(
        "etcd_keys",
        json!({"path": "/app/color", "value": "blue"}),
    )];
    let results = provider.apply(&mut state, &decls).await.unwrap();

    assert_eq!(*results[0].result.as_ref().unwrap(), Action::Created);
    let tracked = state
        .get("etcd_keys", &results[0].path)
        .unwrap()
        .clone();
    assert_eq!(tracked.failure_count, 0);
}

#[tokio::test]
async fn test_stale_update_against_etcd_is_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/keys/app/color"))
        .respond_with(existing_color())
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v2/keys/app/color"))
        .and(query_param("prevIndex", "11"))
        .respond_with(ResponseTemplate::new(412).set_body_json(json!({
            "errorCode": 101,
            "message": "Compare failed",
            "cause": "[11 != 12]",
            "index": 12
        })))
        .expect(1)
        .mount(&server)
        .await;

    let provider = Provider::configure(json!({
        "endpoints": server.address().to_string(),
    }))
    .unwrap();

    let mut state = tracked_color();
    let decls = vec![ResourceDecl::new(
        "etcd_keys",
        json!({"path": "/app/color", "value": "green"}),
    )];
    let results = provider.apply(&mut state, &decls).await.unwrap();

    let err = results[0].result.as_ref().unwrap_err();
    assert!(err.is_conflict());
    assert!(err.to_string().contains("/app/color"));
    assert_eq!(state.failed().len(), 1);
}

#[tokio::test]
async fn test_untracked_existing_key_is_left_alone() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v2/keys/app/color"))
        .respond_with(existing_color())
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let provider = Provider::configure(json!({
        "endpoints": server.address().to_string(),
    }))
    .unwrap();

    let mut state = StateStore::new();
    let decls = vec![ResourceDecl::new(
        "etcd_keys",
        json!({"path": "/app/color", "value": "green"}),
    )];
    let results = provider.apply(&mut state, &decls).await.unwrap();

    let err = results[0].result.as_ref().unwrap_err();
    assert!(matches!(err, Error::AlreadyExists(_)));
    assert!(err.to_string().contains("/app/color"));
}
