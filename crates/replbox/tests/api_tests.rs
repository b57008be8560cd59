//! HTTP API tests.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use replbox::{AppState, create_router};
use replbox_protocol::ClientMessage;
use replbox_storage::{MemoryStore, StorageMirror};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn post_project(body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/project")
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

#[tokio::test]
async fn test_health() {
    let temp = test_tree();
    let app = create_router(AppState::new(test_config(temp.path()), None));

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["terminals"], 0);
}

#[tokio::test]
async fn test_project_from_template() {
    let temp = test_tree();
    let app = create_router(AppState::new(test_config(temp.path()), None));

    let response = app
        .oneshot(post_project(json!({"replId": "proj2", "language": "node"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["source"], "template");
    assert_eq!(body["files"], 2);

    let workspace = temp.path().join("workspaces/proj2");
    assert_eq!(
        std::fs::read_to_string(workspace.join("index.js")).unwrap(),
        "console.log('hi')"
    );
    assert!(workspace.join("src/util.js").is_file());
}

#[tokio::test]
async fn test_project_rejects_bad_input() {
    let temp = test_tree();
    let state = AppState::new(test_config(temp.path()), None);

    for body in [
        json!({"language": "node"}),
        json!({"replId": "", "language": "node"}),
        json!({"replId": "../escape", "language": "node"}),
        json!({"replId": "proj3", "language": "cobol"}),
        json!({"replId": "proj3", "language": "../workspaces"}),
    ] {
        let response = create_router(state.clone())
            .oneshot(post_project(body.clone()))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{body}");
        let error = body_json(response).await;
        assert_eq!(error["code"], "BAD_REQUEST");
    }
    assert!(!temp.path().join("workspaces/proj3").exists());
}

#[tokio::test]
async fn test_project_from_storage() {
    let temp = test_tree();
    let store = Arc::new(MemoryStore::with_page_size(2));
    store.insert("base/node/index.js", "hello").await;
    store.insert("base/node/package.json", "{}").await;
    store.insert("base/node/src/app.js", "world").await;
    store.insert("base/python/main.py", "print()").await;

    let mut config = test_config(temp.path());
    config.storage = Some(storage_config());
    let app = create_router(AppState::new(
        config,
        Some(StorageMirror::new(store.clone())),
    ));

    let response = app
        .oneshot(post_project(json!({"replId": "proj9", "language": "node"})))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body = body_json(response).await;
    assert_eq!(body["source"], "storage");
    assert_eq!(body["copy"]["outcome"], "completed");
    assert_eq!(body["copy"]["pages"], 2);
    assert_eq!(body["fetch"]["outcome"], "completed");

    assert_eq!(store.keys_with_prefix("code/proj9/").await.len(), 3);
    let workspace = temp.path().join("workspaces/proj9");
    assert_eq!(
        std::fs::read_to_string(workspace.join("src/app.js")).unwrap(),
        "world"
    );
    assert!(!workspace.join("main.py").exists());
}

#[tokio::test]
async fn test_project_from_storage_with_unknown_language() {
    let temp = test_tree();
    let store = Arc::new(MemoryStore::new());
    let mut config = test_config(temp.path());
    config.storage = Some(storage_config());
    let app = create_router(AppState::new(config, Some(StorageMirror::new(store))));

    let response = app
        .oneshot(post_project(json!({"replId": "proj9", "language": "rust"})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_content_updates_are_mirrored_to_storage() {
    let store = Arc::new(MemoryStore::new());
    let server = TestServer::start_with_store(store.clone()).await;
    let (mut client, _) = server.open("proj1").await;

    send(
        &mut client,
        &ClientMessage::UpdateContent {
            id: Some("1".into()),
            path: "/src/app.js".into(),
            content: "mirrored".into(),
        },
    )
    .await;
    next_matching(&mut client, |m| {
        matches!(m, replbox_protocol::ServerMessage::Ack { .. })
    })
    .await;

    let deadline = tokio::time::Instant::now() + TIMEOUT;
    loop {
        if let Some(body) = store.object("code/proj1/src/app.js").await {
            assert_eq!(body.as_ref(), b"mirrored");
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "object never mirrored");
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
