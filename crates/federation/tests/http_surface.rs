//! Routing tests over the assembled axum surface.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use chrono::Utc;
use quill_common::config::{
    BucketConfig, Config, FederationConfig, PageConfig, SeedUserConfig, ServerConfig, TableConfig,
};
use quill_federation::{router, ApClient, Context};
use quill_index::User;
use quill_store::{MemoryBlobStore, MemoryKeyValueStore, MemoryParameterStore};
use serde_json::Value;
use tower::ServiceExt;

const DOMAIN: &str = "example.social";

async fn app() -> axum::Router {
    let config = Config {
        server: ServerConfig::default(),
        federation: FederationConfig {
            domain: DOMAIN.to_string(),
        },
        tables: TableConfig::default(),
        buckets: BucketConfig::default(),
        pages: PageConfig::default(),
        seed_user: Some(SeedUserConfig {
            username: "alice".to_string(),
            name: "Alice".to_string(),
            summary: String::new(),
            url: String::new(),
        }),
    };
    let kv = Arc::new(MemoryKeyValueStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let params = Arc::new(MemoryParameterStore::new());
    let client = Arc::new(ApClient::new(DOMAIN).unwrap());
    let ctx = Arc::new(Context::new(
        config,
        kv,
        blobs,
        params,
        client.clone(),
        client,
    ));

    let now = Utc::now();
    ctx.users
        .put_user(&User {
            domain: DOMAIN.to_string(),
            username: "alice".to_string(),
            name: "Alice".to_string(),
            preferred_username: "alice".to_string(),
            summary: "a resident".to_string(),
            url: format!("https://{DOMAIN}/@alice"),
            public_key_pem: "-----BEGIN PUBLIC KEY-----\n".to_string(),
            private_key_path: "/quill/users/alice/private-key".to_string(),
            follower_count: 0,
            following_count: 0,
            created_at: now,
            updated_at: now,
            last_activity_at: now,
        })
        .await
        .unwrap();

    router(ctx)
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn test_webfinger_route() {
    let app = app().await;
    let (status, body) = get_json(
        &app,
        "/.well-known/webfinger?resource=acct%3Aalice%40example.social",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["subject"], "alice@example.social");

    let (status, _) = get_json(
        &app,
        "/.well-known/webfinger?resource=acct%3Anobody%40example.social",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = get_json(&app, "/.well-known/webfinger?resource=bogus").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_actor_route() {
    let app = app().await;
    let (status, body) = get_json(&app, "/users/alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "Person");
    assert_eq!(body["id"], format!("https://{DOMAIN}/users/alice"));
    assert_eq!(body["inbox"], format!("https://{DOMAIN}/users/alice/inbox"));
    assert_eq!(
        body["publicKey"]["id"],
        format!("https://{DOMAIN}/users/alice#main-key")
    );

    let (status, _) = get_json(&app, "/users/nobody").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_collection_routes() {
    let app = app().await;
    for uri in [
        "/users/alice/outbox",
        "/users/alice/followers",
        "/users/alice/following",
    ] {
        let (status, body) = get_json(&app, uri).await;
        assert_eq!(status, StatusCode::OK, "{uri}");
        assert_eq!(body["type"], "OrderedCollection", "{uri}");
        assert_eq!(body["first"], format!("https://{DOMAIN}{uri}?page=true"));
    }

    let (status, body) = get_json(&app, "/users/alice/followers?page=true").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["type"], "OrderedCollectionPage");
    assert!(body["orderedItems"].as_array().unwrap().is_empty());

    // Mutually exclusive cursors are a client error.
    let (status, _) = get_json(&app, "/users/alice/followers?page=true&before=a&after=b").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unsigned_inbox_post_is_unauthorized() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users/alice/inbox")
                .header("content-type", "application/activity+json")
                .body(Body::from(
                    r#"{"type":"Follow","actor":"https://r.example/users/bob","object":"https://example.social/users/alice"}"#,
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_outbox_post_requires_principal() {
    let app = app().await;
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users/alice/outbox")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"type":"Note","content":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A mismatched principal is forbidden.
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/users/alice/outbox")
                .header("content-type", "application/json")
                .header(quill_federation::BEARER_USERNAME_HEADER, "mallory")
                .body(Body::from(r#"{"type":"Note","content":"hi"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_missing_post_is_not_found() {
    let app = app().await;
    let (status, _) = get_json(&app, "/users/alice/posts/unknown").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = get_json(&app, "/users/alice/posts/unknown/replies").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
