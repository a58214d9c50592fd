//! Axum handlers mapping the HTTP surface onto the pipeline units and read
//! views.

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use quill_common::{AppError, AppResult};
use serde::Deserialize;
use serde_json::Value;
use tracing::{error, info};

use crate::context::Context;
use crate::inbound::{dispatch_inbound_activity, receive_inbound_activity, InboxRequest};
use crate::outbound::{run_outbound_pipeline, stage_outbound_object};
use crate::views;
use crate::webfinger::webfinger_view;

/// Shared handler state.
pub type SharedContext = Arc<Context>;

/// Header carrying the authenticated principal, set by the fronting
/// gateway after it validates the caller's credentials.
pub const BEARER_USERNAME_HEADER: &str = "x-quill-user";

const ACTIVITY_JSON: &str = "application/activity+json; charset=utf-8";
const WEBFINGER_JSON: &str = "application/json";

/// Query parameters of the paginated collection endpoints.
#[derive(Debug, Deserialize)]
pub struct CollectionQuery {
    pub page: Option<bool>,
    pub before: Option<String>,
    pub after: Option<String>,
}

/// WebFinger query parameters.
#[derive(Debug, Deserialize)]
pub struct WebfingerQuery {
    pub resource: String,
}

fn activity_json(document: Value) -> Response {
    (
        StatusCode::OK,
        [("Content-Type", ACTIVITY_JSON)],
        Json(document),
    )
        .into_response()
}

fn header(headers: &HeaderMap, name: &str) -> String {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// GET `/.well-known/webfinger`
pub async fn webfinger_handler(
    State(ctx): State<SharedContext>,
    Query(query): Query<WebfingerQuery>,
) -> AppResult<Response> {
    let document = webfinger_view(&ctx, &query.resource).await?;
    Ok((
        StatusCode::OK,
        [("Content-Type", WEBFINGER_JSON)],
        Json(document),
    )
        .into_response())
}

/// GET `/users/{username}`
pub async fn user_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
) -> AppResult<Response> {
    Ok(activity_json(views::describe_user(&ctx, &username).await?))
}

/// POST `/users/{username}/inbox`
///
/// Verification and persistence run in-request; dispatch and any response
/// delivery continue in the background once the payload is durable.
pub async fn inbox_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
    headers: HeaderMap,
    body: String,
) -> AppResult<StatusCode> {
    let request = InboxRequest {
        username,
        signature: header(&headers, "signature"),
        date: header(&headers, "date"),
        digest: header(&headers, "digest"),
        content_type: header(&headers, "content-type"),
        body,
    };
    let Some(inbox_key) = receive_inbound_activity(&ctx, &request).await? else {
        return Ok(StatusCode::ACCEPTED);
    };

    tokio::spawn(async move {
        match dispatch_inbound_activity(&ctx, &inbox_key).await {
            Ok(Some(staged)) => {
                info!(key = %staged.key, "delivering staged response");
                if let Err(err) = run_outbound_pipeline(&ctx, &staged).await {
                    error!(error = %err, "failed to deliver staged response");
                }
            }
            Ok(None) => {}
            Err(err) => error!(error = %err, key = %inbox_key.key, "dispatch failed"),
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// POST `/users/{username}/outbox`
pub async fn outbox_post_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> AppResult<StatusCode> {
    let bearer = header(&headers, BEARER_USERNAME_HEADER);
    if bearer.is_empty() {
        return Err(AppError::Unauthorized);
    }
    let staged = stage_outbound_object(&ctx, &username, &bearer, body).await?;

    tokio::spawn(async move {
        if let Err(err) = run_outbound_pipeline(&ctx, &staged).await {
            error!(error = %err, key = %staged.key, "outbound pipeline failed");
        }
    });

    Ok(StatusCode::ACCEPTED)
}

/// GET `/users/{username}/outbox`
pub async fn outbox_get_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> AppResult<Response> {
    let document = views::outbox_view(
        &ctx,
        &username,
        query.page.unwrap_or(false),
        query.before,
        query.after,
    )
    .await?;
    Ok(activity_json(document))
}

/// GET `/users/{username}/followers`
pub async fn followers_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> AppResult<Response> {
    let document = views::followers_view(
        &ctx,
        &username,
        query.page.unwrap_or(false),
        query.before,
        query.after,
    )
    .await?;
    Ok(activity_json(document))
}

/// GET `/users/{username}/following`
pub async fn following_handler(
    State(ctx): State<SharedContext>,
    Path(username): Path<String>,
    Query(query): Query<CollectionQuery>,
) -> AppResult<Response> {
    let document = views::following_view(
        &ctx,
        &username,
        query.page.unwrap_or(false),
        query.before,
        query.after,
    )
    .await?;
    Ok(activity_json(document))
}

/// GET `/users/{username}/posts/{unique_part}`
pub async fn post_handler(
    State(ctx): State<SharedContext>,
    Path((username, unique_part)): Path<(String, String)>,
) -> AppResult<Response> {
    Ok(activity_json(
        views::post_view(&ctx, &username, &unique_part).await?,
    ))
}

/// GET `/users/{username}/posts/{unique_part}/replies`
pub async fn replies_handler(
    State(ctx): State<SharedContext>,
    Path((username, unique_part)): Path<(String, String)>,
    Query(query): Query<CollectionQuery>,
) -> AppResult<Response> {
    let document = views::replies_view(
        &ctx,
        &username,
        &unique_part,
        query.page.unwrap_or(false),
        query.before,
        query.after,
    )
    .await?;
    Ok(activity_json(document))
}

/// Assembles the federation routes.
pub fn router(ctx: SharedContext) -> Router {
    Router::new()
        .route("/.well-known/webfinger", get(webfinger_handler))
        .route("/users/:username", get(user_handler))
        .route("/users/:username/inbox", post(inbox_handler))
        .route(
            "/users/:username/outbox",
            get(outbox_get_handler).post(outbox_post_handler),
        )
        .route("/users/:username/followers", get(followers_handler))
        .route("/users/:username/following", get(following_handler))
        .route("/users/:username/posts/:unique_part", get(post_handler))
        .route(
            "/users/:username/posts/:unique_part/replies",
            get(replies_handler),
        )
        .with_state(ctx)
}
