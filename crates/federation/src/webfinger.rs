//! WebFinger actor discovery.

use quill_common::ids::parse_acct_uri;
use quill_common::{AppError, AppResult};
use serde_json::{json, Value};
use tracing::{debug, info};

use crate::context::Context;

/// Resolves a `resource=acct:{name}@{domain}` query into a JRD document.
pub async fn webfinger_view(ctx: &Context, resource: &str) -> AppResult<Value> {
    info!(resource = %resource, "WebFinger lookup");
    let (username, domain) = parse_acct_uri(resource)?;
    if domain != ctx.domain() {
        return Err(AppError::NotFound(format!("unexpected domain: {domain}")));
    }

    debug!(username = %username, "looking up user");
    let user = ctx.require_user(&username).await?;

    Ok(json!({
        "subject": format!("{username}@{domain}"),
        "links": [
            {
                "rel": "self",
                "type": "application/activity+json",
                "href": user.id(),
            },
        ],
    }))
}
