//! Quill server entry point.
//!
//! Builds the application context over the in-memory store backends, seeds
//! the configured user, and serves the federation routes. Deployments with
//! managed table/blob/parameter services plug their own implementations of
//! the store contracts in here.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use chrono::Utc;
use quill_common::crypto::generate_rsa_keypair;
use quill_common::Config;
use quill_federation::{ApClient, Context};
use quill_index::{StatisticsMaintainer, User};
use quill_store::{MemoryBlobStore, MemoryKeyValueStore, MemoryParameterStore};
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// How often the statistics maintainer drains the change streams.
const STATISTICS_DRAIN_INTERVAL: Duration = Duration::from_secs(5);

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "failed to install Ctrl+C handler");
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => error!(error = %err, "failed to install SIGTERM handler"),
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
}

/// Seeds the configured user unless it already exists.
///
/// A fresh key pair is generated on first start; the private half goes into
/// the parameter store under the path the user record references.
async fn seed_user(ctx: &Context, params: &MemoryParameterStore) -> anyhow::Result<()> {
    let Some(seed) = ctx.config.seed_user.clone() else {
        return Ok(());
    };
    if ctx
        .users
        .find_user_by_username(&seed.username, ctx.domain())
        .await?
        .is_some()
    {
        return Ok(());
    }

    info!(username = %seed.username, "seeding user");
    let keypair = generate_rsa_keypair()?;
    let private_key_path = format!("/quill/users/{}/private-key", seed.username);
    params.put_parameter(&private_key_path, &keypair.private_key_pem);

    let now = Utc::now();
    let user = User {
        domain: ctx.domain().to_string(),
        username: seed.username.clone(),
        name: seed.name,
        preferred_username: seed.username,
        summary: seed.summary,
        url: seed.url,
        public_key_pem: keypair.public_key_pem,
        private_key_path,
        follower_count: 0,
        following_count: 0,
        created_at: now,
        updated_at: now,
        last_activity_at: now,
    };
    ctx.users.put_user(&user).await?;
    Ok(())
}

/// Periodically drains the table change streams into the derived counters.
async fn statistics_loop(
    kv: Arc<MemoryKeyValueStore>,
    maintainer: StatisticsMaintainer,
    user_table: String,
    object_table: String,
) {
    let mut interval = tokio::time::interval(STATISTICS_DRAIN_INTERVAL);
    loop {
        interval.tick().await;
        let user_events = kv.drain_events(&user_table);
        if !user_events.is_empty() {
            if let Err(err) = maintainer.apply_user_events(&user_events).await {
                error!(error = %err, "user statistics drain failed");
            }
        }
        let object_events = kv.drain_events(&object_table);
        if !object_events.is_empty() {
            if let Err(err) = maintainer.apply_object_events(&object_events).await {
                error!(error = %err, "object statistics drain failed");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "quill_server=info,quill_federation=info,quill_index=info,tower_http=info".into()
        }))
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    let config = Config::load().context("failed to load configuration")?;
    info!(domain = %config.federation.domain, "starting quill");

    let kv = Arc::new(MemoryKeyValueStore::new());
    let blobs = Arc::new(MemoryBlobStore::new());
    let params = Arc::new(MemoryParameterStore::new());
    let client = Arc::new(ApClient::new(&config.federation.domain)?);

    let maintainer = StatisticsMaintainer::new(
        kv.clone(),
        config.tables.user_table.clone(),
        config.tables.object_table.clone(),
    );
    let user_table = config.tables.user_table.clone();
    let object_table = config.tables.object_table.clone();

    let ctx = Arc::new(Context::new(
        config.clone(),
        kv.clone(),
        blobs,
        params.clone(),
        client.clone(),
        client,
    ));

    seed_user(&ctx, &params).await?;

    tokio::spawn(statistics_loop(kv, maintainer, user_table, object_table));

    let app = quill_federation::router(ctx).layer(TraceLayer::new_for_http());
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid bind address")?;
    info!(address = %addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind")?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    Ok(())
}
