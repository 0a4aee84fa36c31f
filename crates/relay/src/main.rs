use std::sync::Arc;

use anyhow::Context;
use tandem_relay::{
    auth::{
        join_token::JoinTokenAuthority, jwt::AccessTokenService,
        primary::PrimaryCredentialVerifier,
    },
    config::RelayConfig,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    feed::{ChangeFeed, DEFAULT_FEED_CAPACITY},
    hub::Hub,
    metrics::{set_global_metrics, RelayMetrics},
    server::{build_router, shutdown_signal, RouterOptions},
    store::SessionStore,
};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config);

    if config.uses_dev_secrets() {
        warn!("using development token secrets; set TANDEM_RELAY_*_TOKEN_SECRET in production");
    }

    let access_tokens = Arc::new(
        AccessTokenService::new(&config.access_token_secret)
            .context("invalid relay access token secret")?,
    );
    let join_tokens = Arc::new(
        JoinTokenAuthority::new(&config.join_token_secret)
            .context("invalid relay join token secret")?,
    );
    let metrics = Arc::new(RelayMetrics::default());
    set_global_metrics(metrics.clone());

    let feed_shutdown = CancellationToken::new();
    let (store, feed, feed_pump) = build_backends(&config, feed_shutdown.clone()).await?;
    info!(store = store.backend_name(), "session store ready");

    let hub = Hub::new(
        config.hub_config(),
        join_tokens,
        PrimaryCredentialVerifier::new(access_tokens.clone()),
        store,
        feed,
    );
    let app = build_router(
        hub.clone(),
        RouterOptions {
            access_tokens,
            metrics,
            max_frame_bytes: config.max_frame_bytes,
            cors_origins: config.cors_origins.clone(),
        },
    );

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, ws_base_url = %config.ws_base_url, "starting relay server");

    // Upgraded sockets keep `serve` alive until the hub closes them.
    let shutdown_hub = hub.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_hub.shutdown().await;
        })
        .await
        .context("relay server exited unexpectedly");

    feed_shutdown.cancel();
    if let Some(pump) = feed_pump {
        let _ = pump.await;
    }
    info!("relay server stopped");

    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

/// Postgres store and `LISTEN` feed when a database is configured,
/// in-memory otherwise.
async fn build_backends(
    config: &RelayConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<(SessionStore, ChangeFeed, Option<JoinHandle<()>>)> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("TANDEM_RELAY_DATABASE_URL unset; using the in-memory session store and change feed");
        return Ok((SessionStore::in_memory(), ChangeFeed::in_memory(DEFAULT_FEED_CAPACITY), None));
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize relay PostgreSQL pool")?;
    check_pool_health(&pool).await.context("relay PostgreSQL health check failed")?;
    run_migrations(&pool).await.context("failed to apply relay migrations")?;

    let (feed, pump) = ChangeFeed::listen_postgres(
        pool.clone(),
        config.change_channel.clone(),
        DEFAULT_FEED_CAPACITY,
        shutdown,
    );
    Ok((SessionStore::Postgres(pool), feed, Some(pump)))
}
