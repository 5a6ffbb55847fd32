mod config;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::{Router, extract::ws::close_code, routing::get};
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use parley_api::{AppState, AppStateInner, FcmGateway, MessagePipeline, NoopGateway, PushGateway};
use parley_bus::Broker;
use parley_db::Database;
use parley_gateway::fanout::start_fanout;
use parley_gateway::{ConnectionRegistry, Gateway, Identity, ws_upgrade};

use crate::config::Config;

const SOCKET_CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    // Bus and gateway
    let broker = Broker::open(config.broker.clone())?;
    broker
        .ping()
        .await
        .with_context(|| format!("event bus unreachable at {}", config.broker.url))?;
    info!(namespace = %config.broker.namespace, "Connected to event bus");
    let bus = broker.client(config.node_id.as_str());
    let registry = ConnectionRegistry::new();
    let identity = Identity::new(&config.jwt_secret);

    let gateway = Gateway {
        registry: registry.clone(),
        db: db.clone(),
        identity: identity.clone(),
        config: config.gateway.clone(),
    };

    let push: Arc<dyn PushGateway> = match &config.fcm {
        Some(fcm) => {
            info!(project_id = %fcm.project_id, "FCM push enabled");
            Arc::new(FcmGateway::new(fcm.project_id.clone(), fcm.access_token.clone()))
        }
        None => {
            warn!("PARLEY_FCM_* not set, push notifications disabled");
            Arc::new(NoopGateway)
        }
    };

    let fanout = start_fanout(&bus, db.clone(), registry.clone()).await?;
    let consumers = parley_api::start_consumers(&bus, db.clone(), push).await?;

    let app_state: AppState = Arc::new(AppStateInner {
        db: db.clone(),
        identity,
        pipeline: MessagePipeline::new(db.clone(), bus),
    });

    // Routes
    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(gateway);

    let app = Router::new()
        .merge(parley_api::router(app_state))
        .merge(ws_route)
        .route("/health", get(|| async { "ok" }))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    info!(node_id = %config.node_id, "Parley server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;

    // Upgraded sockets outlive the HTTP server. Close them while the store
    // is still open so their presence rows go with them.
    for handle in registry.list().await {
        handle.close(close_code::AWAY, "server shutting down");
    }
    let deadline = tokio::time::Instant::now() + SOCKET_CLOSE_TIMEOUT;
    while !registry.is_empty().await && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    fanout.unsubscribe().await;
    consumers.unsubscribe_all().await;
    broker.drain().await;
    db.close()?;

    info!("Parley server stopped");
    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    token.cancel();
}
