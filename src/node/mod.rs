pub mod consumer;
pub mod heartbeat;
pub mod state;
pub mod ws;

use std::future::IntoFuture;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::bus::{KafkaEventStream, KafkaPublisher};
use crate::config::NodeConfig;
use crate::directory::RedisDirectory;
use crate::events::{CLOSE_GOING_AWAY, REASON_SHUTDOWN};
use self::state::NodeState;

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(5);

pub fn create_app(state: Arc<NodeState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(ws::session_ws))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
    }))
}

pub async fn run(config: NodeConfig) -> Result<()> {
    // Failing to reach the directory or the bus at startup is permanent:
    // bail out non-zero instead of serving sessions we cannot lease.
    let directory = RedisDirectory::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to directory at {}", config.redis_url))?;
    let publisher =
        KafkaPublisher::new(&config.kafka_brokers).context("failed to create bus producer")?;
    let events_stream = KafkaEventStream::new(&config.kafka_brokers, &config.node_id)
        .context("failed to create bus consumer")?;

    let state = Arc::new(NodeState::new(
        &config,
        Arc::new(publisher),
        Arc::new(directory),
    ));

    // The fabric should learn about this node before any client can reach
    // it. A directory hiccup here is transient: log it and bind anyway, the
    // heartbeat loop retries on its next tick.
    if let Err(e) = heartbeat::heartbeat_once(&state).await {
        tracing::warn!(error = %e, "initial heartbeat failed, heartbeat loop will retry");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let heartbeat_task = tokio::spawn(heartbeat::run_heartbeat(
        state.clone(),
        config.heartbeat_interval,
        shutdown_rx.clone(),
    ));
    let scrub_task = tokio::spawn(heartbeat::run_scrub(
        state.clone(),
        config.stale_after(),
        shutdown_rx.clone(),
    ));
    let consumer_task = tokio::spawn(consumer::run_consumer(
        state.clone(),
        events_stream,
        shutdown_rx.clone(),
    ));

    let app = create_app(state.clone());
    let addr = format!("0.0.0.0:{}", config.ws_port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        node_id = %state.node_id,
        vnodes = state.assigned_vnodes.len(),
        "presence node listening"
    );

    let mut acceptor_rx = shutdown_rx.clone();
    let server = tokio::spawn(
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = acceptor_rx.changed().await;
            })
            .into_future(),
    );

    wait_for_signal().await?;
    tracing::info!("shutdown signal received");

    let _ = shutdown_tx.send(true);
    let closed = state.close_all(CLOSE_GOING_AWAY, REASON_SHUTDOWN).await;
    tracing::info!(sessions = closed, "closed live sessions");

    let drain = async {
        // Acceptor first, then the bus: consumer before producer so no
        // event can arrive after its publisher is gone.
        server.await.context("server task panicked")??;
        let _ = tokio::join!(heartbeat_task, scrub_task);
        consumer_task.await.context("consumer task panicked")?;
        if let Err(e) = state.publisher.close().await {
            tracing::warn!(error = %e, "bus producer close failed");
        }
        anyhow::Ok(())
    };
    let drained = tokio::time::timeout(SHUTDOWN_DEADLINE, drain).await;
    match drained {
        Ok(Ok(())) => {
            // Last live handle: dropping it closes the directory connection.
            drop(state);
            tracing::info!("shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => Err(e.context("shutdown failed")),
        Err(_) => bail!("shutdown did not complete within {SHUTDOWN_DEADLINE:?}"),
    }
}

async fn wait_for_signal() -> Result<()> {
    let mut terminate = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("failed to install SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("failed to listen for SIGINT")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}
