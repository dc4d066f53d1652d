pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router;
use axum::body::Body;
use axum::extract::Request;
use sentry::integrations::tower::{NewSentryLayer, SentryHttpLayer};
use tokio::net::TcpListener;

use crate::config::CoordinatorConfig;
use crate::directory::{Directory, RedisDirectory};
use crate::ring::HashRing;

/// Shared state for the coordinator handlers.
///
/// The directory is the write path for ownership; the ring is a local
/// replica, warmed at startup and refreshed lazily on routing misses.
#[derive(Clone)]
pub struct AppState {
    pub directory: Arc<dyn Directory>,
    pub ring: Arc<HashRing>,
    pub own_ttl: Duration,
    pub user_cache_ttl: Duration,
}

pub fn create_app(state: AppState) -> Router {
    routes::build_router(state)
}

pub async fn run(config: CoordinatorConfig) -> Result<()> {
    let directory = RedisDirectory::connect(&config.redis_url)
        .await
        .with_context(|| format!("failed to connect to directory at {}", config.redis_url))?;

    let state = AppState {
        directory: Arc::new(directory),
        ring: Arc::new(HashRing::new(config.vnode_count)),
        own_ttl: config.own_ttl,
        user_cache_ttl: config.user_cache_ttl,
    };
    warm_ring(&state).await;

    let app = create_app(state)
        .layer(SentryHttpLayer::new().enable_transaction())
        .layer(NewSentryLayer::<Request<Body>>::new_from_top());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(
        addr = %addr,
        vnode_count = config.vnode_count,
        "coordinator listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}

/// Seed the local ring from the directory. A failure here is transient; the
/// ring refreshes itself on the first routing miss.
async fn warm_ring(state: &AppState) {
    match state.directory.get_owners().await {
        Ok(owners) => {
            tracing::info!(vnodes = owners.len(), "warmed ring from directory");
            state.ring.update_mappings(&owners);
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to warm ring from directory");
        }
    }
}
