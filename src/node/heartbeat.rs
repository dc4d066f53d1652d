use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::directory::DirectoryError;
use crate::node::state::NodeState;

/// One ownership + load refresh. Both maps carry the full assigned set so
/// the whole-key TTL covers every vnode this node owns.
pub async fn heartbeat_once(state: &NodeState) -> Result<(), DirectoryError> {
    let owners = state.owners_snapshot();
    let loads = state.loads_snapshot().await;
    state.directory.put_owners(&owners, state.own_ttl).await?;
    state.directory.put_loads(&loads, state.own_ttl).await?;
    Ok(())
}

/// Periodic ownership-lease refresh. A failed tick is logged and retried on
/// the next one; the lease TTL is sized to survive a single miss.
pub async fn run_heartbeat(
    state: Arc<NodeState>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The immediate first tick duplicates the startup heartbeat; skip it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                match heartbeat_once(&state).await {
                    Ok(()) => tracing::debug!(vnodes = state.assigned_vnodes.len(), "heartbeat refreshed"),
                    Err(e) => tracing::warn!(error = %e, "heartbeat failed, retrying next tick"),
                }
            }
        }
    }
    tracing::info!("heartbeat stopped");
}

/// Periodic eviction of remote presence entries whose offline event was
/// lost. Runs at a third of the staleness horizon.
pub async fn run_scrub(
    state: Arc<NodeState>,
    stale_after: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(stale_after / 3);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {
                let evicted = state.scrub_stale(stale_after).await;
                if evicted > 0 {
                    tracing::info!(evicted, "scrubbed stale presence entries");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use tokio::sync::mpsc;

    use crate::bus::MemoryBus;
    use crate::config::{NodeConfig, RawNodeValues};
    use crate::directory::{Directory, MemoryDirectory};
    use crate::ring::user_vnode;

    fn test_node(directory: Arc<MemoryDirectory>) -> NodeState {
        let config = NodeConfig::from_raw_values(RawNodeValues {
            node_id: Some("node-a"),
            assigned_vnodes: Some("0,1,2,3"),
            vnode_count: Some("4"),
            jwt_secret: Some("secret"),
            ..RawNodeValues::default()
        })
        .unwrap();
        NodeState::new(&config, Arc::new(MemoryBus::new(16)), directory)
    }

    #[tokio::test]
    async fn test_heartbeat_writes_owners_and_loads() {
        let directory = Arc::new(MemoryDirectory::new());
        let state = test_node(directory.clone());

        heartbeat_once(&state).await.unwrap();

        let owners = directory.get_owners().await.unwrap();
        let expected: HashMap<u32, String> =
            (0..4).map(|v| (v, "node-a".to_string())).collect();
        assert_eq!(owners, expected);

        let loads = directory.get_loads().await.unwrap();
        assert_eq!(loads.len(), 4);
        assert!(loads.values().all(|&count| count == 0));
    }

    #[tokio::test]
    async fn test_heartbeat_refreshes_ttl() {
        let directory = Arc::new(MemoryDirectory::new());
        let state = test_node(directory.clone());

        heartbeat_once(&state).await.unwrap();

        // Lease must be close to the full own_ttl right after a heartbeat
        let epsilon = Duration::from_secs(1);
        for remaining in [
            directory.owners_expires_in().unwrap(),
            directory.loads_expires_in().unwrap(),
        ] {
            assert!(remaining >= state.own_ttl - epsilon);
        }
    }

    #[tokio::test]
    async fn test_heartbeat_reflects_disconnect() {
        let directory = Arc::new(MemoryDirectory::new());
        let state = test_node(directory.clone());

        let user = (0..)
            .map(|i| format!("user-{i}"))
            .find(|u| user_vnode(u, 4) == 2)
            .unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let (connection_id, _) = state.register_session(&user, tx).await;

        heartbeat_once(&state).await.unwrap();
        assert_eq!(directory.get_loads().await.unwrap()[&2], 1);

        state.unregister_session(&user, connection_id).await;
        heartbeat_once(&state).await.unwrap();
        assert_eq!(directory.get_loads().await.unwrap()[&2], 0);
    }
}
