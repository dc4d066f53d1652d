use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, mpsc};

use crate::bus::EventPublisher;
use crate::config::NodeConfig;
use crate::directory::Directory;
use crate::events::{self, PresenceAction, PresenceEvent, ServerFrame};
use crate::ring::user_vnode;

/// Messages pushed to a session's writer task. The consumer loop and a
/// displacing connect both need to reach a socket they do not own; they do
/// it through this channel.
#[derive(Debug)]
pub enum Outbound {
    Frame(ServerFrame),
    Close { code: u16, reason: &'static str },
}

/// Handle to one live session.
pub struct SessionHandle {
    /// Monotonic id distinguishing this connection from a displaced
    /// predecessor of the same user, so late cleanup stays idempotent.
    pub connection_id: u64,
    pub tx: mpsc::UnboundedSender<Outbound>,
}

/// Shared state of a presence node: the authoritative set of local sessions
/// plus the per-vnode presence view fed by local connects and bus events.
pub struct NodeState {
    pub node_id: String,
    pub vnode_count: u32,
    pub assigned_vnodes: HashSet<u32>,
    pub jwt_secret: String,
    pub own_ttl: Duration,
    pub publisher: Arc<dyn EventPublisher>,
    pub directory: Arc<dyn Directory>,

    clients: Mutex<HashMap<String, SessionHandle>>,
    /// vnode → (user id → last-seen ms). Values refresh on every local
    /// connect and every applied bus event; the scrub uses them to evict
    /// entries whose offline event was lost.
    online: Mutex<HashMap<u32, HashMap<String, i64>>>,
    connection_seq: AtomicU64,
}

impl NodeState {
    pub fn new(
        config: &NodeConfig,
        publisher: Arc<dyn EventPublisher>,
        directory: Arc<dyn Directory>,
    ) -> Self {
        Self {
            node_id: config.node_id.clone(),
            vnode_count: config.vnode_count,
            assigned_vnodes: config.assigned_vnodes.clone(),
            jwt_secret: config.jwt_secret.clone(),
            own_ttl: config.own_ttl(),
            publisher,
            directory,
            clients: Mutex::new(HashMap::new()),
            online: Mutex::new(HashMap::new()),
            connection_seq: AtomicU64::new(1),
        }
    }

    /// The vnode for `user_id` if this node owns it.
    pub fn owns_user(&self, user_id: &str) -> Option<u32> {
        let vnode = user_vnode(user_id, self.vnode_count);
        self.assigned_vnodes.contains(&vnode).then_some(vnode)
    }

    /// Insert a session, returning its connection id and the displaced
    /// handle of a previous session for the same user, if any. The caller
    /// owns closing the displaced session.
    pub async fn register_session(
        &self,
        user_id: &str,
        tx: mpsc::UnboundedSender<Outbound>,
    ) -> (u64, Option<SessionHandle>) {
        let connection_id = self.connection_seq.fetch_add(1, Ordering::Relaxed);
        let displaced = {
            let mut clients = self.clients.lock().await;
            clients.insert(user_id.to_string(), SessionHandle { connection_id, tx })
        };

        let vnode = user_vnode(user_id, self.vnode_count);
        self.online
            .lock()
            .await
            .entry(vnode)
            .or_default()
            .insert(user_id.to_string(), events::now_ms());

        (connection_id, displaced)
    }

    /// Remove a session on close. Only the connection that still owns the
    /// `clients` entry mutates state, which makes double-close and
    /// displaced-session cleanup no-ops. Returns whether state changed
    /// (i.e. whether the caller should publish `offline`).
    pub async fn unregister_session(&self, user_id: &str, connection_id: u64) -> bool {
        {
            let mut clients = self.clients.lock().await;
            match clients.get(user_id) {
                Some(handle) if handle.connection_id == connection_id => {
                    clients.remove(user_id);
                }
                _ => return false,
            }
        }

        let vnode = user_vnode(user_id, self.vnode_count);
        if let Some(members) = self.online.lock().await.get_mut(&vnode) {
            members.remove(user_id);
        }
        true
    }

    /// Apply a bus event to the presence view. Events published by this
    /// node and events for vnodes outside the assigned set are ignored.
    /// Returns whether the event was applied.
    pub async fn apply_event(&self, event: &PresenceEvent) -> bool {
        if event.node_id == self.node_id {
            return false;
        }
        let vnode = user_vnode(&event.user_id, self.vnode_count);
        if !self.assigned_vnodes.contains(&vnode) {
            return false;
        }

        {
            let mut online = self.online.lock().await;
            let members = online.entry(vnode).or_default();
            match event.action {
                PresenceAction::Online => {
                    members.insert(event.user_id.clone(), events::now_ms());
                }
                PresenceAction::Offline => {
                    members.remove(&event.user_id);
                }
            }
        }

        // A locally-connected session of the same user hears about its
        // other devices through a status_update frame.
        let clients = self.clients.lock().await;
        if let Some(handle) = clients.get(&event.user_id) {
            let frame = ServerFrame::StatusUpdate {
                action: event.action,
                timestamp: event.timestamp,
                source_node_id: event.node_id.clone(),
            };
            let _ = handle.tx.send(Outbound::Frame(frame));
        }
        true
    }

    /// Publish a transition, logging (not propagating) failure: a lost
    /// event is bounded by the load TTL and the remote-view scrub.
    pub async fn publish_presence(&self, user_id: &str, action: PresenceAction) {
        let event = match action {
            PresenceAction::Online => PresenceEvent::online(user_id, &self.node_id),
            PresenceAction::Offline => PresenceEvent::offline(user_id, &self.node_id),
        };
        if let Err(e) = self.publisher.publish(&event).await {
            tracing::warn!(
                error = %e,
                user_id = %user_id,
                action = ?action,
                "failed to publish presence event"
            );
        }
    }

    /// Ownership claims for the heartbeat: every assigned vnode maps to
    /// this node.
    pub fn owners_snapshot(&self) -> HashMap<u32, String> {
        self.assigned_vnodes
            .iter()
            .map(|&vnode| (vnode, self.node_id.clone()))
            .collect()
    }

    /// Session counts per assigned vnode, zeros included so every owned
    /// vnode gets its TTL refreshed.
    pub async fn loads_snapshot(&self) -> HashMap<u32, u64> {
        let online = self.online.lock().await;
        self.assigned_vnodes
            .iter()
            .map(|&vnode| {
                let count = online.get(&vnode).map_or(0, |members| members.len() as u64);
                (vnode, count)
            })
            .collect()
    }

    /// Evict remote presence entries not refreshed within `stale_after`.
    /// Users with a live local session are never evicted. Returns the
    /// number of evicted entries.
    pub async fn scrub_stale(&self, stale_after: Duration) -> usize {
        let cutoff = events::now_ms() - stale_after.as_millis() as i64;
        let clients = self.clients.lock().await;
        let mut online = self.online.lock().await;

        let mut evicted = 0;
        for members in online.values_mut() {
            members.retain(|user_id, last_seen| {
                let keep = *last_seen >= cutoff || clients.contains_key(user_id);
                if !keep {
                    evicted += 1;
                }
                keep
            });
        }
        evicted
    }

    /// Close every live session (shutdown path). Returns how many were
    /// signalled.
    pub async fn close_all(&self, code: u16, reason: &'static str) -> usize {
        let mut clients = self.clients.lock().await;
        let count = clients.len();
        for (_, handle) in clients.drain() {
            let _ = handle.tx.send(Outbound::Close { code, reason });
        }
        count
    }

    /// Current members of a vnode's presence set.
    pub async fn online_users(&self, vnode: u32) -> HashSet<String> {
        self.online
            .lock()
            .await
            .get(&vnode)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn session_count(&self) -> usize {
        self.clients.lock().await.len()
    }
}
