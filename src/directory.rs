use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::aio::ConnectionManager;

/// Directory hash holding the vnode→instance ownership map.
pub const OWNERS_KEY: &str = "vnode:owners";
/// Directory hash holding per-vnode session counts.
pub const LOADS_KEY: &str = "vnode:load";

pub fn user_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

pub type Result<T> = std::result::Result<T, DirectoryError>;

/// The shared directory: the only cross-process state in the system.
///
/// All writes are merge-and-refresh: a partial map write must not erase
/// unrelated entries, and every write refreshes the whole-key TTL. The
/// directory is not a coordination primitive; contention on ownership is
/// mediated by the coordinator.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn get_owners(&self) -> Result<HashMap<u32, String>>;
    async fn put_owners(&self, owners: &HashMap<u32, String>, ttl: Duration) -> Result<()>;
    async fn delete_owners(&self, vnodes: &[u32]) -> Result<()>;

    async fn get_loads(&self) -> Result<HashMap<u32, u64>>;
    async fn put_loads(&self, loads: &HashMap<u32, u64>, ttl: Duration) -> Result<()>;

    async fn get_user_instance(&self, user_id: &str) -> Result<Option<String>>;
    async fn put_user_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<()>;
}

/// Redis-backed directory. `vnode:owners` and `vnode:load` are hashes with a
/// whole-key TTL; `user:<id>` is a plain `SET … EX` string.
pub struct RedisDirectory {
    conn: ConnectionManager,
}

impl RedisDirectory {
    /// Connect to Redis. A failure here is a permanent fault: callers are
    /// expected to log it and exit non-zero.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_tokio_connection_manager().await?;
        Ok(Self { conn })
    }

    async fn read_hash<V>(&self, key: &str) -> Result<HashMap<u32, V>>
    where
        V: FromStr,
    {
        let mut conn = self.conn.clone();
        let raw: HashMap<String, String> =
            redis::cmd("HGETALL").arg(key).query_async(&mut conn).await?;

        let mut parsed = HashMap::with_capacity(raw.len());
        for (field, value) in raw {
            match (field.parse::<u32>(), value.parse::<V>()) {
                (Ok(vnode), Ok(v)) => {
                    parsed.insert(vnode, v);
                }
                _ => {
                    tracing::warn!(key = %key, field = %field, "skipping unparsable directory entry");
                }
            }
        }
        Ok(parsed)
    }

    async fn write_hash<V>(&self, key: &str, entries: &HashMap<u32, V>, ttl: Duration) -> Result<()>
    where
        V: ToString,
    {
        if entries.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        pipe.cmd("HSET").arg(key);
        for (vnode, value) in entries {
            pipe.arg(*vnode).arg(value.to_string());
        }
        pipe.ignore();
        pipe.cmd("EXPIRE")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl Directory for RedisDirectory {
    async fn get_owners(&self) -> Result<HashMap<u32, String>> {
        self.read_hash(OWNERS_KEY).await
    }

    async fn put_owners(&self, owners: &HashMap<u32, String>, ttl: Duration) -> Result<()> {
        self.write_hash(OWNERS_KEY, owners, ttl).await
    }

    async fn delete_owners(&self, vnodes: &[u32]) -> Result<()> {
        if vnodes.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(OWNERS_KEY);
        for vnode in vnodes {
            cmd.arg(*vnode);
        }
        cmd.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn get_loads(&self) -> Result<HashMap<u32, u64>> {
        self.read_hash(LOADS_KEY).await
    }

    async fn put_loads(&self, loads: &HashMap<u32, u64>, ttl: Duration) -> Result<()> {
        self.write_hash(LOADS_KEY, loads, ttl).await
    }

    async fn get_user_instance(&self, user_id: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let instance: Option<String> = redis::cmd("GET")
            .arg(user_key(user_id))
            .query_async(&mut conn)
            .await?;
        Ok(instance)
    }

    async fn put_user_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(user_key(user_id))
            .arg(instance_id)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }
}

#[derive(Default)]
struct MemoryState {
    owners: HashMap<u32, String>,
    owners_deadline: Option<Instant>,
    loads: HashMap<u32, u64>,
    loads_deadline: Option<Instant>,
    users: HashMap<String, (String, Instant)>,
}

impl MemoryState {
    fn expire(&mut self) {
        let now = Instant::now();
        if self.owners_deadline.is_some_and(|d| d <= now) {
            self.owners.clear();
            self.owners_deadline = None;
        }
        if self.loads_deadline.is_some_and(|d| d <= now) {
            self.loads.clear();
            self.loads_deadline = None;
        }
        self.users.retain(|_, (_, deadline)| *deadline > now);
    }
}

/// In-memory directory with real TTL semantics. Used by tests and usable for
/// single-process local runs.
#[derive(Default)]
pub struct MemoryDirectory {
    state: Mutex<MemoryState>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remaining TTL on the owners key, if it holds any entries.
    pub fn owners_expires_in(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .owners_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    pub fn loads_expires_in(&self) -> Option<Duration> {
        let state = self.state.lock().unwrap();
        state
            .loads_deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn get_owners(&self) -> Result<HashMap<u32, String>> {
        let mut state = self.state.lock().unwrap();
        state.expire();
        Ok(state.owners.clone())
    }

    async fn put_owners(&self, owners: &HashMap<u32, String>, ttl: Duration) -> Result<()> {
        if owners.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.expire();
        for (vnode, instance) in owners {
            state.owners.insert(*vnode, instance.clone());
        }
        state.owners_deadline = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn delete_owners(&self, vnodes: &[u32]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.expire();
        for vnode in vnodes {
            state.owners.remove(vnode);
        }
        Ok(())
    }

    async fn get_loads(&self) -> Result<HashMap<u32, u64>> {
        let mut state = self.state.lock().unwrap();
        state.expire();
        Ok(state.loads.clone())
    }

    async fn put_loads(&self, loads: &HashMap<u32, u64>, ttl: Duration) -> Result<()> {
        if loads.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().unwrap();
        state.expire();
        for (vnode, load) in loads {
            state.loads.insert(*vnode, *load);
        }
        state.loads_deadline = Some(Instant::now() + ttl);
        Ok(())
    }

    async fn get_user_instance(&self, user_id: &str) -> Result<Option<String>> {
        let mut state = self.state.lock().unwrap();
        state.expire();
        Ok(state.users.get(user_id).map(|(instance, _)| instance.clone()))
    }

    async fn put_user_instance(
        &self,
        user_id: &str,
        instance_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.users.insert(
            user_id.to_string(),
            (instance_id.to_string(), Instant::now() + ttl),
        );
        Ok(())
    }
}
