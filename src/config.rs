use std::collections::HashSet;
use std::time::Duration;

use anyhow::{Context, Result, bail};

/// Default TTL floor for directory ownership entries, and the TTL for the
/// user→instance routing cache.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60);

/// Per-connection server ping interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

fn parse_port(raw: Option<&str>, default: u16) -> u16 {
    raw.and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn parse_vnode_count(raw: Option<&str>) -> Result<u32> {
    let count: u32 = match raw.filter(|s| !s.is_empty()) {
        Some(v) => v
            .parse()
            .with_context(|| format!("invalid VNODE_COUNT: {v}"))?,
        None => 1024,
    };
    if count == 0 {
        bail!("VNODE_COUNT must be positive");
    }
    Ok(count)
}

/// Ownership lease TTL: at least twice the heartbeat interval so one missed
/// heartbeat does not evict a live owner, floored at the default.
fn own_ttl_for(heartbeat_interval: Duration) -> Duration {
    DEFAULT_TTL.max(heartbeat_interval * 2)
}

/// Configuration for the coordinator service, loaded from environment
/// variables.
#[derive(Debug)]
pub struct CoordinatorConfig {
    pub port: u16,
    pub vnode_count: u32,
    pub redis_url: String,
    pub own_ttl: Duration,
    pub user_cache_ttl: Duration,
}

impl CoordinatorConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_raw_values(
            std::env::var("COORDINATOR_PORT").ok().as_deref(),
            std::env::var("VNODE_COUNT").ok().as_deref(),
            std::env::var("REDIS_URL").ok().as_deref(),
        )
    }

    /// Build from raw string values as they would come from env vars. Used
    /// directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(
        port: Option<&str>,
        vnode_count: Option<&str>,
        redis_url: Option<&str>,
    ) -> Result<Self> {
        Ok(CoordinatorConfig {
            port: parse_port(port, 4000),
            vnode_count: parse_vnode_count(vnode_count)?,
            redis_url: redis_url
                .filter(|s| !s.is_empty())
                .unwrap_or("redis://127.0.0.1:6379")
                .to_string(),
            own_ttl: DEFAULT_TTL,
            user_cache_ttl: DEFAULT_TTL,
        })
    }
}

/// Raw environment values for a presence node. A plain carrier struct so
/// tests can construct arbitrary combinations without touching the process
/// environment.
#[derive(Debug, Default)]
pub struct RawNodeValues<'a> {
    pub node_id: Option<&'a str>,
    pub assigned_vnodes: Option<&'a str>,
    pub ws_port: Option<&'a str>,
    pub vnode_count: Option<&'a str>,
    pub kafka_brokers: Option<&'a str>,
    pub redis_url: Option<&'a str>,
    pub jwt_secret: Option<&'a str>,
    pub heartbeat_interval: Option<&'a str>,
}

/// Configuration for a presence node, loaded from environment variables.
///
/// Startup validation is strict: a missing `NODE_ID`/`JWT_SECRET`, an
/// unparsable `ASSIGNED_VNODES` list, or an assigned vnode outside
/// `[0, VNODE_COUNT)` all fail fast with a non-zero exit.
#[derive(Debug)]
pub struct NodeConfig {
    pub node_id: String,
    pub assigned_vnodes: HashSet<u32>,
    pub ws_port: u16,
    pub vnode_count: u32,
    pub kafka_brokers: String,
    pub redis_url: String,
    pub jwt_secret: String,
    pub heartbeat_interval: Duration,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self> {
        let node_id = std::env::var("NODE_ID").ok();
        let assigned = std::env::var("ASSIGNED_VNODES").ok();
        let ws_port = std::env::var("WS_PORT").ok();
        let vnode_count = std::env::var("VNODE_COUNT").ok();
        let kafka_brokers = std::env::var("KAFKA_BROKERS").ok();
        let redis_url = std::env::var("REDIS_URL").ok();
        let jwt_secret = std::env::var("JWT_SECRET").ok();
        let heartbeat = std::env::var("HEARTBEAT_INTERVAL").ok();

        Self::from_raw_values(RawNodeValues {
            node_id: node_id.as_deref(),
            assigned_vnodes: assigned.as_deref(),
            ws_port: ws_port.as_deref(),
            vnode_count: vnode_count.as_deref(),
            kafka_brokers: kafka_brokers.as_deref(),
            redis_url: redis_url.as_deref(),
            jwt_secret: jwt_secret.as_deref(),
            heartbeat_interval: heartbeat.as_deref(),
        })
    }

    pub fn from_raw_values(raw: RawNodeValues<'_>) -> Result<Self> {
        let node_id = raw
            .node_id
            .filter(|s| !s.is_empty())
            .context("NODE_ID is required")?
            .to_string();

        let jwt_secret = raw
            .jwt_secret
            .filter(|s| !s.is_empty())
            .context("JWT_SECRET is required")?
            .to_string();

        let vnode_count = parse_vnode_count(raw.vnode_count)?;

        let assigned_raw = raw
            .assigned_vnodes
            .filter(|s| !s.trim().is_empty())
            .context("ASSIGNED_VNODES is required")?;
        let assigned_vnodes = parse_assigned_vnodes(assigned_raw, vnode_count)?;

        let heartbeat_interval = match raw.heartbeat_interval.filter(|s| !s.is_empty()) {
            Some(v) => {
                let ms: u64 = v
                    .parse()
                    .with_context(|| format!("invalid HEARTBEAT_INTERVAL: {v}"))?;
                if ms == 0 {
                    bail!("HEARTBEAT_INTERVAL must be positive");
                }
                Duration::from_millis(ms)
            }
            None => Duration::from_millis(30_000),
        };

        Ok(NodeConfig {
            node_id,
            assigned_vnodes,
            ws_port: parse_port(raw.ws_port, 8080),
            vnode_count,
            kafka_brokers: raw
                .kafka_brokers
                .filter(|s| !s.is_empty())
                .unwrap_or("127.0.0.1:9092")
                .to_string(),
            redis_url: raw
                .redis_url
                .filter(|s| !s.is_empty())
                .unwrap_or("redis://127.0.0.1:6379")
                .to_string(),
            jwt_secret,
            heartbeat_interval,
        })
    }

    /// TTL written with every ownership/load heartbeat.
    pub fn own_ttl(&self) -> Duration {
        own_ttl_for(self.heartbeat_interval)
    }

    /// Age past which a remote presence entry with no refreshing event is
    /// considered stale and scrubbed.
    pub fn stale_after(&self) -> Duration {
        self.own_ttl() * 3
    }
}

fn parse_assigned_vnodes(raw: &str, vnode_count: u32) -> Result<HashSet<u32>> {
    let mut assigned = HashSet::new();
    for part in raw.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let vnode: u32 = part
            .parse()
            .with_context(|| format!("invalid vnode id in ASSIGNED_VNODES: {part}"))?;
        if vnode >= vnode_count {
            bail!("assigned vnode {vnode} is outside [0, {vnode_count})");
        }
        assigned.insert(vnode);
    }
    if assigned.is_empty() {
        bail!("ASSIGNED_VNODES is empty");
    }
    Ok(assigned)
}

/// Optional error-reporting configuration shared by both services.
#[derive(Debug)]
pub struct TelemetryConfig {
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

impl TelemetryConfig {
    pub fn from_env() -> Self {
        Self::from_raw_values(
            std::env::var("SENTRY_DSN").ok().as_deref(),
            std::env::var("ENVIRONMENT").ok().as_deref(),
        )
    }

    pub fn from_raw_values(sentry_dsn: Option<&str>, environment: Option<&str>) -> Self {
        TelemetryConfig {
            sentry_dsn: sentry_dsn.filter(|s| !s.is_empty()).map(String::from),
            environment: environment
                .filter(|s| !s.is_empty())
                .unwrap_or("local")
                .to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw_node<'a>() -> RawNodeValues<'a> {
        RawNodeValues {
            node_id: Some("node-a"),
            assigned_vnodes: Some("0,1,2"),
            jwt_secret: Some("secret"),
            ..RawNodeValues::default()
        }
    }

    #[test]
    fn test_coordinator_defaults() {
        let config = CoordinatorConfig::from_raw_values(None, None, None).unwrap();
        assert_eq!(config.port, 4000);
        assert_eq!(config.vnode_count, 1024);
        assert_eq!(config.redis_url, "redis://127.0.0.1:6379");
        assert_eq!(config.own_ttl, Duration::from_secs(60));
    }

    #[test]
    fn test_coordinator_invalid_port_uses_default() {
        let config = CoordinatorConfig::from_raw_values(Some("not-a-number"), None, None).unwrap();
        assert_eq!(config.port, 4000);
    }

    #[test]
    fn test_coordinator_invalid_vnode_count_fails() {
        assert!(CoordinatorConfig::from_raw_values(None, Some("many"), None).is_err());
        assert!(CoordinatorConfig::from_raw_values(None, Some("0"), None).is_err());
    }

    #[test]
    fn test_node_defaults() {
        let config = NodeConfig::from_raw_values(raw_node()).unwrap();
        assert_eq!(config.ws_port, 8080);
        assert_eq!(config.vnode_count, 1024);
        assert_eq!(config.kafka_brokers, "127.0.0.1:9092");
        assert_eq!(config.heartbeat_interval, Duration::from_millis(30_000));
        assert_eq!(config.assigned_vnodes, HashSet::from([0, 1, 2]));
    }

    #[test]
    fn test_node_requires_node_id() {
        let raw = RawNodeValues {
            node_id: None,
            ..raw_node()
        };
        let err = NodeConfig::from_raw_values(raw).unwrap_err();
        assert!(err.to_string().contains("NODE_ID"));
    }

    #[test]
    fn test_node_requires_jwt_secret() {
        let raw = RawNodeValues {
            jwt_secret: Some(""),
            ..raw_node()
        };
        assert!(NodeConfig::from_raw_values(raw).is_err());
    }

    #[test]
    fn test_node_rejects_unparsable_vnode_list() {
        let raw = RawNodeValues {
            assigned_vnodes: Some("0,two,4"),
            ..raw_node()
        };
        assert!(NodeConfig::from_raw_values(raw).is_err());
    }

    #[test]
    fn test_node_rejects_out_of_range_vnode() {
        let raw = RawNodeValues {
            assigned_vnodes: Some("0,16"),
            vnode_count: Some("16"),
            ..raw_node()
        };
        let err = NodeConfig::from_raw_values(raw).unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[test]
    fn test_node_accepts_spaced_vnode_list() {
        let raw = RawNodeValues {
            assigned_vnodes: Some(" 1, 2 ,3 "),
            ..raw_node()
        };
        let config = NodeConfig::from_raw_values(raw).unwrap();
        assert_eq!(config.assigned_vnodes, HashSet::from([1, 2, 3]));
    }

    #[test]
    fn test_own_ttl_floors_at_default() {
        let config = NodeConfig::from_raw_values(raw_node()).unwrap();
        // 2 × 30 s heartbeat equals the floor
        assert_eq!(config.own_ttl(), Duration::from_secs(60));

        let raw = RawNodeValues {
            heartbeat_interval: Some("5000"),
            ..raw_node()
        };
        let config = NodeConfig::from_raw_values(raw).unwrap();
        assert_eq!(config.own_ttl(), Duration::from_secs(60));
    }

    #[test]
    fn test_own_ttl_tracks_long_heartbeats() {
        let raw = RawNodeValues {
            heartbeat_interval: Some("45000"),
            ..raw_node()
        };
        let config = NodeConfig::from_raw_values(raw).unwrap();
        assert_eq!(config.own_ttl(), Duration::from_secs(90));
        assert_eq!(config.stale_after(), Duration::from_secs(270));
    }

    #[test]
    fn test_node_rejects_zero_heartbeat() {
        let raw = RawNodeValues {
            heartbeat_interval: Some("0"),
            ..raw_node()
        };
        assert!(NodeConfig::from_raw_values(raw).is_err());
    }

    #[test]
    fn test_telemetry_empty_dsn_is_none() {
        let config = TelemetryConfig::from_raw_values(Some(""), None);
        assert!(config.sentry_dsn.is_none());
        assert_eq!(config.environment, "local");
    }
}
