//! Server configuration loaded from the environment.

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use crate::{room::RoomSettings, stats::StatsSettings};

pub const DEFAULT_ALLOWED_ORIGINS: [&str; 2] =
    ["https://m-draw-web.vercel.app", "http://draw.busyhe.com"];

#[derive(Debug, Clone)]
pub struct Config {
    /// Bind address (`SERVER_ADDR`).
    pub server_addr: SocketAddr,
    /// CORS allow-list (`ALLOWED_ORIGINS`, comma separated). Empty allows any
    /// origin without credentials.
    pub allowed_origins: Vec<String>,
    /// Root directory for durable stores (`DATA_DIR`). `None` keeps
    /// everything in memory.
    pub data_dir: Option<PathBuf>,
    /// Visitor liveness window (`HEARTBEAT_TTL_MS`).
    pub heartbeat_ttl: Duration,
    /// Per-room session cap (`MAX_CONNECTIONS`).
    pub max_connections: usize,
    /// Minimum spacing of throttled snapshot saves (`SNAPSHOT_INTERVAL_MS`).
    pub snapshot_interval: Duration,
    /// Quiet period before an empty, saved room actor retires (`ROOM_IDLE_TIMEOUT_MS`).
    pub room_idle_timeout: Duration,
    /// Deadline for a best-effort stats notification (`NOTIFY_TIMEOUT_MS`).
    pub notify_timeout: Duration,
    /// Body limit for asset uploads (`MAX_UPLOAD_BYTES`).
    pub max_upload_bytes: usize,
    pub ws_ping_interval: Duration,
    pub ws_ping_timeout: Duration,
    /// Fallback log filter when `RUST_LOG` is unset (`LOG_LEVEL`).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_addr: SocketAddr::from(([127, 0, 0, 1], 8787)),
            allowed_origins: DEFAULT_ALLOWED_ORIGINS.iter().map(|o| o.to_string()).collect(),
            data_dir: None,
            heartbeat_ttl: Duration::from_secs(30),
            max_connections: 100,
            snapshot_interval: Duration::from_secs(10),
            room_idle_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(5),
            max_upload_bytes: 16 * 1024 * 1024,
            ws_ping_interval: Duration::from_secs(30),
            ws_ping_timeout: Duration::from_secs(60),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment. Call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let defaults = Self::default();

        let server_addr = parse_var("SERVER_ADDR")?.unwrap_or(defaults.server_addr);
        let allowed_origins = match std::env::var("ALLOWED_ORIGINS") {
            Ok(list) => list
                .split(',')
                .map(str::trim)
                .filter(|o| !o.is_empty())
                .map(str::to_string)
                .collect(),
            Err(_) => defaults.allowed_origins,
        };
        let data_dir = std::env::var("DATA_DIR")
            .ok()
            .filter(|d| !d.is_empty())
            .map(PathBuf::from);
        let millis = |name, default: Duration| -> Result<Duration, ConfigLoadError> {
            Ok(parse_var::<u64>(name)?.map_or(default, Duration::from_millis))
        };
        let secs = |name, default: Duration| -> Result<Duration, ConfigLoadError> {
            Ok(parse_var::<u64>(name)?.map_or(default, Duration::from_secs))
        };

        Ok(Self {
            server_addr,
            allowed_origins,
            data_dir,
            heartbeat_ttl: millis("HEARTBEAT_TTL_MS", defaults.heartbeat_ttl)?,
            max_connections: parse_var("MAX_CONNECTIONS")?.unwrap_or(defaults.max_connections),
            snapshot_interval: millis("SNAPSHOT_INTERVAL_MS", defaults.snapshot_interval)?,
            room_idle_timeout: millis("ROOM_IDLE_TIMEOUT_MS", defaults.room_idle_timeout)?,
            notify_timeout: millis("NOTIFY_TIMEOUT_MS", defaults.notify_timeout)?,
            max_upload_bytes: parse_var("MAX_UPLOAD_BYTES")?.unwrap_or(defaults.max_upload_bytes),
            ws_ping_interval: secs("WS_PING_INTERVAL_SECS", defaults.ws_ping_interval)?,
            ws_ping_timeout: secs("WS_PING_TIMEOUT_SECS", defaults.ws_ping_timeout)?,
            log_level: std::env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
        })
    }

    pub fn stats_settings(&self) -> StatsSettings {
        StatsSettings {
            heartbeat_ttl: self.heartbeat_ttl,
            notify_timeout: self.notify_timeout,
            ..StatsSettings::default()
        }
    }

    pub fn room_settings(&self) -> RoomSettings {
        RoomSettings {
            max_connections: self.max_connections,
            snapshot_interval: self.snapshot_interval,
            idle_timeout: self.room_idle_timeout,
            ..RoomSettings::default()
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str) -> Result<Option<T>, ConfigLoadError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigLoadError::Invalid(name)),
        _ => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Invalid {0}")]
    Invalid(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.heartbeat_ttl, Duration::from_millis(30_000));
        assert_eq!(config.max_connections, 100);
        assert_eq!(config.allowed_origins.len(), 2);
        assert_eq!(config.stats_settings().heartbeat_ttl, config.heartbeat_ttl);
        assert_eq!(config.room_settings().max_connections, 100);
        assert_eq!(config.room_settings().idle_timeout, Duration::from_secs(30));
    }
}
