//! Runtime configuration from `LANEHOLD_*` environment variables.
//!
//! Unset or unparsable values fall back to the defaults below.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use chrono_tz::Tz;

use crate::model::{HOUR, Ms, SECOND};

#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub engine: EngineConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    /// WAL appends since the last compaction before the compactor rewrites the log.
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
}

/// Booking policy knobs shared by every facility engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub hold_ttl_ms: Ms,
    pub max_hold_ttl_ms: Ms,
    /// A hold is never renewed past `created_at + max_hold_lifetime_ms`.
    pub max_hold_lifetime_ms: Ms,
    pub sweep_interval_ms: Ms,
    /// Signal renewal this many sessions before the authorization runs out.
    pub renewal_lead: u32,
    pub late_cancel_window_ms: Ms,
    pub lessons_per_authorization: u32,
    pub timezone: Tz,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hold_ttl_ms: 600 * SECOND,
            max_hold_ttl_ms: 1_800 * SECOND,
            max_hold_lifetime_ms: 3_600 * SECOND,
            sweep_interval_ms: 5 * SECOND,
            renewal_lead: 1,
            late_cancel_window_ms: 24 * HOUR,
            lessons_per_authorization: 12,
            timezone: chrono_tz::America::Los_Angeles,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server: ServerConfig::from_env(),
            engine: EngineConfig::from_env(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        Self {
            port: env_or("LANEHOLD_PORT", 5433),
            bind: env_or("LANEHOLD_BIND", "0.0.0.0".to_string()),
            data_dir: PathBuf::from(env_or("LANEHOLD_DATA_DIR", "./data".to_string())),
            password: env_or("LANEHOLD_PASSWORD", "lanehold".to_string()),
            max_connections: env_or("LANEHOLD_MAX_CONNECTIONS", 256),
            compact_threshold: env_or("LANEHOLD_COMPACT_THRESHOLD", 1000),
            metrics_port: env_opt("LANEHOLD_METRICS_PORT"),
            tls_cert: env::var("LANEHOLD_TLS_CERT").ok(),
            tls_key: env::var("LANEHOLD_TLS_KEY").ok(),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            hold_ttl_ms: secs_or("LANEHOLD_HOLD_TTL_SECS", defaults.hold_ttl_ms),
            max_hold_ttl_ms: secs_or("LANEHOLD_MAX_HOLD_TTL_SECS", defaults.max_hold_ttl_ms),
            max_hold_lifetime_ms: secs_or(
                "LANEHOLD_MAX_HOLD_LIFETIME_SECS",
                defaults.max_hold_lifetime_ms,
            ),
            sweep_interval_ms: secs_or("LANEHOLD_SWEEP_INTERVAL_SECS", defaults.sweep_interval_ms),
            renewal_lead: env_or("LANEHOLD_RENEWAL_LEAD", defaults.renewal_lead),
            late_cancel_window_ms: env_opt::<i64>("LANEHOLD_LATE_CANCEL_HOURS")
                .map(|h| h * HOUR)
                .unwrap_or(defaults.late_cancel_window_ms),
            lessons_per_authorization: env_or(
                "LANEHOLD_LESSONS_PER_AUTHORIZATION",
                defaults.lessons_per_authorization,
            ),
            timezone: env_or("LANEHOLD_TIMEZONE", defaults.timezone),
        }
    }
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|s| s.parse().ok())
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

fn secs_or(key: &str, default_ms: Ms) -> Ms {
    env_opt::<i64>(key).map(|s| s * SECOND).unwrap_or(default_ms)
}
