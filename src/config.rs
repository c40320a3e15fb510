use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::model::Ms;

/// Scheduling and ledger policy. Every value has a production default.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Auto-fill block length.
    pub autofill_block_minutes: u16,
    /// Capacity of every auto-filled instance.
    pub autofill_ticket_limit: u32,
    /// How long a cart hold keeps its tickets before the expiry sweep may release them.
    pub hold_ttl_ms: Ms,
    /// Bounded wait for an instance row lock before reporting a conflict.
    pub lock_wait: Duration,
    /// Retries after a conflict before a reservation gives up.
    pub conflict_retries: u32,
    /// How long a settled line stays queryable before the sweep drops it.
    pub line_retention_ms: Ms,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            autofill_block_minutes: 120,
            autofill_ticket_limit: 20,
            hold_ttl_ms: 15 * 60 * 1000,
            lock_wait: Duration::from_millis(500),
            conflict_retries: 3,
            line_retention_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// Process configuration, read from `PARKSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub reaper_interval: Duration,
    pub engine: EngineConfig,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup. Unparseable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        let defaults = EngineConfig::default();
        let engine = EngineConfig {
            autofill_block_minutes: parsed(&lookup, "PARKSLOT_AUTOFILL_BLOCK_MINUTES")
                .filter(|m: &u16| *m > 0)
                .unwrap_or(defaults.autofill_block_minutes),
            autofill_ticket_limit: parsed(&lookup, "PARKSLOT_AUTOFILL_TICKET_LIMIT")
                .filter(|n: &u32| *n > 0)
                .unwrap_or(defaults.autofill_ticket_limit),
            hold_ttl_ms: parsed::<u64>(&lookup, "PARKSLOT_HOLD_TTL_SECS")
                .map(|s| s as Ms * 1000)
                .unwrap_or(defaults.hold_ttl_ms),
            lock_wait: parsed(&lookup, "PARKSLOT_LOCK_WAIT_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_wait),
            conflict_retries: parsed(&lookup, "PARKSLOT_CONFLICT_RETRIES")
                .unwrap_or(defaults.conflict_retries),
            line_retention_ms: parsed::<u64>(&lookup, "PARKSLOT_LINE_RETENTION_SECS")
                .map(|s| s as Ms * 1000)
                .unwrap_or(defaults.line_retention_ms),
        };

        Self {
            bind: lookup("PARKSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&lookup, "PARKSLOT_PORT").unwrap_or(7411),
            data_dir: lookup("PARKSLOT_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            max_connections: parsed(&lookup, "PARKSLOT_MAX_CONNECTIONS").unwrap_or(256),
            compact_threshold: parsed(&lookup, "PARKSLOT_COMPACT_THRESHOLD").unwrap_or(1000),
            metrics_port: parsed(&lookup, "PARKSLOT_METRICS_PORT"),
            reaper_interval: Duration::from_secs(
                parsed(&lookup, "PARKSLOT_REAPER_INTERVAL_SECS").unwrap_or(5),
            ),
            engine,
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("parkslot.wal")
    }
}
