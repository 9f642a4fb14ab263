//! Configuration management with validation and defaults
//!
//! Centralized configuration for the table server: every tunable that the
//! session, round, betting, and settlement layers consult lives here, with
//! defaults that match a small production table.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level server configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DicehallConfig {
    pub server: ServerConfig,
    pub session: SessionConfig,
    pub rounds: RoundsConfig,
    pub betting: BettingConfig,
    pub settlement: SettlementConfig,
}

impl Default for DicehallConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            session: SessionConfig::default(),
            rounds: RoundsConfig::default(),
            betting: BettingConfig::default(),
            settlement: SettlementConfig::default(),
        }
    }
}

/// HTTP/WebSocket listener configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub allowed_origins: Vec<String>,
    pub request_timeout_secs: u64,
    /// Hard ceiling on a single inbound frame, in bytes
    pub max_frame_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            allowed_origins: vec!["*".to_string()],
            request_timeout_secs: 30,
            max_frame_bytes: 64 * 1024,
        }
    }
}

/// Connection/session lifecycle tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Unauthenticated connections are swept after this grace period
    pub auth_grace_secs: u64,
    /// Authenticated but silent connections are swept after this
    pub idle_timeout_secs: u64,
    /// How often the registry sweep runs
    pub sweep_interval_secs: u64,
    /// Server-side heartbeat broadcast interval
    pub heartbeat_interval_secs: u64,
    /// Inbound message budget per connection, rolling 60s window
    pub messages_per_minute: u32,
    /// Verified-identity cache capacity and lifetime
    pub identity_cache_size: usize,
    pub identity_cache_ttl_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_grace_secs: 30,
            idle_timeout_secs: 90,
            sweep_interval_secs: 10,
            heartbeat_interval_secs: 30,
            messages_per_minute: 120,
            identity_cache_size: 4096,
            identity_cache_ttl_secs: 300,
        }
    }
}

/// Round lifecycle and ticker tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RoundsConfig {
    /// Betting window length once a round starts
    pub betting_secs: u64,
    /// Ticker poll interval
    pub tick_interval_secs: u64,
    /// Countdown notifications fire only at these remaining-seconds marks
    pub countdown_thresholds: Vec<u64>,
    /// Round snapshots in the fast cache expire after this
    pub cache_ttl_secs: u64,
    /// Countdown/result dedup entries are evicted after this horizon
    pub dedup_eviction_secs: u64,
}

impl Default for RoundsConfig {
    fn default() -> Self {
        Self {
            betting_secs: 30,
            tick_interval_secs: 1,
            countdown_thresholds: vec![30, 20, 10, 5, 3, 2, 1],
            cache_ttl_secs: 600,
            // One hour: long past any round's lifetime, bounds dedup memory
            dedup_eviction_secs: 3600,
        }
    }
}

/// Betting pipeline limits and lock tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct BettingConfig {
    /// Maximum bet entries accepted in a single place_bet call
    pub max_bets_per_call: usize,
    /// Aggregate stake cap per user per round
    pub per_round_cap: u64,
    /// Aggregate stake cap per user per calendar day
    pub daily_cap: u64,
    /// No cancellation inside the final seconds of the window
    pub cancel_cutoff_secs: u64,
    /// Exclusivity lock TTL (covers a stuck holder)
    pub lock_ttl_ms: u64,
    /// Bounded wait before a lock acquisition fails closed
    pub lock_wait_ms: u64,
    /// Risk flag: placements per user per minute before logging
    pub placements_per_minute_flag: u32,
    /// Risk flag: single stake at or above this is logged
    pub anomalous_stake_flag: u64,
}

impl Default for BettingConfig {
    fn default() -> Self {
        Self {
            max_bets_per_call: 20,
            per_round_cap: 1_000_000,
            daily_cap: 10_000_000,
            cancel_cutoff_secs: 3,
            lock_ttl_ms: 5_000,
            lock_wait_ms: 500,
            placements_per_minute_flag: 30,
            anomalous_stake_flag: 500_000,
        }
    }
}

/// Settlement tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    /// Rebate credited when a user's round net is negative, in basis points
    /// of their total stake (50 = 0.5%)
    pub rebate_bps: u64,
    /// A single win at or above this triggers the large-win alert
    pub large_win_alert: u64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            rebate_bps: 50,
            large_win_alert: 1_000_000,
        }
    }
}

impl DicehallConfig {
    /// Load from a TOML file, falling back to defaults for missing sections
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::LoadFailed(format!("{}: {}", path.display(), e)))?;
        let config: Self =
            toml::from_str(&raw).map_err(|e| ConfigError::LoadFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Production preset: tighter sweep timing, larger identity cache
    pub fn production() -> Self {
        Self {
            session: SessionConfig {
                sweep_interval_secs: 5,
                identity_cache_size: 16_384,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Validate for logical consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rounds.betting_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "rounds.betting_secs must be > 0".to_string(),
            ));
        }
        if self.rounds.tick_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "rounds.tick_interval_secs must be > 0".to_string(),
            ));
        }
        if self.betting.max_bets_per_call == 0 {
            return Err(ConfigError::InvalidValue(
                "betting.max_bets_per_call must be > 0".to_string(),
            ));
        }
        if self.betting.lock_ttl_ms < self.betting.lock_wait_ms {
            return Err(ConfigError::LogicalInconsistency(
                "lock TTL shorter than the bounded wait would let a second \
                 caller acquire while the first still holds"
                    .to_string(),
            ));
        }
        if self.betting.cancel_cutoff_secs >= self.rounds.betting_secs {
            return Err(ConfigError::LogicalInconsistency(
                "cancel cutoff covers the entire betting window".to_string(),
            ));
        }
        if self.session.messages_per_minute == 0 {
            return Err(ConfigError::InvalidValue(
                "session.messages_per_minute must be > 0".to_string(),
            ));
        }
        if self.settlement.rebate_bps >= 10_000 {
            return Err(ConfigError::InvalidValue(
                "settlement.rebate_bps must be < 10000".to_string(),
            ));
        }
        Ok(())
    }

    pub fn betting_window(&self) -> Duration {
        Duration::from_secs(self.rounds.betting_secs)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.rounds.tick_interval_secs)
    }

    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.betting.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.betting.lock_wait_ms)
    }
}

impl RoundsConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.tick_interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }

    pub fn dedup_eviction(&self) -> Duration {
        Duration::from_secs(self.dedup_eviction_secs)
    }
}

impl BettingConfig {
    pub fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.lock_ttl_ms)
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock_wait_ms)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    InvalidValue(String),
    LogicalInconsistency(String),
    LoadFailed(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
            ConfigError::LogicalInconsistency(msg) => {
                write!(f, "Configuration logical inconsistency: {}", msg)
            }
            ConfigError::LoadFailed(msg) => write!(f, "Failed to load configuration: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
