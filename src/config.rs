use crate::models::Timeframe;
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Full run configuration. Every recognised option lives here as an explicit
/// field with a compile-time default; the CLI overrides individual fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    /// Market to trade, e.g. "ETH-USD".
    pub instrument: String,
    pub timeframe: Timeframe,
    /// Multiplier for breakout volume confirmation.
    pub volume_factor: f64,
    /// Closed-candle lookback for the resistance level.
    pub resistance_periods: usize,
    /// Closed-candle lookback for the average volume.
    pub volume_lookback: usize,
    /// Take-profit distance as a multiple of the stop distance.
    pub risk_reward_ratio: f64,
    /// Stop placement below the broken resistance, as a fraction.
    pub stop_offset_pct: f64,
    /// Default notional per entry.
    pub position_size_usd: f64,
    /// Hard cap per entry.
    pub max_position_size_usd: f64,
    pub max_daily_loss_usd: f64,
    /// Drawdown from initial equity at which the breaker trips, as a fraction.
    pub max_drawdown_pct: f64,
    /// Required free collateral is size / max_leverage.
    pub max_leverage: f64,
    /// Control-loop period in seconds.
    pub update_interval_s: u64,
    /// When true, orders are synthesised locally and never sent to the venue.
    pub simulation_mode: bool,
    /// Safety-net REST snapshot period in seconds.
    pub snapshot_interval_s: u64,
    /// Candles kept in the rolling store.
    pub candle_history: usize,
    /// Seconds to skip entry evaluation after a position closes.
    pub cooldown_s: u64,
    pub order_timeout_s: u64,
    pub query_timeout_s: u64,
    /// Seconds to await in-flight orders during shutdown.
    pub shutdown_grace_s: u64,
    /// Persist an open position to bot_state.json instead of closing it on
    /// shutdown.
    pub persist_position_on_shutdown: bool,
    /// Starting equity for the simulated venue.
    pub initial_equity_usd: f64,
    /// Directory for trades.jsonl / performance.json / bot_state.json.
    pub data_dir: PathBuf,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            instrument: "ETH-USD".to_string(),
            timeframe: Timeframe::M5,
            volume_factor: 2.0,
            resistance_periods: 24,
            volume_lookback: 20,
            risk_reward_ratio: 3.0,
            stop_offset_pct: 0.01,
            position_size_usd: 100.0,
            max_position_size_usd: 1_000.0,
            max_daily_loss_usd: 500.0,
            max_drawdown_pct: 0.10,
            max_leverage: 5.0,
            update_interval_s: 60,
            simulation_mode: true,
            snapshot_interval_s: 60,
            candle_history: 100,
            cooldown_s: 300,
            order_timeout_s: 10,
            query_timeout_s: 5,
            shutdown_grace_s: 15,
            persist_position_on_shutdown: false,
            initial_equity_usd: 10_000.0,
            data_dir: PathBuf::from("."),
        }
    }
}

impl BotConfig {
    /// Reject configurations the loop cannot run with. Failures here are
    /// fatal at start-up (exit code 1).
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.instrument.is_empty() {
            bail!("instrument must not be empty");
        }
        if self.volume_factor <= 0.0 {
            bail!("volume_factor must be positive, got {}", self.volume_factor);
        }
        if self.resistance_periods == 0 {
            bail!("resistance_periods must be at least 1");
        }
        if self.volume_lookback == 0 {
            bail!("volume_lookback must be at least 1");
        }
        if self.risk_reward_ratio <= 0.0 {
            bail!(
                "risk_reward_ratio must be positive, got {}",
                self.risk_reward_ratio
            );
        }
        if !(0.0..1.0).contains(&self.stop_offset_pct) {
            bail!(
                "stop_offset_pct must be in [0, 1), got {}",
                self.stop_offset_pct
            );
        }
        if self.position_size_usd <= 0.0 {
            bail!(
                "position_size_usd must be positive, got {}",
                self.position_size_usd
            );
        }
        if self.max_position_size_usd <= 0.0 {
            bail!("max_position_size_usd must be positive");
        }
        if self.max_leverage < 1.0 {
            bail!("max_leverage must be at least 1, got {}", self.max_leverage);
        }
        if self.max_drawdown_pct <= 0.0 || self.max_drawdown_pct >= 1.0 {
            bail!(
                "max_drawdown_pct must be in (0, 1), got {}",
                self.max_drawdown_pct
            );
        }
        if self.update_interval_s == 0 {
            bail!("update_interval_s must be at least 1");
        }
        if self.candle_history < self.resistance_periods.max(self.volume_lookback) {
            bail!(
                "candle_history ({}) must cover the longest lookback ({})",
                self.candle_history,
                self.resistance_periods.max(self.volume_lookback)
            );
        }
        Ok(())
    }
}

/// Indexer credentials captured by `setup` (or taken from the environment).
/// The indexer surface is read-only, so this is an address, not a key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub address: String,
    #[serde(default)]
    pub subaccount: u32,
}

impl Credentials {
    pub fn file_path(data_dir: &Path) -> PathBuf {
        data_dir.join("credentials.json")
    }

    pub fn load(data_dir: &Path) -> Option<Self> {
        if let Ok(address) = std::env::var("DYDX_ADDRESS") {
            let subaccount = std::env::var("DYDX_SUBACCOUNT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0);
            return Some(Self {
                address,
                subaccount,
            });
        }

        let raw = std::fs::read_to_string(Self::file_path(data_dir)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn save(&self, data_dir: &Path) -> anyhow::Result<()> {
        let path = Self::file_path(data_dir);
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }
}
