// Pre-trade risk gate and circuit breaker.
use crate::clock::Clock;
use crate::config::BotConfig;
use crate::models::{AccountSnapshot, Trade};
use chrono::NaiveDate;
use std::fmt;
use std::sync::Arc;

/// Thresholds the gate and breaker enforce.
#[derive(Debug, Clone)]
pub struct RiskLimits {
    pub max_position_size_usd: f64,
    pub max_daily_loss_usd: f64,
    /// Drawdown from initial equity at which the breaker trips, as a fraction.
    pub max_drawdown_pct: f64,
    /// Free collateral must cover size / max_leverage.
    pub max_leverage: f64,
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_position_size_usd: 1_000.0,
            max_daily_loss_usd: 500.0,
            max_drawdown_pct: 0.10,
            max_leverage: 5.0,
        }
    }
}

impl From<&BotConfig> for RiskLimits {
    fn from(config: &BotConfig) -> Self {
        Self {
            max_position_size_usd: config.max_position_size_usd,
            max_daily_loss_usd: config.max_daily_loss_usd,
            max_drawdown_pct: config.max_drawdown_pct,
            max_leverage: config.max_leverage,
        }
    }
}

/// Why the gate refused an entry. Each check has its own variant so callers
/// can log and react to the exact reason.
#[derive(Debug, Clone, PartialEq)]
pub enum RiskDenial {
    PositionTooLarge { size_usd: f64, max_usd: f64 },
    InsufficientCollateral { required_usd: f64, available_usd: f64 },
    CircuitBroken { reason: String },
}

impl fmt::Display for RiskDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RiskDenial::PositionTooLarge { size_usd, max_usd } => write!(
                f,
                "position size ${:.2} exceeds maximum ${:.2}",
                size_usd, max_usd
            ),
            RiskDenial::InsufficientCollateral {
                required_usd,
                available_usd,
            } => write!(
                f,
                "insufficient free collateral: required ${:.2}, available ${:.2}",
                required_usd, available_usd
            ),
            RiskDenial::CircuitBroken { reason } => write!(f, "circuit breaker: {}", reason),
        }
    }
}

/// Day-scoped loss accounting. Rehydrated at start-up by replaying the
/// current day's trades.
#[derive(Debug, Clone)]
pub struct RiskState {
    /// Captured on the first successful equity read.
    pub initial_equity: Option<f64>,
    pub daily_pnl: f64,
    pub last_reset_day: NaiveDate,
    tripped: bool,
}

pub struct RiskManager {
    limits: RiskLimits,
    state: RiskState,
    clock: Arc<dyn Clock>,
}

impl RiskManager {
    pub fn new(limits: RiskLimits, clock: Arc<dyn Clock>) -> Self {
        let today = clock.today_utc();
        Self {
            limits,
            state: RiskState {
                initial_equity: None,
                daily_pnl: 0.0,
                last_reset_day: today,
                tripped: false,
            },
            clock,
        }
    }

    pub fn daily_pnl(&self) -> f64 {
        self.state.daily_pnl
    }

    pub fn is_tripped(&self) -> bool {
        self.state.tripped
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Fold a closed trade's PnL into the daily total and re-check the
    /// daily-loss breaker.
    pub fn update_daily_pnl(&mut self, delta: f64) {
        self.rollover();
        self.state.daily_pnl += delta;
        if self.state.daily_pnl.abs() >= self.limits.max_daily_loss_usd {
            self.trip(format!(
                "daily PnL ${:.2} beyond limit ${:.2}",
                self.state.daily_pnl, self.limits.max_daily_loss_usd
            ));
        }
    }

    /// Replay already-persisted trades from the current UTC day into the
    /// daily total (start-up rehydration).
    pub fn replay_trades<'a>(&mut self, trades: impl IntoIterator<Item = &'a Trade>) {
        let today = self.clock.today_utc();
        for trade in trades {
            if trade.closed_on() == today {
                self.update_daily_pnl(trade.pnl_usd);
            }
        }
    }

    /// All-or-nothing pre-trade gate. Also captures initial equity on the
    /// first read and re-evaluates the breaker against the fresh snapshot.
    pub fn allow_entry(
        &mut self,
        size_usd: f64,
        account: &AccountSnapshot,
    ) -> Result<(), RiskDenial> {
        self.rollover();
        self.note_equity(account.equity_usd);

        if size_usd > self.limits.max_position_size_usd {
            return Err(RiskDenial::PositionTooLarge {
                size_usd,
                max_usd: self.limits.max_position_size_usd,
            });
        }

        let required = size_usd / self.limits.max_leverage;
        if account.free_collateral_usd < required {
            return Err(RiskDenial::InsufficientCollateral {
                required_usd: required,
                available_usd: account.free_collateral_usd,
            });
        }

        if let Some(reason) = self.breaker_reason(account.equity_usd) {
            self.trip(reason.clone());
            return Err(RiskDenial::CircuitBroken { reason });
        }
        if self.state.tripped {
            return Err(RiskDenial::CircuitBroken {
                reason: "tripped earlier today".to_string(),
            });
        }

        Ok(())
    }

    fn note_equity(&mut self, equity: f64) {
        if self.state.initial_equity.is_none() && equity > 0.0 {
            self.state.initial_equity = Some(equity);
            tracing::info!(equity, "captured initial equity");
        }
    }

    /// Returns the trip reason when a threshold is currently breached.
    /// Drawdown uses the equity snapshot, not marked-to-market open
    /// positions, so the breaker does not flap with the price.
    fn breaker_reason(&self, equity: f64) -> Option<String> {
        if self.state.daily_pnl.abs() >= self.limits.max_daily_loss_usd {
            return Some(format!(
                "daily PnL ${:.2} beyond limit ${:.2}",
                self.state.daily_pnl, self.limits.max_daily_loss_usd
            ));
        }
        if let Some(initial) = self.state.initial_equity {
            let drawdown = (initial - equity) / initial;
            if drawdown > self.limits.max_drawdown_pct {
                return Some(format!(
                    "drawdown {:.1}% beyond limit {:.1}%",
                    drawdown * 100.0,
                    self.limits.max_drawdown_pct * 100.0
                ));
            }
        }
        None
    }

    fn trip(&mut self, reason: String) {
        if !self.state.tripped {
            tracing::warn!(%reason, "circuit breaker tripped");
            self.state.tripped = true;
        }
    }

    /// On a UTC day change: reset the daily total and un-trip. If drawdown
    /// has not recovered the next gate check trips the breaker again.
    fn rollover(&mut self) {
        let today = self.clock.today_utc();
        if today != self.state.last_reset_day {
            tracing::info!(
                day = %today,
                carried_pnl = self.state.daily_pnl,
                "daily risk reset"
            );
            self.state.daily_pnl = 0.0;
            self.state.tripped = false;
            self.state.last_reset_day = today;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use chrono::{Duration, TimeZone, Utc};

    fn manager() -> (Arc<ManualClock>, RiskManager) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        ));
        let limits = RiskLimits {
            max_position_size_usd: 1_000.0,
            max_daily_loss_usd: 50.0,
            max_drawdown_pct: 0.10,
            max_leverage: 5.0,
        };
        let manager = RiskManager::new(limits, clock.clone());
        (clock, manager)
    }

    fn account(equity: f64, free: f64) -> AccountSnapshot {
        AccountSnapshot {
            equity_usd: equity,
            free_collateral_usd: free,
        }
    }

    #[test]
    fn approves_within_all_limits() {
        let (_clock, mut risk) = manager();
        assert!(risk.allow_entry(100.0, &account(10_000.0, 9_000.0)).is_ok());
    }

    #[test]
    fn rejects_oversized_position() {
        let (_clock, mut risk) = manager();
        let denial = risk
            .allow_entry(1_500.0, &account(10_000.0, 9_000.0))
            .unwrap_err();
        assert!(matches!(denial, RiskDenial::PositionTooLarge { .. }));
    }

    #[test]
    fn rejects_insufficient_collateral() {
        let (_clock, mut risk) = manager();
        // 1000 / 5 = 200 required, only 150 free.
        let denial = risk
            .allow_entry(1_000.0, &account(10_000.0, 150.0))
            .unwrap_err();
        assert!(matches!(denial, RiskDenial::InsufficientCollateral { .. }));
    }

    #[test]
    fn daily_loss_trips_the_breaker() {
        let (_clock, mut risk) = manager();
        risk.update_daily_pnl(-55.0);
        assert!(risk.is_tripped());

        let denial = risk
            .allow_entry(100.0, &account(10_000.0, 9_000.0))
            .unwrap_err();
        assert!(matches!(denial, RiskDenial::CircuitBroken { .. }));
    }

    #[test]
    fn drawdown_trips_the_breaker() {
        let (_clock, mut risk) = manager();
        // First read captures initial equity.
        assert!(risk.allow_entry(100.0, &account(10_000.0, 9_000.0)).is_ok());

        // Equity down 15% against a 10% limit.
        let denial = risk
            .allow_entry(100.0, &account(8_500.0, 8_000.0))
            .unwrap_err();
        assert!(matches!(denial, RiskDenial::CircuitBroken { .. }));
        assert!(risk.is_tripped());
    }

    #[test]
    fn day_change_resets_daily_pnl_and_untrips() {
        let (clock, mut risk) = manager();
        risk.update_daily_pnl(-55.0);
        assert!(risk.is_tripped());

        clock.advance(Duration::days(1));
        assert!(risk.allow_entry(100.0, &account(10_000.0, 9_000.0)).is_ok());
        assert_eq!(risk.daily_pnl(), 0.0);
    }

    #[test]
    fn breaker_stays_tripped_when_drawdown_persists_across_days() {
        let (clock, mut risk) = manager();
        assert!(risk.allow_entry(100.0, &account(10_000.0, 9_000.0)).is_ok());
        assert!(risk
            .allow_entry(100.0, &account(8_500.0, 8_000.0))
            .is_err());

        clock.advance(Duration::days(1));
        // Still 15% under water: trips again on the fresh check.
        let denial = risk
            .allow_entry(100.0, &account(8_500.0, 8_000.0))
            .unwrap_err();
        assert!(matches!(denial, RiskDenial::CircuitBroken { .. }));
    }

    #[test]
    fn replay_counts_only_same_day_trades() {
        use crate::models::{ExitReason, Side, Trade};
        let (_clock, mut risk) = manager();

        let trade = |closed_at, pnl| Trade {
            instrument: "ETH-USD".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            size_base: 1.0,
            size_usd: 100.0,
            stop_loss: 99.0,
            take_profit: 107.0,
            opened_at: closed_at,
            exit_price: 100.0,
            closed_at,
            exit_reason: ExitReason::StopLoss,
            pnl_usd: pnl,
        };

        let yesterday = Utc.with_ymd_and_hms(2024, 2, 29, 18, 0, 0).unwrap();
        let today = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let trades = vec![trade(yesterday, -40.0), trade(today, -20.0), trade(today, -35.0)];

        risk.replay_trades(trades.iter());
        assert_eq!(risk.daily_pnl(), -55.0);
        assert!(risk.is_tripped());
    }

    #[test]
    fn daily_pnl_matches_trade_sum() {
        let (_clock, mut risk) = manager();
        for pnl in [12.5, -7.25, 3.0] {
            risk.update_daily_pnl(pnl);
        }
        assert!((risk.daily_pnl() - 8.25).abs() < 1e-9);
        assert!(!risk.is_tripped());
    }
}
