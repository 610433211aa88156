use super::Strategy;
use crate::config::BotConfig;
use crate::models::{EntrySignal, MarketView, Signal};

/// Resistance-breakout entry with volume confirmation.
///
/// The resistance level is derived from *closed* candles so a breakout is a
/// distinct crossing event rather than self-referential; volume confirmation
/// reads the currently forming candle because that is the earliest moment
/// the anomaly is knowable.
#[derive(Debug, Clone)]
pub struct BreakoutParams {
    /// Current-candle volume must reach this multiple of the average.
    pub volume_factor: f64,
    /// Take-profit distance as a multiple of the stop distance.
    pub risk_reward_ratio: f64,
    /// Stop placement below the broken resistance, as a fraction.
    pub stop_offset_pct: f64,
    /// Notional requested per entry (the risk gate may still refuse it).
    pub position_size_usd: f64,
}

impl Default for BreakoutParams {
    fn default() -> Self {
        Self {
            volume_factor: 2.0,
            risk_reward_ratio: 3.0,
            stop_offset_pct: 0.01,
            position_size_usd: 100.0,
        }
    }
}

impl From<&BotConfig> for BreakoutParams {
    fn from(config: &BotConfig) -> Self {
        Self {
            volume_factor: config.volume_factor,
            risk_reward_ratio: config.risk_reward_ratio,
            stop_offset_pct: config.stop_offset_pct,
            position_size_usd: config.position_size_usd,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BreakoutStrategy {
    params: BreakoutParams,
}

impl BreakoutStrategy {
    pub fn new(params: BreakoutParams) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &BreakoutParams {
        &self.params
    }
}

impl Default for BreakoutStrategy {
    fn default() -> Self {
        Self::new(BreakoutParams::default())
    }
}

impl Strategy for BreakoutStrategy {
    fn evaluate(&self, view: &MarketView) -> Signal {
        let price = view.latest_price;
        let resistance = view.resistance_level;
        let average = view.average_volume;

        // Infinite resistance doubles as the "insufficient history" marker.
        if price <= 0.0 || !resistance.is_finite() || average <= 0.0 {
            return Signal::NoSignal;
        }

        // An exact touch of the resistance is not a breakout.
        if price <= resistance {
            return Signal::NoSignal;
        }

        if view.current_volume < self.params.volume_factor * average {
            tracing::debug!(
                price,
                resistance,
                current_volume = view.current_volume,
                average_volume = average,
                "breakout without volume confirmation"
            );
            return Signal::NoSignal;
        }

        let stop_loss = resistance * (1.0 - self.params.stop_offset_pct);
        // At extreme offsets the stop can sit above the entry; skip those.
        if price <= stop_loss {
            return Signal::NoSignal;
        }
        let take_profit = price + self.params.risk_reward_ratio * (price - stop_loss);

        Signal::EnterLong(EntrySignal {
            entry_price: price,
            stop_loss,
            take_profit,
            size_usd: self.params.position_size_usd,
            reasoning: format!(
                "price {:.4} broke resistance {:.4} on {:.1}x average volume",
                price,
                resistance,
                view.current_volume / average
            ),
        })
    }

    fn name(&self) -> &str {
        "BreakoutStrategy"
    }
}
