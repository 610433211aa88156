// Trading strategy module
pub mod breakout;

use crate::models::{MarketView, Signal};

pub use breakout::{BreakoutParams, BreakoutStrategy};

/// Base trait for all trading strategies.
pub trait Strategy: Send + Sync {
    /// Evaluate the current market view and decide whether to enter.
    /// A not-ready view (infinite resistance, zero average volume) must
    /// yield `Signal::NoSignal`.
    fn evaluate(&self, view: &MarketView) -> Signal;

    /// Get strategy name
    fn name(&self) -> &str;
}
