use crate::models::{ExitReason, Position, Trade};
use anyhow::bail;
use chrono::{DateTime, Utc};

/// Tracks the at-most-one open position per bot instance.
///
/// The held position is never mutated between `open` and `close`; exits are
/// derived from it, not written into it.
#[derive(Default)]
pub struct PositionManager {
    position: Option<Position>,
}

impl PositionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a freshly filled position. Fails if one is already held.
    pub fn open(&mut self, position: Position) -> anyhow::Result<()> {
        if let Some(existing) = &self.position {
            bail!(
                "already holding a {} position opened at {}",
                existing.instrument,
                existing.opened_at
            );
        }
        if !(position.stop_loss < position.entry_price
            && position.entry_price < position.take_profit)
        {
            bail!(
                "invalid exit levels: stop {} / entry {} / take-profit {}",
                position.stop_loss,
                position.entry_price,
                position.take_profit
            );
        }
        tracing::info!(
            instrument = %position.instrument,
            entry = position.entry_price,
            size_base = position.size_base,
            stop_loss = position.stop_loss,
            take_profit = position.take_profit,
            "position opened"
        );
        self.position = Some(position);
        Ok(())
    }

    pub fn current(&self) -> Option<&Position> {
        self.position.as_ref()
    }

    /// Exit decision for the held position at the given price. Exact touches
    /// of either level count.
    pub fn check_exit(&self, price: f64) -> Option<ExitReason> {
        let position = self.position.as_ref()?;
        if price <= position.stop_loss {
            Some(ExitReason::StopLoss)
        } else if price >= position.take_profit {
            Some(ExitReason::TakeProfit)
        } else {
            None
        }
    }

    /// Close the held position into an immutable trade record and release it.
    pub fn close(
        &mut self,
        exit_price: f64,
        reason: ExitReason,
        at: DateTime<Utc>,
    ) -> anyhow::Result<Trade> {
        let Some(position) = self.position.take() else {
            bail!("no open position to close");
        };

        let pnl_usd = (exit_price - position.entry_price) * position.size_base;
        tracing::info!(
            instrument = %position.instrument,
            exit_price,
            %reason,
            pnl_usd,
            "position closed"
        );

        Ok(Trade {
            instrument: position.instrument,
            side: position.side,
            entry_price: position.entry_price,
            size_base: position.size_base,
            size_usd: position.size_usd,
            stop_loss: position.stop_loss,
            take_profit: position.take_profit,
            opened_at: position.opened_at,
            exit_price,
            closed_at: at,
            exit_reason: reason,
            pnl_usd,
        })
    }

    /// Release the held position without closing it (persist-on-shutdown).
    pub fn take(&mut self) -> Option<Position> {
        self.position.take()
    }
}
