use crate::clock::Clock;
use crate::execution::PositionManager;
use crate::models::{EntrySignal, ExitReason, Position, Side, Trade};
use crate::persistence::TradeStore;
use crate::risk::{RiskDenial, RiskManager};
use crate::venue::{Fill, OrderSide, VenueClient};
use anyhow::{anyhow, Context};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::timeout;
use uuid::Uuid;

/// Venue lot step for size rounding. ETH-USD on the testnet quantises to
/// 0.001 ETH; we round down one decimal finer and let the venue truncate.
const LOT_STEP: f64 = 0.0001;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    /// Fills are synthesised locally; the venue never sees an order.
    Simulation,
    /// Orders go to the venue and block until filled or timed out.
    Live,
}

/// Result of an entry attempt that did not error.
#[derive(Debug, Clone)]
pub enum EntryOutcome {
    Opened(Position),
    Rejected(RiskDenial),
}

/// Places entries and exits, keeping the position transition, the trade
/// record and the risk accounting one logical step.
pub struct OrderManager {
    venue: Arc<dyn VenueClient>,
    clock: Arc<dyn Clock>,
    mode: ExecutionMode,
    instrument: String,
    order_timeout: Duration,
    query_timeout: Duration,
    positions: Arc<Mutex<PositionManager>>,
    risk: Arc<Mutex<RiskManager>>,
    store: Arc<Mutex<TradeStore>>,
}

impl OrderManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        venue: Arc<dyn VenueClient>,
        clock: Arc<dyn Clock>,
        mode: ExecutionMode,
        instrument: String,
        order_timeout: Duration,
        query_timeout: Duration,
        positions: Arc<Mutex<PositionManager>>,
        risk: Arc<Mutex<RiskManager>>,
        store: Arc<Mutex<TradeStore>>,
    ) -> Self {
        Self {
            venue,
            clock,
            mode,
            instrument,
            order_timeout,
            query_timeout,
            positions,
            risk,
            store,
        }
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    /// Round a base size down to the venue lot grid.
    fn round_lot(size_base: f64) -> f64 {
        (size_base / LOT_STEP).floor() * LOT_STEP
    }

    /// Attempt a long entry. Risk rejection is a normal outcome with no side
    /// effect; order failure or timeout is an error and leaves no position.
    pub async fn open_long(&self, entry: &EntrySignal) -> anyhow::Result<EntryOutcome> {
        let account = timeout(self.query_timeout, self.venue.get_account())
            .await
            .map_err(|_| anyhow!("account query timed out"))?
            .context("account query failed")?;

        {
            let mut risk = self.risk.lock().unwrap();
            if let Err(denial) = risk.allow_entry(entry.size_usd, &account) {
                tracing::info!(%denial, "entry rejected by risk gate");
                return Ok(EntryOutcome::Rejected(denial));
            }
        }

        let size_base = Self::round_lot(entry.size_usd / entry.entry_price);
        if size_base <= 0.0 {
            return Err(anyhow!(
                "size ${} rounds to zero base units at price {}",
                entry.size_usd,
                entry.entry_price
            ));
        }

        let client_id = Uuid::new_v4();
        let fill = match self.mode {
            ExecutionMode::Simulation => {
                tracing::info!(
                    instrument = %self.instrument,
                    size_base,
                    price = entry.entry_price,
                    "simulated market buy"
                );
                Fill {
                    filled_price: entry.entry_price,
                    filled_size: size_base,
                }
            }
            ExecutionMode::Live => {
                self.submit(OrderSide::Buy, size_base, client_id).await?
            }
        };

        let position = Position {
            instrument: self.instrument.clone(),
            side: Side::Long,
            entry_price: fill.filled_price,
            size_base: fill.filled_size,
            size_usd: fill.filled_price * fill.filled_size,
            stop_loss: entry.stop_loss,
            take_profit: entry.take_profit,
            opened_at: self.clock.now(),
        };

        self.positions.lock().unwrap().open(position.clone())?;
        Ok(EntryOutcome::Opened(position))
    }

    /// Close the open position at the observed trigger price. The position
    /// is considered closed even when the trade record fails to persist;
    /// financial truth lives on the venue, not in local storage.
    pub async fn close(&self, price: f64, reason: ExitReason) -> anyhow::Result<Trade> {
        let size_base = {
            let positions = self.positions.lock().unwrap();
            positions
                .current()
                .ok_or_else(|| anyhow!("no open position to close"))?
                .size_base
        };

        let fill = match self.mode {
            ExecutionMode::Simulation => {
                tracing::info!(
                    instrument = %self.instrument,
                    size_base,
                    price,
                    %reason,
                    "simulated market sell"
                );
                Fill {
                    filled_price: price,
                    filled_size: size_base,
                }
            }
            ExecutionMode::Live => {
                self.submit(OrderSide::Sell, size_base, Uuid::new_v4())
                    .await?
            }
        };

        let trade = self.positions.lock().unwrap().close(
            fill.filled_price,
            reason,
            self.clock.now(),
        )?;

        if let Err(err) = self.store.lock().unwrap().append(&trade) {
            tracing::error!(%err, "failed to persist trade; continuing");
        }
        self.risk.lock().unwrap().update_daily_pnl(trade.pnl_usd);

        Ok(trade)
    }

    /// Submit a live market order with a bounded wait for the fill. On
    /// timeout the order is cancelled best-effort and the attempt fails.
    async fn submit(
        &self,
        side: OrderSide,
        size_base: f64,
        client_id: Uuid,
    ) -> anyhow::Result<Fill> {
        match timeout(
            self.order_timeout,
            self.venue
                .place_market_order(&self.instrument, side, size_base, client_id),
        )
        .await
        {
            Ok(Ok(fill)) => Ok(fill),
            Ok(Err(err)) => Err(err.context("order placement failed")),
            Err(_) => {
                if let Err(err) = self.venue.cancel_order(client_id).await {
                    tracing::warn!(%err, %client_id, "cancel after timeout failed");
                }
                Err(anyhow!(
                    "order {} timed out after {:?}",
                    client_id,
                    self.order_timeout
                ))
            }
        }
    }
}
