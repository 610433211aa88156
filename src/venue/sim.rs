use crate::models::{AccountSnapshot, Candle, Timeframe, VenueTrade};
use crate::venue::{Fill, OrderSide, VenueClient};
use crate::Result;
use anyhow::bail;
use async_trait::async_trait;
use std::sync::Mutex;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Initial-margin fraction applied to open notional when deriving free
/// collateral (20%, matching 5x leverage on the testnet).
const MARGIN_FRACTION: f64 = 0.2;

struct SimState {
    candles: Vec<Candle>,
    last_price: f64,
    equity_usd: f64,
    /// (entry price, base size) of the held long, if any.
    open_lot: Option<(f64, f64)>,
    trade_tx: Option<mpsc::Sender<VenueTrade>>,
    fail_orders: bool,
}

/// Deterministic in-memory venue for tests and offline simulation runs.
///
/// Honours a configured starting equity and tracks realised PnL through
/// fills so the risk gate sees a realistic account.
pub struct SimulatedVenue {
    state: Mutex<SimState>,
}

impl SimulatedVenue {
    pub fn new(initial_equity_usd: f64) -> Self {
        Self {
            state: Mutex::new(SimState {
                candles: Vec::new(),
                last_price: 0.0,
                equity_usd: initial_equity_usd,
                open_lot: None,
                trade_tx: None,
                fail_orders: false,
            }),
        }
    }

    /// Replace the candle history served by `get_candles`.
    pub fn set_candles(&self, candles: Vec<Candle>) {
        let mut state = self.state.lock().unwrap();
        if let Some(last) = candles.last() {
            if state.last_price <= 0.0 {
                state.last_price = last.close;
            }
        }
        state.candles = candles;
    }

    /// Set the price the next market order fills at.
    pub fn set_price(&self, price: f64) {
        self.state.lock().unwrap().last_price = price;
    }

    /// Push a trade into the live feed (no-op without a subscriber).
    pub fn push_trade(&self, trade: VenueTrade) {
        let tx = {
            let mut state = self.state.lock().unwrap();
            state.last_price = trade.price;
            state.trade_tx.clone()
        };
        if let Some(tx) = tx {
            if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(trade) {
                self.state.lock().unwrap().trade_tx = None;
            }
        }
    }

    /// Drop the feed sender, simulating a stream disconnect.
    pub fn drop_stream(&self) {
        self.state.lock().unwrap().trade_tx = None;
    }

    pub fn has_subscriber(&self) -> bool {
        self.state.lock().unwrap().trade_tx.is_some()
    }

    /// Make subsequent order submissions fail, for error-path tests.
    pub fn fail_orders(&self, fail: bool) {
        self.state.lock().unwrap().fail_orders = fail;
    }

    pub fn equity(&self) -> f64 {
        self.state.lock().unwrap().equity_usd
    }
}

#[async_trait]
impl VenueClient for SimulatedVenue {
    async fn get_candles(
        &self,
        _instrument: &str,
        _timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let state = self.state.lock().unwrap();
        let start = state.candles.len().saturating_sub(limit);
        Ok(state.candles[start..].to_vec())
    }

    async fn subscribe_trades(&self, _instrument: &str) -> Result<mpsc::Receiver<VenueTrade>> {
        let (tx, rx) = mpsc::channel(64);
        self.state.lock().unwrap().trade_tx = Some(tx);
        Ok(rx)
    }

    async fn get_account(&self) -> Result<AccountSnapshot> {
        let state = self.state.lock().unwrap();
        let open_notional = state
            .open_lot
            .map(|(price, size)| price * size)
            .unwrap_or(0.0);
        Ok(AccountSnapshot {
            equity_usd: state.equity_usd,
            free_collateral_usd: state.equity_usd - open_notional * MARGIN_FRACTION,
        })
    }

    async fn place_market_order(
        &self,
        _instrument: &str,
        side: OrderSide,
        size_base: f64,
        _client_id: Uuid,
    ) -> Result<Fill> {
        let mut state = self.state.lock().unwrap();
        if state.fail_orders {
            bail!("simulated order rejection");
        }
        if state.last_price <= 0.0 {
            bail!("no mark price available");
        }
        let price = state.last_price;

        match side {
            OrderSide::Buy => {
                if state.open_lot.is_some() {
                    bail!("already holding a lot");
                }
                state.open_lot = Some((price, size_base));
            }
            OrderSide::Sell => {
                let Some((entry, held)) = state.open_lot.take() else {
                    bail!("no lot to sell");
                };
                if size_base > held + f64::EPSILON {
                    state.open_lot = Some((entry, held));
                    bail!("sell size {} exceeds held {}", size_base, held);
                }
                state.equity_usd += (price - entry) * size_base;
                let remaining = held - size_base;
                if remaining > f64::EPSILON {
                    state.open_lot = Some((entry, remaining));
                }
            }
        }

        Ok(Fill {
            filled_price: price,
            filled_size: size_base,
        })
    }

    async fn cancel_order(&self, _client_id: Uuid) -> Result<()> {
        Ok(())
    }
}
