use crate::clock::Clock;
use crate::config::BotConfig;
use crate::market::CandleStore;
use crate::models::{MarketView, Timeframe, VenueTrade};
use crate::venue::VenueClient;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Stream reconnect backoff bounds.
const BACKOFF_START: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

struct Book {
    store: CandleStore,
    latest_price: f64,
}

/// Keeps the candle store fresh from two paths (REST snapshots and the live
/// trade stream) and publishes consistent `MarketView` copies on demand.
///
/// All shared state sits behind a single mutex; every public read or write
/// is one acquisition, and callers never hold the lock.
pub struct MarketData {
    venue: Arc<dyn VenueClient>,
    clock: Arc<dyn Clock>,
    instrument: String,
    timeframe: Timeframe,
    resistance_periods: usize,
    volume_lookback: usize,
    history: usize,
    query_timeout: Duration,
    inner: Mutex<Book>,
    connected: AtomicBool,
}

impl MarketData {
    pub fn new(
        venue: Arc<dyn VenueClient>,
        clock: Arc<dyn Clock>,
        config: &BotConfig,
    ) -> Self {
        Self {
            venue,
            clock,
            instrument: config.instrument.clone(),
            timeframe: config.timeframe,
            resistance_periods: config.resistance_periods,
            volume_lookback: config.volume_lookback,
            history: config.candle_history,
            query_timeout: Duration::from_secs(config.query_timeout_s),
            inner: Mutex::new(Book {
                store: CandleStore::new(config.timeframe, config.candle_history),
                latest_price: 0.0,
            }),
            connected: AtomicBool::new(false),
        }
    }

    /// Fetch a fresh candle history and atomically replace the store.
    /// Returns the number of candles loaded.
    pub async fn snapshot(&self) -> anyhow::Result<usize> {
        let candles = timeout(
            self.query_timeout,
            self.venue
                .get_candles(&self.instrument, self.timeframe, self.history),
        )
        .await
        .map_err(|_| anyhow::anyhow!("candle snapshot timed out"))??;

        let count = candles.len();
        let last_close = candles.last().map(|c| c.close);

        let mut book = self.inner.lock().unwrap();
        book.store.load_snapshot(candles)?;
        if book.latest_price <= 0.0 {
            // Seed the price before the first stream trade arrives.
            if let Some(close) = last_close {
                book.latest_price = close;
            }
        }
        Ok(count)
    }

    /// Spawn the long-lived stream reader. Reconnects with exponential
    /// backoff forever; each (re)connect re-snapshots to close the gap and
    /// drops trades that raced the snapshot.
    pub fn start_stream(self: &Arc<Self>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut backoff = BACKOFF_START;
            loop {
                match this.venue.subscribe_trades(&this.instrument).await {
                    Ok(mut rx) => {
                        if let Err(err) = this.snapshot().await {
                            tracing::warn!(%err, "re-snapshot after connect failed");
                        }
                        while rx.try_recv().is_ok() {}

                        this.connected.store(true, Ordering::SeqCst);
                        backoff = BACKOFF_START;
                        tracing::info!(instrument = %this.instrument, "trade stream connected");

                        while let Some(trade) = rx.recv().await {
                            this.apply(trade);
                        }

                        this.connected.store(false, Ordering::SeqCst);
                        tracing::warn!(instrument = %this.instrument, "trade stream closed");
                    }
                    Err(err) => {
                        tracing::warn!(%err, "trade stream connect failed");
                    }
                }
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(BACKOFF_CAP);
            }
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Consistent snapshot of price and derived statistics, computed under
    /// one lock acquisition. Before enough closed candles exist the view
    /// carries `resistance_level = +inf` and `average_volume = 0`, which the
    /// strategy reads as "not ready".
    pub fn current_market_view(&self) -> MarketView {
        let book = self.inner.lock().unwrap();

        let resistance_level = if book.store.closed_len() >= self.resistance_periods {
            book.store
                .tail(self.resistance_periods)
                .iter()
                .map(|c| c.high)
                .fold(f64::NEG_INFINITY, f64::max)
        } else {
            f64::INFINITY
        };

        let average_volume = if book.store.closed_len() >= self.volume_lookback {
            let tail = book.store.tail(self.volume_lookback);
            tail.iter().map(|c| c.volume).sum::<f64>() / tail.len() as f64
        } else {
            0.0
        };

        let current_volume = book.store.open_candle().map(|c| c.volume).unwrap_or(0.0);

        MarketView {
            instrument: self.instrument.clone(),
            latest_price: book.latest_price,
            resistance_level,
            average_volume,
            current_volume,
            at: self.clock.now(),
        }
    }

    pub fn latest_price(&self) -> f64 {
        self.inner.lock().unwrap().latest_price
    }

    fn apply(&self, trade: VenueTrade) {
        let mut book = self.inner.lock().unwrap();
        if trade.price > 0.0 {
            book.latest_price = trade.price;
        }
        if let Err(err) = book.store.apply_trade(trade.price, trade.size, trade.at) {
            tracing::debug!(%err, "dropping trade");
        }
    }
}
