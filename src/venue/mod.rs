// Venue access: market data, account state, order placement.
pub mod indexer;
pub mod sim;

use crate::models::{AccountSnapshot, Candle, Timeframe, VenueTrade};
use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

pub use indexer::IndexerClient;
pub use sim::SimulatedVenue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Fill confirmation for a market order.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fill {
    pub filled_price: f64,
    pub filled_size: f64,
}

/// Abstract venue capability. Networking, authentication and wire formats
/// live entirely inside implementations.
#[async_trait]
pub trait VenueClient: Send + Sync {
    /// Fetch the most recent `limit` candles, oldest first. The last candle
    /// may still be forming.
    async fn get_candles(
        &self,
        instrument: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>>;

    /// Subscribe to the live trade feed. The returned channel closes when
    /// the underlying connection drops; reconnection is the caller's job.
    async fn subscribe_trades(&self, instrument: &str) -> Result<mpsc::Receiver<VenueTrade>>;

    async fn get_account(&self) -> Result<AccountSnapshot>;

    /// Submit a market order and block until it fills. `client_id` is reused
    /// on retries so the venue can de-duplicate.
    async fn place_market_order(
        &self,
        instrument: &str,
        side: OrderSide,
        size_base: f64,
        client_id: Uuid,
    ) -> Result<Fill>;

    /// Best-effort cancellation of an in-flight order.
    async fn cancel_order(&self, client_id: Uuid) -> Result<()>;
}
