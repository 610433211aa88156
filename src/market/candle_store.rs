use crate::models::{Candle, Timeframe};
use anyhow::bail;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// Bounded ring of candles for one (instrument, timeframe).
///
/// Closed candles are kept in ascending `start_time` order; at most one
/// candle is open and mutable. `tail` only ever returns closed candles, so
/// derived statistics never read a half-formed bar.
pub struct CandleStore {
    timeframe: Timeframe,
    capacity: usize,
    closed: VecDeque<Candle>,
    open: Option<Candle>,
}

impl CandleStore {
    pub fn new(timeframe: Timeframe, capacity: usize) -> Self {
        Self {
            timeframe,
            capacity,
            closed: VecDeque::with_capacity(capacity),
            open: None,
        }
    }

    pub fn timeframe(&self) -> Timeframe {
        self.timeframe
    }

    /// Atomically replace the store contents with a fresh history.
    ///
    /// The newest candle of the snapshot is treated as the currently forming
    /// one (the venue returns it mid-bucket). Rejects snapshots with a
    /// mismatched timeframe or non-monotonic timestamps; on rejection the
    /// previous contents are left untouched.
    pub fn load_snapshot(&mut self, candles: Vec<Candle>) -> anyhow::Result<()> {
        for candle in &candles {
            if candle.timeframe != self.timeframe {
                bail!(
                    "snapshot timeframe {} does not match store timeframe {}",
                    candle.timeframe,
                    self.timeframe
                );
            }
        }
        for pair in candles.windows(2) {
            if pair[1].start_time <= pair[0].start_time {
                bail!(
                    "snapshot timestamps not strictly increasing at {}",
                    pair[1].start_time
                );
            }
        }

        let mut candles = candles;
        self.open = candles.pop();
        self.closed.clear();
        let skip = candles.len().saturating_sub(self.capacity);
        self.closed.extend(candles.into_iter().skip(skip));
        Ok(())
    }

    /// Fold one trade into the open candle, sealing it first when the trade
    /// falls past the bucket boundary. Trades older than the open candle are
    /// rejected; the caller drops them.
    pub fn apply_trade(
        &mut self,
        price: f64,
        size: f64,
        at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        let bucket = self.timeframe.bucket_start(at);

        match self.open.take() {
            None => {
                self.open = Some(Candle::from_trade(self.timeframe, price, size, at));
            }
            Some(mut open) if bucket == open.start_time => {
                open.high = open.high.max(price);
                open.low = open.low.min(price);
                open.close = price;
                open.volume += size;
                self.open = Some(open);
            }
            Some(open) if bucket > open.start_time => {
                self.push_closed(open);
                self.open = Some(Candle::from_trade(self.timeframe, price, size, at));
            }
            Some(open) => {
                let open_start = open.start_time;
                self.open = Some(open);
                bail!("trade at {} precedes open candle {}", at, open_start);
            }
        }
        Ok(())
    }

    /// Last `k` closed candles, oldest first. The open candle is excluded.
    pub fn tail(&self, k: usize) -> Vec<Candle> {
        let start = self.closed.len().saturating_sub(k);
        self.closed.iter().skip(start).cloned().collect()
    }

    pub fn closed_len(&self) -> usize {
        self.closed.len()
    }

    pub fn open_candle(&self) -> Option<&Candle> {
        self.open.as_ref()
    }

    fn push_closed(&mut self, candle: Candle) {
        self.closed.push_back(candle);
        while self.closed.len() > self.capacity {
            self.closed.pop_front();
        }
    }
}
