use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle granularity supported by the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1m")]
    M1,
    #[serde(rename = "5m")]
    M5,
    #[serde(rename = "15m")]
    M15,
    #[serde(rename = "30m")]
    M30,
    #[serde(rename = "1h")]
    H1,
    #[serde(rename = "4h")]
    H4,
    #[serde(rename = "1d")]
    D1,
}

impl Timeframe {
    pub fn duration(&self) -> Duration {
        match self {
            Timeframe::M1 => Duration::minutes(1),
            Timeframe::M5 => Duration::minutes(5),
            Timeframe::M15 => Duration::minutes(15),
            Timeframe::M30 => Duration::minutes(30),
            Timeframe::H1 => Duration::hours(1),
            Timeframe::H4 => Duration::hours(4),
            Timeframe::D1 => Duration::days(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::M1 => "1m",
            Timeframe::M5 => "5m",
            Timeframe::M15 => "15m",
            Timeframe::M30 => "30m",
            Timeframe::H1 => "1h",
            Timeframe::H4 => "4h",
            Timeframe::D1 => "1d",
        }
    }

    /// Align a timestamp down to the start of the bucket containing it.
    pub fn bucket_start(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let step = self.duration().num_seconds();
        let secs = at.timestamp();
        let aligned = secs - secs.rem_euclid(step);
        Utc.timestamp_opt(aligned, 0).single().unwrap_or(at)
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Timeframe::M1),
            "5m" => Ok(Timeframe::M5),
            "15m" => Ok(Timeframe::M15),
            "30m" => Ok(Timeframe::M30),
            "1h" => Ok(Timeframe::H1),
            "4h" => Ok(Timeframe::H4),
            "1d" => Ok(Timeframe::D1),
            other => Err(format!(
                "unknown timeframe '{}' (expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d)",
                other
            )),
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One OHLCV bar. `start_time` is aligned to the timeframe grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub start_time: DateTime<Utc>,
    pub timeframe: Timeframe,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Seed a fresh candle from the first trade of its bucket.
    pub fn from_trade(timeframe: Timeframe, price: f64, size: f64, at: DateTime<Utc>) -> Self {
        Self {
            start_time: timeframe.bucket_start(at),
            timeframe,
            open: price,
            high: price,
            low: price,
            close: price,
            volume: size,
        }
    }
}

/// A single fill reported by the venue's trade feed.
#[derive(Debug, Clone, PartialEq)]
pub struct VenueTrade {
    pub price: f64,
    pub size: f64,
    pub at: DateTime<Utc>,
}

/// Read-only snapshot of the market as the strategy sees it.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketView {
    pub instrument: String,
    pub latest_price: f64,
    /// Highest high over the resistance lookback of closed candles,
    /// +inf until enough history has accumulated.
    pub resistance_level: f64,
    /// Mean volume over the volume lookback of closed candles, 0.0 until
    /// enough history has accumulated.
    pub average_volume: f64,
    /// Volume of the currently forming candle.
    pub current_volume: f64,
    pub at: DateTime<Utc>,
}

/// A candidate long entry with its exit levels already computed.
#[derive(Debug, Clone, PartialEq)]
pub struct EntrySignal {
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub size_usd: f64,
    pub reasoning: String,
}

/// Strategy output for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    NoSignal,
    EnterLong(EntrySignal),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
}

/// An open long position. Immutable between open and close.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub instrument: String,
    pub side: Side,
    pub entry_price: f64,
    /// Quantity in base units; `size_base = size_usd / entry_price`.
    pub size_base: f64,
    /// Notional at entry.
    pub size_usd: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    ManualClose,
    Shutdown,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::ManualClose => "manual_close",
            ExitReason::Shutdown => "shutdown",
        };
        f.write_str(s)
    }
}

/// A closed position record. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trade {
    pub instrument: String,
    pub side: Side,
    pub entry_price: f64,
    pub size_base: f64,
    pub size_usd: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub opened_at: DateTime<Utc>,
    pub exit_price: f64,
    pub closed_at: DateTime<Utc>,
    pub exit_reason: ExitReason,
    pub pnl_usd: f64,
}

impl Trade {
    pub fn closed_on(&self) -> NaiveDate {
        self.closed_at.date_naive()
    }
}

/// Account margin state, fetched from the venue on demand.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub equity_usd: f64,
    pub free_collateral_usd: f64,
}
