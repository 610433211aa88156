use crate::models::{Position, Trade};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Aggregate performance over the recorded trades.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub total_pnl: f64,
    /// Winning fraction of all trades, as a percentage.
    pub win_rate: f64,
    pub avg_win: f64,
    /// Average losing trade, as a positive magnitude.
    pub avg_loss: f64,
    /// Gross profit over gross loss; +inf when loss-free and profitable,
    /// 0 when there are no trades at all.
    pub profit_factor: f64,
    /// Maximum peak-to-trough decline of the cumulative PnL series, in USD.
    pub max_drawdown: f64,
}

impl PerformanceMetrics {
    pub fn from_trades(trades: &[Trade]) -> Self {
        let total_trades = trades.len();
        let total_pnl: f64 = trades.iter().map(|t| t.pnl_usd).sum();

        let wins: Vec<f64> = trades
            .iter()
            .map(|t| t.pnl_usd)
            .filter(|p| *p > 0.0)
            .collect();
        let losses: Vec<f64> = trades
            .iter()
            .map(|t| t.pnl_usd)
            .filter(|p| *p <= 0.0)
            .collect();

        let gross_profit: f64 = wins.iter().sum();
        let gross_loss: f64 = losses.iter().map(|p| p.abs()).sum();

        let win_rate = if total_trades > 0 {
            (wins.len() as f64 / total_trades as f64) * 100.0
        } else {
            0.0
        };
        let avg_win = if wins.is_empty() {
            0.0
        } else {
            gross_profit / wins.len() as f64
        };
        let avg_loss = if losses.is_empty() {
            0.0
        } else {
            gross_loss / losses.len() as f64
        };
        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let mut peak = 0.0_f64;
        let mut cumulative = 0.0_f64;
        let mut max_drawdown = 0.0_f64;
        for trade in trades {
            cumulative += trade.pnl_usd;
            peak = peak.max(cumulative);
            max_drawdown = max_drawdown.max(peak - cumulative);
        }

        Self {
            total_trades,
            total_pnl,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            max_drawdown,
        }
    }
}

/// Append-only trade log plus derived state files.
///
/// `trades.jsonl` holds one trade per line, appended and flushed per record;
/// `performance.json` is overwritten after each append with the latest
/// metrics; `bot_state.json` carries an open position across restarts.
pub struct TradeStore {
    trades_path: PathBuf,
    performance_path: PathBuf,
    state_path: PathBuf,
    file: File,
    trades: Vec<Trade>,
}

impl TradeStore {
    pub fn open(dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;

        let trades_path = dir.join("trades.jsonl");
        let trades = Self::read_trades(&trades_path)?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&trades_path)
            .with_context(|| format!("failed to open {}", trades_path.display()))?;

        Ok(Self {
            trades_path,
            performance_path: dir.join("performance.json"),
            state_path: dir.join("bot_state.json"),
            file,
            trades,
        })
    }

    fn read_trades(path: &Path) -> anyhow::Result<Vec<Trade>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", path.display()))
            }
        };

        let reader = BufReader::new(file);
        let lines: Vec<String> = reader.lines().collect::<std::io::Result<_>>()?;
        let last = lines.len().saturating_sub(1);

        let mut trades = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Trade>(line) {
                Ok(trade) => trades.push(trade),
                Err(err) if i == last => {
                    // A truncated final record means the process died
                    // mid-write; drop it silently.
                    tracing::debug!(%err, "dropping truncated final trade record");
                }
                Err(err) => {
                    tracing::debug!(%err, line = i + 1, "skipping malformed trade record");
                }
            }
        }
        Ok(trades)
    }

    /// Append one trade (flush-per-record) and refresh performance.json.
    pub fn append(&mut self, trade: &Trade) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(trade)?;
        line.push('\n');
        self.file
            .write_all(line.as_bytes())
            .with_context(|| format!("failed to append to {}", self.trades_path.display()))?;
        self.file.flush()?;

        self.trades.push(trade.clone());

        if let Err(err) = self.write_performance() {
            tracing::warn!(%err, "failed to refresh performance snapshot");
        }
        Ok(())
    }

    pub fn trades(&self) -> &[Trade] {
        &self.trades
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        PerformanceMetrics::from_trades(&self.trades)
    }

    pub fn flush(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        Ok(())
    }

    fn write_performance(&self) -> anyhow::Result<()> {
        let body = serde_json::to_string_pretty(&self.metrics())?;
        std::fs::write(&self.performance_path, body)
            .with_context(|| format!("failed to write {}", self.performance_path.display()))?;
        Ok(())
    }

    /// Persist an open position for restart-with-open-position workflows.
    pub fn save_open_position(&self, position: &Position) -> anyhow::Result<()> {
        let body = serde_json::to_string_pretty(position)?;
        std::fs::write(&self.state_path, body)
            .with_context(|| format!("failed to write {}", self.state_path.display()))?;
        Ok(())
    }

    pub fn load_open_position(&self) -> Option<Position> {
        let raw = std::fs::read_to_string(&self.state_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(position) => Some(position),
            Err(err) => {
                tracing::debug!(%err, "ignoring unreadable bot_state.json");
                None
            }
        }
    }

    pub fn clear_open_position(&self) {
        let _ = std::fs::remove_file(&self.state_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ExitReason, Side};
    use chrono::{TimeZone, Utc};

    fn trade(pnl: f64) -> Trade {
        let opened = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Trade {
            instrument: "ETH-USD".to_string(),
            side: Side::Long,
            entry_price: 100.0,
            size_base: 1.0,
            size_usd: 100.0,
            stop_loss: 99.0,
            take_profit: 107.0,
            opened_at: opened,
            exit_price: 100.0 + pnl,
            closed_at: opened + chrono::Duration::hours(1),
            exit_reason: if pnl >= 0.0 {
                ExitReason::TakeProfit
            } else {
                ExitReason::StopLoss
            },
            pnl_usd: pnl,
        }
    }

    #[test]
    fn append_and_reload_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TradeStore::open(dir.path()).unwrap();
            store.append(&trade(10.0)).unwrap();
            store.append(&trade(-5.0)).unwrap();
        }

        let store = TradeStore::open(dir.path()).unwrap();
        assert_eq!(store.trades().len(), 2);
        assert_eq!(store.trades()[0].pnl_usd, 10.0);
        assert_eq!(store.trades()[1].pnl_usd, -5.0);
    }

    #[test]
    fn reload_yields_identical_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let before = {
            let mut store = TradeStore::open(dir.path()).unwrap();
            for pnl in [12.0, -4.0, 30.0, -11.0] {
                store.append(&trade(pnl)).unwrap();
            }
            store.metrics()
        };

        let after = TradeStore::open(dir.path()).unwrap().metrics();
        assert_eq!(before, after);
    }

    #[test]
    fn truncated_final_record_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut store = TradeStore::open(dir.path()).unwrap();
            store.append(&trade(10.0)).unwrap();
        }

        // Simulate a crash mid-append.
        let path = dir.path().join("trades.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(b"{\"instrument\":\"ETH-USD\",\"side\"").unwrap();

        let store = TradeStore::open(dir.path()).unwrap();
        assert_eq!(store.trades().len(), 1);
    }

    #[test]
    fn appends_never_rewrite_existing_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trades.jsonl");

        let mut store = TradeStore::open(dir.path()).unwrap();
        store.append(&trade(10.0)).unwrap();
        let first = std::fs::read(&path).unwrap();

        store.append(&trade(-5.0)).unwrap();
        let second = std::fs::read(&path).unwrap();

        assert!(second.len() > first.len());
        assert_eq!(&second[..first.len()], &first[..]);
    }

    #[test]
    fn performance_snapshot_is_written_after_append() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = TradeStore::open(dir.path()).unwrap();
        store.append(&trade(10.0)).unwrap();

        let raw = std::fs::read_to_string(dir.path().join("performance.json")).unwrap();
        let metrics: PerformanceMetrics = serde_json::from_str(&raw).unwrap();
        assert_eq!(metrics.total_trades, 1);
        assert_eq!(metrics.total_pnl, 10.0);
    }

    #[test]
    fn metrics_on_mixed_trades() {
        let trades: Vec<Trade> = [100.0, 50.0, -25.0, -25.0].map(trade).into_iter().collect();
        let metrics = PerformanceMetrics::from_trades(&trades);

        assert_eq!(metrics.total_trades, 4);
        assert_eq!(metrics.total_pnl, 100.0);
        assert_eq!(metrics.win_rate, 50.0);
        assert_eq!(metrics.avg_win, 75.0);
        assert_eq!(metrics.avg_loss, 25.0);
        assert_eq!(metrics.profit_factor, 3.0);
        // Peak 150 after two wins, trough 100 after two losses.
        assert_eq!(metrics.max_drawdown, 50.0);
    }

    #[test]
    fn profit_factor_edge_cases() {
        let loss_free: Vec<Trade> = [10.0, 20.0].map(trade).into_iter().collect();
        assert!(PerformanceMetrics::from_trades(&loss_free)
            .profit_factor
            .is_infinite());

        assert_eq!(PerformanceMetrics::from_trades(&[]).profit_factor, 0.0);
        assert_eq!(PerformanceMetrics::from_trades(&[]).total_trades, 0);
    }

    #[test]
    fn open_position_round_trips_through_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = TradeStore::open(dir.path()).unwrap();
        assert!(store.load_open_position().is_none());

        let position = Position {
            instrument: "ETH-USD".to_string(),
            side: Side::Long,
            entry_price: 101.0,
            size_base: 0.99,
            size_usd: 99.99,
            stop_loss: 99.0,
            take_profit: 107.0,
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
        };
        store.save_open_position(&position).unwrap();
        assert_eq!(store.load_open_position(), Some(position));

        store.clear_open_position();
        assert!(store.load_open_position().is_none());
    }
}
