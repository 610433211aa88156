//! End-to-end scenarios driving the bot tick-by-tick over the simulated
//! venue with a manual clock.

use breakoutbot::bot::{Bot, BotPhase};
use breakoutbot::clock::{Clock, ManualClock};
use breakoutbot::config::BotConfig;
use breakoutbot::models::{Candle, ExitReason, Side, Timeframe, Trade, VenueTrade};
use breakoutbot::persistence::TradeStore;
use breakoutbot::venue::SimulatedVenue;
use chrono::{DateTime, Duration, TimeZone, Utc};
use std::sync::Arc;

fn start_of_run() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 12, 2, 30).unwrap()
}

/// 24 closed 5m candles with highs <= 100 and volume 1000, plus the forming
/// candle trading at `price` on `volume`.
fn breakout_history(price: f64, volume: f64) -> Vec<Candle> {
    let first = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
    let mut candles: Vec<Candle> = (0..24)
        .map(|i| Candle {
            start_time: first + Duration::minutes(i * 5),
            timeframe: Timeframe::M5,
            open: 98.0,
            high: 99.0 + (i % 3) as f64 * 0.5, // highs between 99 and 100
            low: 97.5,
            close: 98.5,
            volume: 1_000.0,
        })
        .collect();
    candles.push(Candle {
        start_time: first + Duration::minutes(120),
        timeframe: Timeframe::M5,
        open: 100.0,
        high: price,
        low: 99.8,
        close: price,
        volume,
    });
    candles
}

fn config(dir: &std::path::Path) -> BotConfig {
    let mut config = BotConfig::default();
    config.instrument = "ETH-USD".to_string();
    config.timeframe = Timeframe::M5;
    config.volume_factor = 2.5;
    config.resistance_periods = 24;
    config.volume_lookback = 20;
    config.risk_reward_ratio = 3.0;
    config.stop_offset_pct = 0.01;
    config.position_size_usd = 100.0;
    config.max_daily_loss_usd = 50.0;
    config.simulation_mode = false; // route fills through the sim venue
    config.cooldown_s = 300;
    config.data_dir = dir.to_path_buf();
    config
}

async fn setup(
    history: Vec<Candle>,
) -> (Arc<SimulatedVenue>, Arc<ManualClock>, Bot, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(SimulatedVenue::new(10_000.0));
    venue.set_candles(history);

    let clock = Arc::new(ManualClock::new(start_of_run()));
    let mut bot = Bot::new(config(dir.path()), venue.clone(), clock.clone()).unwrap();
    bot.connect().await.unwrap();
    for _ in 0..100 {
        if bot.stream_connected() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(bot.stream_connected(), "stream never came up");
    (venue, clock, bot, dir)
}

/// Feed a trade into the stream and wait until the reader task has applied
/// it. Re-pushes each poll round in case the feed was still (re)connecting.
async fn feed_price(venue: &SimulatedVenue, bot: &Bot, clock: &ManualClock, price: f64) {
    for _ in 0..100 {
        venue.push_trade(VenueTrade {
            price,
            size: 1.0,
            at: clock.now(),
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        if (bot.latest_price() - price).abs() < 1e-9 {
            return;
        }
    }
    panic!("price {} never reached the market view", price);
}

#[tokio::test]
async fn happy_path_breakout_enters_long() {
    // S1: breakout at 101 on 2600 volume against a 1000 average.
    let (venue, _clock, mut bot, _dir) = setup(breakout_history(101.0, 2_600.0)).await;
    venue.set_price(101.0);

    bot.tick().await;

    let position = bot.current_position().expect("expected an open position");
    assert_eq!(position.side, Side::Long);
    assert_eq!(position.entry_price, 101.0);
    assert!((position.stop_loss - 99.0).abs() < 1e-9);
    assert!((position.take_profit - 107.0).abs() < 1e-9);
    assert_eq!(bot.phase(), BotPhase::Running);
}

#[tokio::test]
async fn no_entry_without_volume_confirmation() {
    // S2: volume 1500 < 2.5 * 1000.
    let (venue, _clock, mut bot, _dir) = setup(breakout_history(101.0, 1_500.0)).await;
    venue.set_price(101.0);

    bot.tick().await;

    assert!(bot.current_position().is_none());
}

#[tokio::test]
async fn stop_hit_closes_the_position() {
    // S3: after the S1 entry, prices 100.5, 99.4, 99.0.
    let (venue, clock, mut bot, _dir) = setup(breakout_history(101.0, 2_600.0)).await;
    venue.set_price(101.0);
    bot.tick().await;
    assert!(bot.current_position().is_some());

    for price in [100.5, 99.4] {
        clock.advance(Duration::seconds(5));
        feed_price(&venue, &bot, &clock, price).await;
        bot.tick().await;
        assert!(bot.current_position().is_some(), "no exit above the stop");
    }

    clock.advance(Duration::seconds(5));
    feed_price(&venue, &bot, &clock, 99.0).await;
    bot.tick().await;

    assert!(bot.current_position().is_none());
    let metrics = bot.metrics();
    assert_eq!(metrics.total_trades, 1);
    // pnl = (99 - 101) * round_down(100 / 101)
    let expected = (99.0 - 101.0) * 0.99;
    assert!((bot.daily_pnl() - expected).abs() < 1e-9);
    assert!((metrics.total_pnl - expected).abs() < 1e-9);
}

#[tokio::test]
async fn take_profit_hit_closes_the_position() {
    // S4: after the S1 entry, prices 103, 106, 107.2.
    let (venue, clock, mut bot, _dir) = setup(breakout_history(101.0, 2_600.0)).await;
    venue.set_price(101.0);
    bot.tick().await;

    for price in [103.0, 106.0] {
        clock.advance(Duration::seconds(5));
        feed_price(&venue, &bot, &clock, price).await;
        bot.tick().await;
        assert!(bot.current_position().is_some());
    }

    clock.advance(Duration::seconds(5));
    feed_price(&venue, &bot, &clock, 107.2).await;
    bot.tick().await;

    assert!(bot.current_position().is_none());
    assert!(bot.daily_pnl() > 0.0);
    let expected = (107.2 - 101.0) * 0.99;
    assert!((bot.daily_pnl() - expected).abs() < 1e-9);
}

fn losing_trade(closed_at: DateTime<Utc>, pnl: f64) -> Trade {
    Trade {
        instrument: "ETH-USD".to_string(),
        side: Side::Long,
        entry_price: 100.0,
        size_base: 1.0,
        size_usd: 100.0,
        stop_loss: 99.0,
        take_profit: 107.0,
        opened_at: closed_at - Duration::hours(1),
        exit_price: 100.0 + pnl,
        closed_at,
        exit_reason: ExitReason::StopLoss,
        pnl_usd: pnl,
    }
}

#[tokio::test]
async fn replayed_losses_trip_the_breaker_at_start() {
    // S5: three same-day losers summing to -55 against a $50 limit.
    let dir = tempfile::tempdir().unwrap();
    {
        let mut store = TradeStore::open(dir.path()).unwrap();
        let closed_at = start_of_run() - Duration::hours(2);
        for pnl in [-20.0, -20.0, -15.0] {
            store.append(&losing_trade(closed_at, pnl)).unwrap();
        }
    }

    let venue = Arc::new(SimulatedVenue::new(10_000.0));
    venue.set_candles(breakout_history(101.0, 2_600.0));
    venue.set_price(101.0);
    let clock = Arc::new(ManualClock::new(start_of_run()));

    let mut bot = Bot::new(config(dir.path()), venue.clone(), clock.clone()).unwrap();
    assert!(bot.startup_breaker_tripped());
    assert_eq!(bot.daily_pnl(), -55.0);

    // If run anyway, breakout conditions are ignored.
    bot.connect().await.unwrap();
    bot.tick().await;
    assert!(bot.current_position().is_none());
    assert_eq!(bot.phase(), BotPhase::CircuitBroken);
}

#[tokio::test]
async fn stream_disconnect_keeps_the_position_and_recovers() {
    // S6: the stream drops while a position is open.
    let (venue, clock, mut bot, _dir) = setup(breakout_history(101.0, 2_600.0)).await;
    venue.set_price(101.0);
    bot.tick().await;
    assert!(bot.current_position().is_some());

    let last_price = bot.latest_price();
    venue.drop_stream();
    // Wait for the reader task to observe the closed channel.
    for _ in 0..100 {
        if !bot.stream_connected() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(!bot.stream_connected(), "reader never saw the disconnect");

    clock.advance(Duration::seconds(5));
    bot.tick().await;
    assert_eq!(bot.phase(), BotPhase::Reconnecting);
    assert_eq!(bot.latest_price(), last_price);
    assert!(bot.current_position().is_some());

    // Backoff starts at one second; wait for the resubscribe + re-snapshot.
    for _ in 0..300 {
        if venue.has_subscriber() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(venue.has_subscriber(), "stream never reconnected");

    clock.advance(Duration::seconds(5));
    bot.tick().await;
    assert_eq!(bot.phase(), BotPhase::Running);
    assert!(bot.current_position().is_some());
}

#[tokio::test]
async fn shutdown_closes_the_open_position() {
    let (venue, _clock, mut bot, dir) = setup(breakout_history(101.0, 2_600.0)).await;
    venue.set_price(101.0);
    bot.tick().await;
    assert!(bot.current_position().is_some());

    bot.shutdown().await;

    assert_eq!(bot.phase(), BotPhase::Stopped);
    assert!(bot.current_position().is_none());
    let store = TradeStore::open(dir.path()).unwrap();
    assert_eq!(store.trades().len(), 1);
    assert_eq!(store.trades()[0].exit_reason, ExitReason::Shutdown);
}

#[tokio::test]
async fn shutdown_can_persist_the_open_position() {
    let dir = tempfile::tempdir().unwrap();
    let venue = Arc::new(SimulatedVenue::new(10_000.0));
    venue.set_candles(breakout_history(101.0, 2_600.0));
    venue.set_price(101.0);
    let clock = Arc::new(ManualClock::new(start_of_run()));

    let mut cfg = config(dir.path());
    cfg.persist_position_on_shutdown = true;
    let mut bot = Bot::new(cfg, venue.clone(), clock.clone()).unwrap();
    bot.connect().await.unwrap();
    bot.tick().await;
    let position = bot.current_position().expect("expected an open position");

    bot.shutdown().await;
    assert!(bot.current_position().is_none());

    // A fresh bot picks the position back up.
    let restarted = Bot::new(config(dir.path()), venue, clock).unwrap();
    assert_eq!(restarted.current_position(), Some(position));
}
