use crate::clock::Clock;
use crate::config::BotConfig;
use crate::execution::{EntryOutcome, ExecutionMode, OrderManager, PositionManager};
use crate::market::MarketData;
use crate::models::{ExitReason, Position, Signal};
use crate::persistence::{PerformanceMetrics, TradeStore};
use crate::risk::{RiskDenial, RiskLimits, RiskManager};
use crate::strategy::{BreakoutParams, BreakoutStrategy, Strategy};
use crate::venue::VenueClient;
use anyhow::Context;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Overall bot lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotPhase {
    Initialising,
    Running,
    Reconnecting,
    /// Risk limits breached: existing position still managed, no new entries.
    CircuitBroken,
    Stopping,
    Stopped,
}

/// Orchestrates market data, strategy, risk and execution on a periodic
/// tick. The loop is the top-level supervisor: no error escapes it.
pub struct Bot {
    config: BotConfig,
    clock: Arc<dyn Clock>,
    market: Arc<MarketData>,
    strategy: Box<dyn Strategy>,
    risk: Arc<Mutex<RiskManager>>,
    positions: Arc<Mutex<PositionManager>>,
    orders: OrderManager,
    store: Arc<Mutex<TradeStore>>,
    phase: BotPhase,
    last_snapshot: Option<DateTime<Utc>>,
    cooldown_until: Option<DateTime<Utc>>,
    stream_task: Option<JoinHandle<()>>,
}

impl Bot {
    pub fn new(
        config: BotConfig,
        venue: Arc<dyn VenueClient>,
        clock: Arc<dyn Clock>,
    ) -> anyhow::Result<Self> {
        config.validate()?;

        let store = TradeStore::open(&config.data_dir)?;
        let mut risk = RiskManager::new(RiskLimits::from(&config), clock.clone());
        risk.replay_trades(store.trades());
        if risk.daily_pnl() != 0.0 {
            tracing::info!(
                daily_pnl = risk.daily_pnl(),
                "replayed same-day trades into risk state"
            );
        }

        let mut positions = PositionManager::new();
        if let Some(position) = store.load_open_position() {
            tracing::info!(
                instrument = %position.instrument,
                entry = position.entry_price,
                "restoring persisted open position"
            );
            positions.open(position)?;
            store.clear_open_position();
        }

        let market = Arc::new(MarketData::new(venue.clone(), clock.clone(), &config));
        let strategy = Box::new(BreakoutStrategy::new(BreakoutParams::from(&config)));

        let mode = if config.simulation_mode {
            ExecutionMode::Simulation
        } else {
            ExecutionMode::Live
        };
        let risk = Arc::new(Mutex::new(risk));
        let positions = Arc::new(Mutex::new(positions));
        let store = Arc::new(Mutex::new(store));
        let orders = OrderManager::new(
            venue,
            clock.clone(),
            mode,
            config.instrument.clone(),
            Duration::from_secs(config.order_timeout_s),
            Duration::from_secs(config.query_timeout_s),
            positions.clone(),
            risk.clone(),
            store.clone(),
        );

        Ok(Self {
            config,
            clock,
            market,
            strategy,
            risk,
            positions,
            orders,
            store,
            phase: BotPhase::Initialising,
            last_snapshot: None,
            cooldown_until: None,
            stream_task: None,
        })
    }

    pub fn phase(&self) -> BotPhase {
        self.phase
    }

    /// True when the replayed same-day PnL already trips the breaker
    /// (start-up exit code 3).
    pub fn startup_breaker_tripped(&self) -> bool {
        self.risk.lock().unwrap().is_tripped()
    }

    pub fn current_position(&self) -> Option<Position> {
        self.positions.lock().unwrap().current().cloned()
    }

    pub fn daily_pnl(&self) -> f64 {
        self.risk.lock().unwrap().daily_pnl()
    }

    pub fn latest_price(&self) -> f64 {
        self.market.latest_price()
    }

    pub fn stream_connected(&self) -> bool {
        self.market.is_connected()
    }

    pub fn metrics(&self) -> PerformanceMetrics {
        self.store.lock().unwrap().metrics()
    }

    /// First snapshot plus stream start. Failing here means the venue could
    /// not be reached at all (start-up exit code 2).
    pub async fn connect(&mut self) -> anyhow::Result<()> {
        let count = self
            .market
            .snapshot()
            .await
            .context("initial candle snapshot failed")?;
        self.last_snapshot = Some(self.clock.now());

        tracing::info!(
            instrument = %self.config.instrument,
            timeframe = %self.config.timeframe,
            candles = count,
            volume_factor = self.config.volume_factor,
            resistance_periods = self.config.resistance_periods,
            risk_reward = self.config.risk_reward_ratio,
            position_size_usd = self.config.position_size_usd,
            update_interval_s = self.config.update_interval_s,
            simulation = self.config.simulation_mode,
            "bot connected"
        );

        self.stream_task = Some(self.market.start_stream());
        self.phase = BotPhase::Running;
        Ok(())
    }

    /// Tick until a shutdown signal arrives.
    pub async fn run(&mut self) -> anyhow::Result<()> {
        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.config.update_interval_s));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let shutdown = tokio::signal::ctrl_c();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                result = &mut shutdown => {
                    if let Err(err) = result {
                        tracing::warn!(%err, "signal listener failed");
                    }
                    tracing::info!("shutdown signal received");
                    break;
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One control-loop cycle: refresh data, supervise the open position,
    /// otherwise look for an entry. Exits are checked before entries; a stop
    /// hit and a new entry never share a tick.
    pub async fn tick(&mut self) {
        let now = self.clock.now();

        // Safety-net snapshot. A failure skips entry evaluation for this
        // tick but never stops position supervision.
        let snapshot_interval = ChronoDuration::seconds(self.config.snapshot_interval_s as i64);
        let mut data_suspect = false;
        let stale = self
            .last_snapshot
            .map(|at| now - at >= snapshot_interval)
            .unwrap_or(true);
        if stale {
            match self.market.snapshot().await {
                Ok(_) => self.last_snapshot = Some(now),
                Err(err) => {
                    tracing::warn!(%err, "candle snapshot failed, retrying next tick");
                    data_suspect = true;
                }
            }
        }

        match (self.phase, self.market.is_connected()) {
            (BotPhase::Running, false) => {
                tracing::warn!("trade stream down, running on last known price");
                self.phase = BotPhase::Reconnecting;
            }
            (BotPhase::Reconnecting, true) => {
                tracing::info!("trade stream restored");
                self.phase = BotPhase::Running;
            }
            _ => {}
        }

        let view = self.market.current_market_view();
        if view.latest_price <= 0.0 {
            tracing::debug!("no market price yet");
            return;
        }

        let held = self.positions.lock().unwrap().current().is_some();
        if held {
            let exit = self.positions.lock().unwrap().check_exit(view.latest_price);
            if let Some(reason) = exit {
                match self.orders.close(view.latest_price, reason).await {
                    Ok(trade) => {
                        tracing::info!(
                            pnl_usd = trade.pnl_usd,
                            %reason,
                            "exit filled, cooling down"
                        );
                        self.cooldown_until = Some(
                            now + ChronoDuration::seconds(self.config.cooldown_s as i64),
                        );
                        if self.risk.lock().unwrap().is_tripped() {
                            self.phase = BotPhase::CircuitBroken;
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "failed to close position, will retry");
                    }
                }
            }
            return;
        }

        if data_suspect {
            return;
        }
        if let Some(until) = self.cooldown_until {
            if now < until {
                tracing::debug!(until = %until, "post-exit cooldown");
                return;
            }
            self.cooldown_until = None;
        }

        // A tripped breaker clears on the UTC day boundary; reflect that in
        // the phase before evaluating.
        if self.phase == BotPhase::CircuitBroken && !self.risk.lock().unwrap().is_tripped() {
            self.phase = BotPhase::Running;
        }

        match self.strategy.evaluate(&view) {
            Signal::NoSignal => {}
            Signal::EnterLong(entry) => {
                tracing::info!(reasoning = %entry.reasoning, "entry signal");
                match self.orders.open_long(&entry).await {
                    Ok(EntryOutcome::Opened(position)) => {
                        tracing::info!(
                            entry = position.entry_price,
                            stop_loss = position.stop_loss,
                            take_profit = position.take_profit,
                            "long position opened"
                        );
                    }
                    Ok(EntryOutcome::Rejected(denial)) => {
                        if matches!(denial, RiskDenial::CircuitBroken { .. }) {
                            self.phase = BotPhase::CircuitBroken;
                        }
                    }
                    Err(err) => {
                        tracing::error!(%err, "order placement failed");
                    }
                }
            }
        }
    }

    /// Stop ticking, deal with any open position, flush the store.
    pub async fn shutdown(&mut self) {
        self.phase = BotPhase::Stopping;
        if let Some(task) = self.stream_task.take() {
            task.abort();
        }

        let open = self.positions.lock().unwrap().current().cloned();
        if let Some(position) = open {
            if self.config.persist_position_on_shutdown {
                match self.store.lock().unwrap().save_open_position(&position) {
                    Ok(()) => {
                        let _ = self.positions.lock().unwrap().take();
                        tracing::info!("open position persisted for restart");
                    }
                    Err(err) => {
                        tracing::error!(%err, "failed to persist open position");
                    }
                }
            } else {
                let mut price = self.market.latest_price();
                if price <= 0.0 {
                    price = position.entry_price;
                }
                let grace = Duration::from_secs(self.config.shutdown_grace_s);
                match tokio::time::timeout(
                    grace,
                    self.orders.close(price, ExitReason::Shutdown),
                )
                .await
                {
                    Ok(Ok(trade)) => {
                        tracing::info!(pnl_usd = trade.pnl_usd, "position closed on shutdown");
                    }
                    Ok(Err(err)) => {
                        tracing::error!(%err, "failed to close position on shutdown");
                    }
                    Err(_) => {
                        tracing::error!("close did not complete within the shutdown grace");
                    }
                }
            }
        }

        if let Err(err) = self.store.lock().unwrap().flush() {
            tracing::error!(%err, "failed to flush trade store");
        }
        self.phase = BotPhase::Stopped;
        tracing::info!("bot stopped");
    }
}
