//! The strategy runtime: the single serialization domain in which all
//! strategy state lives. One task drains the market-data and user-data
//! channels; every callback runs to completion before the next event is
//! taken, so strategy state never sees a concurrent read-modify-write.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use common::config::SignalConfig;
use common::{Candle, Error, HaColor, MarketEvent, OrderStatus, OrderUpdate, Result, Side};

use crate::indicators::{heikin_ashi, rsi};
use crate::signal::{SignalEngine, SignalGate};
use crate::{MarketView, Strategy, StrategyStatus};

const MAX_HISTORY: usize = 200;

struct GateAdapter<'a> {
    strategy: &'a dyn Strategy,
}

impl SignalGate for GateAdapter<'_> {
    fn can_accept_signal(&self, side: Side) -> bool {
        self.strategy.can_accept_signal(side)
    }

    fn has_pending_exit(&self) -> bool {
        self.strategy.has_pending_exit()
    }
}

pub struct StrategyRuntime {
    signal_config: SignalConfig,
    engine: SignalEngine,
    strategy: Box<dyn Strategy>,
    /// Closed candles only, oldest first; the live candle never enters.
    history: Vec<Candle>,
    /// Idempotence key of the last processed close.
    last_open_time: Option<i64>,
}

impl StrategyRuntime {
    pub fn new(signal_config: SignalConfig, strategy: Box<dyn Strategy>) -> Self {
        Self {
            engine: SignalEngine::new(signal_config.clone()),
            signal_config,
            strategy,
            history: Vec::new(),
            last_open_time: None,
        }
    }

    /// Seed the candle history from REST klines so stop levels are available
    /// from the first signal after startup. Unclosed candles are dropped.
    pub fn prefill_history(&mut self, candles: Vec<Candle>) {
        for candle in candles.into_iter().filter(|c| c.is_closed) {
            self.push_candle(candle);
        }
        info!(candles = self.history.len(), "Candle history prefilled");
    }

    pub fn snapshot(&self) -> StrategyStatus {
        self.strategy.snapshot()
    }

    pub async fn shutdown(&mut self) {
        self.strategy.shutdown().await;
    }

    /// Replace the active strategy. The outgoing one is drained first; its
    /// shutdown leaves exchange-side orders untouched.
    pub async fn swap_strategy(&mut self, strategy: Box<dyn Strategy>) {
        self.strategy.shutdown().await;
        info!(from = self.strategy.name(), to = strategy.name(), "Strategy swapped");
        self.strategy = strategy;
    }

    /// Drive the runtime from the two ingest channels. Returns on fatal
    /// strategy errors or when either channel closes (a stream loop gave up
    /// its reconnection budget).
    pub async fn run(
        &mut self,
        mut candle_rx: mpsc::Receiver<MarketEvent>,
        mut update_rx: mpsc::Receiver<OrderUpdate>,
    ) -> Result<()> {
        info!(strategy = self.strategy.name(), "Strategy runtime running");
        loop {
            tokio::select! {
                // Order updates drain first so a fill is always observed
                // before any candle close that depends on its effect.
                biased;

                update = update_rx.recv() => match update {
                    Some(update) => self.handle_order_update(update).await?,
                    None => {
                        warn!("User data channel closed");
                        return Err(Error::Other("user data stream terminated".into()));
                    }
                },
                event = candle_rx.recv() => match event {
                    Some(event) => self.handle_candle(event.kline).await?,
                    None => {
                        warn!("Market data channel closed");
                        return Err(Error::Other("market data stream terminated".into()));
                    }
                },
            }
        }
    }

    fn push_candle(&mut self, candle: Candle) -> bool {
        if self.last_open_time == Some(candle.open_time) {
            debug!(open_time = candle.open_time, "Duplicate candle close ignored");
            return false;
        }
        self.last_open_time = Some(candle.open_time);
        self.history.push(candle);
        if self.history.len() > MAX_HISTORY {
            self.history.remove(0);
        }
        true
    }

    /// Handle one candle-close event: update history and indicators, give
    /// the strategy its exit/trailing pass, then evaluate the signal engine.
    pub async fn handle_candle(&mut self, candle: Candle) -> Result<()> {
        if !candle.is_closed {
            return Ok(());
        }
        if !self.push_candle(candle) {
            return Ok(());
        }

        let closes: Vec<f64> = if self.signal_config.rsi_on_ha {
            heikin_ashi::close_series(&self.history)
        } else {
            self.history.iter().map(|c| c.close).collect()
        };
        let rsi_snapshot: Vec<(u32, Option<f64>)> = self
            .signal_config
            .periods()
            .into_iter()
            .map(|p| (p, rsi::latest(&closes, p)))
            .collect();
        let ha_color = heikin_ashi::latest_color(&self.history).unwrap_or(HaColor::Doji);

        let view = MarketView {
            history: &self.history,
            rsi: &rsi_snapshot,
        };

        tolerate(self.strategy.on_closed_candle(&view).await)?;

        let confirmed = self.engine.on_closed_candle(
            &rsi_snapshot,
            ha_color,
            candle.volume,
            &GateAdapter {
                strategy: self.strategy.as_ref(),
            },
        );
        if let Some(signal) = confirmed {
            info!(side = %signal.side, color = %signal.ha_color, "Executing confirmed signal");
            let result = self.strategy.on_signal(&signal, &view).await;
            // Consume the latch whether or not execution succeeded; a stale
            // signal must never re-fire on a later candle.
            self.engine.acknowledge();
            tolerate(result)?;
        }

        Ok(())
    }

    /// Handle one user-data order update. Only FILLED updates reach the
    /// strategy; everything else is observed for logging.
    pub async fn handle_order_update(&mut self, update: OrderUpdate) -> Result<()> {
        if update.status != OrderStatus::Filled {
            debug!(
                order_id = update.order_id,
                status = %update.status,
                "Order update observed"
            );
            return Ok(());
        }
        tolerate(self.strategy.on_order_update(&update).await)
    }
}

/// Fatal errors propagate and take the process down; everything else is the
/// strategy's problem and has already been logged at the failure site.
fn tolerate(result: Result<()>) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_fatal() => Err(e),
        Err(e) => {
            warn!(error = %e, "Strategy callback failed");
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::Signal;

    /// Counting stub: records how many closes and signals it saw.
    #[derive(Default)]
    struct Probe {
        closes: usize,
        signals: usize,
    }

    #[async_trait]
    impl Strategy for Probe {
        fn name(&self) -> &'static str {
            "PROBE"
        }
        fn can_accept_signal(&self, _side: Side) -> bool {
            true
        }
        fn has_pending_exit(&self) -> bool {
            false
        }
        async fn on_signal(&mut self, _signal: &Signal, _view: &MarketView<'_>) -> Result<()> {
            self.signals += 1;
            Ok(())
        }
        async fn on_closed_candle(&mut self, _view: &MarketView<'_>) -> Result<()> {
            self.closes += 1;
            Ok(())
        }
        async fn on_order_update(&mut self, _update: &OrderUpdate) -> Result<()> {
            Ok(())
        }
        fn snapshot(&self) -> StrategyStatus {
            StrategyStatus {
                name: "PROBE",
                long_active: false,
                short_active: false,
                detail: format!("closes={} signals={}", self.closes, self.signals),
            }
        }
        async fn shutdown(&mut self) {}
    }

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            open_time,
            open: close,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 100.0,
            is_closed: true,
        }
    }

    #[tokio::test]
    async fn duplicate_close_is_idempotent() {
        let mut runtime = StrategyRuntime::new(SignalConfig::default(), Box::new(Probe::default()));

        runtime.handle_candle(candle(1000, 100.0)).await.unwrap();
        runtime.handle_candle(candle(1000, 100.0)).await.unwrap();
        runtime.handle_candle(candle(2000, 101.0)).await.unwrap();

        assert_eq!(runtime.history.len(), 2);
        assert!(runtime.snapshot().detail.starts_with("closes=2"));
    }

    #[tokio::test]
    async fn live_candles_never_enter_history() {
        let mut runtime = StrategyRuntime::new(SignalConfig::default(), Box::new(Probe::default()));

        let mut live = candle(1000, 100.0);
        live.is_closed = false;
        runtime.handle_candle(live).await.unwrap();
        assert!(runtime.history.is_empty());
        assert!(runtime.snapshot().detail.starts_with("closes=0"));
    }

    #[tokio::test]
    async fn prefill_drops_the_forming_candle() {
        let mut runtime = StrategyRuntime::new(SignalConfig::default(), Box::new(Probe::default()));

        let mut forming = candle(3000, 102.0);
        forming.is_closed = false;
        runtime.prefill_history(vec![candle(1000, 100.0), candle(2000, 101.0), forming]);
        assert_eq!(runtime.history.len(), 2);
    }

    #[tokio::test]
    async fn swapping_strategies_drains_the_old_one() {
        let mut runtime = StrategyRuntime::new(SignalConfig::default(), Box::new(Probe::default()));
        runtime.handle_candle(candle(1000, 100.0)).await.unwrap();
        assert!(runtime.snapshot().detail.starts_with("closes=1"));

        runtime.swap_strategy(Box::new(Probe::default())).await;
        assert!(runtime.snapshot().detail.starts_with("closes=0"));

        runtime.handle_candle(candle(2000, 101.0)).await.unwrap();
        assert!(runtime.snapshot().detail.starts_with("closes=1"));
    }

    #[tokio::test]
    async fn non_filled_updates_do_not_reach_the_strategy() {
        let mut runtime = StrategyRuntime::new(SignalConfig::default(), Box::new(Probe::default()));
        let update = OrderUpdate {
            order_id: 1,
            symbol: "BTCUSDC".into(),
            side: common::OrderSide::Sell,
            position_side: Side::Long,
            status: OrderStatus::New,
            executed_qty: 0.0,
            last_price: 0.0,
            kind: common::OrderKind::StopMarket,
        };
        runtime.handle_order_update(update).await.unwrap();
    }
}
