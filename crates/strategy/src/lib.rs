pub mod accumulator;
pub mod all_or_nothing;
pub mod cascade;
pub mod indicators;
pub mod one_or_more;
pub mod runtime;
pub mod signal;

use std::sync::Arc;

use async_trait::async_trait;

use common::config::{Config, StrategyKind};
use common::{Candle, OrderUpdate, Result, Side, Signal};
use engine::Gateway;

pub use runtime::StrategyRuntime;
pub use signal::{SignalEngine, SignalGate, SignalState};

/// Read-only market context handed to strategy callbacks: the closed-candle
/// history (oldest first, live candle never included) and the latest RSI
/// value per configured period.
pub struct MarketView<'a> {
    pub history: &'a [Candle],
    pub rsi: &'a [(u32, Option<f64>)],
}

impl MarketView<'_> {
    pub fn last_close(&self) -> Option<f64> {
        self.history.last().map(|c| c.close)
    }

    /// Lowest low of the last `n` closed candles.
    pub fn min_low(&self, n: usize) -> Option<f64> {
        if self.history.len() < n || n == 0 {
            return None;
        }
        self.history[self.history.len() - n..]
            .iter()
            .map(|c| c.low)
            .fold(None, |acc: Option<f64>, low| {
                Some(acc.map_or(low, |a| a.min(low)))
            })
    }

    /// Highest high of the last `n` closed candles.
    pub fn max_high(&self, n: usize) -> Option<f64> {
        if self.history.len() < n || n == 0 {
            return None;
        }
        self.history[self.history.len() - n..]
            .iter()
            .map(|c| c.high)
            .fold(None, |acc: Option<f64>, high| {
                Some(acc.map_or(high, |a| a.max(high)))
            })
    }
}

/// Point-in-time status of the active strategy, for logging and the
/// supervisor.
#[derive(Debug, Clone)]
pub struct StrategyStatus {
    pub name: &'static str,
    pub long_active: bool,
    pub short_active: bool,
    pub detail: String,
}

/// The dispatch surface shared by the four strategies. All methods run in
/// the runtime's single serialization domain; no callback overlaps another.
#[async_trait]
pub trait Strategy: Send {
    fn name(&self) -> &'static str;

    /// False when a signal for this side could not be honored.
    fn can_accept_signal(&self, side: Side) -> bool;

    /// True while exit (TP) orders of an earlier cycle are still live and
    /// new cycles must stay shut.
    fn has_pending_exit(&self) -> bool;

    /// A confirmed signal was consumed by the runtime.
    async fn on_signal(&mut self, signal: &Signal, view: &MarketView<'_>) -> Result<()>;

    /// A candle closed (after history and indicators were updated).
    async fn on_closed_candle(&mut self, view: &MarketView<'_>) -> Result<()>;

    /// A FILLED order update for this symbol arrived on the user stream.
    async fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()>;

    fn snapshot(&self) -> StrategyStatus;

    /// Stop trading. Live protective orders on the exchange are preserved:
    /// an operator restart must not unwind positions.
    async fn shutdown(&mut self);
}

/// Per-side strategy state storage.
#[derive(Debug, Clone, Default)]
pub struct PerSide<T> {
    pub long: T,
    pub short: T,
}

impl<T> PerSide<T> {
    pub fn get(&self, side: Side) -> &T {
        match side {
            Side::Long => &self.long,
            Side::Short => &self.short,
        }
    }

    pub fn get_mut(&mut self, side: Side) -> &mut T {
        match side {
            Side::Long => &mut self.long,
            Side::Short => &mut self.short,
        }
    }
}

/// Build the strategy selected by the configuration.
pub fn build_strategy(config: &Config, gateway: Arc<Gateway>) -> Box<dyn Strategy> {
    match config.strategy_type {
        StrategyKind::AllOrNothing => Box::new(all_or_nothing::AllOrNothing::new(
            config.all_or_nothing.clone(),
            config.signal.clone(),
            gateway,
        )),
        StrategyKind::Accumulator => Box::new(accumulator::Accumulator::new(
            config.accumulator.clone(),
            config.hedging.clone(),
            gateway,
        )),
        StrategyKind::CascadeMaster => Box::new(cascade::CascadeMaster::new(
            config.hedging.clone(),
            config.cascade.clone(),
            config.tp.clone(),
            gateway,
        )),
        StrategyKind::OneOrMore => Box::new(one_or_more::OneOrMore::new(
            config.one_or_more.clone(),
            gateway,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candle(high: f64, low: f64, close: f64) -> Candle {
        Candle {
            open_time: 0,
            open: close,
            high,
            low,
            close,
            volume: 0.0,
            is_closed: true,
        }
    }

    #[test]
    fn swing_extremes_use_exactly_the_last_n() {
        let history = vec![
            candle(200.0, 50.0, 100.0), // outside the window
            candle(101.0, 100.0, 100.5),
            candle(100.0, 99.0, 99.5),
            candle(99.0, 98.0, 98.5),
            candle(98.0, 97.0, 97.5),
            candle(97.0, 96.0, 96.5),
        ];
        let view = MarketView { history: &history, rsi: &[] };
        assert_eq!(view.min_low(5), Some(96.0));
        assert_eq!(view.max_high(5), Some(101.0));
        assert_eq!(view.min_low(6), Some(50.0));
    }

    #[test]
    fn short_history_yields_none() {
        let history = vec![candle(101.0, 100.0, 100.5)];
        let view = MarketView { history: &history, rsi: &[] };
        assert_eq!(view.min_low(5), None);
        assert_eq!(view.max_high(5), None);
    }
}
