//! ONE_OR_MORE: a single hedged cycle with a symmetric payout. The entry is
//! hedged by an oversized stop at the swing extreme; both legs carry a
//! take profit one risk-distance away, so whichever leg wins retires the
//! whole cycle. Optional cross-stops lock the realized R in even when the
//! hedge leg runs.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use common::config::OneOrMoreConfig;
use common::{OrderKind, OrderRef, OrderUpdate, Result, Side, Signal};
use engine::Gateway;

use crate::{MarketView, PerSide, Strategy, StrategyStatus};

#[derive(Debug, Clone, Default)]
struct CycleState {
    active: bool,
    signal_price: f64,
    hedge_price: f64,
    distance: f64,
    qty: f64,
    hedge: Option<OrderRef>,
    tp_signal: Option<OrderRef>,
    tp_hedge: Option<OrderRef>,
    stop_signal: Option<OrderRef>,
    stop_hedge: Option<OrderRef>,
}

impl CycleState {
    fn orders(&self) -> impl Iterator<Item = &OrderRef> {
        [
            self.hedge.as_ref(),
            self.tp_signal.as_ref(),
            self.tp_hedge.as_ref(),
            self.stop_signal.as_ref(),
            self.stop_hedge.as_ref(),
        ]
        .into_iter()
        .flatten()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    Hedge,
    TpSignal,
    TpHedge,
    StopSignal,
    StopHedge,
}

pub struct OneOrMore {
    config: OneOrMoreConfig,
    gateway: Arc<Gateway>,
    sides: PerSide<CycleState>,
}

impl OneOrMore {
    pub fn new(config: OneOrMoreConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            config,
            gateway,
            sides: PerSide::default(),
        }
    }

    fn any_active(&self) -> bool {
        self.sides.long.active || self.sides.short.active
    }

    /// Exit level `rr` risk-distances from `anchor`, padded by the safety
    /// offset and, for tight cycles, the small-distance offset.
    fn exit_level(&self, anchor: f64, distance: f64, rr: f64, toward_up: bool) -> f64 {
        let safety = anchor * self.config.tp_safety_offset_percent;
        let small = if distance < anchor * self.config.min_distance_percent {
            anchor * self.config.small_distance_offset_percent
        } else {
            0.0
        };
        if toward_up {
            anchor + distance * rr + small - safety
        } else {
            anchor - distance * rr - small + safety
        }
    }

    fn find(&self, order_id: i64) -> Option<(Side, Role)> {
        for side in [Side::Long, Side::Short] {
            let st = self.sides.get(side);
            let matched = [
                (st.hedge.as_ref(), Role::Hedge),
                (st.tp_signal.as_ref(), Role::TpSignal),
                (st.tp_hedge.as_ref(), Role::TpHedge),
                (st.stop_signal.as_ref(), Role::StopSignal),
                (st.stop_hedge.as_ref(), Role::StopHedge),
            ]
            .into_iter()
            .find(|(o, _)| o.is_some_and(|o| o.is(order_id)));
            if let Some((_, role)) = matched {
                return Some((side, role));
            }
        }
        None
    }

    /// Retire the whole cycle: cancel every outstanding order except the one
    /// that just filled, flatten any residual exchange-side position, clear
    /// all state.
    async fn teardown(&mut self, side: Side, filled_order_id: i64) -> Result<()> {
        info!(%side, filled_order_id, "Cycle exit filled, full teardown");

        let st = std::mem::take(self.sides.get_mut(side));
        for order in st.orders() {
            if order.is(filled_order_id) {
                continue;
            }
            self.gateway.cancel_quietly(order).await;
        }

        self.gateway.flatten_all().await?;
        self.sides = PerSide::default();
        info!("Teardown complete, ready for a new cycle");
        Ok(())
    }

    async fn on_hedge_filled(&mut self, side: Side, update: &OrderUpdate) -> Result<()> {
        let (signal_price, hedge_price, distance, qty) = {
            let st = self.sides.get_mut(side);
            st.hedge = None; // executed, nothing left to cancel
            (st.signal_price, st.hedge_price, st.distance, st.qty)
        };
        let hedge_side = side.opposite();
        let hedge_qty = if update.executed_qty > 0.0 {
            update.executed_qty
        } else {
            qty * self.config.hedge_quantity_multiplier
        };
        info!(%side, price = update.last_price, qty = hedge_qty, "Hedge filled");

        // The hedge leg gets its own exit one (possibly asymmetric) risk
        // distance back toward the entry.
        let rr_hedge = if self.config.asymmetric_tp.enabled {
            self.config.asymmetric_tp.rr_ratio_hedge_after_hedge
        } else {
            1.0
        };
        let tp_hedge_level = self.exit_level(hedge_price, distance, rr_hedge, side == Side::Short);
        let tp_hedge = match self
            .gateway
            .place_protective(
                OrderKind::TakeProfit,
                hedge_side.exit_order_side(),
                hedge_side,
                hedge_qty,
                tp_hedge_level,
                Some(tp_hedge_level),
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                let st = std::mem::take(self.sides.get_mut(side));
                for order in st.orders() {
                    self.gateway.cancel_quietly(order).await;
                }
                return Err(e);
            }
        };
        self.sides.get_mut(side).tp_hedge = Some(tp_hedge);

        // Asymmetric mode pulls the signal TP closer to secure the entry leg.
        if self.config.asymmetric_tp.enabled {
            if let Some(old) = self.sides.get_mut(side).tp_signal.take() {
                self.gateway.cancel_quietly(&old).await;
            }
            let rr_signal = self.config.asymmetric_tp.rr_ratio_signal_after_hedge;
            let level = self.exit_level(signal_price, distance, rr_signal, side == Side::Long);
            match self
                .gateway
                .take_profit(side.exit_order_side(), side, qty, level, level)
                .await
            {
                Ok(order) => self.sides.get_mut(side).tp_signal = Some(order),
                Err(e) => warn!(%side, error = %e, "Asymmetric signal TP replacement failed"),
            }
        }

        if self.config.cross_stops.enabled {
            self.install_cross_stops(side).await;
        }
        Ok(())
    }

    /// Stops that close each leg at the other leg's TP level, so the cycle
    /// realizes its R even if a TP limit never fills.
    async fn install_cross_stops(&mut self, side: Side) {
        let st = self.sides.get(side);
        let signal_exit = st.tp_hedge.as_ref().and_then(|o| o.stop_price);
        let hedge_exit = st.tp_signal.as_ref().and_then(|o| o.stop_price);
        let hedge_side = side.opposite();

        let signal_qty = match self.gateway.position(side).await {
            Ok(Some(p)) => p.quantity(),
            _ => st.qty,
        };
        let hedge_qty = match self.gateway.position(hedge_side).await {
            Ok(Some(p)) => p.quantity(),
            _ => 0.0,
        };

        if let (Some(level), true) = (signal_exit, signal_qty > 0.0) {
            match self
                .gateway
                .stop_market(side.exit_order_side(), side, signal_qty, level)
                .await
            {
                Ok(order) => self.sides.get_mut(side).stop_signal = Some(order),
                Err(e) => warn!(%side, error = %e, "Cross-stop on signal leg failed"),
            }
        }
        if let (Some(level), true) = (hedge_exit, hedge_qty > 0.0) {
            match self
                .gateway
                .stop_market(hedge_side.exit_order_side(), hedge_side, hedge_qty, level)
                .await
            {
                Ok(order) => self.sides.get_mut(side).stop_hedge = Some(order),
                Err(e) => warn!(%side, error = %e, "Cross-stop on hedge leg failed"),
            }
        }
    }

    /// A cross-stop fired: that leg closed at the other leg's TP level, its
    /// R locked in. Only the closed leg's orders and the sibling cross-stop
    /// go away; the surviving leg keeps its position and TP until that TP
    /// fill retires the cycle.
    async fn on_cross_stop_filled(&mut self, side: Side, role: Role) {
        let (closed_tp, sibling_stop) = {
            let st = self.sides.get_mut(side);
            match role {
                Role::StopSignal => {
                    st.stop_signal = None;
                    (st.tp_signal.take(), st.stop_hedge.take())
                }
                _ => {
                    st.stop_hedge = None;
                    (st.tp_hedge.take(), st.stop_signal.take())
                }
            }
        };

        if let Some(tp) = &closed_tp {
            self.gateway.cancel_quietly(tp).await;
        }
        if let Some(stop) = &sibling_stop {
            self.gateway.cancel_quietly(stop).await;
        }
        info!(%side, "Closed leg reset, surviving leg and its TP stay live");
    }
}

#[async_trait]
impl Strategy for OneOrMore {
    fn name(&self) -> &'static str {
        "ONE_OR_MORE"
    }

    fn can_accept_signal(&self, _side: Side) -> bool {
        // Strictly one cycle at a time across both sides.
        !self.any_active()
    }

    fn has_pending_exit(&self) -> bool {
        [&self.sides.long, &self.sides.short]
            .iter()
            .any(|st| st.tp_signal.is_some() || st.tp_hedge.is_some())
    }

    async fn on_signal(&mut self, signal: &Signal, view: &MarketView<'_>) -> Result<()> {
        if !self.config.enabled {
            debug!("ONE_OR_MORE disabled in configuration, signal ignored");
            return Ok(());
        }
        if self.any_active() {
            warn!("Cycle already running, signal ignored");
            return Ok(());
        }
        let side = signal.side;

        let offset = self.config.sl_offset_percent;
        let hedge_level = match side {
            Side::Long => view.min_low(self.config.sl_lookback_candles).map(|l| l * (1.0 - offset)),
            Side::Short => view.max_high(self.config.sl_lookback_candles).map(|h| h * (1.0 + offset)),
        };
        let Some(hedge_level) = hedge_level else {
            warn!(%side, "Insufficient candle history for hedge level, signal skipped");
            return Ok(());
        };
        let Some(current_price) = view.last_close() else {
            return Ok(());
        };

        let qty = self
            .gateway
            .initial_quantity(current_price, hedge_level)
            .await?;
        let ack = self
            .gateway
            .market(side.entry_order_side(), side, qty)
            .await?;
        let (signal_price, filled_qty) = self.gateway.entry_fill(&ack).await?;
        let qty = if filled_qty > 0.0 { filled_qty } else { qty };
        info!(%side, signal_price, qty, "Cycle entry filled");

        let hedge_side = side.opposite();
        let hedge = match self
            .gateway
            .place_protective(
                OrderKind::StopMarket,
                hedge_side.entry_order_side(),
                hedge_side,
                qty * self.config.hedge_quantity_multiplier,
                hedge_level,
                None,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                *self.sides.get_mut(side) = CycleState::default();
                return Err(e);
            }
        };

        let hedge_price = hedge.stop_price.unwrap_or(hedge_level);
        let distance = (signal_price - hedge_price).abs();
        info!(%side, hedge_price, distance, "Hedge placed");

        let tp_level = self.exit_level(signal_price, distance, self.config.rr_ratio, side == Side::Long);
        let tp_signal = match self
            .gateway
            .place_protective(
                OrderKind::TakeProfit,
                side.exit_order_side(),
                side,
                qty,
                tp_level,
                Some(tp_level),
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.gateway.cancel_quietly(&hedge).await;
                *self.sides.get_mut(side) = CycleState::default();
                return Err(e);
            }
        };
        info!(%side, tp_level, "Signal take profit placed");

        *self.sides.get_mut(side) = CycleState {
            active: true,
            signal_price,
            hedge_price,
            distance,
            qty,
            hedge: Some(hedge),
            tp_signal: Some(tp_signal),
            tp_hedge: None,
            stop_signal: None,
            stop_hedge: None,
        };
        Ok(())
    }

    async fn on_closed_candle(&mut self, _view: &MarketView<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()> {
        let Some((side, role)) = self.find(update.order_id) else {
            debug!(order_id = update.order_id, "Order update for untracked order");
            return Ok(());
        };

        match role {
            Role::Hedge => self.on_hedge_filled(side, update).await,
            Role::TpSignal | Role::TpHedge => self.teardown(side, update.order_id).await,
            Role::StopSignal => {
                info!(%side, order_id = update.order_id, "Cross-stop on signal leg filled");
                self.on_cross_stop_filled(side, Role::StopSignal).await;
                Ok(())
            }
            Role::StopHedge => {
                info!(%side, order_id = update.order_id, "Cross-stop on hedge leg filled");
                self.on_cross_stop_filled(side, Role::StopHedge).await;
                Ok(())
            }
        }
    }

    fn snapshot(&self) -> StrategyStatus {
        StrategyStatus {
            name: self.name(),
            long_active: self.sides.long.active,
            short_active: self.sides.short.active,
            detail: format!(
                "long_distance={} short_distance={}",
                self.sides.long.distance, self.sides.short.distance
            ),
        }
    }

    async fn shutdown(&mut self) {
        info!("ONE_OR_MORE shutdown, exchange-side cycle orders preserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy(config: OneOrMoreConfig) -> OneOrMore {
        let api = Arc::new(paper::PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        let gateway = Arc::new(Gateway::new(
            api,
            "BTCUSDC",
            "5m",
            common::config::TradingConfig::default(),
            engine::RetryPolicy::immediate(5),
        ));
        OneOrMore::new(config, gateway)
    }

    #[test]
    fn exit_level_applies_safety_offset() {
        let s = strategy(OneOrMoreConfig {
            tp_safety_offset_percent: 0.0002,
            min_distance_percent: 0.002,
            small_distance_offset_percent: 0.0015,
            ..OneOrMoreConfig::default()
        });
        // distance 0.5 on anchor 100 is comfortable: tp = 100 + 0.5 - 0.02
        let level = s.exit_level(100.0, 0.5, 1.0, true);
        assert!((level - 100.48).abs() < 1e-9);
    }

    #[test]
    fn tight_cycles_get_the_small_distance_offset() {
        let s = strategy(OneOrMoreConfig {
            tp_safety_offset_percent: 0.0,
            min_distance_percent: 0.002,
            small_distance_offset_percent: 0.0015,
            ..OneOrMoreConfig::default()
        });
        // distance 0.1 < 0.2 threshold: tp = 100 + 0.1 + 0.15
        let level = s.exit_level(100.0, 0.1, 1.0, true);
        assert!((level - 100.25).abs() < 1e-9);

        // downward leg mirrors it
        let level = s.exit_level(100.0, 0.1, 1.0, false);
        assert!((level - 99.75).abs() < 1e-9);
    }

    #[test]
    fn single_cycle_across_both_sides() {
        let mut s = strategy(OneOrMoreConfig::default());
        assert!(s.can_accept_signal(Side::Long));
        assert!(s.can_accept_signal(Side::Short));
        s.sides.long.active = true;
        assert!(!s.can_accept_signal(Side::Long));
        assert!(!s.can_accept_signal(Side::Short));
    }
}
