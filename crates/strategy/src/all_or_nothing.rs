//! ALL_OR_NOTHING: one position per side, protected by a swing-low/high stop
//! loss and either a fixed take profit or a dynamic RSI exit, with an
//! optional trailing stop.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use common::config::{AllOrNothingConfig, SignalConfig};
use common::{OrderKind, OrderRef, OrderUpdate, Result, Side, Signal};
use engine::Gateway;

use crate::indicators::rsi::{classify, RsiZone};
use crate::{MarketView, PerSide, Strategy, StrategyStatus};

#[derive(Debug, Clone, Default)]
struct SideState {
    active: bool,
    entry_price: f64,
    qty: f64,
    sl: Option<OrderRef>,
    tp: Option<OrderRef>,
    trailing_reference: Option<f64>,
}

pub struct AllOrNothing {
    config: AllOrNothingConfig,
    signal_config: SignalConfig,
    gateway: Arc<Gateway>,
    sides: PerSide<SideState>,
}

impl AllOrNothing {
    pub fn new(
        config: AllOrNothingConfig,
        signal_config: SignalConfig,
        gateway: Arc<Gateway>,
    ) -> Self {
        Self {
            config,
            signal_config,
            gateway,
            sides: PerSide::default(),
        }
    }

    /// Stop level from the swing extreme of the last N closed candles,
    /// shifted away from the position by the configured offset.
    fn protective_level(&self, side: Side, view: &MarketView<'_>) -> Option<f64> {
        let lookback = self.config.sl_lookback_candles;
        let offset = self.config.sl_offset_percent;
        match side {
            Side::Long => view.min_low(lookback).map(|low| low * (1.0 - offset)),
            Side::Short => view.max_high(lookback).map(|high| high * (1.0 + offset)),
        }
    }

    /// True when every configured RSI period sits in `zone`.
    fn all_rsi_in_zone(&self, rsi: &[(u32, Option<f64>)], zone: RsiZone) -> bool {
        for threshold in &self.signal_config.rsi_thresholds {
            let Some(value) = rsi
                .iter()
                .find(|(p, _)| *p == threshold.period)
                .and_then(|(_, v)| *v)
            else {
                return false;
            };
            if classify(value, threshold.oversold, threshold.overbought) != zone {
                return false;
            }
        }
        !self.signal_config.rsi_thresholds.is_empty()
    }

    async fn dynamic_exit(&mut self, side: Side) -> Result<()> {
        let (qty, sl, tp) = {
            let st = self.sides.get_mut(side);
            (st.qty, st.sl.take(), st.tp.take())
        };

        info!(%side, qty, "Dynamic RSI exit triggered, closing at market");
        self.gateway
            .market(side.exit_order_side(), side, qty)
            .await?;

        if self.config.dynamic_rsi_exit.cancel_fixed_orders {
            if let Some(sl) = &sl {
                self.gateway.cancel_quietly(sl).await;
            }
            if let Some(tp) = &tp {
                self.gateway.cancel_quietly(tp).await;
            }
        }

        *self.sides.get_mut(side) = SideState::default();
        Ok(())
    }

    async fn trail_stop(&mut self, side: Side, close: f64) {
        let trailing = &self.config.trailing_stop;
        let (reference, old_sl) = {
            let st = self.sides.get(side);
            match (st.trailing_reference, st.sl.clone()) {
                (Some(r), Some(sl)) => (r, sl),
                _ => return,
            }
        };

        let favorable_move = match side {
            Side::Long => (close - reference) / reference,
            Side::Short => (reference - close) / reference,
        };
        if favorable_move < trailing.price_trigger_percent {
            return;
        }

        let Some(old_stop) = old_sl.stop_price else {
            return;
        };
        let new_stop = match side {
            Side::Long => old_stop * (1.0 + trailing.sl_adjustment_percent),
            Side::Short => old_stop * (1.0 - trailing.sl_adjustment_percent),
        };
        info!(%side, old_stop, new_stop, "Trailing stop adjustment");

        self.gateway.cancel_quietly(&old_sl).await;
        match self
            .gateway
            .stop_market(side.exit_order_side(), side, old_sl.qty, new_stop)
            .await
        {
            Ok(new_sl) => {
                let st = self.sides.get_mut(side);
                st.sl = Some(new_sl);
                st.trailing_reference = Some(close);
            }
            Err(e) => {
                // Position stays open; the side simply runs without a stop
                // until the next adjustment or exit.
                error!(%side, error = %e, "Trailing stop replacement failed");
                self.sides.get_mut(side).sl = None;
            }
        }
    }
}

#[async_trait]
impl Strategy for AllOrNothing {
    fn name(&self) -> &'static str {
        "ALL_OR_NOTHING"
    }

    fn can_accept_signal(&self, side: Side) -> bool {
        !self.sides.get(side).active
    }

    fn has_pending_exit(&self) -> bool {
        // Exits here are per-side protective orders; the same-side active
        // flag already gates them.
        false
    }

    async fn on_signal(&mut self, signal: &Signal, view: &MarketView<'_>) -> Result<()> {
        if !self.config.enabled {
            debug!("ALL_OR_NOTHING disabled in configuration, signal ignored");
            return Ok(());
        }
        let side = signal.side;
        if self.sides.get(side).active {
            warn!(%side, "Position already active, signal ignored");
            return Ok(());
        }

        let Some(preliminary_sl) = self.protective_level(side, view) else {
            warn!(%side, "Insufficient candle history for stop level, signal skipped");
            return Ok(());
        };
        let Some(current_price) = view.last_close() else {
            return Ok(());
        };

        let qty = self
            .gateway
            .initial_quantity(current_price, preliminary_sl)
            .await?;

        let ack = self
            .gateway
            .market(side.entry_order_side(), side, qty)
            .await?;
        let (entry_price, filled_qty) = self.gateway.entry_fill(&ack).await?;
        let qty = if filled_qty > 0.0 { filled_qty } else { qty };
        info!(%side, entry_price, qty, "Entry filled");

        // Re-anchor the stop with the fill price in the candidate set; a
        // fill that gapped past the swing extreme must stay protected.
        let sl_level = match side {
            Side::Long => preliminary_sl.min(entry_price * (1.0 - self.config.sl_offset_percent)),
            Side::Short => preliminary_sl.max(entry_price * (1.0 + self.config.sl_offset_percent)),
        };
        if sl_level != preliminary_sl {
            info!(%side, preliminary_sl, sl_level, "Stop level re-anchored to fill");
        }

        // Block further signals for this side before any protective order
        // exists.
        {
            let st = self.sides.get_mut(side);
            st.active = true;
            st.entry_price = entry_price;
            st.qty = qty;
            st.trailing_reference = Some(entry_price);
        }

        let sl = match self
            .gateway
            .place_protective(
                OrderKind::StopMarket,
                side.exit_order_side(),
                side,
                qty,
                sl_level,
                None,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                // No sibling exists yet; free the side and surface.
                *self.sides.get_mut(side) = SideState::default();
                return Err(e);
            }
        };
        self.sides.get_mut(side).sl = Some(sl);

        if self.config.dynamic_rsi_exit.enabled {
            info!(%side, "Dynamic RSI exit active, no fixed take profit");
        } else {
            let tp_limit = match side {
                Side::Long => entry_price * (1.0 + self.config.tp_percent),
                Side::Short => entry_price * (1.0 - self.config.tp_percent),
            };
            let trigger = match side {
                Side::Long => tp_limit * (1.0 - self.config.price_offset),
                Side::Short => tp_limit * (1.0 + self.config.price_offset),
            };
            match self
                .gateway
                .place_protective(
                    OrderKind::TakeProfit,
                    side.exit_order_side(),
                    side,
                    qty,
                    trigger,
                    Some(tp_limit),
                )
                .await
            {
                Ok(order) => self.sides.get_mut(side).tp = Some(order),
                Err(e) => {
                    if let Some(sl) = self.sides.get_mut(side).sl.take() {
                        self.gateway.cancel_quietly(&sl).await;
                    }
                    *self.sides.get_mut(side) = SideState::default();
                    return Err(e);
                }
            }
        }

        info!(%side, entry_price, "Position sealed with protective orders");
        Ok(())
    }

    async fn on_closed_candle(&mut self, view: &MarketView<'_>) -> Result<()> {
        for side in [Side::Long, Side::Short] {
            if !self.sides.get(side).active {
                continue;
            }

            if self.config.dynamic_rsi_exit.enabled {
                let exit_zone = match side {
                    Side::Long => RsiZone::Overbought,
                    Side::Short => RsiZone::Oversold,
                };
                if self.all_rsi_in_zone(view.rsi, exit_zone) {
                    self.dynamic_exit(side).await?;
                    continue;
                }
            }

            if self.config.trailing_stop.enabled {
                if let Some(close) = view.last_close() {
                    self.trail_stop(side, close).await;
                }
            }
        }
        Ok(())
    }

    async fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()> {
        for side in [Side::Long, Side::Short] {
            let st = self.sides.get(side);
            let is_sl = st.sl.as_ref().is_some_and(|o| o.is(update.order_id));
            let is_tp = st.tp.as_ref().is_some_and(|o| o.is(update.order_id));
            if !is_sl && !is_tp {
                continue;
            }

            let label = if is_sl { "Stop loss" } else { "Take profit" };
            info!(%side, order_id = update.order_id, price = update.last_price, "{label} filled, retiring side");

            let (sl, tp) = {
                let st = self.sides.get_mut(side);
                (st.sl.take(), st.tp.take())
            };
            let sibling = if is_sl { tp } else { sl };
            if let Some(sibling) = &sibling {
                self.gateway.cancel_quietly(sibling).await;
            }
            *self.sides.get_mut(side) = SideState::default();
            return Ok(());
        }

        debug!(order_id = update.order_id, "Order update for untracked order");
        Ok(())
    }

    fn snapshot(&self) -> StrategyStatus {
        StrategyStatus {
            name: self.name(),
            long_active: self.sides.long.active,
            short_active: self.sides.short.active,
            detail: format!(
                "long_entry={} short_entry={}",
                self.sides.long.entry_price, self.sides.short.entry_price
            ),
        }
    }

    async fn shutdown(&mut self) {
        info!("ALL_OR_NOTHING shutdown, exchange-side protective orders preserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::{RsiThreshold, VolumeValidation};

    fn signal_config() -> SignalConfig {
        SignalConfig {
            rsi_on_ha: true,
            rsi_thresholds: vec![
                RsiThreshold { period: 3, oversold: 10.0, overbought: 90.0 },
                RsiThreshold { period: 5, oversold: 20.0, overbought: 80.0 },
            ],
            volume_validation: VolumeValidation { enabled: false, lookback_candles: 14 },
        }
    }

    fn strategy() -> AllOrNothing {
        let api = Arc::new(paper::PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        let gateway = Arc::new(Gateway::new(
            api,
            "BTCUSDC",
            "5m",
            common::config::TradingConfig::default(),
            engine::RetryPolicy::immediate(5),
        ));
        AllOrNothing::new(AllOrNothingConfig::default(), signal_config(), gateway)
    }

    #[test]
    fn rsi_zone_requires_every_period() {
        let s = strategy();
        let all_over = vec![(3, Some(95.0)), (5, Some(85.0))];
        assert!(s.all_rsi_in_zone(&all_over, RsiZone::Overbought));

        let partial = vec![(3, Some(95.0)), (5, Some(50.0))];
        assert!(!s.all_rsi_in_zone(&partial, RsiZone::Overbought));

        let missing = vec![(3, Some(95.0))];
        assert!(!s.all_rsi_in_zone(&missing, RsiZone::Overbought));
    }

    #[test]
    fn signal_gate_tracks_active_flag() {
        let mut s = strategy();
        assert!(s.can_accept_signal(Side::Long));
        s.sides.long.active = true;
        assert!(!s.can_accept_signal(Side::Long));
        assert!(s.can_accept_signal(Side::Short));
    }
}
