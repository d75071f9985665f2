//! ACCUMULATOR: average down with market entries, one dynamic take profit
//! per side recomputed from the exchange-reported average entry price. Never
//! places a hedge, stop loss, or cascade child.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use common::config::{AccumulatorConfig, HedgingConfig};
use common::{OrderKind, OrderRef, OrderUpdate, Result, Side, Signal};
use engine::Gateway;

use crate::{MarketView, PerSide, Strategy, StrategyStatus};

#[derive(Debug, Clone, Default)]
struct SideState {
    accumulation_count: u32,
    tp: Option<OrderRef>,
    total_qty: f64,
}

pub struct Accumulator {
    config: AccumulatorConfig,
    /// Only the lookback is used, for percentage sizing against the swing
    /// extreme; the hedging flag itself is ignored by contract.
    hedging: HedgingConfig,
    gateway: Arc<Gateway>,
    sides: PerSide<SideState>,
}

impl Accumulator {
    pub fn new(config: AccumulatorConfig, hedging: HedgingConfig, gateway: Arc<Gateway>) -> Self {
        Self {
            config,
            hedging,
            gateway,
            sides: PerSide::default(),
        }
    }

    fn can_accumulate(&self, side: Side) -> bool {
        self.sides.get(side).accumulation_count < self.config.max_accumulations
    }

    /// Cancel the side's TP if one is live and install a fresh one at
    /// `avg_price +/- tp_percent` for the full position quantity.
    async fn refresh_tp(&mut self, side: Side, avg_price: f64, qty: f64) -> Result<()> {
        if let Some(old) = self.sides.get_mut(side).tp.take() {
            self.gateway.cancel_quietly(&old).await;
        }

        let tp_level = match side {
            Side::Long => avg_price * (1.0 + self.config.tp_percent),
            Side::Short => avg_price * (1.0 - self.config.tp_percent),
        };
        let trigger = match side {
            Side::Long => tp_level * (1.0 - self.config.price_offset),
            Side::Short => tp_level * (1.0 + self.config.price_offset),
        };

        let tp = self
            .gateway
            .place_protective(
                OrderKind::TakeProfit,
                side.exit_order_side(),
                side,
                qty,
                trigger,
                Some(tp_level),
            )
            .await?;
        info!(%side, tp_level, qty, "Accumulator take profit refreshed");
        self.sides.get_mut(side).tp = Some(tp);
        Ok(())
    }
}

#[async_trait]
impl Strategy for Accumulator {
    fn name(&self) -> &'static str {
        "ACCUMULATOR"
    }

    fn can_accept_signal(&self, side: Side) -> bool {
        self.can_accumulate(side)
    }

    fn has_pending_exit(&self) -> bool {
        // A live TP must not block further accumulations on either side.
        false
    }

    async fn on_signal(&mut self, signal: &Signal, view: &MarketView<'_>) -> Result<()> {
        if !self.config.enabled {
            debug!("ACCUMULATOR disabled in configuration, signal ignored");
            return Ok(());
        }
        let side = signal.side;
        if !self.can_accumulate(side) {
            warn!(
                %side,
                max = self.config.max_accumulations,
                "Accumulation limit reached, signal ignored"
            );
            return Ok(());
        }

        let Some(current_price) = view.last_close() else {
            return Ok(());
        };
        // Percentage sizing risks against the swing extreme the hedge would
        // use; the accumulator itself never places one.
        let protective = match side {
            Side::Long => view.min_low(self.hedging.lookback_candles),
            Side::Short => view.max_high(self.hedging.lookback_candles),
        };
        let Some(protective) = protective else {
            warn!(%side, "Insufficient candle history for sizing, signal skipped");
            return Ok(());
        };

        let qty = self.gateway.initial_quantity(current_price, protective).await?;
        let ack = self
            .gateway
            .market(side.entry_order_side(), side, qty)
            .await?;
        let (fill_price, _) = self.gateway.entry_fill(&ack).await?;

        // The exchange is the source of truth for the blended entry.
        let Some(position) = self.gateway.position(side).await? else {
            warn!(%side, "No position reported after fill, TP not updated");
            return Ok(());
        };
        if !position.is_open() {
            warn!(%side, "Position flat after fill, TP not updated");
            return Ok(());
        }

        let count = {
            let st = self.sides.get_mut(side);
            st.accumulation_count += 1;
            st.total_qty = position.quantity();
            st.accumulation_count
        };
        info!(
            %side,
            count,
            fill_price,
            avg_price = position.entry_price,
            total_qty = position.quantity(),
            "Accumulation filled"
        );

        self.refresh_tp(side, position.entry_price, position.quantity())
            .await
    }

    async fn on_closed_candle(&mut self, _view: &MarketView<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()> {
        for side in [Side::Long, Side::Short] {
            let is_tp = self
                .sides
                .get(side)
                .tp
                .as_ref()
                .is_some_and(|o| o.is(update.order_id));
            if !is_tp {
                continue;
            }

            info!(
                %side,
                order_id = update.order_id,
                price = update.last_price,
                "Accumulator take profit filled, side reset"
            );
            *self.sides.get_mut(side) = SideState::default();
            return Ok(());
        }

        debug!(order_id = update.order_id, "Order update for untracked order");
        Ok(())
    }

    fn snapshot(&self) -> StrategyStatus {
        StrategyStatus {
            name: self.name(),
            long_active: self.sides.long.accumulation_count > 0,
            short_active: self.sides.short.accumulation_count > 0,
            detail: format!(
                "long={}/{} short={}/{}",
                self.sides.long.accumulation_count,
                self.config.max_accumulations,
                self.sides.short.accumulation_count,
                self.config.max_accumulations
            ),
        }
    }

    async fn shutdown(&mut self) {
        info!("ACCUMULATOR shutdown, exchange-side take profits preserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulation_gate_counts_per_side() {
        let api = Arc::new(paper::PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        let gateway = Arc::new(Gateway::new(
            api,
            "BTCUSDC",
            "5m",
            common::config::TradingConfig::default(),
            engine::RetryPolicy::immediate(5),
        ));
        let mut s = Accumulator::new(
            AccumulatorConfig {
                max_accumulations: 2,
                ..AccumulatorConfig::default()
            },
            HedgingConfig::default(),
            gateway,
        );

        assert!(s.can_accept_signal(Side::Long));
        s.sides.long.accumulation_count = 2;
        assert!(!s.can_accept_signal(Side::Long));
        assert!(s.can_accept_signal(Side::Short));
        // A live TP alone never gates new signals.
        assert!(!s.has_pending_exit());
    }
}
