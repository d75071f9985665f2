//! CASCADE_MASTER: hedged, self-propagating alternating ladder. The entry is
//! hedged by an oversized stop on the opposite side; every fill re-balances
//! cumulative exposure with a `2X - Y` child at the opposite reference price
//! while a pair of climbing take profits waits to retire the whole ladder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use common::config::{CascadeConfig, HedgingConfig, TpConfig};
use common::{OrderKind, OrderRef, OrderUpdate, Result, Side, Signal};
use engine::Gateway;

use crate::{MarketView, PerSide, Strategy, StrategyStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CascadeState {
    Inactive,
    /// Entry placed, waiting for the initial hedge stop to execute.
    WaitingHedge,
    /// Ladder running, children pending.
    Active,
    /// Child limit reached or child creation failed; positions and TPs stay
    /// live until a TP retires them.
    Stopped,
}

/// Reference prices and climbing take-profit levels of the ladder.
///
/// `tp_long = base_long * (1 + k*increment)`, `tp_short = base_short *
/// (1 - k*increment)` with `base = p_ref +/- |dref| * base_multiplier` and a
/// per-side fill counter `k`.
#[derive(Debug, Default)]
struct TpLadder {
    distance: Option<f64>,
    bases: PerSide<Option<f64>>,
    counters: PerSide<u32>,
    active: PerSide<Option<OrderRef>>,
}

impl TpLadder {
    fn initialize(&mut self, p_ref_long: f64, p_ref_short: f64, base_multiplier: f64) {
        let distance = (p_ref_long - p_ref_short).abs() * base_multiplier;
        self.distance = Some(distance);
        self.bases.long = Some(p_ref_long + distance);
        self.bases.short = Some(p_ref_short - distance);
        self.counters = PerSide::default();
        info!(
            distance,
            tp_long_base = p_ref_long + distance,
            tp_short_base = p_ref_short - distance,
            "Take-profit ladder initialized"
        );
    }

    fn initialized(&self) -> bool {
        self.distance.is_some()
    }

    fn level(&self, side: Side, increment: f64) -> Option<f64> {
        let base = (*self.bases.get(side))?;
        let k = *self.counters.get(side) as f64;
        Some(match side {
            Side::Long => base * (1.0 + k * increment),
            Side::Short => base * (1.0 - k * increment),
        })
    }

    fn reset(&mut self) {
        *self = TpLadder::default();
    }
}

pub struct CascadeMaster {
    hedging: HedgingConfig,
    cascade: CascadeConfig,
    tp: TpConfig,
    gateway: Arc<Gateway>,

    state: CascadeState,
    signal_side: Option<Side>,
    /// Reference price per side: the signal fill and the hedge fill/stop.
    refs: PerSide<Option<f64>>,
    /// Cumulative filled quantity per side.
    qtys: PerSide<f64>,
    orders_count: u32,
    pending_children: Vec<OrderRef>,
    hedge: Option<OrderRef>,
    ladder: TpLadder,
}

impl CascadeMaster {
    pub fn new(
        hedging: HedgingConfig,
        cascade: CascadeConfig,
        tp: TpConfig,
        gateway: Arc<Gateway>,
    ) -> Self {
        Self {
            hedging,
            cascade,
            tp,
            gateway,
            state: CascadeState::Inactive,
            signal_side: None,
            refs: PerSide::default(),
            qtys: PerSide::default(),
            orders_count: 0,
            pending_children: Vec::new(),
            hedge: None,
            ladder: TpLadder::default(),
        }
    }

    fn reset_all(&mut self) {
        self.state = CascadeState::Inactive;
        self.signal_side = None;
        self.refs = PerSide::default();
        self.qtys = PerSide::default();
        self.orders_count = 0;
        self.pending_children.clear();
        self.hedge = None;
        self.ladder.reset();
        info!("Cascade state reset");
    }

    /// Place or replace one side's TP at its current ladder level. `bump`
    /// advances the side's counter first. `critical` placements go through
    /// the protective retry and surface a fatal on exhaustion; refreshes are
    /// single-shot and only logged on failure.
    async fn refresh_tp(&mut self, side: Side, qty: f64, bump: bool, critical: bool) -> Result<()> {
        if !self.tp.enabled || !self.ladder.initialized() || qty <= 0.0 {
            return Ok(());
        }
        if bump {
            *self.ladder.counters.get_mut(side) += 1;
        }
        let Some(level) = self.ladder.level(side, self.tp.position_increment) else {
            return Ok(());
        };

        if let Some(old) = self.ladder.active.get_mut(side).take() {
            self.gateway.cancel_quietly(&old).await;
        }

        // Trigger at the level, limit shifted through it for fill quality.
        let limit = match side {
            Side::Long => level * (1.0 + self.tp.price_offset),
            Side::Short => level * (1.0 - self.tp.price_offset),
        };

        let placed = if critical {
            self.gateway
                .place_protective(
                    OrderKind::TakeProfit,
                    side.exit_order_side(),
                    side,
                    qty,
                    level,
                    Some(limit),
                )
                .await
        } else {
            self.gateway
                .take_profit(side.exit_order_side(), side, qty, level, limit)
                .await
        };

        match placed {
            Ok(order) => {
                info!(%side, level, qty, k = *self.ladder.counters.get(side), "Ladder TP placed");
                *self.ladder.active.get_mut(side) = Some(order);
                Ok(())
            }
            Err(e) if critical => Err(e),
            Err(e) => {
                warn!(%side, error = %e, "Ladder TP refresh failed");
                Ok(())
            }
        }
    }

    /// Alternation rule: the dominant side triggers a re-balancing child on
    /// the opposite side, sized `2X - Y` so dominance swaps after the fill.
    async fn create_next_child(&mut self) {
        let l = self.qtys.long;
        let s = self.qtys.short;
        let (side, reference, qty) = if l > s {
            (Side::Short, *self.refs.get(Side::Short), 2.0 * l - s)
        } else {
            (Side::Long, *self.refs.get(Side::Long), 2.0 * s - l)
        };

        let Some(stop_price) = reference else {
            error!(%side, "Reference price missing, cascade child not created");
            return;
        };
        if qty <= 0.0 {
            error!(%side, qty, "Degenerate cascade child quantity");
            return;
        }

        for attempt in 1..=self.cascade.retry_attempts.max(1) {
            match self
                .gateway
                .stop_market(side.entry_order_side(), side, qty, stop_price)
                .await
            {
                Ok(order) => {
                    info!(
                        %side,
                        order_id = order.order_id,
                        qty,
                        stop_price,
                        "Cascade child placed"
                    );
                    self.pending_children.push(order);
                    return;
                }
                Err(e) => {
                    warn!(%side, attempt, error = %e, "Cascade child placement failed");
                    if attempt < self.cascade.retry_attempts {
                        tokio::time::sleep(Duration::from_secs(self.cascade.retry_delay_secs))
                            .await;
                    }
                }
            }
        }

        warn!(
            long = self.qtys.long,
            short = self.qtys.short,
            placed = self.orders_count,
            "Cascade halted after child creation failure"
        );
        self.state = CascadeState::Stopped;
    }

    /// Full teardown after a TP fill: children and the opposite TP go away,
    /// residual positions are flattened, state returns to INACTIVE.
    async fn teardown(&mut self, filled_side: Side) -> Result<()> {
        info!(%filled_side, "Ladder TP filled, tearing the cascade down");

        let children = std::mem::take(&mut self.pending_children);
        for child in &children {
            self.gateway.cancel_quietly(child).await;
        }
        if let Some(hedge) = self.hedge.take() {
            self.gateway.cancel_quietly(&hedge).await;
        }
        *self.ladder.active.get_mut(filled_side) = None;
        if let Some(opposite) = self.ladder.active.get_mut(filled_side.opposite()).take() {
            self.gateway.cancel_quietly(&opposite).await;
        }

        self.gateway.flatten_all().await?;
        self.reset_all();
        Ok(())
    }
}

#[async_trait]
impl Strategy for CascadeMaster {
    fn name(&self) -> &'static str {
        "CASCADE_MASTER"
    }

    fn can_accept_signal(&self, _side: Side) -> bool {
        self.state == CascadeState::Inactive
    }

    fn has_pending_exit(&self) -> bool {
        self.ladder.active.long.is_some() || self.ladder.active.short.is_some()
    }

    async fn on_signal(&mut self, signal: &Signal, view: &MarketView<'_>) -> Result<()> {
        if !self.cascade.enabled {
            debug!("Cascade disabled in configuration, signal ignored");
            return Ok(());
        }
        if self.state != CascadeState::Inactive {
            warn!(state = ?self.state, "Cascade already engaged, signal ignored");
            return Ok(());
        }
        let side = signal.side;

        let hedge_level = match side {
            Side::Long => view.min_low(self.hedging.lookback_candles),
            Side::Short => view.max_high(self.hedging.lookback_candles),
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
        let (fill_price, filled_qty) = self.gateway.entry_fill(&ack).await?;
        let qty = if filled_qty > 0.0 { filled_qty } else { qty };

        *self.refs.get_mut(side) = Some(fill_price);
        *self.qtys.get_mut(side) = qty;
        info!(%side, fill_price, qty, "Cascade entry filled");

        let hedge_side = side.opposite();
        let hedge_qty = qty * self.hedging.quantity_multiplier;
        let hedge = match self
            .gateway
            .place_protective(
                OrderKind::StopMarket,
                hedge_side.entry_order_side(),
                hedge_side,
                hedge_qty,
                hedge_level,
                None,
            )
            .await
        {
            Ok(order) => order,
            Err(e) => {
                self.reset_all();
                return Err(e);
            }
        };
        info!(
            %hedge_side,
            stop = ?hedge.stop_price,
            qty = hedge.qty,
            "Initial hedge placed"
        );

        let hedge_stop = hedge.stop_price.unwrap_or(hedge_level);
        let (p_long, p_short) = match side {
            Side::Long => (fill_price, hedge_stop),
            Side::Short => (hedge_stop, fill_price),
        };
        self.ladder.initialize(p_long, p_short, self.tp.base_multiplier);
        self.hedge = Some(hedge);
        self.signal_side = Some(side);

        if let Err(e) = self.refresh_tp(side, qty, false, true).await {
            if let Some(hedge) = self.hedge.take() {
                self.gateway.cancel_quietly(&hedge).await;
            }
            self.reset_all();
            return Err(e);
        }

        self.state = CascadeState::WaitingHedge;
        Ok(())
    }

    async fn on_closed_candle(&mut self, _view: &MarketView<'_>) -> Result<()> {
        Ok(())
    }

    async fn on_order_update(&mut self, update: &OrderUpdate) -> Result<()> {
        // Initial hedge executed: the missing reference price is now known.
        if let Some(hedge) = self
            .hedge
            .take_if(|h| h.is(update.order_id))
        {
            let side = hedge.position_side;

            if self.refs.get(side).is_none() {
                *self.refs.get_mut(side) = Some(update.last_price);
            }
            *self.qtys.get_mut(side) += update.executed_qty;
            info!(
                %side,
                price = update.last_price,
                qty = update.executed_qty,
                "Initial hedge filled, cascade active"
            );

            if let Some(signal_side) = self.signal_side {
                let qty = *self.qtys.get(signal_side);
                self.refresh_tp(signal_side, qty, true, false).await?;
            }
            let qty = *self.qtys.get(side);
            self.refresh_tp(side, qty, false, true).await?;

            self.state = CascadeState::Active;
            self.create_next_child().await;
            return Ok(());
        }

        // A cascade child executed: rebalance and propagate.
        if let Some(idx) = self
            .pending_children
            .iter()
            .position(|c| c.is(update.order_id))
        {
            let child = self.pending_children.remove(idx);
            let side = child.position_side;
            *self.qtys.get_mut(side) += update.executed_qty;
            self.orders_count += 1;
            info!(
                %side,
                count = self.orders_count,
                long = self.qtys.long,
                short = self.qtys.short,
                "Cascade child filled"
            );

            let (long_qty, short_qty) = (self.qtys.long, self.qtys.short);
            self.refresh_tp(Side::Long, long_qty, true, false).await?;
            self.refresh_tp(Side::Short, short_qty, true, false).await?;

            if self.orders_count < self.cascade.max_orders {
                self.create_next_child().await;
            } else {
                info!(
                    max = self.cascade.max_orders,
                    "Cascade order limit reached, positions and TPs remain live"
                );
                self.state = CascadeState::Stopped;
            }
            return Ok(());
        }

        // A ladder TP executed: the whole cycle retires.
        for side in [Side::Long, Side::Short] {
            if self
                .ladder
                .active
                .get(side)
                .as_ref()
                .is_some_and(|o| o.is(update.order_id))
            {
                return self.teardown(side).await;
            }
        }

        debug!(order_id = update.order_id, "Order update for untracked order");
        Ok(())
    }

    fn snapshot(&self) -> StrategyStatus {
        StrategyStatus {
            name: self.name(),
            long_active: self.qtys.long > 0.0,
            short_active: self.qtys.short > 0.0,
            detail: format!(
                "state={:?} children={}/{} long={} short={}",
                self.state, self.orders_count, self.cascade.max_orders, self.qtys.long, self.qtys.short
            ),
        }
    }

    async fn shutdown(&mut self) {
        info!("CASCADE_MASTER shutdown, ladder orders on the exchange preserved");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ladder_levels_climb_per_side() {
        let mut ladder = TpLadder::default();
        ladder.initialize(100.0, 96.0, 1.0);
        assert_eq!(ladder.distance, Some(4.0));
        assert_eq!(ladder.level(Side::Long, 0.001), Some(104.0));
        assert_eq!(ladder.level(Side::Short, 0.001), Some(92.0));

        *ladder.counters.get_mut(Side::Long) += 1;
        let bumped = ladder.level(Side::Long, 0.001).unwrap();
        assert!((bumped - 104.0 * 1.001).abs() < 1e-9);

        *ladder.counters.get_mut(Side::Short) += 2;
        let bumped = ladder.level(Side::Short, 0.001).unwrap();
        assert!((bumped - 92.0 * 0.998).abs() < 1e-9);
    }

    #[test]
    fn ladder_reset_clears_everything() {
        let mut ladder = TpLadder::default();
        ladder.initialize(100.0, 96.0, 1.0);
        ladder.reset();
        assert!(!ladder.initialized());
        assert_eq!(ladder.level(Side::Long, 0.001), None);
    }
}
