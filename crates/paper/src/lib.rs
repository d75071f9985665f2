//! In-memory exchange simulator.
//!
//! Implements [`ExchangeApi`] against an internal order ledger and position
//! book so the strategy runtime can be exercised end-to-end without a network.
//! MARKET orders fill immediately at the configured mark price; STOP_MARKET
//! and TAKE_PROFIT orders rest as open until a test fills them explicitly
//! with [`PaperExchange::fill_order`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::debug;

use common::{
    AssetBalance, Candle, Error, ExchangeApi, OpenOrder, OrderAck, OrderKind, OrderRequest,
    OrderSide, OrderState, OrderStatus, OrderUpdate, PositionInfo, Result, Side, SymbolFilters,
};

/// One order in the simulated ledger.
#[derive(Debug, Clone)]
pub struct PaperOrder {
    pub order_id: i64,
    pub req: OrderRequest,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
}

#[derive(Debug, Clone, Copy, Default)]
struct PositionState {
    entry_price: f64,
    /// Signed, Binance-style: SHORT positions carry a negative amount.
    amt: f64,
}

#[derive(Default)]
struct Inner {
    orders: Vec<PaperOrder>,
    positions: HashMap<Side, PositionState>,
    balances: HashMap<String, f64>,
    klines: Vec<Candle>,
    mark_price: f64,
    /// Pending simulated rejections per order kind.
    fail_counts: HashMap<OrderKind, u32>,
    listen_keys_created: u32,
    listen_keys_closed: u32,
}

pub struct PaperExchange {
    symbol: String,
    filters: SymbolFilters,
    next_order_id: AtomicI64,
    inner: Mutex<Inner>,
}

impl PaperExchange {
    pub fn new(symbol: impl Into<String>, tick: &str, step: &str, min_qty: &str) -> Self {
        Self {
            symbol: symbol.into(),
            filters: SymbolFilters::parse(tick, step, min_qty).expect("valid test grids"),
            next_order_id: AtomicI64::new(1),
            inner: Mutex::new(Inner::default()),
        }
    }

    // ── Test scripting ──────────────────────────────────────────────────────

    pub fn set_balance(&self, asset: &str, available: f64) {
        self.inner.lock().unwrap().balances.insert(asset.to_string(), available);
    }

    pub fn set_mark_price(&self, price: f64) {
        self.inner.lock().unwrap().mark_price = price;
    }

    pub fn set_klines(&self, klines: Vec<Candle>) {
        self.inner.lock().unwrap().klines = klines;
    }

    /// Overwrite one position row (signed amount, Binance-style).
    pub fn set_position(&self, side: Side, entry_price: f64, amt: f64) {
        self.inner
            .lock()
            .unwrap()
            .positions
            .insert(side, PositionState { entry_price, amt });
    }

    /// Reject the next `n` placements of `kind` with an exchange error.
    pub fn fail_next(&self, kind: OrderKind, n: u32) {
        self.inner.lock().unwrap().fail_counts.insert(kind, n);
    }

    /// Fill a resting order at `price`, apply its position effect, and return
    /// the normalized update a user-data stream would deliver.
    pub fn fill_order(&self, order_id: i64, price: f64) -> OrderUpdate {
        let mut inner = self.inner.lock().unwrap();
        let idx = inner
            .orders
            .iter()
            .position(|o| o.order_id == order_id)
            .unwrap_or_else(|| panic!("no such order: {order_id}"));

        let (req, qty) = {
            let order = &mut inner.orders[idx];
            assert_eq!(order.status, OrderStatus::New, "order {order_id} is not open");
            let qty: f64 = order.req.quantity.parse().unwrap_or(0.0);
            order.status = OrderStatus::Filled;
            order.avg_price = price;
            order.executed_qty = qty;
            (order.req.clone(), qty)
        };
        apply_fill(&mut inner, req.side, req.position_side, qty, price);

        OrderUpdate {
            order_id,
            symbol: req.symbol,
            side: req.side,
            position_side: req.position_side,
            status: OrderStatus::Filled,
            executed_qty: qty,
            last_price: price,
            kind: req.kind,
        }
    }

    // ── Assertions ──────────────────────────────────────────────────────────

    pub fn orders_snapshot(&self) -> Vec<PaperOrder> {
        self.inner.lock().unwrap().orders.clone()
    }

    pub fn last_order(&self) -> Option<PaperOrder> {
        self.inner.lock().unwrap().orders.last().cloned()
    }

    pub fn order(&self, order_id: i64) -> Option<PaperOrder> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .cloned()
    }

    pub fn open_orders_snapshot(&self) -> Vec<PaperOrder> {
        self.inner
            .lock()
            .unwrap()
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::New)
            .cloned()
            .collect()
    }

    pub fn position_snapshot(&self, side: Side) -> Option<PositionInfo> {
        let inner = self.inner.lock().unwrap();
        inner.positions.get(&side).map(|p| PositionInfo {
            symbol: self.symbol.clone(),
            position_side: side,
            entry_price: p.entry_price,
            position_amt: p.amt,
        })
    }

    pub fn listen_key_counts(&self) -> (u32, u32) {
        let inner = self.inner.lock().unwrap();
        (inner.listen_keys_created, inner.listen_keys_closed)
    }
}

/// Apply one fill to the hedge-mode position book. Increasing the magnitude
/// of a position moves its entry to the volume-weighted average; reducing it
/// leaves the entry untouched; reaching zero removes the row.
fn apply_fill(inner: &mut Inner, side: OrderSide, position_side: Side, qty: f64, price: f64) {
    let delta = match side {
        OrderSide::Buy => qty,
        OrderSide::Sell => -qty,
    };
    let pos = inner.positions.entry(position_side).or_default();
    let old = pos.amt;
    let new = old + delta;

    if new.abs() > old.abs() {
        pos.entry_price = if old == 0.0 {
            price
        } else {
            (pos.entry_price * old.abs() + price * qty) / (old.abs() + qty)
        };
    }
    pos.amt = new;

    if pos.amt.abs() < 1e-12 {
        inner.positions.remove(&position_side);
    }
}

#[async_trait]
impl ExchangeApi for PaperExchange {
    async fn balances(&self) -> Result<Vec<AssetBalance>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .balances
            .iter()
            .map(|(asset, available)| AssetBalance {
                asset: asset.clone(),
                available: *available,
            })
            .collect())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        if symbol != self.symbol {
            return Err(Error::Exchange(format!("unknown symbol {symbol}")));
        }
        Ok(self.filters.clone())
    }

    async fn klines(&self, _symbol: &str, _interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let inner = self.inner.lock().unwrap();
        let klines = &inner.klines;
        let start = klines.len().saturating_sub(limit as usize);
        Ok(klines[start..].to_vec())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(n) = inner.fail_counts.get_mut(&req.kind) {
            if *n > 0 {
                *n -= 1;
                return Err(Error::Exchange(format!(
                    "HTTP 400: simulated rejection of {}",
                    req.kind
                )));
            }
        }

        let order_id = self.next_order_id.fetch_add(1, Ordering::SeqCst);
        let qty: f64 = req.quantity.parse().unwrap_or(0.0);

        let (status, avg_price, executed_qty) = match req.kind {
            OrderKind::Market => {
                let mark = inner.mark_price;
                apply_fill(&mut inner, req.side, req.position_side, qty, mark);
                (OrderStatus::Filled, mark, qty)
            }
            _ => (OrderStatus::New, 0.0, 0.0),
        };

        debug!(order_id, kind = %req.kind, side = %req.side, "Paper order placed");
        inner.orders.push(PaperOrder {
            order_id,
            req: req.clone(),
            status,
            avg_price,
            executed_qty,
        });

        Ok(OrderAck {
            order_id,
            client_order_id: req.client_order_id.clone(),
            status,
            avg_price: (avg_price > 0.0).then_some(avg_price),
            executed_qty,
        })
    }

    async fn cancel_order(&self, _symbol: &str, order_id: i64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter_mut()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| Error::Exchange(format!("HTTP 400: unknown order {order_id}")))?;
        if order.status != OrderStatus::New {
            return Err(Error::Exchange(format!(
                "HTTP 400: order {order_id} is {} and cannot be canceled",
                order.status
            )));
        }
        order.status = OrderStatus::Canceled;
        Ok(())
    }

    async fn order_status(&self, _symbol: &str, order_id: i64) -> Result<OrderState> {
        let inner = self.inner.lock().unwrap();
        let order = inner
            .orders
            .iter()
            .find(|o| o.order_id == order_id)
            .ok_or_else(|| Error::Exchange(format!("HTTP 400: unknown order {order_id}")))?;
        Ok(OrderState {
            order_id,
            status: order.status,
            avg_price: order.avg_price,
            executed_qty: order.executed_qty,
        })
    }

    async fn positions(&self, _symbol: &str) -> Result<Vec<PositionInfo>> {
        let inner = self.inner.lock().unwrap();
        let mut rows: Vec<PositionInfo> = inner
            .positions
            .iter()
            .map(|(side, p)| PositionInfo {
                symbol: self.symbol.clone(),
                position_side: *side,
                entry_price: p.entry_price,
                position_amt: p.amt,
            })
            .collect();
        rows.sort_by_key(|r| r.position_side == Side::Short);
        Ok(rows)
    }

    async fn open_orders(&self, _symbol: &str) -> Result<Vec<OpenOrder>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner
            .orders
            .iter()
            .filter(|o| o.status == OrderStatus::New)
            .map(|o| OpenOrder {
                order_id: o.order_id,
                side: o.req.side,
                position_side: o.req.position_side,
                kind: o.req.kind,
            })
            .collect())
    }

    async fn create_listen_key(&self) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.listen_keys_created += 1;
        Ok(format!("paper-listen-key-{}", inner.listen_keys_created))
    }

    async fn keep_alive_listen_key(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    async fn close_listen_key(&self, _key: &str) -> Result<()> {
        self.inner.lock().unwrap().listen_keys_closed += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange() -> PaperExchange {
        PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001")
    }

    fn market_req(side: OrderSide, position_side: Side, qty: &str) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDC".into(),
            side,
            position_side,
            kind: OrderKind::Market,
            quantity: qty.into(),
            stop_price: None,
            limit_price: None,
            client_order_id: "x-test".into(),
        }
    }

    #[tokio::test]
    async fn market_orders_fill_at_mark_and_open_positions() {
        let ex = exchange();
        ex.set_mark_price(100.0);

        let ack = ex
            .place_order(&market_req(OrderSide::Buy, Side::Long, "0.002"))
            .await
            .unwrap();
        assert_eq!(ack.status, OrderStatus::Filled);
        assert_eq!(ack.avg_price, Some(100.0));

        let pos = ex.position_snapshot(Side::Long).unwrap();
        assert_eq!(pos.entry_price, 100.0);
        assert_eq!(pos.position_amt, 0.002);
    }

    #[tokio::test]
    async fn averaging_moves_entry_price() {
        let ex = exchange();
        ex.set_mark_price(100.0);
        ex.place_order(&market_req(OrderSide::Buy, Side::Long, "0.002"))
            .await
            .unwrap();
        ex.set_mark_price(98.0);
        ex.place_order(&market_req(OrderSide::Buy, Side::Long, "0.002"))
            .await
            .unwrap();

        let pos = ex.position_snapshot(Side::Long).unwrap();
        assert!((pos.entry_price - 99.0).abs() < 1e-9);
        assert!((pos.position_amt - 0.004).abs() < 1e-12);
    }

    #[tokio::test]
    async fn filling_a_resting_stop_updates_the_book() {
        let ex = exchange();
        let req = OrderRequest {
            kind: OrderKind::StopMarket,
            stop_price: Some("96.0".into()),
            ..market_req(OrderSide::Sell, Side::Short, "0.004")
        };
        let ack = ex.place_order(&req).await.unwrap();
        assert_eq!(ack.status, OrderStatus::New);

        let update = ex.fill_order(ack.order_id, 96.0);
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.executed_qty, 0.004);

        let pos = ex.position_snapshot(Side::Short).unwrap();
        assert_eq!(pos.position_amt, -0.004);
        assert_eq!(pos.entry_price, 96.0);
    }

    #[tokio::test]
    async fn cancel_only_affects_open_orders() {
        let ex = exchange();
        ex.set_mark_price(100.0);
        let ack = ex
            .place_order(&market_req(OrderSide::Buy, Side::Long, "0.002"))
            .await
            .unwrap();
        // market orders fill immediately, so cancel must fail
        assert!(ex.cancel_order("BTCUSDC", ack.order_id).await.is_err());
    }

    #[tokio::test]
    async fn scripted_klines_respect_the_limit() {
        let ex = exchange();
        let candles: Vec<Candle> = (0..10)
            .map(|i| Candle {
                open_time: i * 1000,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 10.0,
                is_closed: true,
            })
            .collect();
        ex.set_klines(candles);

        let out = ex.klines("BTCUSDC", "5m", 4).await.unwrap();
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].open_time, 6000);
    }

    #[tokio::test]
    async fn failure_injection_rejects_then_recovers() {
        let ex = exchange();
        ex.fail_next(OrderKind::StopMarket, 1);
        let req = OrderRequest {
            kind: OrderKind::StopMarket,
            stop_price: Some("96.0".into()),
            ..market_req(OrderSide::Sell, Side::Short, "0.004")
        };
        assert!(ex.place_order(&req).await.is_err());
        assert!(ex.place_order(&req).await.is_ok());
    }
}
