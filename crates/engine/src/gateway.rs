use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::config::{QuantityMode, TradingConfig};
use common::{
    Candle, Error, ExchangeApi, OpenOrder, OrderAck, OrderKind, OrderRef, OrderRequest, OrderSide,
    OrderStatus, PositionInfo, Result, Side, SymbolFilters,
};

/// Bounded retry for protective-order creation: `max_attempts` tries with a
/// linearly increasing delay of `base_delay * n` between attempts.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::ZERO,
        }
    }

    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * attempt
    }
}

/// Strategy-facing face of the exchange.
///
/// Owns the symbol-precision cache and all price/quantity formatting: every
/// level a strategy computes passes through here before it reaches the wire,
/// rounded down onto the symbol's grids. Also owns quantity sizing and the
/// protective-order retry policy. Constructed once; outlives all strategies.
pub struct Gateway {
    api: Arc<dyn ExchangeApi>,
    symbol: String,
    timeframe: String,
    trading: TradingConfig,
    retry: RetryPolicy,
    /// Write-once-then-read-mostly; refreshed only by explicit reload.
    filters: RwLock<Option<SymbolFilters>>,
}

impl Gateway {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        trading: TradingConfig,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            api,
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            trading,
            retry,
            filters: RwLock::new(None),
        }
    }

    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Fetch and cache the symbol's grids. Call at startup so a bad symbol
    /// fails before any trading starts.
    pub async fn preload(&self) -> Result<()> {
        let filters = self.filters().await?;
        info!(
            symbol = %self.symbol,
            tick_size = %filters.tick_size,
            step_size = %filters.step_size,
            min_qty = %filters.min_qty,
            "Symbol precision cached"
        );
        Ok(())
    }

    /// Drop the cached grids; the next call refetches exchange metadata.
    pub async fn reload_filters(&self) {
        *self.filters.write().await = None;
    }

    async fn filters(&self) -> Result<SymbolFilters> {
        if let Some(f) = self.filters.read().await.clone() {
            return Ok(f);
        }
        let fetched = self.api.symbol_filters(&self.symbol).await?;
        let mut slot = self.filters.write().await;
        // Another task may have raced the fetch; first write wins.
        if slot.is_none() {
            *slot = Some(fetched.clone());
        }
        Ok(slot.clone().unwrap_or(fetched))
    }

    pub async fn format_price(&self, price: f64) -> Result<String> {
        self.filters().await?.format_price(price)
    }

    pub async fn format_quantity(&self, quantity: f64) -> Result<String> {
        self.filters().await?.format_quantity(quantity)
    }

    // ── Account ─────────────────────────────────────────────────────────────

    /// Available balance of the symbol's quote asset.
    pub async fn quote_balance(&self) -> Result<Option<f64>> {
        let quote = quote_asset(&self.symbol);
        let balances = self.api.balances().await?;
        Ok(balances
            .into_iter()
            .find(|b| b.asset == quote)
            .map(|b| b.available))
    }

    pub async fn position(&self, side: Side) -> Result<Option<PositionInfo>> {
        let positions = self.api.positions(&self.symbol).await?;
        Ok(positions.into_iter().find(|p| p.position_side == side))
    }

    pub async fn positions(&self) -> Result<Vec<PositionInfo>> {
        self.api.positions(&self.symbol).await
    }

    pub async fn open_orders(&self) -> Result<Vec<OpenOrder>> {
        self.api.open_orders(&self.symbol).await
    }

    pub async fn klines(&self, limit: u32) -> Result<Vec<Candle>> {
        self.api.klines(&self.symbol, &self.timeframe, limit).await
    }

    // ── Sizing ──────────────────────────────────────────────────────────────

    /// Entry quantity per the configured sizing rule, already on the step
    /// grid. PERCENTAGE risks `balance * pct` against the distance between
    /// the entry price and the protective level, falling back to the
    /// exchange minimum when the balance is unavailable.
    pub async fn initial_quantity(&self, entry_price: f64, protective_level: f64) -> Result<f64> {
        let filters = self.filters().await?;

        let raw = match self.trading.quantity_mode {
            QuantityMode::Minimum => filters.min_qty_f64(),
            QuantityMode::Fixed => self.trading.initial_quantity,
            QuantityMode::Percentage => {
                let balance = self.quote_balance().await?;
                let Some(balance) = balance.filter(|b| *b > 0.0) else {
                    warn!(
                        symbol = %self.symbol,
                        "Quote balance unavailable, falling back to minimum quantity"
                    );
                    return Ok(filters.min_qty_f64());
                };

                let distance = (entry_price - protective_level).abs();
                if distance == 0.0 {
                    return Err(Error::Other(
                        "entry and protective level coincide, cannot size position".into(),
                    ));
                }

                let risk_amount = balance * self.trading.balance_percentage;
                let qty = risk_amount / distance;
                debug!(
                    balance,
                    risk_amount, distance, qty, "Percentage sizing computed"
                );
                qty
            }
        };

        let formatted = filters.format_quantity(raw.max(0.0))?;
        let on_grid: f64 = formatted.parse().unwrap_or(0.0);
        if on_grid <= 0.0 {
            warn!(raw, "Computed quantity below step grid, using minimum quantity");
            return Ok(filters.min_qty_f64());
        }
        Ok(on_grid)
    }

    // ── Orders ──────────────────────────────────────────────────────────────

    fn request(
        &self,
        kind: OrderKind,
        side: OrderSide,
        position_side: Side,
        quantity: String,
        stop_price: Option<String>,
        limit_price: Option<String>,
    ) -> OrderRequest {
        OrderRequest {
            symbol: self.symbol.clone(),
            side,
            position_side,
            kind,
            quantity,
            stop_price,
            limit_price,
            client_order_id: format!("x-{}", Uuid::new_v4().simple()),
        }
    }

    /// Submit a MARKET order. Quantity is formatted onto the step grid here.
    pub async fn market(
        &self,
        side: OrderSide,
        position_side: Side,
        quantity: f64,
    ) -> Result<OrderAck> {
        let qty = self.format_quantity(quantity).await?;
        let req = self.request(OrderKind::Market, side, position_side, qty, None, None);
        info!(symbol = %self.symbol, %side, %position_side, qty = %req.quantity, "Placing MARKET order");
        self.api.place_order(&req).await
    }

    /// Submit a STOP_MARKET order. Both quantity and trigger price are
    /// formatted onto their grids here.
    pub async fn stop_market(
        &self,
        side: OrderSide,
        position_side: Side,
        quantity: f64,
        stop_price: f64,
    ) -> Result<OrderRef> {
        let qty = self.format_quantity(quantity).await?;
        let stop = self.format_price(stop_price).await?;
        let req = self.request(
            OrderKind::StopMarket,
            side,
            position_side,
            qty.clone(),
            Some(stop.clone()),
            None,
        );
        info!(
            symbol = %self.symbol, %side, %position_side,
            qty = %qty, stop = %stop,
            "Placing STOP_MARKET order"
        );
        let ack = self.api.place_order(&req).await?;
        Ok(order_ref(&req, &ack))
    }

    /// Submit a TAKE_PROFIT (stop-limit) order.
    pub async fn take_profit(
        &self,
        side: OrderSide,
        position_side: Side,
        quantity: f64,
        stop_price: f64,
        limit_price: f64,
    ) -> Result<OrderRef> {
        let qty = self.format_quantity(quantity).await?;
        let stop = self.format_price(stop_price).await?;
        let limit = self.format_price(limit_price).await?;
        let req = self.request(
            OrderKind::TakeProfit,
            side,
            position_side,
            qty.clone(),
            Some(stop.clone()),
            Some(limit.clone()),
        );
        info!(
            symbol = %self.symbol, %side, %position_side,
            qty = %qty, stop = %stop, limit = %limit,
            "Placing TAKE_PROFIT order"
        );
        let ack = self.api.place_order(&req).await?;
        Ok(order_ref(&req, &ack))
    }

    /// Protective-order placement wrapped in the bounded retry. Exhaustion
    /// surfaces `Error::ProtectiveOrder`; the caller is responsible for
    /// cancelling any sibling already placed in the same cycle.
    pub async fn place_protective(
        &self,
        kind: OrderKind,
        side: OrderSide,
        position_side: Side,
        quantity: f64,
        stop_price: f64,
        limit_price: Option<f64>,
    ) -> Result<OrderRef> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=self.retry.max_attempts {
            info!(
                attempt,
                max = self.retry.max_attempts,
                %kind, %position_side,
                "Protective order attempt"
            );
            let result = match (kind, limit_price) {
                (OrderKind::StopMarket, _) => {
                    self.stop_market(side, position_side, quantity, stop_price).await
                }
                (OrderKind::TakeProfit, Some(limit)) => {
                    self.take_profit(side, position_side, quantity, stop_price, limit).await
                }
                _ => Err(Error::Other(format!("{kind} is not a protective order"))),
            };

            match result {
                Ok(order) => return Ok(order),
                Err(e) => {
                    warn!(attempt, error = %e, "Protective order attempt failed");
                    last_error = e.to_string();
                }
            }

            if attempt < self.retry.max_attempts {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(Error::ProtectiveOrder {
            side: position_side.to_string(),
            kind: kind.to_string(),
            reason: last_error,
        })
    }

    pub async fn cancel(&self, order_id: i64) -> Result<()> {
        self.api.cancel_order(&self.symbol, order_id).await
    }

    /// Best-effort cancel for teardown paths: failures are logged, not
    /// propagated, so one dead order cannot block the rest of a cleanup.
    pub async fn cancel_quietly(&self, order: &OrderRef) {
        match self.cancel(order.order_id).await {
            Ok(()) => info!(order_id = order.order_id, kind = %order.kind, "Order cancelled"),
            Err(e) => warn!(order_id = order.order_id, error = %e, "Cancel failed"),
        }
    }

    /// Fill price and executed quantity of an entry. Prefers the order-status
    /// endpoint over the placement acknowledgement.
    pub async fn entry_fill(&self, ack: &OrderAck) -> Result<(f64, f64)> {
        match self.api.order_status(&self.symbol, ack.order_id).await {
            Ok(state) if state.status == OrderStatus::Filled && state.avg_price > 0.0 => {
                return Ok((state.avg_price, state.executed_qty));
            }
            Ok(state) => {
                warn!(order_id = ack.order_id, status = %state.status, "Entry not FILLED per order status");
            }
            Err(e) => {
                warn!(order_id = ack.order_id, error = %e, "Order status lookup failed");
            }
        }
        // Fall back to the placement response.
        match ack.avg_price {
            Some(p) if p > 0.0 => Ok((p, ack.executed_qty)),
            _ => Err(Error::Exchange(format!(
                "fill price unavailable for order {}",
                ack.order_id
            ))),
        }
    }

    /// MARKET-close every non-zero position on the symbol.
    pub async fn flatten_all(&self) -> Result<()> {
        let positions = self.positions().await?;
        for pos in positions.iter().filter(|p| p.is_open()) {
            info!(
                position_side = %pos.position_side,
                qty = pos.quantity(),
                "Flattening residual position"
            );
            self.market(
                pos.position_side.exit_order_side(),
                pos.position_side,
                pos.quantity(),
            )
            .await?;
        }
        Ok(())
    }
}

fn order_ref(req: &OrderRequest, ack: &OrderAck) -> OrderRef {
    OrderRef {
        order_id: ack.order_id,
        symbol: req.symbol.clone(),
        side: req.side,
        position_side: req.position_side,
        kind: req.kind,
        qty: req.quantity.parse().unwrap_or(0.0),
        stop_price: req.stop_price.as_deref().and_then(|s| s.parse().ok()),
        limit_price: req.limit_price.as_deref().and_then(|s| s.parse().ok()),
        status: ack.status,
    }
}

fn quote_asset(symbol: &str) -> &str {
    const KNOWN: [&str; 5] = ["USDT", "USDC", "BTC", "ETH", "BNB"];
    for quote in KNOWN {
        if symbol.ends_with(quote) {
            return quote;
        }
    }
    warn!(symbol, "Unrecognized quote asset, assuming USDT");
    "USDT"
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::QuantityMode;
    use paper::PaperExchange;

    fn trading(mode: QuantityMode) -> TradingConfig {
        TradingConfig {
            quantity_mode: mode,
            initial_quantity: 0.5,
            balance_percentage: 0.01,
        }
    }

    fn gateway(api: Arc<PaperExchange>, mode: QuantityMode) -> Gateway {
        Gateway::new(api, "BTCUSDC", "5m", trading(mode), RetryPolicy::immediate(5))
    }

    #[test]
    fn quote_asset_by_suffix() {
        assert_eq!(quote_asset("BTCUSDC"), "USDC");
        assert_eq!(quote_asset("LINKUSDT"), "USDT");
        assert_eq!(quote_asset("ETHBTC"), "BTC");
    }

    #[tokio::test]
    async fn percentage_sizing_uses_protective_distance() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        api.set_balance("USDC", 10_000.0);
        let gw = gateway(api, QuantityMode::Percentage);

        // risk 1% of 10_000 = 100 over a distance of 5.0 -> 20.0
        let qty = gw.initial_quantity(101.0, 96.0).await.unwrap();
        assert_eq!(qty, 20.0);
    }

    #[tokio::test]
    async fn percentage_sizing_falls_back_to_minimum_without_balance() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        // no balance configured
        let gw = gateway(api, QuantityMode::Percentage);
        let qty = gw.initial_quantity(101.0, 96.0).await.unwrap();
        assert_eq!(qty, 0.001);
    }

    #[tokio::test]
    async fn fixed_and_minimum_modes() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        let gw = gateway(api.clone(), QuantityMode::Fixed);
        assert_eq!(gw.initial_quantity(0.0, 0.0).await.unwrap(), 0.5);

        let gw = gateway(api, QuantityMode::Minimum);
        assert_eq!(gw.initial_quantity(0.0, 0.0).await.unwrap(), 0.001);
    }

    #[tokio::test]
    async fn orders_go_out_on_the_grid() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        let gw = gateway(api.clone(), QuantityMode::Fixed);

        let order = gw
            .stop_market(OrderSide::Sell, Side::Long, 0.0029999, 95.99904)
            .await
            .unwrap();
        assert_eq!(order.qty, 0.002);
        assert_eq!(order.stop_price, Some(95.9));

        let placed = api.last_order().unwrap();
        assert_eq!(placed.req.quantity, "0.002");
        assert_eq!(placed.req.stop_price.as_deref(), Some("95.9"));
    }

    #[tokio::test]
    async fn protective_retry_exhaustion_is_fatal() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        api.fail_next(OrderKind::StopMarket, 5);
        let gw = gateway(api.clone(), QuantityMode::Fixed);

        let err = gw
            .place_protective(OrderKind::StopMarket, OrderSide::Sell, Side::Long, 0.002, 95.9, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ProtectiveOrder { .. }));
        assert!(api.open_orders_snapshot().is_empty());
    }

    #[tokio::test]
    async fn protective_retry_succeeds_after_transient_failures() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        api.fail_next(OrderKind::StopMarket, 2);
        let gw = gateway(api.clone(), QuantityMode::Fixed);

        let order = gw
            .place_protective(OrderKind::StopMarket, OrderSide::Sell, Side::Long, 0.002, 95.9, None)
            .await
            .unwrap();
        assert_eq!(order.kind, OrderKind::StopMarket);
        assert_eq!(api.open_orders_snapshot().len(), 1);
    }

    #[tokio::test]
    async fn flatten_all_closes_every_open_position() {
        let api = Arc::new(PaperExchange::new("BTCUSDC", "0.1", "0.001", "0.001"));
        api.set_mark_price(100.0);
        api.set_position(Side::Long, 100.0, 0.01);
        api.set_position(Side::Short, 99.5, -0.02);
        let gw = gateway(api.clone(), QuantityMode::Fixed);

        gw.flatten_all().await.unwrap();
        assert!(api.position_snapshot(Side::Long).is_none());
        assert!(api.position_snapshot(Side::Short).is_none());
    }
}
