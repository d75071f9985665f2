use async_trait::async_trait;

use crate::precision::SymbolFilters;
use crate::{AssetBalance, Candle, OrderKind, OrderSide, OrderStatus, PositionInfo, Result, Side};

/// An order as submitted to the exchange. Quantity and prices are already
/// grid-formatted decimal strings; raw levels never cross this boundary.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Side,
    pub kind: OrderKind,
    pub quantity: String,
    pub stop_price: Option<String>,
    pub limit_price: Option<String>,
    pub client_order_id: String,
}

/// Acknowledgement returned by order placement.
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub order_id: i64,
    pub client_order_id: String,
    pub status: OrderStatus,
    /// Average fill price, when the exchange already reports one.
    pub avg_price: Option<f64>,
    pub executed_qty: f64,
}

/// Point-in-time order state from the order query endpoint.
#[derive(Debug, Clone)]
pub struct OrderState {
    pub order_id: i64,
    pub status: OrderStatus,
    pub avg_price: f64,
    pub executed_qty: f64,
}

/// Summary row of the open-orders endpoint.
#[derive(Debug, Clone)]
pub struct OpenOrder {
    pub order_id: i64,
    pub side: OrderSide,
    pub position_side: Side,
    pub kind: OrderKind,
}

/// Abstraction over the exchange connection.
///
/// `BinanceClient` in `crates/engine` implements this for live trading;
/// `PaperExchange` in `crates/paper` implements it in memory for tests.
/// Strategies never call this directly; all order flow goes through the
/// gateway, which owns formatting and retry.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Futures wallet balances, one row per asset.
    async fn balances(&self) -> Result<Vec<AssetBalance>>;

    /// Trading grids of one symbol from exchange metadata.
    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters>;

    /// Most recent klines, oldest first. The last entry may be the live
    /// (unclosed) candle.
    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>>;

    /// Submit an order and return the exchange's acknowledgement.
    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck>;

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()>;

    async fn order_status(&self, symbol: &str, order_id: i64) -> Result<OrderState>;

    /// Position rows for the symbol (hedge mode: one per position side).
    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>>;

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>>;

    // ── User-data subscription token ────────────────────────────────────────

    async fn create_listen_key(&self) -> Result<String>;

    async fn keep_alive_listen_key(&self, key: &str) -> Result<()>;

    async fn close_listen_key(&self, key: &str) -> Result<()>;
}
