use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single kline/candlestick as received from the exchange stream.
///
/// `is_closed` is the exchange's close flag; only closed candles feed the
/// indicator pipeline and the strategies' candle history.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Candle open time in milliseconds since epoch. Used as the idempotence
    /// key for close events.
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_closed: bool,
}

/// Live market data event from the kline stream.
/// Emitted on every kline update; `kline.is_closed` marks the close transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketEvent {
    pub symbol: String,
    pub kline: Candle,
    pub timestamp: DateTime<Utc>,
}

/// Direction of a position (Binance hedge-mode `positionSide`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Side {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// The order side that opens a position on this side.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// The order side that closes a position on this side.
    pub fn exit_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Sell,
            Side::Short => OrderSide::Buy,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

/// Side of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type as sent to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OrderKind {
    #[serde(rename = "MARKET")]
    Market,
    #[serde(rename = "STOP_MARKET")]
    StopMarket,
    #[serde(rename = "TAKE_PROFIT")]
    TakeProfit,
}

impl std::fmt::Display for OrderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderKind::Market => write!(f, "MARKET"),
            OrderKind::StopMarket => write!(f, "STOP_MARKET"),
            OrderKind::TakeProfit => write!(f, "TAKE_PROFIT"),
        }
    }
}

/// Order lifecycle status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Expired,
    Rejected,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::New => "NEW",
            OrderStatus::PartiallyFilled => "PARTIALLY_FILLED",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Canceled => "CANCELED",
            OrderStatus::Expired => "EXPIRED",
            OrderStatus::Rejected => "REJECTED",
        };
        write!(f, "{s}")
    }
}

/// Normalized `ORDER_TRADE_UPDATE` event from the user-data stream.
///
/// Only `Filled` updates drive strategy state transitions; every other
/// status is observed for logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Side,
    pub status: OrderStatus,
    pub executed_qty: f64,
    pub last_price: f64,
    pub kind: OrderKind,
}

/// Heikin-Ashi candle color.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HaColor {
    Green,
    Red,
    Doji,
}

impl std::fmt::Display for HaColor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HaColor::Green => write!(f, "green"),
            HaColor::Red => write!(f, "red"),
            HaColor::Doji => write!(f, "doji"),
        }
    }
}

/// Confirmed entry signal emitted by the signal engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    pub side: Side,
    /// RSI value per period at confirmation time, ascending by period.
    pub rsi_snapshot: Vec<(u32, f64)>,
    pub ha_color: HaColor,
    /// Volume of the confirming candle, when volume validation ran.
    pub volume: Option<f64>,
    pub origin_timestamp: DateTime<Utc>,
}

/// A live order tracked in strategy state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRef {
    pub order_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub position_side: Side,
    pub kind: OrderKind,
    pub qty: f64,
    pub stop_price: Option<f64>,
    pub limit_price: Option<f64>,
    pub status: OrderStatus,
}

impl OrderRef {
    pub fn is(&self, order_id: i64) -> bool {
        self.order_id == order_id
    }
}

/// One row of the futures position endpoint, normalized.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionInfo {
    pub symbol: String,
    pub position_side: Side,
    pub entry_price: f64,
    /// Signed position amount as reported by the exchange.
    pub position_amt: f64,
}

impl PositionInfo {
    pub fn quantity(&self) -> f64 {
        self.position_amt.abs()
    }

    pub fn is_open(&self) -> bool {
        self.position_amt != 0.0
    }
}

/// One asset balance row of the futures balance endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetBalance {
    pub asset: String,
    pub available: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn side_opposite_and_order_sides() {
        assert_eq!(Side::Long.opposite(), Side::Short);
        assert_eq!(Side::Short.opposite(), Side::Long);
        assert_eq!(Side::Long.entry_order_side(), OrderSide::Buy);
        assert_eq!(Side::Long.exit_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.entry_order_side(), OrderSide::Sell);
        assert_eq!(Side::Short.exit_order_side(), OrderSide::Buy);
    }

    #[test]
    fn order_status_parses_exchange_strings() {
        let s: OrderStatus = serde_json::from_str("\"PARTIALLY_FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::PartiallyFilled);
        let s: OrderStatus = serde_json::from_str("\"FILLED\"").unwrap();
        assert_eq!(s, OrderStatus::Filled);
    }

    #[test]
    fn order_kind_parses_exchange_strings() {
        let k: OrderKind = serde_json::from_str("\"STOP_MARKET\"").unwrap();
        assert_eq!(k, OrderKind::StopMarket);
        assert_eq!(k.to_string(), "STOP_MARKET");
    }
}
