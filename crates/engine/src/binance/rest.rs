use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use sha2::Sha256;
use tracing::debug;

use common::{
    AssetBalance, Candle, Error, ExchangeApi, OpenOrder, OrderAck, OrderKind, OrderRequest,
    OrderSide, OrderState, OrderStatus, PositionInfo, Result, Side, SymbolFilters,
};

const BASE_URL: &str = "https://fapi.binance.com";

/// REST client for the Binance USDT-M Futures API. Signed requests carry an
/// HMAC-SHA256 signature over the canonical form-encoded query string and
/// the `X-MBX-APIKEY` header.
pub struct BinanceClient {
    api_key: String,
    secret: String,
    http: Client,
}

impl BinanceClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            http: Client::builder()
                .use_rustls_tls()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_millis() as u64
    }

    fn sign(&self, query: &str) -> String {
        type HmacSha256 = Hmac<Sha256>;
        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts any key length");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Signed request: appends `timestamp` and `signature` to the query.
    async fn signed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        let ts = Self::timestamp_ms();
        let query = if params.is_empty() {
            format!("timestamp={ts}")
        } else {
            format!("{params}&timestamp={ts}")
        };
        let signature = self.sign(&query);
        let url = format!("{BASE_URL}{path}?{query}&signature={signature}");

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    /// Keyed but unsigned request (listen-key endpoints).
    async fn keyed(&self, method: Method, path: &str, params: &str) -> Result<String> {
        let url = if params.is_empty() {
            format!("{BASE_URL}{path}")
        } else {
            format!("{BASE_URL}{path}?{params}")
        };

        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.api_key)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;

        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }

    async fn public(&self, path: &str, params: &str) -> Result<String> {
        let url = if params.is_empty() {
            format!("{BASE_URL}{path}")
        } else {
            format!("{BASE_URL}{path}?{params}")
        };
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        let status = resp.status();
        let body = resp.text().await.map_err(|e| Error::Http(e.to_string()))?;
        if !status.is_success() {
            return Err(Error::Exchange(format!("HTTP {status}: {body}")));
        }
        Ok(body)
    }
}

#[async_trait]
impl ExchangeApi for BinanceClient {
    async fn balances(&self) -> Result<Vec<AssetBalance>> {
        let body = self.signed(Method::GET, "/fapi/v2/balance", "").await?;
        let rows: Vec<BalanceRow> = serde_json::from_str(&body)?;
        Ok(rows
            .into_iter()
            .map(|r| AssetBalance {
                asset: r.asset,
                available: r.available_balance.parse().unwrap_or(0.0),
            })
            .collect())
    }

    async fn symbol_filters(&self, symbol: &str) -> Result<SymbolFilters> {
        let body = self.public("/fapi/v1/exchangeInfo", "").await?;
        let info: ExchangeInfo = serde_json::from_str(&body)?;

        let sym = info
            .symbols
            .into_iter()
            .find(|s| s.symbol == symbol)
            .ok_or_else(|| Error::Exchange(format!("symbol {symbol} not in exchangeInfo")))?;

        let mut tick_size = None;
        let mut step_size = None;
        let mut min_qty = None;
        for f in &sym.filters {
            match f.filter_type.as_str() {
                "PRICE_FILTER" => tick_size = f.tick_size.clone(),
                "LOT_SIZE" => {
                    step_size = f.step_size.clone();
                    min_qty = f.min_qty.clone();
                }
                _ => {}
            }
        }

        match (tick_size, step_size, min_qty) {
            (Some(t), Some(s), Some(m)) => SymbolFilters::parse(&t, &s, &m),
            _ => Err(Error::Exchange(format!(
                "PRICE_FILTER/LOT_SIZE missing for {symbol}"
            ))),
        }
    }

    async fn klines(&self, symbol: &str, interval: &str, limit: u32) -> Result<Vec<Candle>> {
        let params = format!("symbol={symbol}&interval={interval}&limit={limit}");
        let body = self.public("/fapi/v1/klines", &params).await?;
        let rows: Vec<Vec<serde_json::Value>> = serde_json::from_str(&body)?;

        let n = rows.len();
        let mut out = Vec::with_capacity(n);
        for (i, row) in rows.into_iter().enumerate() {
            let num = |idx: usize| -> f64 {
                row.get(idx)
                    .and_then(|v| v.as_str())
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(0.0)
            };
            out.push(Candle {
                open_time: row.first().and_then(|v| v.as_i64()).unwrap_or(0),
                open: num(1),
                high: num(2),
                low: num(3),
                close: num(4),
                volume: num(5),
                // The endpoint returns the forming candle last.
                is_closed: i + 1 < n,
            });
        }
        Ok(out)
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<OrderAck> {
        let mut params = format!(
            "symbol={}&side={}&positionSide={}&type={}&quantity={}&newClientOrderId={}",
            req.symbol, req.side, req.position_side, req.kind, req.quantity, req.client_order_id
        );
        if let Some(stop) = &req.stop_price {
            params.push_str(&format!("&stopPrice={stop}"));
        }
        if let Some(limit) = &req.limit_price {
            params.push_str(&format!("&price={limit}&timeInForce=GTC"));
        }

        debug!(symbol = %req.symbol, side = %req.side, kind = %req.kind, "Submitting order");
        let body = self.signed(Method::POST, "/fapi/v1/order", &params).await?;
        let resp: OrderResponse = serde_json::from_str(&body)?;
        Ok(resp.into_ack())
    }

    async fn cancel_order(&self, symbol: &str, order_id: i64) -> Result<()> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        self.signed(Method::DELETE, "/fapi/v1/order", &params)
            .await?;
        Ok(())
    }

    async fn order_status(&self, symbol: &str, order_id: i64) -> Result<OrderState> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let body = self.signed(Method::GET, "/fapi/v1/order", &params).await?;
        let resp: OrderResponse = serde_json::from_str(&body)?;
        Ok(OrderState {
            order_id: resp.order_id,
            status: resp.status,
            avg_price: resp.avg_price.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0),
            executed_qty: resp.executed_qty.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0.0),
        })
    }

    async fn positions(&self, symbol: &str) -> Result<Vec<PositionInfo>> {
        let params = format!("symbol={symbol}");
        let body = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        let rows: Vec<PositionRow> = serde_json::from_str(&body)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                let position_side = parse_side(&r.position_side)?;
                Some(PositionInfo {
                    symbol: r.symbol,
                    position_side,
                    entry_price: r.entry_price.parse().unwrap_or(0.0),
                    position_amt: r.position_amt.parse().unwrap_or(0.0),
                })
            })
            .collect())
    }

    async fn open_orders(&self, symbol: &str) -> Result<Vec<OpenOrder>> {
        let params = format!("symbol={symbol}");
        let body = self
            .signed(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        let rows: Vec<OpenOrderRow> = serde_json::from_str(&body)?;
        Ok(rows
            .into_iter()
            .filter_map(|r| {
                Some(OpenOrder {
                    order_id: r.order_id,
                    side: if r.side == "BUY" { OrderSide::Buy } else { OrderSide::Sell },
                    position_side: parse_side(&r.position_side)?,
                    kind: parse_order_kind(&r.order_type),
                })
            })
            .collect())
    }

    async fn create_listen_key(&self) -> Result<String> {
        let body = self.keyed(Method::POST, "/fapi/v1/listenKey", "").await?;
        let resp: ListenKeyResponse = serde_json::from_str(&body)?;
        Ok(resp.listen_key)
    }

    async fn keep_alive_listen_key(&self, key: &str) -> Result<()> {
        let params = format!("listenKey={key}");
        self.keyed(Method::PUT, "/fapi/v1/listenKey", &params).await?;
        Ok(())
    }

    async fn close_listen_key(&self, key: &str) -> Result<()> {
        let params = format!("listenKey={key}");
        self.keyed(Method::DELETE, "/fapi/v1/listenKey", &params)
            .await?;
        Ok(())
    }
}

pub(crate) fn parse_side(s: &str) -> Option<Side> {
    match s {
        "LONG" => Some(Side::Long),
        "SHORT" => Some(Side::Short),
        _ => None, // one-way mode rows ("BOTH") are not ours
    }
}

/// Order types this bot never places normalize onto the closest tracked kind.
pub(crate) fn parse_order_kind(s: &str) -> OrderKind {
    match s {
        "STOP_MARKET" | "STOP" => OrderKind::StopMarket,
        "TAKE_PROFIT" | "TAKE_PROFIT_MARKET" => OrderKind::TakeProfit,
        _ => OrderKind::Market,
    }
}

// ─── Response types ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BalanceRow {
    asset: String,
    available_balance: String,
}

#[derive(Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Deserialize)]
struct SymbolInfo {
    symbol: String,
    filters: Vec<FilterInfo>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FilterInfo {
    filter_type: String,
    #[serde(default)]
    tick_size: Option<String>,
    #[serde(default)]
    step_size: Option<String>,
    #[serde(default)]
    min_qty: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    #[serde(default)]
    client_order_id: String,
    status: OrderStatus,
    #[serde(default)]
    avg_price: Option<String>,
    #[serde(default)]
    executed_qty: Option<String>,
}

impl OrderResponse {
    fn into_ack(self) -> OrderAck {
        let avg_price = self
            .avg_price
            .as_deref()
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| *p > 0.0);
        OrderAck {
            order_id: self.order_id,
            client_order_id: self.client_order_id,
            status: self.status,
            avg_price,
            executed_qty: self
                .executed_qty
                .as_deref()
                .and_then(|s| s.parse().ok())
                .unwrap_or(0.0),
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRow {
    symbol: String,
    position_side: String,
    entry_price: String,
    position_amt: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenOrderRow {
    order_id: i64,
    side: String,
    position_side: String,
    #[serde(rename = "type")]
    order_type: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKeyResponse {
    listen_key: String,
}
