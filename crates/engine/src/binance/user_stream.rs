use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use common::config::ReconnectionConfig;
use common::{Error, ExchangeApi, OrderSide, OrderStatus, OrderUpdate, Result};

use super::market_stream::WS_BASE;
use super::rest::{parse_order_kind, parse_side};

/// Listen-key keep-alive cadence required by the exchange.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(1800);

/// Authenticated user-data stream: maintains the listen key, normalizes
/// `ORDER_TRADE_UPDATE` events for the configured symbol and forwards them
/// to the strategy runtime.
///
/// Reconnects with a fixed delay up to `max_attempts`, the same policy the
/// market stream uses; every reconnect attempt recreates the listen key.
/// Exhaustion ends the loop, which the supervisor treats as a shutdown
/// condition.
pub struct UserStream {
    api: Arc<dyn ExchangeApi>,
    symbol: String,
    reconnection: ReconnectionConfig,
    update_tx: mpsc::Sender<OrderUpdate>,
    /// Currently active listen key, shared so shutdown can delete it.
    listen_key: Arc<Mutex<Option<String>>>,
}

enum StreamEnd {
    ChannelClosed,
    Disconnected,
}

impl UserStream {
    pub fn new(
        api: Arc<dyn ExchangeApi>,
        symbol: impl Into<String>,
        reconnection: ReconnectionConfig,
        update_tx: mpsc::Sender<OrderUpdate>,
    ) -> Self {
        Self {
            api,
            symbol: symbol.into(),
            reconnection,
            update_tx,
            listen_key: Arc::new(Mutex::new(None)),
        }
    }

    /// Handle to the active listen key, for deletion at shutdown.
    pub fn listen_key_handle(&self) -> Arc<Mutex<Option<String>>> {
        self.listen_key.clone()
    }

    /// Run the stream loop until the receiver is gone or reconnection is
    /// exhausted. Call from `tokio::spawn`.
    pub async fn run(self) {
        let mut attempts = 0u32;
        let delay = Duration::from_secs(self.reconnection.delay_secs);

        loop {
            let key = match self.api.create_listen_key().await {
                Ok(key) => {
                    info!(key_prefix = &key[..key.len().min(10)], "Listen key created");
                    *self.listen_key.lock().await = Some(key.clone());
                    key
                }
                Err(e) => {
                    warn!(error = %e, "Failed to create listen key");
                    if !self.reconnection.enabled {
                        error!("Reconnection disabled, stopping user stream");
                        return;
                    }
                    attempts += 1;
                    if attempts >= self.reconnection.max_attempts {
                        error!("User stream reconnection attempts exhausted");
                        return;
                    }
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };

            match self.connect_once(&key, &mut attempts).await {
                Ok(StreamEnd::ChannelClosed) => {
                    info!("User stream receiver gone, stopping");
                    return;
                }
                Ok(StreamEnd::Disconnected) => {
                    warn!("User data stream disconnected");
                }
                Err(e) => {
                    warn!(error = %e, "User data stream error");
                }
            }

            if !self.reconnection.enabled {
                error!("Reconnection disabled, stopping user stream");
                return;
            }
            attempts += 1;
            if attempts >= self.reconnection.max_attempts {
                error!(attempts, "User stream reconnection attempts exhausted");
                return;
            }
            info!(
                attempt = attempts,
                delay_secs = self.reconnection.delay_secs,
                "Reconnecting user data stream"
            );
            tokio::time::sleep(delay).await;
        }
    }

    async fn connect_once(&self, key: &str, attempts: &mut u32) -> Result<StreamEnd> {
        let url_str = format!("{WS_BASE}/{key}");
        let url = Url::parse(&url_str).map_err(|e| Error::WebSocket(e.to_string()))?;

        info!("Connecting to user data stream");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        let recv_timeout = Duration::from_secs(self.reconnection.timeout_secs);
        let mut keep_alive = tokio::time::interval(KEEP_ALIVE_INTERVAL);
        keep_alive.tick().await; // consume the immediate first tick

        loop {
            tokio::select! {
                _ = keep_alive.tick() => {
                    match self.api.keep_alive_listen_key(key).await {
                        Ok(()) => debug!("Listen key keep-alive sent"),
                        Err(e) => warn!(error = %e, "Listen key keep-alive failed"),
                    }
                }
                msg = tokio::time::timeout(recv_timeout, read.next()) => {
                    let msg = match msg {
                        Ok(Some(m)) => m.map_err(|e| Error::WebSocket(e.to_string()))?,
                        Ok(None) => return Ok(StreamEnd::Disconnected),
                        Err(_) => {
                            warn!("User stream receive timeout");
                            return Ok(StreamEnd::Disconnected);
                        }
                    };

                    let tokio_tungstenite::tungstenite::Message::Text(text) = msg else {
                        continue;
                    };

                    match parse_order_update(&text) {
                        Ok(Some(update)) if update.symbol == self.symbol => {
                            *attempts = 0;
                            if self.update_tx.send(update).await.is_err() {
                                return Ok(StreamEnd::ChannelClosed);
                            }
                        }
                        Ok(Some(update)) => {
                            debug!(symbol = %update.symbol, "Order update for other symbol ignored");
                        }
                        Ok(None) => {}
                        Err(e) => warn!(error = %e, "Failed to parse user data event"),
                    }
                }
            }
        }
    }
}

// ─── ORDER_TRADE_UPDATE parsing ──────────────────────────────────────────────

#[derive(Deserialize)]
struct OrderTradeUpdate {
    o: OrderPayload,
}

#[derive(Deserialize)]
struct OrderPayload {
    #[serde(rename = "i")]
    order_id: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "S")]
    side: String,
    #[serde(rename = "ps")]
    position_side: String,
    #[serde(rename = "X")]
    status: OrderStatus,
    #[serde(rename = "o")]
    order_type: String,
    #[serde(rename = "z", default)]
    cumulative_qty: String,
    #[serde(rename = "L", default)]
    last_price: String,
}

fn parse_order_update(text: &str) -> Result<Option<OrderUpdate>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    match value.get("e").and_then(|v| v.as_str()) {
        Some("ORDER_TRADE_UPDATE") => {}
        Some("ACCOUNT_UPDATE") => {
            debug!("ACCOUNT_UPDATE received");
            return Ok(None);
        }
        _ => return Ok(None),
    }

    let event: OrderTradeUpdate = serde_json::from_value(value)?;
    let o = event.o;

    let Some(position_side) = parse_side(&o.position_side) else {
        return Ok(None); // one-way mode order, not ours
    };

    Ok(Some(OrderUpdate {
        order_id: o.order_id,
        symbol: o.symbol,
        side: if o.side == "BUY" { OrderSide::Buy } else { OrderSide::Sell },
        position_side,
        status: o.status,
        executed_qty: o.cumulative_qty.parse().unwrap_or(0.0),
        last_price: o.last_price.parse().unwrap_or(0.0),
        kind: parse_order_kind(&o.order_type),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{OrderKind, Side};

    const FILLED_MSG: &str = r#"{
        "e": "ORDER_TRADE_UPDATE", "E": 1700000001000, "T": 1700000000999,
        "o": {
            "i": 8886774, "s": "BTCUSDC", "S": "SELL", "ps": "LONG",
            "X": "FILLED", "x": "TRADE", "o": "TAKE_PROFIT",
            "z": "0.002", "q": "0.002", "L": "101.3"
        }
    }"#;

    #[test]
    fn parses_filled_order_trade_update() {
        let update = parse_order_update(FILLED_MSG).unwrap().unwrap();
        assert_eq!(update.order_id, 8886774);
        assert_eq!(update.symbol, "BTCUSDC");
        assert_eq!(update.side, OrderSide::Sell);
        assert_eq!(update.position_side, Side::Long);
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.kind, OrderKind::TakeProfit);
        assert_eq!(update.executed_qty, 0.002);
        assert_eq!(update.last_price, 101.3);
    }

    #[test]
    fn account_update_is_skipped() {
        let msg = r#"{"e": "ACCOUNT_UPDATE", "a": {}}"#;
        assert!(parse_order_update(msg).unwrap().is_none());
    }

    #[test]
    fn one_way_mode_orders_are_skipped() {
        let msg = FILLED_MSG.replace("\"LONG\"", "\"BOTH\"");
        assert!(parse_order_update(&msg).unwrap().is_none());
    }
}
