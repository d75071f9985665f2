use std::time::Duration;

use chrono::{TimeZone, Utc};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tracing::{debug, error, info, warn};
use url::Url;

use common::config::ReconnectionConfig;
use common::{Candle, Error, MarketEvent, Result};

pub const WS_BASE: &str = "wss://fstream.binance.com/ws";

/// Kline WebSocket stream for one `(symbol, timeframe)`.
///
/// Live updates are logged; the `is_closed` transition of each candle is
/// forwarded exactly once (idempotence key: `open_time`). Reconnects with a
/// fixed delay up to `max_attempts`; exhaustion ends the loop, which the
/// supervisor treats as a shutdown condition.
pub struct MarketStream {
    symbol: String,
    timeframe: String,
    reconnection: ReconnectionConfig,
    event_tx: mpsc::Sender<MarketEvent>,
}

enum StreamEnd {
    ChannelClosed,
    Disconnected,
}

impl MarketStream {
    pub fn new(
        symbol: impl Into<String>,
        timeframe: impl Into<String>,
        reconnection: ReconnectionConfig,
        event_tx: mpsc::Sender<MarketEvent>,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            timeframe: timeframe.into(),
            reconnection,
            event_tx,
        }
    }

    /// Run the stream loop until the receiver is gone or reconnection is
    /// exhausted. Call from `tokio::spawn`.
    pub async fn run(self) {
        let mut attempts = 0u32;
        // Last closed candle forwarded; survives reconnects so a replayed
        // close for the same open_time is suppressed.
        let mut last_closed_open_time: Option<i64> = None;

        loop {
            match self.connect_once(&mut attempts, &mut last_closed_open_time).await {
                Ok(StreamEnd::ChannelClosed) => {
                    info!(symbol = %self.symbol, "Market stream receiver gone, stopping");
                    return;
                }
                Ok(StreamEnd::Disconnected) => {
                    warn!(symbol = %self.symbol, "Market stream disconnected");
                }
                Err(e) => {
                    warn!(symbol = %self.symbol, error = %e, "Market stream error");
                }
            }

            if !self.reconnection.enabled {
                error!(symbol = %self.symbol, "Reconnection disabled, stopping market stream");
                return;
            }
            attempts += 1;
            if attempts >= self.reconnection.max_attempts {
                error!(
                    symbol = %self.symbol,
                    attempts,
                    "Market stream reconnection attempts exhausted"
                );
                return;
            }
            info!(
                symbol = %self.symbol,
                attempt = attempts,
                delay_secs = self.reconnection.delay_secs,
                "Reconnecting market stream"
            );
            tokio::time::sleep(Duration::from_secs(self.reconnection.delay_secs)).await;
        }
    }

    async fn connect_once(
        &self,
        attempts: &mut u32,
        last_closed_open_time: &mut Option<i64>,
    ) -> Result<StreamEnd> {
        let url_str = format!(
            "{WS_BASE}/{}@kline_{}",
            self.symbol.to_lowercase(),
            self.timeframe
        );
        let url = Url::parse(&url_str).map_err(|e| Error::WebSocket(e.to_string()))?;

        info!(symbol = %self.symbol, url = %url_str, "Connecting to kline stream");
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| Error::WebSocket(e.to_string()))?;
        let (_, mut read) = ws_stream.split();

        let recv_timeout = Duration::from_secs(self.reconnection.timeout_secs);

        loop {
            let msg = match tokio::time::timeout(recv_timeout, read.next()).await {
                Ok(Some(msg)) => msg.map_err(|e| Error::WebSocket(e.to_string()))?,
                Ok(None) => return Ok(StreamEnd::Disconnected),
                Err(_) => {
                    warn!(symbol = %self.symbol, "Kline stream receive timeout");
                    return Ok(StreamEnd::Disconnected);
                }
            };

            let tokio_tungstenite::tungstenite::Message::Text(text) = msg else {
                continue;
            };

            let candle = match parse_kline(&text) {
                Ok(Some(c)) => c,
                Ok(None) => continue, // non-kline message
                Err(e) => {
                    warn!(error = %e, "Failed to parse kline event");
                    continue;
                }
            };

            // A healthy message means the connection recovered.
            *attempts = 0;

            if !candle.is_closed {
                debug!(
                    symbol = %self.symbol,
                    price = candle.close,
                    volume = candle.volume,
                    "Live kline update"
                );
                continue;
            }

            // Duplicate close for the same candle: drop it.
            if *last_closed_open_time == Some(candle.open_time) {
                debug!(open_time = candle.open_time, "Duplicate candle close suppressed");
                continue;
            }
            *last_closed_open_time = Some(candle.open_time);

            let event = MarketEvent {
                symbol: self.symbol.clone(),
                kline: candle,
                timestamp: Utc
                    .timestamp_millis_opt(candle.open_time)
                    .single()
                    .unwrap_or_else(Utc::now),
            };
            if self.event_tx.send(event).await.is_err() {
                return Ok(StreamEnd::ChannelClosed);
            }
        }
    }
}

// ─── Binance kline JSON parsing ──────────────────────────────────────────────

#[derive(Deserialize)]
struct KlineWrapper {
    k: KlineData,
}

#[derive(Deserialize)]
struct KlineData {
    #[serde(rename = "t")]
    open_time: i64,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_closed: bool,
}

fn parse_kline(text: &str) -> Result<Option<Candle>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    if value.get("e").and_then(|v| v.as_str()) != Some("kline") {
        return Ok(None);
    }

    let wrapper: KlineWrapper = serde_json::from_value(value)?;
    let k = wrapper.k;
    Ok(Some(Candle {
        open_time: k.open_time,
        open: k.open.parse().unwrap_or(0.0),
        high: k.high.parse().unwrap_or(0.0),
        low: k.low.parse().unwrap_or(0.0),
        close: k.close.parse().unwrap_or(0.0),
        volume: k.volume.parse().unwrap_or(0.0),
        is_closed: k.is_closed,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    const KLINE_MSG: &str = r#"{
        "e": "kline", "E": 1700000000123, "s": "BTCUSDC",
        "k": {
            "t": 1699999800000, "T": 1700000099999, "s": "BTCUSDC", "i": "5m",
            "o": "101.0", "c": "101.5", "h": "102.0", "l": "100.5",
            "v": "1543.2", "x": true
        }
    }"#;

    #[test]
    fn parses_closed_kline() {
        let candle = parse_kline(KLINE_MSG).unwrap().unwrap();
        assert_eq!(candle.open_time, 1699999800000);
        assert_eq!(candle.open, 101.0);
        assert_eq!(candle.close, 101.5);
        assert_eq!(candle.high, 102.0);
        assert_eq!(candle.low, 100.5);
        assert_eq!(candle.volume, 1543.2);
        assert!(candle.is_closed);
    }

    #[test]
    fn ignores_non_kline_events() {
        let msg = r#"{"e": "aggTrade", "p": "101.0"}"#;
        assert!(parse_kline(msg).unwrap().is_none());
    }
}
