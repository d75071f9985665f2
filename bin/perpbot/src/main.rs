use std::sync::Arc;

use anyhow::Context;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use common::{Config, ExchangeApi, MarketEvent, OrderUpdate};
use engine::{BinanceClient, Gateway, MarketStream, RetryPolicy, UserStream};
use strategy::{build_strategy, StrategyRuntime};

#[tokio::main]
async fn main() {
    // ── Logging ──────────────────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse().unwrap()))
        .init();

    if let Err(e) = run().await {
        error!(error = %e, "perpbot terminating on fatal error");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    // ── Config ────────────────────────────────────────────────────────────────
    let cfg = Config::load().context("configuration")?;
    info!(
        symbol = %cfg.symbol,
        timeframe = %cfg.timeframe,
        strategy = %cfg.strategy_type,
        "perpbot starting"
    );

    // ── Exchange ──────────────────────────────────────────────────────────────
    let api: Arc<dyn ExchangeApi> = Arc::new(BinanceClient::new(&cfg.api_key, &cfg.secret_key));
    let gateway = Arc::new(Gateway::new(
        api.clone(),
        &cfg.symbol,
        &cfg.timeframe,
        cfg.trading.clone(),
        RetryPolicy::default(),
    ));
    gateway
        .preload()
        .await
        .context("symbol precision preload")?;

    match gateway.quote_balance().await {
        Ok(Some(balance)) => info!(balance, "Quote asset balance"),
        Ok(None) => warn!("Quote asset balance not found"),
        Err(e) => warn!(error = %e, "Balance lookup failed"),
    }

    // ── Strategy runtime ──────────────────────────────────────────────────────
    let strategy = build_strategy(&cfg, gateway.clone());
    let mut runtime = StrategyRuntime::new(cfg.signal.clone(), strategy);
    match gateway.klines(100).await {
        Ok(klines) => runtime.prefill_history(klines),
        Err(e) => warn!(error = %e, "Candle history prefill failed, stop levels need live closes"),
    }

    // ── Ingest loops ──────────────────────────────────────────────────────────
    let (candle_tx, candle_rx) = mpsc::channel::<MarketEvent>(256);
    let (update_tx, update_rx) = mpsc::channel::<OrderUpdate>(256);

    let market_stream = MarketStream::new(
        &cfg.symbol,
        &cfg.timeframe,
        cfg.reconnection.clone(),
        candle_tx,
    );
    let user_stream = UserStream::new(
        api.clone(),
        &cfg.symbol,
        cfg.reconnection.clone(),
        update_tx,
    );
    let listen_key = user_stream.listen_key_handle();

    let market_task = tokio::spawn(market_stream.run());
    let user_task = tokio::spawn(user_stream.run());

    // ── Main loop ─────────────────────────────────────────────────────────────
    // The runtime is the single serialization domain; it stops on fatal
    // strategy errors or when a stream exhausts its reconnection budget.
    let outcome = tokio::select! {
        result = runtime.run(candle_rx, update_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
            Ok(())
        }
    };

    // ── Shutdown ──────────────────────────────────────────────────────────────
    // Exchange-side orders are deliberately left alive: an operator restart
    // must not unwind positions.
    runtime.shutdown().await;
    market_task.abort();
    user_task.abort();
    if let Some(key) = listen_key.lock().await.take() {
        match api.close_listen_key(&key).await {
            Ok(()) => info!("Listen key deleted"),
            Err(e) => warn!(error = %e, "Listen key deletion failed"),
        }
    }

    outcome.context("strategy runtime")?;
    info!("perpbot stopped cleanly");
    Ok(())
}
