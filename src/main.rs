// =============================================================================
// won-engine — Main Entry Point
// =============================================================================
//
// Wires configuration, the Bithumb REST/WebSocket clients and the signal
// pipeline together, then spawns one task per background loop: the
// reconnecting WebSocket feed, the funding-rate poller, and a daily-reset
// scheduler. Runs until Ctrl+C.
// =============================================================================

mod config;
mod engine;
mod ensemble;
mod exchange;
mod microstructure;
mod notify;
mod regime;
mod risk;
mod sentiment;
mod types;
mod volatility;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;
use crate::exchange::{run_bithumb_stream, BithumbClient, StreamHandlers};

const RECONNECT_BACKOFF_INITIAL_SECS: u64 = 1;
const RECONNECT_BACKOFF_MAX_SECS: u64 = 30;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║                  won-engine — starting up                 ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let config = config::EngineConfig::load();
    info!(symbols = ?config.symbols, "target symbols configured");

    let client = Arc::new(BithumbClient::new(config.api_key.clone(), config.api_secret.clone()));
    let engine = Engine::new(config.clone(), client.clone());

    engine.load_initial_data().await;

    // ── WebSocket feed, reconnecting with exponential backoff ────────────
    let ws_engine = engine.clone();
    let ws_symbols = config.symbols.clone();
    tokio::spawn(async move {
        let mut backoff = RECONNECT_BACKOFF_INITIAL_SECS;
        loop {
            let mut handlers = StreamHandlers::new();

            {
                let eng = ws_engine.clone();
                handlers.on_orderbook(move |symbol, book| eng.on_orderbook(symbol, book));
            }
            {
                let eng = ws_engine.clone();
                handlers.on_transaction(move |symbol, tick| {
                    let eng = eng.clone();
                    let symbol = symbol.to_string();
                    let tick = *tick;
                    tokio::spawn(async move {
                        eng.on_transaction(&symbol, &tick).await;
                    });
                    Ok(())
                });
            }

            match run_bithumb_stream(&ws_symbols, &handlers).await {
                Ok(()) => {
                    warn!("Bithumb WebSocket closed — reconnecting");
                    backoff = RECONNECT_BACKOFF_INITIAL_SECS;
                }
                Err(e) => {
                    error!(error = %e, backoff_secs = backoff, "Bithumb WebSocket error — reconnecting");
                }
            }

            tokio::time::sleep(Duration::from_secs(backoff)).await;
            backoff = (backoff * 2).min(RECONNECT_BACKOFF_MAX_SECS);
        }
    });

    // ── Binance funding-rate poller (300s cadence) ───────────────────────
    tokio::spawn(engine.clone().run_funding_loop());

    // ── Daily reset, aligned to local midnight ───────────────────────────
    let reset_engine = engine.clone();
    tokio::spawn(async move {
        loop {
            let now = chrono::Local::now();
            let tomorrow_midnight = (now + chrono::Duration::days(1))
                .date_naive()
                .and_hms_opt(0, 0, 0)
                .unwrap();
            let sleep_secs = (tomorrow_midnight - now.naive_local()).num_seconds().max(1) as u64;
            tokio::time::sleep(Duration::from_secs(sleep_secs)).await;

            let summary = reset_engine.daily_reset();
            info!(
                daily_pnl = summary.daily_pnl,
                daily_pnl_pct = summary.daily_pnl_pct * 100.0,
                trades = summary.trades,
                cvar_95 = summary.cvar_95,
                "daily risk counters reset"
            );
        }
    });

    info!("all subsystems running — press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    warn!("shutdown signal received — stopping gracefully");

    info!("won-engine shut down complete");
    Ok(())
}
