// =============================================================================
// Engine — orchestrates microstructure, volatility, regime, ensemble and risk
// =============================================================================
//
// Wires the Bithumb WebSocket feed to per-tick processing:
//   orderbook tick  -> microstructure OBI/OFI update, periodic heartbeat
//   transaction tick -> microstructure VPIN + volatility + regime update,
//                       exit check, then entry check
//
// Entry evaluation is guarded by a per-symbol async mutex so overlapping
// transaction ticks for the same symbol never race into a double entry.
// =============================================================================

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::config::EngineConfig;
use crate::ensemble::Ensemble;
use crate::exchange::BithumbClient;
use crate::microstructure::Microstructure;
use crate::notify::Notifier;
use crate::regime::RegimeDetector;
use crate::risk::{ExitAction, RiskManager};
use crate::sentiment::SentimentBoard;
use crate::types::{Action, Side, TradeTick};
use crate::volatility::VolatilityModel;

const HEARTBEAT_INTERVAL_SECS: u64 = 30;
const FUNDING_POLL_INTERVAL_SECS: u64 = 300;
const CANDLE_HISTORY_LIMIT: usize = 1440;
const SEED_TICKS_FOR_VOL_AND_REGIME: usize = 100;

/// Maps a spot symbol to its Binance USDT-margined perpetual, for funding-rate
/// lookups. Symbols with no listed perpetual are simply skipped.
fn futures_symbol(symbol: &str) -> Option<&'static str> {
    match symbol {
        "BTC" => Some("BTCUSDT"),
        "ETH" => Some("ETHUSDT"),
        "SOL" => Some("SOLUSDT"),
        _ => None,
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionSnapshot {
    pub symbol: String,
    pub entry_price: f64,
    pub current_price: f64,
    pub quantity: f64,
    pub pnl_pct: f64,
    pub trailing_active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct SurveillanceSnapshot {
    pub symbol: String,
    pub price: f64,
    pub obi: f64,
    pub ofi: f64,
    pub vpin: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub positions: Vec<PositionSnapshot>,
    pub surveillance: Vec<SurveillanceSnapshot>,
    pub risk_stats: crate::risk::RiskStats,
}

pub struct Engine {
    config: EngineConfig,
    client: Arc<BithumbClient>,
    microstructure: Arc<Microstructure>,
    volatility: Arc<VolatilityModel>,
    regime: Arc<RegimeDetector>,
    ensemble: Arc<Ensemble>,
    sentiment: Arc<SentimentBoard>,
    risk: Arc<RiskManager>,
    notifier: Arc<Notifier>,
    entry_locks: HashMap<String, AsyncMutex<()>>,
    tick_count: AtomicU64,
    last_heartbeat: AtomicU64,
}

impl Engine {
    pub fn new(config: EngineConfig, client: Arc<BithumbClient>) -> Arc<Self> {
        let entry_locks = config
            .symbols
            .iter()
            .map(|s| (s.clone(), AsyncMutex::new(())))
            .collect();

        let notifier = Arc::new(Notifier::new());

        Arc::new(Self {
            microstructure: Arc::new(Microstructure::new(&config)),
            volatility: Arc::new(VolatilityModel::new(&config)),
            regime: Arc::new(RegimeDetector::new(&config)),
            ensemble: Arc::new(Ensemble::new(&config)),
            sentiment: Arc::new(SentimentBoard::new()),
            risk: Arc::new(RiskManager::new(&config, notifier.clone())),
            notifier,
            entry_locks,
            tick_count: AtomicU64::new(0),
            last_heartbeat: AtomicU64::new(now_secs()),
            config,
            client,
        })
    }

    /// Bootstraps microstructure/volatility/regime price history from REST
    /// candles so the engine doesn't start cold on every restart.
    pub async fn load_initial_data(&self) {
        info!("loading historical candles for HMM/GARCH/momentum warm-up");
        for symbol in &self.config.symbols {
            let candles = match self.client.get_candlestick(symbol, "1m").await {
                Ok(c) => c,
                Err(e) => {
                    warn!(symbol, error = %e, "failed to fetch bootstrap candles");
                    continue;
                }
            };
            if candles.is_empty() {
                continue;
            }

            let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
            let momentum_window = &closes[closes.len().saturating_sub(CANDLE_HISTORY_LIMIT)..];
            self.microstructure.prime_prices(symbol, momentum_window);

            let seed_start = closes.len().saturating_sub(SEED_TICKS_FOR_VOL_AND_REGIME);
            let seed = &closes[seed_start..];
            self.volatility.prime_prices(symbol, seed);
            self.regime.prime_prices(symbol, seed);
        }
        info!("historical candle bootstrap complete");
    }

    /// Handler for the WebSocket orderbook stream. Updates OBI/OFI and emits
    /// a heartbeat log roughly every 30 seconds.
    pub fn on_orderbook(&self, symbol: &str, book: &crate::types::OrderBook) -> anyhow::Result<()> {
        if !self.config.symbols.iter().any(|s| s == symbol) {
            return Ok(());
        }

        self.microstructure.update_orderbook(symbol, book);
        let ticks = self.tick_count.fetch_add(1, Ordering::Relaxed) + 1;

        let now = now_secs();
        let last = self.last_heartbeat.load(Ordering::Relaxed);
        if now.saturating_sub(last) > HEARTBEAT_INTERVAL_SECS {
            info!(
                ticks,
                positions = self.risk.open_position_count(),
                "engine heartbeat"
            );
            self.tick_count.store(0, Ordering::Relaxed);
            self.last_heartbeat.store(now, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Handler for the WebSocket transaction stream. Updates VPIN/volatility/
    /// regime, checks exits, then checks entries — all gated per symbol.
    pub async fn on_transaction(self: &Arc<Self>, symbol: &str, tick: &TradeTick) {
        if !self.config.symbols.iter().any(|s| s == symbol) {
            return;
        }
        if tick.price <= 0.0 || tick.quantity <= 0.0 {
            return;
        }

        self.microstructure.update_trade(symbol, tick.price, tick.quantity, tick.side);
        self.volatility.update_price(symbol, tick.price);
        self.regime.update_price(symbol, tick.price);

        self.check_exit(symbol, tick.price).await;
        self.check_entry(symbol, tick.price).await;
    }

    async fn check_exit(&self, symbol: &str, price: f64) {
        if self.risk.open_position(symbol).is_none() {
            return;
        }

        let regime_params = self.regime.current_regime(symbol).params(&self.config);
        let rv = self.volatility.realized_volatility(symbol);

        let Some(exit) = self.risk.update_price(symbol, price, rv, regime_params.trailing_mult) else {
            return;
        };

        warn!(symbol, action = ?exit.action, pnl_pct = exit.pnl_pct * 100.0, "exit signal fired");

        let Some(pos) = self.risk.open_position(symbol) else { return };

        match self.client.place_market_order(symbol, "ask", pos.quantity).await {
            Ok(result) if result.get("status").and_then(|s| s.as_str()) == Some("0000") => {
                let reason = match exit.action {
                    ExitAction::StopLoss => crate::types::CloseReason::StopLoss,
                    ExitAction::TrailingStop => crate::types::CloseReason::TrailingStop,
                };
                if let Some(record) = self.risk.close_position(symbol, price, reason) {
                    self.notifier.send_trade_closed(symbol, record.pnl, record.pnl_pct);
                }
            }
            Ok(result) => error!(symbol, ?result, "exit order rejected by exchange"),
            Err(e) => error!(symbol, error = %e, "exit order request failed"),
        }
    }

    async fn check_entry(self: &Arc<Self>, symbol: &str, price: f64) {
        let Some(lock) = self.entry_locks.get(symbol) else { return };
        let _guard = lock.lock().await;

        if self.risk.open_position(symbol).is_some() {
            return;
        }

        let obi = self.microstructure.obi_signal(symbol);
        let vpin = self.microstructure.vpin_signal(symbol);
        let prices = self.microstructure.prices(symbol);
        let momentum_sig = self.ensemble.momentum_signal(&prices);
        let regime_label = self.regime.current_regime(symbol);
        let regime_sig = self.regime.signal(symbol);
        let sentiment_sig = self.sentiment.get(symbol);
        let funding_sig = futures_symbol(symbol)
            .map(|fs| self.ensemble.funding_signal(fs))
            .unwrap_or(0.0);
        let vol_sig = self.volatility.signal(symbol);

        let result = self.ensemble.compute_final_score(
            obi.signal,
            vpin.signal,
            momentum_sig,
            regime_sig,
            sentiment_sig,
            funding_sig,
            vol_sig,
        );

        if result.vpin_warning {
            return;
        }
        if !result.action.is_entry() {
            return;
        }

        let regime_params = regime_label.params(&self.config);
        let cash = self.available_cash().await;
        let (can, reason, max_amount) = self.risk.can_enter(symbol, cash, regime_params.cash_ratio);
        if !can {
            debug_or_info_skip(symbol, &reason);
            return;
        }

        let mut kelly_adjusted = max_amount * regime_params.kelly_mult;
        kelly_adjusted *= if result.action == Action::StrongBuy { 1.0 } else { 0.5 };

        let quantity = kelly_adjusted / price;
        if quantity <= 0.0 {
            return;
        }

        info!(
            symbol,
            score = result.score,
            action = %result.action,
            confidence = result.confidence,
            amount = kelly_adjusted,
            "entry signal"
        );

        match self.client.place_market_order(symbol, "bid", quantity).await {
            Ok(resp) if resp.get("status").and_then(|s| s.as_str()) == Some("0000") => {
                let rv = self.volatility.realized_volatility(symbol);
                let stop_loss = price * (1.0 - self.config.stop_loss_multiplier * rv.max(0.005));
                self.risk.register_position(symbol, Side::Buy, price, quantity, stop_loss);
                info!(symbol, price, quantity, "entry order filled");
            }
            Ok(resp) => error!(symbol, ?resp, "entry order rejected by exchange"),
            Err(e) => error!(symbol, error = %e, "entry order request failed"),
        }
    }

    async fn available_cash(&self) -> f64 {
        match self.client.get_balance("BTC").await {
            Ok(data) => data
                .get("data")
                .and_then(|d| d.get("available_krw"))
                .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
                .unwrap_or(0.0),
            Err(e) => {
                error!(error = %e, "balance lookup failed");
                0.0
            }
        }
    }

    /// Periodic Binance funding-rate poll (300s cadence), run as a background task.
    pub async fn run_funding_loop(self: Arc<Self>) {
        loop {
            for symbol in &self.config.symbols {
                if let Some(fs) = futures_symbol(symbol) {
                    if let Err(e) = self.ensemble.fetch_funding_rate(fs).await {
                        warn!(symbol, error = %e, "funding rate fetch failed");
                    }
                }
            }
            tokio::time::sleep(std::time::Duration::from_secs(FUNDING_POLL_INTERVAL_SECS)).await;
        }
    }

    pub fn sentiment(&self) -> &Arc<SentimentBoard> {
        &self.sentiment
    }

    pub fn daily_reset(&self) -> crate::risk::DailySummary {
        self.risk.daily_reset()
    }

    pub fn status(&self) -> EngineStatus {
        let positions = self
            .config
            .symbols
            .iter()
            .filter_map(|symbol| {
                let pos = self.risk.open_position(symbol)?;
                let current = self.microstructure.last_price(symbol);
                Some(PositionSnapshot {
                    symbol: symbol.clone(),
                    entry_price: pos.entry_price,
                    current_price: current,
                    quantity: pos.quantity,
                    pnl_pct: pos.pnl_pct(current),
                    trailing_active: pos.trailing_active,
                })
            })
            .collect();

        let surveillance = self
            .config
            .symbols
            .iter()
            .map(|symbol| {
                let obi = self.microstructure.obi_signal(symbol);
                let vpin = self.microstructure.vpin_signal(symbol);
                SurveillanceSnapshot {
                    symbol: symbol.clone(),
                    price: self.microstructure.last_price(symbol),
                    obi: obi.obi,
                    ofi: obi.ofi,
                    vpin: vpin.vpin,
                }
            })
            .collect();

        EngineStatus {
            positions,
            surveillance,
            risk_stats: self.risk.stats(),
        }
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn debug_or_info_skip(symbol: &str, reason: &str) {
    tracing::debug!(symbol, reason, "entry rejected by risk manager");
}
