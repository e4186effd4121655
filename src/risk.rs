// =============================================================================
// Risk engine — four defense lines protecting capital
// =============================================================================
//
// Defense 1 — Fractional Kelly position sizing:
//   Kelly (1956) optimal bet fraction with Thorp (2006) fractional correction.
//   f* = (bp - q) / b, actual use: f*/4 to minimize risk of ruin.
// Defense 2 — Daily CVaR limit:
//   Rockafellar & Uryasev (2000) CVaR framework. Trading halts for the day
//   once tail losses at the 95% confidence level exceed the limit.
// Defense 3 — Circuit breaker:
//   N consecutive stop-outs force a cooldown period.
// Defense 4 — Structural limits:
//   max concurrent positions, per-symbol exposure cap, mandatory cash reserve.
// =============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::notify::Notifier;
use crate::types::{CloseReason, Position, Side, TradeRecord};

const TRADE_HISTORY_CAP: usize = 1000;
const DAILY_PNL_HISTORY_CAP: usize = 100;
const MIN_TRADES_FOR_CVAR: usize = 10;
const MIN_STOP_VOLATILITY: f64 = 0.005;

/// Outcome of an `update_price` exit check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ExitAction {
    StopLoss,
    TrailingStop,
}

pub struct ExitSignal {
    pub action: ExitAction,
    pub pnl_pct: f64,
}

struct Inner {
    positions: std::collections::HashMap<String, Position>,
    trade_history: VecDeque<TradeRecord>,
    daily_pnl: f64,
    daily_pnl_history: VecDeque<f64>,
    consecutive_losses: u32,
    cooldown_until: Option<Instant>,
    daily_trade_count: u32,
    daily_wins: u32,
    daily_losses: u32,
}

/// Four-defense-line position-sizing and circuit-breaker engine.
pub struct RiskManager {
    inner: RwLock<Inner>,
    notifier: Arc<Notifier>,
    kelly_fraction: f64,
    kelly_min_trades: usize,
    max_single_position_ratio: f64,
    max_concurrent_positions: usize,
    max_consecutive_losses: u32,
    cooldown_secs: u64,
    daily_cvar_limit: f64,
    min_cash_reserve_ratio: f64,
    max_total_capital_krw: f64,
    stop_loss_multiplier: f64,
    trailing_activation_pct: f64,
    trailing_offset_multiplier: f64,
}

impl RiskManager {
    pub fn new(cfg: &EngineConfig, notifier: Arc<Notifier>) -> Self {
        Self {
            notifier,
            inner: RwLock::new(Inner {
                positions: std::collections::HashMap::new(),
                trade_history: VecDeque::with_capacity(TRADE_HISTORY_CAP),
                daily_pnl: 0.0,
                daily_pnl_history: VecDeque::with_capacity(DAILY_PNL_HISTORY_CAP),
                consecutive_losses: 0,
                cooldown_until: None,
                daily_trade_count: 0,
                daily_wins: 0,
                daily_losses: 0,
            }),
            kelly_fraction: cfg.kelly_fraction,
            kelly_min_trades: cfg.kelly_min_trades_for_calc,
            max_single_position_ratio: cfg.max_single_position_ratio,
            max_concurrent_positions: cfg.max_concurrent_positions,
            max_consecutive_losses: cfg.max_consecutive_losses,
            cooldown_secs: cfg.cooldown_seconds,
            daily_cvar_limit: cfg.daily_cvar_limit,
            min_cash_reserve_ratio: cfg.min_cash_reserve_ratio,
            max_total_capital_krw: cfg.max_total_capital_krw,
            stop_loss_multiplier: cfg.stop_loss_multiplier,
            trailing_activation_pct: cfg.trailing_activation_pct,
            trailing_offset_multiplier: cfg.trailing_offset_multiplier,
        }
    }

    /// f* = (bp - q) / b, scaled by KELLY_FRACTION, clamped to [0, max_single_position_ratio].
    /// Falls back to the flat KELLY_FRACTION until enough trade history exists.
    fn calc_kelly_fraction(&self, inner: &Inner) -> f64 {
        if inner.trade_history.len() < self.kelly_min_trades {
            return self.kelly_fraction;
        }

        let wins: Vec<&TradeRecord> = inner.trade_history.iter().filter(|t| t.pnl > 0.0).collect();
        let losses: Vec<&TradeRecord> = inner.trade_history.iter().filter(|t| t.pnl <= 0.0).collect();

        if wins.is_empty() || losses.is_empty() {
            return self.kelly_fraction;
        }

        let total = inner.trade_history.len() as f64;
        let p = wins.len() as f64 / total;
        let q = 1.0 - p;
        let avg_win = wins.iter().map(|t| t.pnl_pct).sum::<f64>() / wins.len() as f64;
        let avg_loss = (losses.iter().map(|t| t.pnl_pct).sum::<f64>() / losses.len() as f64).abs();

        if avg_loss == 0.0 {
            return self.kelly_fraction;
        }

        let b = avg_win / avg_loss;
        let kelly = (b * p - q) / b;
        let fractional = kelly * self.kelly_fraction;
        let clamped = fractional.clamp(0.0, self.max_single_position_ratio);

        debug!(p, b, kelly, fractional = clamped, "Kelly fraction computed");
        clamped
    }

    /// Mean of the tail losses at or below the 95th-percentile VaR cutoff.
    fn calc_daily_cvar(&self, inner: &Inner, confidence: f64) -> f64 {
        if inner.daily_pnl_history.len() < MIN_TRADES_FOR_CVAR {
            return 0.0;
        }
        let mut returns: Vec<f64> = inner.daily_pnl_history.iter().copied().collect();
        returns.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let rank = (1.0 - confidence) * (returns.len() - 1) as f64;
        let idx = rank.round().clamp(0.0, (returns.len() - 1) as f64) as usize;
        let var_cutoff = returns[idx];

        let tail: Vec<f64> = returns.iter().copied().filter(|&r| r <= var_cutoff).collect();
        if tail.is_empty() {
            return var_cutoff;
        }
        tail.iter().sum::<f64>() / tail.len() as f64
    }

    /// Defense-line gate: cooldown, daily CVaR, concurrency cap, one-per-symbol,
    /// and mandatory cash reserve. Returns the KRW amount allowed on success.
    pub fn can_enter(&self, symbol: &str, available_cash: f64, regime_cash_ratio: f64) -> (bool, String, f64) {
        let inner = self.inner.read();

        if let Some(until) = inner.cooldown_until {
            if Instant::now() < until {
                let remaining = (until - Instant::now()).as_secs();
                return (false, format!("in cooldown ({remaining}s remaining)"), 0.0);
            }
        }

        if inner.daily_pnl / self.max_total_capital_krw <= self.daily_cvar_limit {
            return (false, format!("daily CVaR limit reached ({:.0} KRW)", inner.daily_pnl), 0.0);
        }

        if inner.positions.len() >= self.max_concurrent_positions {
            return (false, format!("concurrent position limit ({}) reached", self.max_concurrent_positions), 0.0);
        }

        if inner.positions.contains_key(symbol) {
            return (false, format!("{symbol} already held"), 0.0);
        }

        let effective_reserve = regime_cash_ratio.max(self.min_cash_reserve_ratio);
        let min_cash = self.max_total_capital_krw * effective_reserve;
        let investable = available_cash - min_cash;
        if investable <= 0.0 {
            return (false, "cash reserve ratio not met".to_string(), 0.0);
        }

        let kelly_frac = self.calc_kelly_fraction(&inner);
        let max_amount = investable
            .min(self.max_total_capital_krw * kelly_frac)
            .min(self.max_total_capital_krw * self.max_single_position_ratio);

        (true, "entry allowed".to_string(), max_amount)
    }

    pub fn register_position(&self, symbol: &str, side: Side, entry_price: f64, quantity: f64, stop_loss: f64) {
        let mut inner = self.inner.write();
        inner.positions.insert(
            symbol.to_string(),
            Position {
                id: uuid::Uuid::new_v4().to_string(),
                symbol: symbol.to_string(),
                side,
                entry_price,
                quantity,
                opened_at: chrono::Utc::now(),
                highest_price: entry_price,
                stop_loss,
                trailing_stop: None,
                trailing_active: false,
            },
        );
        info!(symbol, entry_price, quantity, "position registered");
    }

    /// Feed a new price for an open position, advancing the high-water mark
    /// and checking the dynamic stop-loss / trailing stop.
    pub fn update_price(&self, symbol: &str, current_price: f64, realized_volatility: f64, trailing_mult: f64) -> Option<ExitSignal> {
        let mut inner = self.inner.write();
        let pos = inner.positions.get_mut(symbol)?;

        let pnl_pct = (current_price - pos.entry_price) / pos.entry_price;

        if current_price > pos.highest_price {
            pos.highest_price = current_price;
        }

        let rv = realized_volatility.max(MIN_STOP_VOLATILITY);
        let stop_loss_pct = self.stop_loss_multiplier * rv;
        let stop_price = pos.entry_price * (1.0 - stop_loss_pct);

        if current_price <= stop_price {
            return Some(ExitSignal { action: ExitAction::StopLoss, pnl_pct });
        }

        if pnl_pct >= self.trailing_activation_pct {
            pos.trailing_active = true;
        }

        if pos.trailing_active {
            let trailing_offset = self.trailing_offset_multiplier * rv * trailing_mult;
            let trailing_stop = pos.highest_price * (1.0 - trailing_offset);
            pos.trailing_stop = Some(trailing_stop);
            if current_price <= trailing_stop {
                return Some(ExitSignal { action: ExitAction::TrailingStop, pnl_pct });
            }
        }

        None
    }

    /// Close a position, recording its trade outcome and updating the
    /// consecutive-loss circuit breaker.
    pub fn close_position(&self, symbol: &str, exit_price: f64, reason: CloseReason) -> Option<TradeRecord> {
        let mut inner = self.inner.write();
        let pos = inner.positions.remove(symbol)?;

        let pnl = (exit_price - pos.entry_price) * pos.quantity;
        let pnl_pct = (exit_price - pos.entry_price) / pos.entry_price;

        let record = TradeRecord {
            symbol: symbol.to_string(),
            side: pos.side,
            entry_price: pos.entry_price,
            exit_price,
            quantity: pos.quantity,
            pnl,
            pnl_pct,
            opened_at: pos.opened_at,
            closed_at: chrono::Utc::now(),
            reason,
        };

        if inner.trade_history.len() >= TRADE_HISTORY_CAP {
            inner.trade_history.pop_front();
        }
        inner.trade_history.push_back(record.clone());
        inner.daily_pnl += pnl;
        inner.daily_trade_count += 1;

        if pnl < 0.0 {
            inner.daily_losses += 1;
            inner.consecutive_losses += 1;
            if inner.consecutive_losses >= self.max_consecutive_losses {
                inner.cooldown_until = Some(Instant::now() + Duration::from_secs(self.cooldown_secs));
                let reason = format!(
                    "circuit breaker tripped after {} consecutive losses — cooling down for {}s",
                    inner.consecutive_losses, self.cooldown_secs
                );
                warn!(
                    consecutive_losses = inner.consecutive_losses,
                    cooldown_secs = self.cooldown_secs,
                    "consecutive-loss circuit breaker tripped, entering cooldown"
                );
                self.notifier.send_emergency_stop(&reason);
            }
        } else {
            inner.daily_wins += 1;
            inner.consecutive_losses = 0;
        }

        info!(symbol, entry = pos.entry_price, exit = exit_price, pnl, pnl_pct, "position closed");
        Some(record)
    }

    /// Roll the day's PnL into history and reset daily counters.
    pub fn daily_reset(&self) -> DailySummary {
        let mut inner = self.inner.write();
        let daily_pnl_pct = inner.daily_pnl / self.max_total_capital_krw;

        if inner.daily_pnl_history.len() >= DAILY_PNL_HISTORY_CAP {
            inner.daily_pnl_history.pop_front();
        }
        inner.daily_pnl_history.push_back(daily_pnl_pct);

        let summary = DailySummary {
            daily_pnl: inner.daily_pnl,
            daily_pnl_pct,
            trades: inner.daily_trade_count,
            wins: inner.daily_wins,
            losses: inner.daily_losses,
            cvar_95: self.calc_daily_cvar(&inner, 0.95),
        };

        inner.daily_pnl = 0.0;
        inner.daily_trade_count = 0;
        inner.daily_wins = 0;
        inner.daily_losses = 0;
        inner.consecutive_losses = 0;

        info!(daily_pnl = summary.daily_pnl, daily_pnl_pct = summary.daily_pnl_pct * 100.0, "daily risk counters reset");
        summary
    }

    pub fn open_position(&self, symbol: &str) -> Option<Position> {
        self.inner.read().positions.get(symbol).cloned()
    }

    pub fn open_position_count(&self) -> usize {
        self.inner.read().positions.len()
    }

    pub fn is_cooldown(&self) -> bool {
        self.inner
            .read()
            .cooldown_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    pub fn daily_pnl(&self) -> f64 {
        self.inner.read().daily_pnl
    }

    pub fn stats(&self) -> RiskStats {
        let inner = self.inner.read();
        let total = inner.trade_history.len();
        let wins = inner.trade_history.iter().filter(|t| t.pnl > 0.0).count();
        let avg_pnl_pct = if total > 0 {
            inner.trade_history.iter().map(|t| t.pnl_pct).sum::<f64>() / total as f64
        } else {
            0.0
        };

        RiskStats {
            total_trades: total,
            win_rate: if total > 0 { wins as f64 / total as f64 } else { 0.0 },
            avg_pnl_pct,
            kelly_fraction: self.calc_kelly_fraction(&inner),
            cvar_95: self.calc_daily_cvar(&inner, 0.95),
            consecutive_losses: inner.consecutive_losses,
            active_positions: inner.positions.len(),
            daily_pnl: inner.daily_pnl,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct DailySummary {
    pub daily_pnl: f64,
    pub daily_pnl_pct: f64,
    pub trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub cvar_95: f64,
}

#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct RiskStats {
    pub total_trades: usize,
    pub win_rate: f64,
    pub avg_pnl_pct: f64,
    pub kelly_fraction: f64,
    pub cvar_95: f64,
    pub consecutive_losses: u32,
    pub active_positions: usize,
    pub daily_pnl: f64,
}

impl std::fmt::Debug for RiskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskManager")
            .field("max_total_capital_krw", &self.max_total_capital_krw)
            .field("max_concurrent_positions", &self.max_concurrent_positions)
            .field("max_consecutive_losses", &self.max_consecutive_losses)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn risk_manager() -> RiskManager {
        RiskManager::new(&EngineConfig::default(), Arc::new(Notifier::new()))
    }

    fn trade(pnl: f64, pnl_pct: f64) -> TradeRecord {
        TradeRecord {
            symbol: "BTC".to_string(),
            side: Side::Buy,
            entry_price: 100.0,
            exit_price: 100.0 * (1.0 + pnl_pct),
            quantity: 1.0,
            pnl,
            pnl_pct,
            opened_at: chrono::Utc::now(),
            closed_at: chrono::Utc::now(),
            reason: CloseReason::Manual,
        }
    }

    #[test]
    fn kelly_falls_back_to_default_below_min_trades() {
        let rm = risk_manager();
        {
            let mut inner = rm.inner.write();
            for _ in 0..19 {
                inner.trade_history.push_back(trade(1.0, 0.01));
            }
        }
        let inner = rm.inner.read();
        assert_eq!(rm.calc_kelly_fraction(&inner), rm.kelly_fraction);
    }

    #[test]
    fn kelly_activates_at_min_trades_with_both_outcomes() {
        let rm = risk_manager();
        {
            let mut inner = rm.inner.write();
            for _ in 0..12 {
                inner.trade_history.push_back(trade(2.0, 0.02));
            }
            for _ in 0..8 {
                inner.trade_history.push_back(trade(-1.0, -0.01));
            }
        }
        let inner = rm.inner.read();
        let kelly = rm.calc_kelly_fraction(&inner);
        assert!(kelly > 0.0 && kelly <= rm.max_single_position_ratio);
    }

    #[test]
    fn consecutive_losses_trip_cooldown() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("BTC", 99.0, CloseReason::StopLoss);
        rm.register_position("ETH", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("ETH", 99.0, CloseReason::StopLoss);
        assert!(!rm.is_cooldown());
        rm.register_position("XRP", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("XRP", 99.0, CloseReason::StopLoss);
        assert!(rm.is_cooldown());
    }

    #[test]
    fn a_win_resets_consecutive_losses() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("BTC", 99.0, CloseReason::StopLoss);
        rm.register_position("ETH", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("ETH", 110.0, CloseReason::Manual);
        assert_eq!(rm.inner.read().consecutive_losses, 0);
    }

    #[test]
    fn at_most_one_position_per_symbol_and_concurrency_cap() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 98.0);
        let (ok, reason, _) = rm.can_enter("BTC", 50_000_000.0, 0.2);
        assert!(!ok);
        assert!(reason.contains("already held"));
    }

    #[test]
    fn trailing_stop_activates_above_threshold_and_tracks_high_water_mark() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 90.0);
        assert!(rm.update_price("BTC", 102.0, 0.01, 1.0).is_none());
        assert!(rm.inner.read().positions["BTC"].trailing_active);
        assert_eq!(rm.inner.read().positions["BTC"].highest_price, 102.0);
    }

    #[test]
    fn stop_loss_fires_below_dynamic_stop_price() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 0.0);
        // stop_loss_multiplier(2.0) * rv(0.02) = 4% below entry -> stop at 96
        let exit = rm.update_price("BTC", 95.0, 0.02, 1.0);
        assert_eq!(exit.unwrap().action, ExitAction::StopLoss);
    }

    #[test]
    fn daily_reset_clears_counters_but_preserves_trade_history() {
        let rm = risk_manager();
        rm.register_position("BTC", Side::Buy, 100.0, 1.0, 98.0);
        rm.close_position("BTC", 110.0, CloseReason::Manual);
        let summary = rm.daily_reset();
        assert_eq!(summary.trades, 1);
        assert_eq!(rm.inner.read().daily_trade_count, 0);
        assert_eq!(rm.stats().total_trades, 1);
    }
}
