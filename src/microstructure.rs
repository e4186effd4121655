// =============================================================================
// Market microstructure analyzer — OBI + OFI + VPIN + Amihud illiquidity
// =============================================================================
//
// References carried over from the source model: Cont, Stoikov & Talreja
// (2010) for order book imbalance; Easley, Lopez de Prado & O'Hara (2012)
// for VPIN; Amihud (2002) for the illiquidity ratio.
// =============================================================================

use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;

use crate::config::EngineConfig;
use crate::types::{OrderBook, Side};

const OBI_HISTORY_CAP: usize = 200;
const OFI_HISTORY_CAP: usize = 200;
const VPIN_BUCKETS_CAP: usize = 100;
const AMIHUD_HISTORY_CAP: usize = 100;
const AMIHUD_WINDOW: usize = 20;
const PRICE_HISTORY_CAP: usize = 2000;

#[derive(Debug, Clone, Copy, Default)]
struct TradeBucket {
    buy_volume: f64,
    sell_volume: f64,
}

struct SymbolState {
    obi_history: VecDeque<f64>,
    current_obi: f64,
    obi_sma: f64,

    ofi_history: VecDeque<f64>,
    current_ofi: f64,
    prev_best_bid_price: f64,
    prev_best_ask_price: f64,
    prev_best_bid_qty: f64,
    prev_best_ask_qty: f64,

    trade_bucket: Vec<TradeBucket>,
    vpin_buckets: VecDeque<f64>,
    current_vpin: f64,

    amihud_history: VecDeque<f64>,
    current_amihud: f64,

    last_price: f64,
    prices: VecDeque<f64>,
}

impl SymbolState {
    fn new() -> Self {
        Self {
            obi_history: VecDeque::with_capacity(OBI_HISTORY_CAP),
            current_obi: 0.0,
            obi_sma: 0.0,
            ofi_history: VecDeque::with_capacity(OFI_HISTORY_CAP),
            current_ofi: 0.0,
            prev_best_bid_price: 0.0,
            prev_best_ask_price: 0.0,
            prev_best_bid_qty: 0.0,
            prev_best_ask_qty: 0.0,
            trade_bucket: Vec::new(),
            vpin_buckets: VecDeque::with_capacity(VPIN_BUCKETS_CAP),
            current_vpin: 0.0,
            amihud_history: VecDeque::with_capacity(AMIHUD_HISTORY_CAP),
            current_amihud: 0.0,
            last_price: 0.0,
            prices: VecDeque::with_capacity(PRICE_HISTORY_CAP),
        }
    }
}

fn push_bounded<T>(deque: &mut VecDeque<T>, cap: usize, value: T) {
    if deque.len() >= cap {
        deque.pop_front();
    }
    deque.push_back(value);
}

/// Signals derived from the order book imbalance.
#[derive(Debug, Clone, Copy)]
pub struct ObiSignal {
    pub obi: f64,
    pub obi_sma: f64,
    pub ofi: f64,
    pub signal: f64,
    pub is_strong_buy: bool,
    pub is_strong_sell: bool,
}

/// Signals derived from VPIN / Amihud illiquidity.
#[derive(Debug, Clone, Copy)]
pub struct VpinSignal {
    pub vpin: f64,
    pub is_danger: bool,
    pub signal: f64,
    pub amihud: f64,
}

/// Tracks per-symbol microstructure state across order book and trade ticks.
pub struct Microstructure {
    states: RwLock<HashMap<String, SymbolState>>,
    obi_depth_levels: usize,
    obi_lookback: usize,
    obi_threshold: f64,
    vpin_bucket_size: usize,
    vpin_num_buckets: usize,
    vpin_danger_threshold: f64,
}

impl Microstructure {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            obi_depth_levels: cfg.obi_depth_levels,
            obi_lookback: cfg.obi_lookback,
            obi_threshold: cfg.obi_threshold,
            vpin_bucket_size: cfg.vpin_bucket_size,
            vpin_num_buckets: cfg.vpin_num_buckets,
            vpin_danger_threshold: cfg.vpin_danger_threshold,
        }
    }

    /// Update OBI/OFI from a new order book snapshot. Returns the current OBI.
    pub fn update_orderbook(&self, symbol: &str, book: &OrderBook) -> f64 {
        let mut states = self.states.write();
        let state = states.entry(symbol.to_string()).or_insert_with(SymbolState::new);

        let depth = self.obi_depth_levels.min(book.bids.len()).min(book.asks.len());
        if depth == 0 {
            return 0.0;
        }

        let total_bid: f64 = book.bids[..depth].iter().map(|l| l.quantity).sum();
        let total_ask: f64 = book.asks[..depth].iter().map(|l| l.quantity).sum();
        let total = total_bid + total_ask;
        if total == 0.0 {
            return 0.0;
        }

        let obi = (total_bid - total_ask) / total;
        state.current_obi = obi;
        push_bounded(&mut state.obi_history, OBI_HISTORY_CAP, obi);

        if state.obi_history.len() >= self.obi_lookback {
            let n = self.obi_lookback;
            let sum: f64 = state.obi_history.iter().rev().take(n).sum();
            state.obi_sma = sum / n as f64;
        }

        let best_bid_price = book.bids.first().map(|l| l.price).unwrap_or(0.0);
        let best_ask_price = book.asks.first().map(|l| l.price).unwrap_or(0.0);
        let best_bid_qty = book.bids.first().map(|l| l.quantity).unwrap_or(0.0);
        let best_ask_qty = book.asks.first().map(|l| l.quantity).unwrap_or(0.0);

        if state.prev_best_bid_price > 0.0 {
            let delta_bid = if best_bid_price > state.prev_best_bid_price {
                best_bid_qty
            } else if best_bid_price == state.prev_best_bid_price {
                best_bid_qty - state.prev_best_bid_qty
            } else {
                -state.prev_best_bid_qty
            };

            let delta_ask = if best_ask_price < state.prev_best_ask_price {
                best_ask_qty
            } else if best_ask_price == state.prev_best_ask_price {
                best_ask_qty - state.prev_best_ask_qty
            } else {
                -state.prev_best_ask_qty
            };

            let ofi = delta_bid - delta_ask;
            state.current_ofi = ofi;
            push_bounded(&mut state.ofi_history, OFI_HISTORY_CAP, ofi);
        }

        state.prev_best_bid_price = best_bid_price;
        state.prev_best_ask_price = best_ask_price;
        state.prev_best_bid_qty = best_bid_qty;
        state.prev_best_ask_qty = best_ask_qty;

        obi
    }

    /// Update VPIN/Amihud from a new trade tick. Returns the current VPIN.
    pub fn update_trade(&self, symbol: &str, price: f64, quantity: f64, side: Side) -> f64 {
        let mut states = self.states.write();
        let state = states.entry(symbol.to_string()).or_insert_with(SymbolState::new);

        state.last_price = price;
        push_bounded(&mut state.prices, PRICE_HISTORY_CAP, price);

        if state.prices.len() >= 2 {
            let last = state.prices[state.prices.len() - 1];
            let prev = state.prices[state.prices.len() - 2];
            if prev != 0.0 && quantity > 0.0 {
                let ret = ((last - prev) / prev).abs();
                let illiq = ret / (quantity * price);
                push_bounded(&mut state.amihud_history, AMIHUD_HISTORY_CAP, illiq);
                if state.amihud_history.len() >= AMIHUD_WINDOW {
                    let sum: f64 = state.amihud_history.iter().rev().take(AMIHUD_WINDOW).sum();
                    state.current_amihud = sum / AMIHUD_WINDOW as f64;
                }
            }
        }

        let trade = TradeBucket {
            buy_volume: if side == Side::Buy { quantity } else { 0.0 },
            sell_volume: if side == Side::Sell { quantity } else { 0.0 },
        };
        state.trade_bucket.push(trade);

        if state.trade_bucket.len() >= self.vpin_bucket_size {
            let bucket_buy: f64 = state.trade_bucket.iter().map(|t| t.buy_volume).sum();
            let bucket_sell: f64 = state.trade_bucket.iter().map(|t| t.sell_volume).sum();
            push_bounded(
                &mut state.vpin_buckets,
                VPIN_BUCKETS_CAP,
                (bucket_buy - bucket_sell).abs(),
            );
            state.trade_bucket.clear();

            if state.vpin_buckets.len() >= self.vpin_num_buckets {
                let n = self.vpin_num_buckets;
                let recent: Vec<f64> = state.vpin_buckets.iter().rev().take(n).copied().collect();
                let max_imbalance = recent.iter().cloned().fold(0.0_f64, f64::max);
                state.current_vpin = if max_imbalance > 0.0 {
                    let mean: f64 = recent.iter().sum::<f64>() / recent.len() as f64;
                    mean / max_imbalance
                } else {
                    0.0
                };
            }
        }

        state.current_vpin
    }

    pub fn obi_signal(&self, symbol: &str) -> ObiSignal {
        let states = self.states.read();
        let state = states.get(symbol);
        let (current_obi, obi_sma, current_ofi) = state
            .map(|s| (s.current_obi, s.obi_sma, s.current_ofi))
            .unwrap_or((0.0, 0.0, 0.0));

        ObiSignal {
            obi: current_obi,
            obi_sma,
            ofi: current_ofi,
            signal: current_obi.clamp(-1.0, 1.0),
            is_strong_buy: current_obi >= self.obi_threshold && current_obi > obi_sma + 0.1,
            is_strong_sell: current_obi <= -self.obi_threshold && current_obi < obi_sma - 0.1,
        }
    }

    pub fn vpin_signal(&self, symbol: &str) -> VpinSignal {
        let states = self.states.read();
        let state = states.get(symbol);
        let (vpin, amihud) = state
            .map(|s| (s.current_vpin, s.current_amihud))
            .unwrap_or((0.0, 0.0));

        let is_danger = vpin >= self.vpin_danger_threshold;
        VpinSignal {
            vpin,
            is_danger,
            signal: if is_danger { -vpin } else { 0.0 },
            amihud,
        }
    }

    pub fn last_price(&self, symbol: &str) -> f64 {
        self.states.read().get(symbol).map(|s| s.last_price).unwrap_or(0.0)
    }

    pub fn prices(&self, symbol: &str) -> Vec<f64> {
        self.states
            .read()
            .get(symbol)
            .map(|s| s.prices.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Seed price history during candle bootstrap, without touching the
    /// OBI/VPIN bucket machinery (those need live book/trade data).
    pub fn prime_prices(&self, symbol: &str, closes: &[f64]) {
        let mut states = self.states.write();
        let state = states.entry(symbol.to_string()).or_insert_with(SymbolState::new);
        for &price in closes {
            push_bounded(&mut state.prices, PRICE_HISTORY_CAP, price);
            state.last_price = price;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::OrderBookLevel;

    fn cfg() -> EngineConfig {
        EngineConfig::default()
    }

    #[test]
    fn obi_is_zero_for_balanced_book() {
        let m = Microstructure::new(&cfg());
        let book = OrderBook {
            bids: vec![OrderBookLevel { price: 100.0, quantity: 5.0 }],
            asks: vec![OrderBookLevel { price: 101.0, quantity: 5.0 }],
        };
        assert_eq!(m.update_orderbook("BTC", &book), 0.0);
    }

    #[test]
    fn obi_matches_worked_example() {
        let m = Microstructure::new(&cfg());
        let book = OrderBook {
            bids: vec![OrderBookLevel { price: 100.0, quantity: 5.0 }],
            asks: vec![OrderBookLevel { price: 101.0, quantity: 1.0 }],
        };
        let obi = m.update_orderbook("BTC", &book);
        assert!((obi - (5.0 - 1.0) / 6.0).abs() < 1e-9);
    }

    #[test]
    fn obi_is_zero_on_empty_book() {
        let m = Microstructure::new(&cfg());
        let book = OrderBook::default();
        assert_eq!(m.update_orderbook("BTC", &book), 0.0);
    }

    #[test]
    fn vpin_requires_full_bucket_history_before_nonzero() {
        let m = Microstructure::new(&cfg());
        for _ in 0..49 {
            m.update_trade("BTC", 100.0, 1.0, Side::Buy);
        }
        assert_eq!(m.vpin_signal("BTC").vpin, 0.0);
    }

    #[test]
    fn vpin_reaches_one_under_fully_one_sided_flow() {
        let m = Microstructure::new(&cfg());
        // 50 buckets of 50 buys each -> |50-0| = 50 per bucket, mean/max = 1.0
        for _ in 0..(50 * 50) {
            m.update_trade("BTC", 100.0, 1.0, Side::Buy);
        }
        let sig = m.vpin_signal("BTC");
        assert!((sig.vpin - 1.0).abs() < 1e-9);
        assert!(sig.is_danger);
    }

    #[test]
    fn vpin_and_obi_stay_within_bounds() {
        let m = Microstructure::new(&cfg());
        for i in 0..500 {
            let side = if i % 3 == 0 { Side::Sell } else { Side::Buy };
            let v = m.update_trade("BTC", 100.0 + (i % 7) as f64, 1.0, side);
            assert!((0.0..=1.0).contains(&v));
        }
    }
}
