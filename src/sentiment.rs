// =============================================================================
// Sentiment slot — externally fed score, read on every ensemble tick
// =============================================================================
//
// The sentiment score itself comes from an external classifier/webhook
// (out of scope here, per spec §1); this module is just the shared slot it
// writes into and the ensemble reads from — an atomic read path with a
// locked write path, since writes are rare and reads are on the hot tick
// path.
// =============================================================================

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::info;

#[derive(Default)]
pub struct SentimentBoard {
    scores: RwLock<HashMap<String, f64>>,
}

impl SentimentBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Update the sentiment score for a symbol, clipped to [-1, 1].
    pub fn update(&self, symbol: &str, score: f64) {
        let clipped = score.clamp(-1.0, 1.0);
        self.scores.write().insert(symbol.to_string(), clipped);
        info!(symbol, score = clipped, "sentiment updated");
    }

    /// Current sentiment for a symbol, or 0.0 (absent) if never set.
    pub fn get(&self, symbol: &str) -> f64 {
        self.scores.read().get(symbol).copied().unwrap_or(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_symbol_defaults_to_zero() {
        let board = SentimentBoard::new();
        assert_eq!(board.get("BTC"), 0.0);
    }

    #[test]
    fn update_clips_to_unit_range() {
        let board = SentimentBoard::new();
        board.update("BTC", 5.0);
        assert_eq!(board.get("BTC"), 1.0);
        board.update("BTC", -5.0);
        assert_eq!(board.get("BTC"), -1.0);
    }
}
