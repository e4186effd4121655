// =============================================================================
// Notifier — fire-and-forget alert delivery
// =============================================================================
//
// Outbound alert channels (Telegram, etc.) are out of scope here; this is the
// call-site contract the rest of the engine alerts through, with a logging
// implementation as the default so every alert still lands somewhere visible.
// =============================================================================

use tracing::{info, warn};

/// Logs alerts. A real delivery backend (Telegram, webhook, ...) would
/// implement the same two call sites and be swapped in at construction time.
#[derive(Default, Clone)]
pub struct Notifier;

impl Notifier {
    pub fn new() -> Self {
        Self
    }

    pub fn send_emergency_stop(&self, reason: &str) {
        warn!(reason, "emergency stop notification");
    }

    pub fn send_trade_closed(&self, symbol: &str, pnl: f64, pnl_pct: f64) {
        info!(symbol, pnl, pnl_pct, "trade closed notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logging_notifier_does_not_panic() {
        let n = Notifier::new();
        n.send_emergency_stop("test");
        n.send_trade_closed("BTC", 1000.0, 0.01);
    }
}
