// =============================================================================
// Bithumb WebSocket gateway — orderbook depth + transaction streams
// =============================================================================
//
// Connects once for all configured symbols, subscribes to both
// `orderbookdepth` and `transaction`, and dispatches parsed frames to
// registered callbacks. Runs until the socket closes or errors, then returns
// so the caller drives the reconnect/backoff loop.
// =============================================================================

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use anyhow::{Context, Result};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{error, info, warn};

use crate::types::{OrderBook, OrderBookLevel, Side, TradeTick};

const WS_URL: &str = "wss://pubwss.bithumb.com/pub/ws";

/// Registered per-event handlers, dispatched in registration order with
/// per-handler error isolation — one handler's failure never blocks the
/// others.
#[derive(Default)]
pub struct StreamHandlers {
    orderbook: Vec<Box<dyn Fn(&str, &OrderBook) -> Result<()> + Send + Sync>>,
    transaction: Vec<Box<dyn Fn(&str, &TradeTick) -> Result<()> + Send + Sync>>,
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_orderbook(
        &mut self,
        handler: impl Fn(&str, &OrderBook) -> Result<()> + Send + Sync + 'static,
    ) {
        self.orderbook.push(Box::new(handler));
    }

    pub fn on_transaction(
        &mut self,
        handler: impl Fn(&str, &TradeTick) -> Result<()> + Send + Sync + 'static,
    ) {
        self.transaction.push(Box::new(handler));
    }

    fn dispatch_orderbook(&self, symbol: &str, book: &OrderBook) {
        for cb in &self.orderbook {
            if let Err(e) = cb(symbol, book) {
                error!(symbol, error = %e, "orderbook callback failed");
            }
        }
    }

    fn dispatch_transaction(&self, symbol: &str, tick: &TradeTick) {
        for cb in &self.transaction {
            if let Err(e) = cb(symbol, tick) {
                error!(symbol, error = %e, "transaction callback failed");
            }
        }
    }
}

/// What was dispatched on a given pass — used only for test observability.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    OrderBook { symbol: String, book: OrderBook },
    Transaction { symbol: String, tick: TradeTick },
}

/// Connect to Bithumb's WebSocket, subscribe `symbols` to orderbookdepth and
/// transaction streams, and dispatch frames to `handlers` until the socket
/// ends or errors.
///
/// The caller is expected to wrap this in a reconnect loop with exponential
/// backoff (1s, doubling, capped at 30s, reset on a successful connect) —
/// this function itself makes exactly one connection attempt.
pub async fn run_bithumb_stream(symbols: &[String], handlers: &StreamHandlers) -> Result<()> {
    info!(url = WS_URL, symbols = ?symbols, "connecting to Bithumb WebSocket");

    let (ws_stream, _response) = connect_async(WS_URL)
        .await
        .context("failed to connect to Bithumb WebSocket")?;

    info!("Bithumb WebSocket connected");
    let (mut write, mut read) = ws_stream.split();

    let market_symbols: Vec<String> = symbols.iter().map(|s| format!("{s}_KRW")).collect();

    let subscribe_orderbook = serde_json::json!({
        "type": "orderbookdepth",
        "symbols": market_symbols,
        "tickTypes": ["1H"],
    });
    let subscribe_transaction = serde_json::json!({
        "type": "transaction",
        "symbols": market_symbols,
        "tickTypes": ["1H"],
    });

    write
        .send(Message::Text(subscribe_orderbook.to_string()))
        .await
        .context("failed to send orderbookdepth subscription")?;
    write
        .send(Message::Text(subscribe_transaction.to_string()))
        .await
        .context("failed to send transaction subscription")?;
    info!(symbols = ?symbols, "subscribed to orderbookdepth + transaction");

    loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                if let Err(e) = dispatch_frame(&text, handlers) {
                    warn!(error = %e, "failed to parse Bithumb frame");
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                error!(error = %e, "Bithumb WebSocket read error");
                return Err(e.into());
            }
            None => {
                warn!("Bithumb WebSocket stream ended");
                return Ok(());
            }
        }
    }
}

fn dispatch_frame(text: &str, handlers: &StreamHandlers) -> Result<()> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse frame JSON")?;

    let msg_type = root.get("type").and_then(|v| v.as_str()).unwrap_or("");
    match msg_type {
        "orderbookdepth" => dispatch_orderbookdepth(&root, handlers),
        "transaction" => dispatch_transaction(&root, handlers),
        _ => Ok(()),
    }
}

fn dispatch_orderbookdepth(root: &serde_json::Value, handlers: &StreamHandlers) -> Result<()> {
    let content = root.get("content").context("orderbookdepth frame missing content")?;
    let list = content
        .get("list")
        .and_then(|v| v.as_array())
        .context("orderbookdepth content missing list")?;

    // Bithumb multiplexes several symbols' levels into one `list`; group by
    // symbol before handing each symbol's book to the handlers.
    let mut by_symbol: std::collections::HashMap<String, OrderBook> = std::collections::HashMap::new();

    for item in list {
        let symbol_pair = item.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
        let symbol = symbol_pair.split('_').next().unwrap_or(symbol_pair).to_string();
        let order_type = item.get("orderType").and_then(|v| v.as_str()).unwrap_or("");
        let price: f64 = item
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let quantity: f64 = item
            .get("quantity")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);

        let entry = by_symbol.entry(symbol).or_default();
        let level = OrderBookLevel { price, quantity };
        match order_type {
            "bid" => entry.bids.push(level),
            "ask" => entry.asks.push(level),
            _ => {}
        }
    }

    for (symbol, mut book) in by_symbol {
        book.bids.sort_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
        book.asks.sort_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
        handlers.dispatch_orderbook(&symbol, &book);
    }

    Ok(())
}

fn dispatch_transaction(root: &serde_json::Value, handlers: &StreamHandlers) -> Result<()> {
    let content = root.get("content").context("transaction frame missing content")?;
    let list = content
        .get("list")
        .and_then(|v| v.as_array())
        .context("transaction content missing list")?;

    for item in list {
        let symbol_pair = item.get("symbol").and_then(|v| v.as_str()).unwrap_or("");
        let symbol = symbol_pair.split('_').next().unwrap_or(symbol_pair).to_string();

        let price: f64 = item
            .get("contPrice")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        let quantity: f64 = item
            .get("contQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0.0);
        // "2" = buy, "1" = sell (unverified against the live venue — see DESIGN.md).
        let side = match item.get("buySellGb").and_then(|v| v.as_str()) {
            Some("2") => Side::Buy,
            _ => Side::Sell,
        };

        let tick = TradeTick {
            price,
            quantity,
            side,
            timestamp: Utc::now(),
        };
        handlers.dispatch_transaction(&symbol, &tick);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn orderbookdepth_frame_groups_by_symbol_and_sorts() {
        let frame = serde_json::json!({
            "type": "orderbookdepth",
            "content": {
                "list": [
                    {"symbol": "BTC_KRW", "orderType": "bid", "price": "100", "quantity": "1"},
                    {"symbol": "BTC_KRW", "orderType": "bid", "price": "101", "quantity": "2"},
                    {"symbol": "BTC_KRW", "orderType": "ask", "price": "103", "quantity": "1"},
                    {"symbol": "BTC_KRW", "orderType": "ask", "price": "102", "quantity": "1"},
                ]
            }
        });

        let seen = Arc::new(std::sync::Mutex::new(None));
        let seen2 = seen.clone();
        let mut handlers = StreamHandlers::new();
        handlers.on_orderbook(move |symbol, book| {
            *seen2.lock().unwrap() = Some((symbol.to_string(), book.clone()));
            Ok(())
        });

        dispatch_frame(&frame.to_string(), &handlers).unwrap();

        let (symbol, book) = seen.lock().unwrap().clone().unwrap();
        assert_eq!(symbol, "BTC");
        assert_eq!(book.bids[0].price, 101.0);
        assert_eq!(book.asks[0].price, 102.0);
    }

    #[test]
    fn a_failing_callback_does_not_block_the_next_one() {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let mut handlers = StreamHandlers::new();
        handlers.on_transaction(|_, _| anyhow::bail!("boom"));
        handlers.on_transaction(move |_, _| {
            count2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let frame = serde_json::json!({
            "type": "transaction",
            "content": {
                "list": [
                    {"symbol": "BTC_KRW", "contPrice": "100", "contQty": "1", "buySellGb": "2"},
                ]
            }
        });
        dispatch_frame(&frame.to_string(), &handlers).unwrap();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
