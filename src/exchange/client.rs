// =============================================================================
// Bithumb REST client — HMAC-SHA512 signed private requests
// =============================================================================
//
// SECURITY: the secret key is never logged or serialized. Private endpoints
// are signed with HMAC-SHA512 over `endpoint\x00query_string\x00nonce_ms`
// (NUL-joined), hex-encoded, per Bithumb's Api-Sign scheme. Calling a private
// endpoint with no configured keys never issues a request — it returns the
// exchange's own "not configured" envelope locally.
// =============================================================================

use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha512;
use tracing::{debug, instrument, warn};

use crate::types::Candle;

type HmacSha512 = Hmac<Sha512>;

const BASE_URL: &str = "https://api.bithumb.com";

/// Status code the exchange (or this client, when keys are absent) uses for
/// success.
const STATUS_OK: &str = "0000";

/// Bithumb REST client. Cheap to `Clone` — holds only a reqwest client and
/// credentials.
#[derive(Clone)]
pub struct BithumbClient {
    api_key: String,
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BithumbClient {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        Self {
            api_key: api_key.into(),
            secret: secret.into(),
            base_url: BASE_URL.to_string(),
            client,
        }
    }

    fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.secret.is_empty()
    }

    fn timestamp_ms() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before UNIX epoch")
            .as_millis() as u64
    }

    /// HMAC-SHA512 signature of `endpoint\x00query_string\x00nonce`.
    fn sign(&self, endpoint: &str, query_string: &str, nonce: &str) -> String {
        let data = format!("{endpoint}\x00{query_string}\x00{nonce}");
        let mut mac =
            HmacSha512::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(data.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // -------------------------------------------------------------------------
    // Public market data
    // -------------------------------------------------------------------------

    #[instrument(skip(self), name = "bithumb::get_ticker")]
    pub async fn get_ticker(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/public/ticker/{}_KRW", self.base_url, symbol);
        self.get_public(&url).await
    }

    #[instrument(skip(self), name = "bithumb::get_orderbook")]
    pub async fn get_orderbook(&self, symbol: &str) -> Result<serde_json::Value> {
        let url = format!("{}/public/orderbook/{}_KRW", self.base_url, symbol);
        self.get_public(&url).await
    }

    #[instrument(skip(self), name = "bithumb::get_transaction_history")]
    pub async fn get_transaction_history(&self, symbol: &str) -> Result<Vec<serde_json::Value>> {
        let url = format!("{}/public/transaction_history/{}_KRW", self.base_url, symbol);
        let data = self.get_public(&url).await?;
        Ok(data.as_array().cloned().unwrap_or_default())
    }

    /// GET candlestick series. Row shape per `interval`:
    /// `[timestamp_ms, open, close, high, low, volume]`.
    #[instrument(skip(self), name = "bithumb::get_candlestick")]
    pub async fn get_candlestick(&self, symbol: &str, interval: &str) -> Result<Vec<Candle>> {
        let url = format!(
            "{}/public/candlestick/{}_KRW/{}",
            self.base_url, symbol, interval
        );
        let data = self.get_public(&url).await?;
        let rows = data.as_array().context("candlestick data is not an array")?;

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let arr = row.as_array().context("candle row is not an array")?;
            if arr.len() < 6 {
                warn!(len = arr.len(), "skipping malformed candle row");
                continue;
            }
            candles.push(Candle {
                timestamp_ms: Self::parse_i64(&arr[0])?,
                open: Self::parse_f64(&arr[1])?,
                close: Self::parse_f64(&arr[2])?,
                high: Self::parse_f64(&arr[3])?,
                low: Self::parse_f64(&arr[4])?,
                volume: Self::parse_f64(&arr[5])?,
            });
        }
        debug!(symbol, interval, count = candles.len(), "candlestick fetched");
        Ok(candles)
    }

    async fn get_public(&self, url: &str) -> Result<serde_json::Value> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {url}"))?;

        if body.get("status").and_then(|v| v.as_str()) != Some(STATUS_OK) {
            warn!(url, status = ?body.get("status"), "non-success status from Bithumb");
        }

        Ok(body.get("data").cloned().unwrap_or(serde_json::Value::Null))
    }

    // -------------------------------------------------------------------------
    // Private (signed) endpoints
    // -------------------------------------------------------------------------

    async fn private_post(
        &self,
        endpoint: &str,
        mut params: Vec<(String, String)>,
    ) -> Result<serde_json::Value> {
        if !self.has_credentials() {
            warn!(endpoint, "Bithumb API keys not configured — refusing to call private endpoint");
            return Ok(json!({"status": "9999", "message": "API key not configured"}));
        }

        params.push(("endpoint".to_string(), endpoint.to_string()));
        let query_string = serde_urlencoded::to_string(&params)
            .context("failed to urlencode private request params")?;
        let nonce = Self::timestamp_ms().to_string();
        let signature = self.sign(endpoint, &query_string, &nonce);

        let url = format!("{}{}", self.base_url, endpoint);
        let resp = self
            .client
            .post(&url)
            .header("Api-Key", &self.api_key)
            .header("Api-Sign", signature)
            .header("Api-Nonce", &nonce)
            .header("Content-Type", "application/x-www-form-urlencoded")
            .body(query_string)
            .send()
            .await
            .with_context(|| format!("POST {endpoint} failed"))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .with_context(|| format!("failed to parse response from {endpoint}"))?;

        Ok(body)
    }

    #[instrument(skip(self), name = "bithumb::get_balance")]
    pub async fn get_balance(&self, symbol: &str) -> Result<serde_json::Value> {
        self.private_post(
            "/info/balance",
            vec![
                ("order_currency".to_string(), symbol.to_string()),
                ("payment_currency".to_string(), "KRW".to_string()),
            ],
        )
        .await
    }

    /// Place a market order. `side` is `"bid"` (buy) or `"ask"` (sell).
    #[instrument(skip(self), name = "bithumb::place_market_order")]
    pub async fn place_market_order(
        &self,
        symbol: &str,
        side: &str,
        units: f64,
    ) -> Result<serde_json::Value> {
        let endpoint = "/trade/place";
        let params = vec![
            ("order_currency".to_string(), symbol.to_string()),
            ("payment_currency".to_string(), "KRW".to_string()),
            ("type".to_string(), side.to_string()),
            ("units".to_string(), units.to_string()),
        ];

        let result = self.private_post(endpoint, params).await?;
        debug!(
            symbol,
            side,
            units,
            status = ?result.get("status"),
            "market order placed"
        );
        Ok(result)
    }

    #[instrument(skip(self), name = "bithumb::cancel_order")]
    pub async fn cancel_order(&self, order_id: &str, symbol: &str, side: &str) -> Result<serde_json::Value> {
        self.private_post(
            "/trade/cancel",
            vec![
                ("order_id".to_string(), order_id.to_string()),
                ("type".to_string(), side.to_string()),
                ("order_currency".to_string(), symbol.to_string()),
                ("payment_currency".to_string(), "KRW".to_string()),
            ],
        )
        .await
    }

    fn parse_f64(val: &serde_json::Value) -> Result<f64> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .with_context(|| format!("failed to parse '{s}' as f64"))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }

    fn parse_i64(val: &serde_json::Value) -> Result<i64> {
        if let Some(s) = val.as_str() {
            s.parse::<i64>()
                .with_context(|| format!("failed to parse '{s}' as i64"))
        } else if let Some(n) = val.as_i64() {
            Ok(n)
        } else {
            anyhow::bail!("expected string or number, got: {val}")
        }
    }
}

impl std::fmt::Debug for BithumbClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BithumbClient")
            .field("api_key", &"<redacted>")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_is_deterministic_for_same_nonce() {
        let client = BithumbClient::new("key", "secret");
        let a = client.sign("/trade/place", "order_currency=BTC", "12345");
        let b = client.sign("/trade/place", "order_currency=BTC", "12345");
        assert_eq!(a, b);
    }

    #[test]
    fn sign_differs_on_endpoint() {
        let client = BithumbClient::new("key", "secret");
        let a = client.sign("/trade/place", "order_currency=BTC", "12345");
        let b = client.sign("/trade/cancel", "order_currency=BTC", "12345");
        assert_ne!(a, b);
    }

    #[test]
    fn no_credentials_short_circuits() {
        assert!(!BithumbClient::new("", "").has_credentials());
        assert!(BithumbClient::new("k", "s").has_credentials());
    }
}
