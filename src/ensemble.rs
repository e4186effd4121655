// =============================================================================
// Signal ensemble — momentum, funding rate, and the 7-signal weighted fusion
// =============================================================================
//
// Reference: Moskowitz, Ooi & Pedersen (2012), JFE 104(2) — time-series
// momentum with multi-timeframe weighting.
// =============================================================================

use std::collections::HashMap;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tracing::{debug, instrument, warn};

use crate::config::EngineConfig;
use crate::types::{Action, EnsembleResult};

const FUNDING_URL: &str = "https://fapi.binance.com/fapi/v1/premiumIndex";

/// Computes momentum/funding signals and fuses all seven inputs into a
/// final action.
pub struct Ensemble {
    momentum_windows_min: Vec<i64>,
    momentum_weights: Vec<f64>,
    weights: crate::config::EnsembleWeights,
    funding_rates: RwLock<HashMap<String, f64>>,
    http: reqwest::Client,
}

impl Ensemble {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            momentum_windows_min: cfg.momentum_windows_min.clone(),
            momentum_weights: cfg.momentum_weights.clone(),
            weights: cfg.ensemble_weights,
            funding_rates: RwLock::new(HashMap::new()),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(5))
                .build()
                .expect("failed to build reqwest client"),
        }
    }

    /// Time-series momentum over multiple lookback windows (in 1-minute
    /// price-history entries), weighted and clipped per window.
    pub fn momentum_signal(&self, prices: &[f64]) -> f64 {
        let smallest_window = *self.momentum_windows_min.iter().min().unwrap_or(&1) as usize;
        if prices.len() < smallest_window {
            return 0.0;
        }

        let mut total_signal = 0.0;
        let mut total_weight = 0.0;
        let current_price = *prices.last().unwrap();

        for (&window, &weight) in self.momentum_windows_min.iter().zip(self.momentum_weights.iter()) {
            let window = window as usize;
            if prices.len() >= window {
                let past_price = prices[prices.len() - window];
                if past_price > 0.0 {
                    let ret = (current_price - past_price) / past_price;
                    let normalized = (ret * 10.0).clamp(-1.0, 1.0);
                    total_signal += normalized * weight;
                    total_weight += weight;
                }
            }
        }

        if total_weight > 0.0 {
            total_signal / total_weight
        } else {
            0.0
        }
    }

    /// Poll Binance Futures for the perpetual funding rate. Symbols without a
    /// known perpetual-futures counterpart are skipped by the caller.
    #[instrument(skip(self), name = "ensemble::fetch_funding_rate")]
    pub async fn fetch_funding_rate(&self, futures_symbol: &str) -> Result<f64> {
        let url = format!("{FUNDING_URL}?symbol={futures_symbol}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {url} failed"))?;

        if !resp.status().is_success() {
            warn!(futures_symbol, status = %resp.status(), "funding rate request failed");
            return Ok(self.funding_rates.read().get(futures_symbol).copied().unwrap_or(0.0));
        }

        let body: serde_json::Value = resp.json().await.context("failed to parse premiumIndex response")?;
        let rate: f64 = body
            .get("lastFundingRate")
            .and_then(|v| v.as_str().and_then(|s| s.parse().ok()).or_else(|| v.as_f64()))
            .unwrap_or(0.0);

        self.funding_rates.write().insert(futures_symbol.to_string(), rate);
        debug!(futures_symbol, rate, "funding rate fetched");
        Ok(rate)
    }

    /// `rate > 0.003 -> -1.0; rate > 0.001 -> -0.5; rate < -0.003 -> +1.0;
    /// rate < -0.001 -> +0.5; else 0.0`.
    pub fn funding_signal(&self, futures_symbol: &str) -> f64 {
        let rate = self.funding_rates.read().get(futures_symbol).copied().unwrap_or(0.0);
        if rate > 0.003 {
            -1.0
        } else if rate > 0.001 {
            -0.5
        } else if rate < -0.003 {
            1.0
        } else if rate < -0.001 {
            0.5
        } else {
            0.0
        }
    }

    /// Weighted fusion of all seven signals. Treats an exact-zero sentiment
    /// or funding signal as "absent" and proportionally renormalizes the
    /// remaining weights — implemented exactly as specified even though this
    /// conflates a legitimate zero reading with a missing input (see
    /// DESIGN.md Open Question #2).
    pub fn compute_final_score(
        &self,
        obi_signal: f64,
        vpin_signal: f64,
        momentum_signal: f64,
        regime_signal: f64,
        sentiment_signal: f64,
        funding_signal: f64,
        volatility_signal: f64,
    ) -> EnsembleResult {
        let w = self.weights;
        let mut w_obi = w.obi;
        let mut w_vpin = w.vpin;
        let mut w_mom = w.momentum;
        let mut w_reg = w.regime;
        let mut w_sent = w.sentiment;
        let mut w_fund = w.funding;
        let mut w_vol = w.volatility;

        let mut missing_weight = 0.0;
        if sentiment_signal == 0.0 {
            missing_weight += w_sent;
            w_sent = 0.0;
        }
        if funding_signal == 0.0 {
            missing_weight += w_fund;
            w_fund = 0.0;
        }

        if missing_weight > 0.0 {
            let active_weight_sum = w_obi + w_vpin + w_mom + w_reg + w_vol;
            if active_weight_sum > 0.0 {
                let scale = 1.0 + (missing_weight / active_weight_sum);
                w_obi *= scale;
                w_vpin *= scale;
                w_mom *= scale;
                w_reg *= scale;
                w_vol *= scale;
            }
        }

        let raw_score = w_obi * obi_signal
            + w_vpin * vpin_signal
            + w_mom * momentum_signal
            + w_reg * regime_signal
            + w_sent * sentiment_signal
            + w_fund * funding_signal
            + w_vol * volatility_signal;

        let score = raw_score.clamp(-1.0, 1.0);

        let action = if score >= 0.7 {
            Action::StrongBuy
        } else if score >= 0.5 {
            Action::Buy
        } else if score <= -0.7 {
            Action::StrongSell
        } else if score <= -0.3 {
            Action::Sell
        } else {
            Action::Hold
        };

        let directional = [obi_signal, momentum_signal, regime_signal, sentiment_signal, funding_signal];
        let positive = directional.iter().filter(|&&s| s > 0.1).count();
        let negative = directional.iter().filter(|&&s| s < -0.1).count();
        let confidence = positive.max(negative) as f64 / directional.len() as f64;

        let vpin_warning = vpin_signal < -0.5;

        EnsembleResult {
            score,
            action,
            confidence,
            vpin_warning,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ensemble() -> Ensemble {
        Ensemble::new(&EngineConfig::default())
    }

    #[test]
    fn renormalized_weights_sum_to_one() {
        // obi 0.30 vpin 0.15 momentum 0.15 regime 0.15 volatility 0.05 = 0.80 active
        // missing = sentiment 0.10 + funding 0.10 = 0.20 -> scale = 1 + 0.20/0.80 = 1.25
        let w = EngineConfig::default().ensemble_weights;
        let active = w.obi + w.vpin + w.momentum + w.regime + w.volatility;
        let scale = 1.0 + (w.sentiment + w.funding) / active;
        let total = (w.obi + w.vpin + w.momentum + w.regime + w.volatility) * scale;
        assert!((total - 1.0).abs() < 1e-9);
    }

    #[test]
    fn fusion_matches_worked_example() {
        let e = ensemble();
        // obi=1, vpin=0, momentum=0.5, regime=1, sentiment=0 (absent), funding=0 (absent), volatility=0
        // renormalized weights (scale 1.25): 0.375*1.0 + 0.1875*0.5 + 0.1875*1.0 = 0.65625 -> buy
        let result = e.compute_final_score(1.0, 0.0, 0.5, 1.0, 0.0, 0.0, 0.0);
        assert!((result.score - 0.65625).abs() < 1e-9);
        assert_eq!(result.action, Action::Buy);
    }

    #[test]
    fn vpin_warning_fires_below_negative_half() {
        let e = ensemble();
        let result = e.compute_final_score(0.0, -0.6, 0.0, 0.0, 0.0, 0.0, 0.0);
        assert!(result.vpin_warning);
    }

    #[test]
    fn momentum_signal_is_zero_with_insufficient_history() {
        let e = ensemble();
        let prices: Vec<f64> = (0..10).map(|i| 100.0 + i as f64).collect();
        assert_eq!(e.momentum_signal(&prices), 0.0);
    }

    #[test]
    fn funding_signal_thresholds() {
        let e = ensemble();
        e.funding_rates.write().insert("BTCUSDT".to_string(), 0.004);
        assert_eq!(e.funding_signal("BTCUSDT"), -1.0);
        e.funding_rates.write().insert("BTCUSDT".to_string(), -0.004);
        assert_eq!(e.funding_signal("BTCUSDT"), 1.0);
        e.funding_rates.write().insert("BTCUSDT".to_string(), 0.0);
        assert_eq!(e.funding_signal("BTCUSDT"), 0.0);
    }
}
