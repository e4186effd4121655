// =============================================================================
// Regime detector — 3-state Gaussian HMM over (return, |return|)
// =============================================================================
//
// State 0 — bullish (high positive mean return, moderate vol)
// State 1 — sideways (low mean return, low vol)
// State 2 — bearish (negative mean return, high vol)
//
// No Gaussian-HMM crate exists anywhere in this codebase family, so the
// Baum-Welch fit below is hand-written against the reference model's
// semantics: `n_components=3`, full covariance, observations stacked as
// `[return, |return|]`, states canonicalized by sorting the fitted return
// means in descending order so index 0 is always the highest-mean state.
// `ndarray` carries the per-iteration responsibility/transition bookkeeping,
// the same role it plays for this codebase family's GARCH fitter.
// =============================================================================

use std::time::Instant;

use ndarray::Array2;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::config::{EngineConfig, RegimeLabel};

const EM_ITERATIONS: usize = 50;
const MIN_PRICES_FOR_TRAIN: usize = 60;
const MIN_RETURNS_FOR_TRAIN: usize = 30;
const MIN_PRICES_TO_ATTEMPT: usize = 120;

#[derive(Debug, Clone, Copy)]
struct Gaussian2 {
    mean: [f64; 2],
    cov: [[f64; 2]; 2],
}

impl Gaussian2 {
    fn pdf(&self, x: [f64; 2]) -> f64 {
        let det = self.cov[0][0] * self.cov[1][1] - self.cov[0][1] * self.cov[1][0];
        let det = det.max(1e-12);
        let inv = [
            [self.cov[1][1] / det, -self.cov[0][1] / det],
            [-self.cov[1][0] / det, self.cov[0][0] / det],
        ];
        let dx = [x[0] - self.mean[0], x[1] - self.mean[1]];
        let maha = dx[0] * (inv[0][0] * dx[0] + inv[0][1] * dx[1])
            + dx[1] * (inv[1][0] * dx[0] + inv[1][1] * dx[1]);
        let norm = 1.0 / (2.0 * std::f64::consts::PI * det.sqrt());
        norm * (-0.5 * maha).exp()
    }
}

struct HiddenMarkovModel {
    states: Vec<Gaussian2>,
    transition: Array2<f64>,
    initial: Vec<f64>,
}

impl HiddenMarkovModel {
    fn seed(observations: &[[f64; 2]], n_states: usize) -> Self {
        let mut sorted_returns: Vec<f64> = observations.iter().map(|o| o[0]).collect();
        sorted_returns.sort_by(|a, b| a.partial_cmp(b).unwrap());

        let n = sorted_returns.len();
        let mean = observations.iter().map(|o| o[0]).sum::<f64>() / n as f64;
        let var = observations.iter().map(|o| (o[0] - mean).powi(2)).sum::<f64>() / n as f64;
        let var = var.max(1e-8);

        let mut states = Vec::with_capacity(n_states);
        for k in 0..n_states {
            let lo = k * n / n_states;
            let hi = ((k + 1) * n / n_states).max(lo + 1).min(n);
            let slice = &sorted_returns[lo..hi];
            let m = slice.iter().sum::<f64>() / slice.len() as f64;
            states.push(Gaussian2 {
                mean: [m, m.abs().max(1e-4)],
                cov: [[var, 0.0], [0.0, var]],
            });
        }

        let mut transition = Array2::from_elem((n_states, n_states), 0.05 / (n_states as f64 - 1.0).max(1.0));
        for i in 0..n_states {
            transition[[i, i]] = 0.95;
        }

        Self {
            states,
            transition,
            initial: vec![1.0 / n_states as f64; n_states],
        }
    }

    /// Scaled forward-backward + one M-step; returns updated model.
    fn em_step(&self, observations: &[[f64; 2]]) -> (Self, Vec<Vec<f64>>) {
        let t_len = observations.len();
        let k = self.states.len();

        let b: Vec<Vec<f64>> = observations
            .iter()
            .map(|&obs| self.states.iter().map(|s| s.pdf(obs).max(1e-300)).collect())
            .collect();

        // Forward pass with per-step scaling.
        let mut alpha = vec![vec![0.0; k]; t_len];
        let mut c = vec![0.0; t_len];
        for i in 0..k {
            alpha[0][i] = self.initial[i] * b[0][i];
        }
        c[0] = alpha[0].iter().sum::<f64>().max(1e-300);
        for i in 0..k {
            alpha[0][i] /= c[0];
        }
        for t in 1..t_len {
            for j in 0..k {
                let mut sum = 0.0;
                for i in 0..k {
                    sum += alpha[t - 1][i] * self.transition[[i, j]];
                }
                alpha[t][j] = sum * b[t][j];
            }
            c[t] = alpha[t].iter().sum::<f64>().max(1e-300);
            for j in 0..k {
                alpha[t][j] /= c[t];
            }
        }

        // Backward pass using the same scale factors.
        let mut beta = vec![vec![0.0; k]; t_len];
        for i in 0..k {
            beta[t_len - 1][i] = 1.0;
        }
        for t in (0..t_len - 1).rev() {
            for i in 0..k {
                let mut sum = 0.0;
                for j in 0..k {
                    sum += self.transition[[i, j]] * b[t + 1][j] * beta[t + 1][j];
                }
                beta[t][i] = sum / c[t + 1];
            }
        }

        // Gamma (state posteriors) and xi (transition posteriors).
        let mut gamma = vec![vec![0.0; k]; t_len];
        for t in 0..t_len {
            let norm: f64 = (0..k).map(|i| alpha[t][i] * beta[t][i]).sum::<f64>().max(1e-300);
            for i in 0..k {
                gamma[t][i] = alpha[t][i] * beta[t][i] / norm;
            }
        }

        let mut xi_sum = Array2::<f64>::zeros((k, k));
        for t in 0..t_len - 1 {
            let mut norm = 0.0;
            let mut local = vec![vec![0.0; k]; k];
            for i in 0..k {
                for j in 0..k {
                    let v = alpha[t][i] * self.transition[[i, j]] * b[t + 1][j] * beta[t + 1][j];
                    local[i][j] = v;
                    norm += v;
                }
            }
            let norm = norm.max(1e-300);
            for i in 0..k {
                for j in 0..k {
                    xi_sum[[i, j]] += local[i][j] / norm;
                }
            }
        }

        // M-step.
        let mut new_initial = gamma[0].clone();
        let init_sum: f64 = new_initial.iter().sum();
        for v in new_initial.iter_mut() {
            *v /= init_sum.max(1e-300);
        }

        let mut new_transition = Array2::<f64>::zeros((k, k));
        for i in 0..k {
            let gamma_sum: f64 = (0..t_len - 1).map(|t| gamma[t][i]).sum::<f64>().max(1e-300);
            for j in 0..k {
                new_transition[[i, j]] = xi_sum[[i, j]] / gamma_sum;
            }
        }

        let mut new_states = Vec::with_capacity(k);
        for i in 0..k {
            let weight_sum: f64 = (0..t_len).map(|t| gamma[t][i]).sum::<f64>().max(1e-300);
            let mean0 = (0..t_len).map(|t| gamma[t][i] * observations[t][0]).sum::<f64>() / weight_sum;
            let mean1 = (0..t_len).map(|t| gamma[t][i] * observations[t][1]).sum::<f64>() / weight_sum;
            let mut cov = [[0.0; 2]; 2];
            for t in 0..t_len {
                let d0 = observations[t][0] - mean0;
                let d1 = observations[t][1] - mean1;
                cov[0][0] += gamma[t][i] * d0 * d0;
                cov[0][1] += gamma[t][i] * d0 * d1;
                cov[1][0] += gamma[t][i] * d1 * d0;
                cov[1][1] += gamma[t][i] * d1 * d1;
            }
            for row in cov.iter_mut() {
                for v in row.iter_mut() {
                    *v /= weight_sum;
                }
            }
            cov[0][0] = cov[0][0].max(1e-8);
            cov[1][1] = cov[1][1].max(1e-8);
            new_states.push(Gaussian2 { mean: [mean0, mean1], cov });
        }

        (
            Self {
                states: new_states,
                transition: new_transition,
                initial: new_initial,
            },
            gamma,
        )
    }

    fn fit(observations: &[[f64; 2]], n_states: usize, iterations: usize) -> (Self, Vec<Vec<f64>>) {
        let mut model = Self::seed(observations, n_states);
        let mut gamma = vec![vec![1.0 / n_states as f64; n_states]; observations.len()];
        for _ in 0..iterations {
            let (next, g) = model.em_step(observations);
            model = next;
            gamma = g;
        }
        (model, gamma)
    }
}

struct SymbolRegime {
    prices: Vec<f64>,
    current: RegimeLabel,
    last_train: Option<Instant>,
    lookback_cap: usize,
}

impl SymbolRegime {
    fn new(lookback_cap: usize) -> Self {
        Self {
            prices: Vec::new(),
            current: RegimeLabel::Sideways,
            last_train: None,
            lookback_cap,
        }
    }

    fn push_price(&mut self, price: f64) {
        self.prices.push(price);
        if self.prices.len() > self.lookback_cap {
            let excess = self.prices.len() - self.lookback_cap;
            self.prices.drain(0..excess);
        }
    }
}

/// Per-symbol 3-state Gaussian HMM regime detector.
pub struct RegimeDetector {
    symbols: RwLock<std::collections::HashMap<String, SymbolRegime>>,
    n_states: usize,
    retrain_interval_secs: u64,
    lookback_cap: usize,
}

impl RegimeDetector {
    pub fn new(cfg: &EngineConfig) -> Self {
        Self {
            symbols: RwLock::new(std::collections::HashMap::new()),
            n_states: cfg.hmm_n_states,
            retrain_interval_secs: cfg.hmm_retrain_interval_secs,
            lookback_cap: (cfg.hmm_lookback_hours as usize) * 60,
        }
    }

    /// Feed a new price; retrain on cadence once enough history exists.
    /// Returns the current (possibly unchanged) regime label.
    pub fn update_price(&self, symbol: &str, price: f64) -> RegimeLabel {
        let mut symbols = self.symbols.write();
        let state = symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolRegime::new(self.lookback_cap));
        state.push_price(price);

        let should_retrain = state
            .last_train
            .map(|t| t.elapsed().as_secs() >= self.retrain_interval_secs)
            .unwrap_or(true)
            && state.prices.len() >= MIN_PRICES_TO_ATTEMPT;

        if should_retrain {
            if let Some(label) = Self::train(&state.prices, self.n_states) {
                state.current = label;
            } else {
                warn!(symbol, "HMM refit skipped — insufficient or degenerate data");
            }
            state.last_train = Some(Instant::now());
        }

        state.current
    }

    fn train(prices: &[f64], n_states: usize) -> Option<RegimeLabel> {
        if prices.len() < MIN_PRICES_FOR_TRAIN {
            return None;
        }
        let returns: Vec<f64> = prices
            .windows(2)
            .map(|w| (w[1] / w[0]).ln())
            .collect();
        if returns.len() < MIN_RETURNS_FOR_TRAIN {
            return None;
        }

        let observations: Vec<[f64; 2]> = returns.iter().map(|&r| [r, r.abs()]).collect();
        let (model, gamma) = HiddenMarkovModel::fit(&observations, n_states, EM_ITERATIONS);

        // Canonicalize: sort states by descending return-mean, remap so
        // index 0 = highest mean (bullish), last = lowest mean (bearish).
        let mut order: Vec<usize> = (0..n_states).collect();
        order.sort_by(|&a, &b| {
            model.states[b].mean[0]
                .partial_cmp(&model.states[a].mean[0])
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        let mut canonical_of = vec![0usize; n_states];
        for (new_idx, &old_idx) in order.iter().enumerate() {
            canonical_of[old_idx] = new_idx;
        }

        let last_t = gamma.len() - 1;
        let raw_state = gamma[last_t]
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))
            .map(|(idx, _)| idx)
            .unwrap_or(1);
        let canonical_state = canonical_of[raw_state];

        let label = match canonical_state {
            0 => RegimeLabel::Bullish,
            x if x + 1 == n_states => RegimeLabel::Bearish,
            _ => RegimeLabel::Sideways,
        };

        info!(regime = %label, "HMM regime refit complete");
        Some(label)
    }

    pub fn current_regime(&self, symbol: &str) -> RegimeLabel {
        self.symbols
            .read()
            .get(symbol)
            .map(|s| s.current)
            .unwrap_or(RegimeLabel::Sideways)
    }

    /// Regime signal in [-1, 1]: bullish=1.0, sideways=0.0, bearish=-1.0.
    pub fn signal(&self, symbol: &str) -> f64 {
        match self.current_regime(symbol) {
            RegimeLabel::Bullish => 1.0,
            RegimeLabel::Sideways => 0.0,
            RegimeLabel::Bearish => -1.0,
        }
    }

    pub fn prime_prices(&self, symbol: &str, closes: &[f64]) {
        let mut symbols = self.symbols.write();
        let state = symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolRegime::new(self.lookback_cap));
        for &price in closes {
            state.push_price(price);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_regime_is_sideways() {
        let d = RegimeDetector::new(&EngineConfig::default());
        assert_eq!(d.current_regime("BTC"), RegimeLabel::Sideways);
        assert_eq!(d.signal("BTC"), 0.0);
    }

    #[test]
    fn insufficient_history_keeps_default_regime() {
        let d = RegimeDetector::new(&EngineConfig::default());
        for i in 0..10 {
            d.update_price("BTC", 100.0 + i as f64);
        }
        assert_eq!(d.current_regime("BTC"), RegimeLabel::Sideways);
    }

    #[test]
    fn strong_uptrend_classifies_as_bullish() {
        let d = RegimeDetector::new(&EngineConfig::default());
        let mut price = 100.0;
        for _ in 0..150 {
            price *= 1.01;
            d.update_price("BTC", price);
        }
        assert_eq!(d.current_regime("BTC"), RegimeLabel::Bullish);
    }

    #[test]
    fn strong_downtrend_classifies_as_bearish() {
        let d = RegimeDetector::new(&EngineConfig::default());
        let mut price = 100.0;
        for _ in 0..150 {
            price *= 0.99;
            d.update_price("BTC", price);
        }
        assert_eq!(d.current_regime("BTC"), RegimeLabel::Bearish);
    }
}
