// =============================================================================
// Engine configuration — named constants loaded from the environment
// =============================================================================
//
// Every tunable named throughout the microstructure/volatility/regime/
// ensemble/risk modules lives here, with the defaults this system was
// designed around. Overridable via environment variables so a deployment can
// tune thresholds without a rebuild.
// =============================================================================

use tracing::info;

fn env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Per-regime risk posture, keyed by `RegimeLabel`.
#[derive(Debug, Clone, Copy)]
pub struct RegimeParams {
    pub kelly_mult: f64,
    pub cash_ratio: f64,
    pub trailing_mult: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegimeLabel {
    Bullish,
    Sideways,
    Bearish,
}

impl std::fmt::Display for RegimeLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Bullish => "bullish",
            Self::Sideways => "sideways",
            Self::Bearish => "bearish",
        };
        write!(f, "{s}")
    }
}

impl RegimeLabel {
    pub fn params(&self, cfg: &EngineConfig) -> RegimeParams {
        match self {
            Self::Bullish => cfg.regime_bullish,
            Self::Sideways => cfg.regime_sideways,
            Self::Bearish => cfg.regime_bearish,
        }
    }
}

/// Weights applied by the signal ensemble. Must sum to 1.0.
#[derive(Debug, Clone, Copy)]
pub struct EnsembleWeights {
    pub obi: f64,
    pub vpin: f64,
    pub momentum: f64,
    pub regime: f64,
    pub sentiment: f64,
    pub funding: f64,
    pub volatility: f64,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub symbols: Vec<String>,

    // Bithumb credentials.
    pub api_key: String,
    pub api_secret: String,

    // Microstructure (C3).
    pub obi_depth_levels: usize,
    pub obi_lookback: usize,
    pub obi_threshold: f64,
    pub vpin_bucket_size: usize,
    pub vpin_num_buckets: usize,
    pub vpin_danger_threshold: f64,

    // Volatility (C4).
    pub garch_lookback: usize,
    pub garch_retrain_interval_secs: u64,

    // Regime (C5).
    pub hmm_n_states: usize,
    pub hmm_lookback_hours: u64,
    pub hmm_retrain_interval_secs: u64,

    // Ensemble (C6).
    pub momentum_windows_min: Vec<i64>,
    pub momentum_weights: Vec<f64>,
    pub ensemble_weights: EnsembleWeights,

    // Risk (C7).
    pub stop_loss_multiplier: f64,
    pub trailing_activation_pct: f64,
    pub trailing_offset_multiplier: f64,
    pub kelly_fraction: f64,
    pub kelly_min_trades_for_calc: usize,
    pub max_single_position_ratio: f64,
    pub max_concurrent_positions: usize,
    pub max_consecutive_losses: u32,
    pub cooldown_seconds: u64,
    pub daily_cvar_limit: f64,
    pub min_cash_reserve_ratio: f64,
    pub max_total_capital_krw: f64,

    pub regime_bullish: RegimeParams,
    pub regime_sideways: RegimeParams,
    pub regime_bearish: RegimeParams,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            symbols: vec![
                "BTC".to_string(),
                "ETH".to_string(),
                "XRP".to_string(),
                "SOL".to_string(),
                "DOGE".to_string(),
            ],
            api_key: String::new(),
            api_secret: String::new(),

            obi_depth_levels: 10,
            obi_lookback: 20,
            obi_threshold: 0.60,
            vpin_bucket_size: 50,
            vpin_num_buckets: 50,
            vpin_danger_threshold: 0.80,

            garch_lookback: 500,
            garch_retrain_interval_secs: 1800,

            hmm_n_states: 3,
            hmm_lookback_hours: 168,
            hmm_retrain_interval_secs: 3600,

            momentum_windows_min: vec![60, 240, 1440, 10080],
            momentum_weights: vec![0.4, 0.3, 0.2, 0.1],
            ensemble_weights: EnsembleWeights {
                obi: 0.30,
                vpin: 0.15,
                momentum: 0.15,
                regime: 0.15,
                sentiment: 0.10,
                funding: 0.10,
                volatility: 0.05,
            },

            stop_loss_multiplier: 2.0,
            trailing_activation_pct: 0.015,
            trailing_offset_multiplier: 1.5,
            kelly_fraction: 0.25,
            kelly_min_trades_for_calc: 20,
            max_single_position_ratio: 0.20,
            max_concurrent_positions: 3,
            max_consecutive_losses: 3,
            cooldown_seconds: 1800,
            daily_cvar_limit: -0.03,
            min_cash_reserve_ratio: 0.20,
            max_total_capital_krw: 50_000_000.0,

            regime_bullish: RegimeParams {
                kelly_mult: 1.0,
                cash_ratio: 0.20,
                trailing_mult: 2.0,
            },
            regime_sideways: RegimeParams {
                kelly_mult: 0.5,
                cash_ratio: 0.40,
                trailing_mult: 1.5,
            },
            regime_bearish: RegimeParams {
                kelly_mult: 0.25,
                cash_ratio: 0.80,
                trailing_mult: 1.0,
            },
        }
    }
}

impl EngineConfig {
    /// Load configuration from the environment, falling back to the values
    /// this system was designed and tuned around.
    pub fn load() -> Self {
        let mut cfg = Self::default();

        cfg.api_key = std::env::var("BITHUMB_API_KEY").unwrap_or_default();
        cfg.api_secret = std::env::var("BITHUMB_API_SECRET").unwrap_or_default();

        if let Ok(syms) = std::env::var("WON_SYMBOLS") {
            let parsed: Vec<String> = syms
                .split(',')
                .map(|s| s.trim().to_uppercase())
                .filter(|s| !s.is_empty())
                .collect();
            if !parsed.is_empty() {
                cfg.symbols = parsed;
            }
        }

        cfg.obi_threshold = env_f64("WON_OBI_THRESHOLD", cfg.obi_threshold);
        cfg.vpin_danger_threshold = env_f64("WON_VPIN_DANGER_THRESHOLD", cfg.vpin_danger_threshold);
        cfg.kelly_fraction = env_f64("WON_KELLY_FRACTION", cfg.kelly_fraction);
        cfg.max_concurrent_positions =
            env_usize("WON_MAX_CONCURRENT_POSITIONS", cfg.max_concurrent_positions);
        cfg.max_consecutive_losses =
            env_u64("WON_MAX_CONSECUTIVE_LOSSES", cfg.max_consecutive_losses as u64) as u32;
        cfg.daily_cvar_limit = env_f64("WON_DAILY_CVAR_LIMIT", cfg.daily_cvar_limit);
        cfg.max_total_capital_krw = env_f64("WON_MAX_TOTAL_CAPITAL_KRW", cfg.max_total_capital_krw);

        info!(symbols = ?cfg.symbols, "engine configuration loaded");
        cfg
    }
}
