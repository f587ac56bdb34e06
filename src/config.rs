use std::str::FromStr;

use crate::error::MakerError;

/// Session configuration loaded from environment variables.
///
/// Option names keep the venue-agent heritage (`TIEMPO_TOTAL`,
/// `SLUG_MERCADO`, ...). A value that is present but out of range is a
/// fatal `ConfigInvalid` at startup — never silently defaulted.
#[derive(Clone, Debug)]
pub struct Config {
    /// Trading-phase horizon in seconds (`TIEMPO_TOTAL`).
    pub total_secs: f64,
    /// Poll interval of the session loop in seconds (`INTERVALO_TICK`).
    pub tick_secs: f64,
    /// Gamma event slug (`SLUG_MERCADO`).
    pub market_slug: String,
    /// Window for the rolling fair-price volatility (`ROLLING_VOL_WINDOW`).
    pub rolling_vol_window: usize,
    /// Warm-up tape length in ticks (`WARMUP_TICKS`).
    pub warmup_ticks: usize,
    /// Base inventory aversion (`GAMMA_BASE`).
    pub gamma_base: f64,
    /// Liquidity density used when the book fit fails (`KAPPA_FALLBACK`).
    pub kappa_fallback: f64,
    /// Hard inventory bound for the kill-switch (`MAX_INVENTARIO`).
    pub max_inventory: i64,
    /// Optional pre-calibrated process noise diagonal (`Q_BASE_DIAG`).
    pub q_base_diag: Option<[f64; 4]>,
    /// Optional pre-calibrated measurement noise diagonal (`R_BASE_DIAG`).
    pub r_base_diag: Option<[f64; 2]>,
    /// Optional pre-calibrated base volatility (`SIGMA_BASE`).
    pub sigma_base: Option<f64>,
    /// Measurement-noise scaling with market spread (`R_FACTOR_SPREAD`).
    pub r_factor_spread: f64,
    /// Process-noise scaling with realized volatility (`Q_FACTOR_VOL`).
    pub q_factor_vol: f64,
    /// Submit real orders instead of simulating fills (`MODO_REAL`).
    pub real_mode: bool,
    /// Notional per quote leg in USDC (`SIZE_USDC`).
    pub size_usdc: f64,

    // Ambient endpoints and paths.
    pub gamma_api_url: String,
    pub clob_ws_url: String,
    pub clob_host: String,
    pub data_dir: String,
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn from_env() -> Result<Self, MakerError> {
        let config = Self {
            total_secs: parse_var("TIEMPO_TOTAL")?.unwrap_or(300.0),
            tick_secs: parse_var("INTERVALO_TICK")?.unwrap_or(0.5),
            market_slug: std::env::var("SLUG_MERCADO").unwrap_or_default(),
            rolling_vol_window: parse_var("ROLLING_VOL_WINDOW")?.unwrap_or(20),
            warmup_ticks: parse_var("WARMUP_TICKS")?.unwrap_or(30),
            gamma_base: parse_var("GAMMA_BASE")?.unwrap_or(0.1),
            kappa_fallback: parse_var("KAPPA_FALLBACK")?.unwrap_or(50.0),
            max_inventory: parse_var("MAX_INVENTARIO")?.unwrap_or(10),
            q_base_diag: parse_diag::<4>("Q_BASE_DIAG")?,
            r_base_diag: parse_diag::<2>("R_BASE_DIAG")?,
            sigma_base: parse_var("SIGMA_BASE")?,
            r_factor_spread: parse_var("R_FACTOR_SPREAD")?.unwrap_or(1.0),
            q_factor_vol: parse_var("Q_FACTOR_VOL")?.unwrap_or(1.0),
            real_mode: std::env::var("MODO_REAL")
                .map(|v| v == "1" || v.to_lowercase() == "true")
                .unwrap_or(false),
            size_usdc: parse_var("SIZE_USDC")?.unwrap_or(1.0),
            gamma_api_url: std::env::var("GAMMA_API_URL")
                .unwrap_or_else(|_| "https://gamma-api.polymarket.com".into()),
            clob_ws_url: std::env::var("CLOB_WS_URL")
                .unwrap_or_else(|_| "wss://ws-subscriptions-clob.polymarket.com/ws/market".into()),
            clob_host: std::env::var("CLOB_HOST")
                .unwrap_or_else(|_| "https://clob.polymarket.com".into()),
            data_dir: std::env::var("DATA_DIR").unwrap_or_else(|_| "Data".into()),
            request_timeout_secs: parse_var("REQUEST_TIMEOUT_SECS")?.unwrap_or(10),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), MakerError> {
        let invalid = |msg: &str| Err(MakerError::ConfigInvalid(msg.into()));

        if self.total_secs <= 0.0 {
            return invalid("TIEMPO_TOTAL must be > 0");
        }
        if self.tick_secs <= 0.0 {
            return invalid("INTERVALO_TICK must be > 0");
        }
        if self.market_slug.trim().is_empty() {
            return invalid("SLUG_MERCADO must be set");
        }
        if self.rolling_vol_window < 2 {
            return invalid("ROLLING_VOL_WINDOW must be >= 2");
        }
        if self.warmup_ticks < 10 {
            return invalid("WARMUP_TICKS must be >= 10");
        }
        if self.gamma_base <= 0.0 {
            return invalid("GAMMA_BASE must be > 0");
        }
        if self.kappa_fallback <= 0.0 {
            return invalid("KAPPA_FALLBACK must be > 0");
        }
        if self.max_inventory <= 0 {
            return invalid("MAX_INVENTARIO must be > 0");
        }
        if let Some(q) = &self.q_base_diag {
            if q.iter().any(|v| *v <= 0.0) {
                return invalid("Q_BASE_DIAG entries must be > 0");
            }
        }
        if let Some(r) = &self.r_base_diag {
            if r.iter().any(|v| *v <= 0.0) {
                return invalid("R_BASE_DIAG entries must be > 0");
            }
        }
        if let Some(s) = self.sigma_base {
            if s <= 0.0 {
                return invalid("SIGMA_BASE must be > 0");
            }
        }
        if self.r_factor_spread < 0.0 {
            return invalid("R_FACTOR_SPREAD must be >= 0");
        }
        if self.q_factor_vol < 0.0 {
            return invalid("Q_FACTOR_VOL must be >= 0");
        }
        if self.size_usdc <= 0.0 {
            return invalid("SIZE_USDC must be > 0");
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(name: &str) -> Result<Option<T>, MakerError> {
    match std::env::var(name) {
        Ok(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            MakerError::ConfigInvalid(format!("{name} has an unparseable value: {raw:?}"))
        }),
        Err(_) => Ok(None),
    }
}

/// Comma-separated fixed-size float list, e.g. `Q_BASE_DIAG=0.01,0.01,0.1,0.1`.
fn parse_diag<const N: usize>(name: &str) -> Result<Option<[f64; N]>, MakerError> {
    let raw = match std::env::var(name) {
        Ok(raw) => raw,
        Err(_) => return Ok(None),
    };
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|_| {
            MakerError::ConfigInvalid(format!("{name} has an unparseable value: {raw:?}"))
        })?;
    let arr: [f64; N] = parts.try_into().map_err(|_| {
        MakerError::ConfigInvalid(format!("{name} must contain exactly {N} values"))
    })?;
    Ok(Some(arr))
}
