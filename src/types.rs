// ─── Order book ────────────────────────────────────────────────────────────

/// One price level of the CLOB book. Prices live in (0, 1).
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BookLevel {
    pub price: f64,
    pub size: f64,
}

/// Derived per-asset metrics, recomputed after every applied book event.
#[derive(Clone, Copy, Debug)]
pub struct MarketMetrics {
    pub best_bid: f64,
    pub best_ask: f64,
    pub wmp: f64,
    pub vol_bid: f64,
    pub vol_ask: f64,
    pub vol_diff: f64,
    /// Exponential decay rate of book depth. NaN until a fit succeeds.
    pub kappa: f64,
}

impl Default for MarketMetrics {
    fn default() -> Self {
        Self {
            best_bid: 0.0,
            best_ask: 0.0,
            wmp: 0.0,
            vol_bid: 0.0,
            vol_ask: 0.0,
            vol_diff: 0.0,
            kappa: f64::NAN,
        }
    }
}

// ─── Market catalog ────────────────────────────────────────────────────────

/// Resolved event from the Gamma catalog. `outcomes` and `token_ids` are
/// parallel.
#[derive(Clone, Debug)]
pub struct MarketCatalog {
    pub title: String,
    pub question: String,
    pub outcomes: Vec<String>,
    pub token_ids: Vec<String>,
}

/// The single outcome token a session quotes.
#[derive(Clone, Debug)]
pub struct TrackedToken {
    pub outcome: String,
    pub token_id: String,
}

// ─── Orders ────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ─── Strategy output ───────────────────────────────────────────────────────

/// One tick of quoting output. A NaN leg means that side is suppressed.
#[derive(Clone, Copy, Debug)]
pub struct Quote {
    pub bid: f64,
    pub ask: f64,
    pub reservation: f64,
    pub gamma: f64,
}

// ─── Session result ────────────────────────────────────────────────────────

/// Final record persisted at shutdown, one CSV row per session.
#[derive(Clone, Debug)]
pub struct SessionResult {
    pub timestamp: String,
    pub market: String,
    pub token: String,
    pub real_mode: bool,
    pub pnl_final: f64,
    pub inventory_final: i64,
    pub cash_final: f64,
    /// NaN when the session ended before calibration.
    pub kappa_calibrated: f64,
}

/// Order placement/fill counters, reported in the shutdown summary.
#[derive(Clone, Copy, Debug, Default)]
pub struct SessionStats {
    pub bids_placed: u32,
    pub asks_placed: u32,
    pub bids_filled: u32,
    pub asks_filled: u32,
}
