use thiserror::Error;

/// Session-level error kinds. Startup errors are fatal; transport and
/// order errors during trading are logged and the tick is skipped.
#[derive(Debug, Error)]
pub enum MakerError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("market not found: {0}")]
    MarketNotFound(String),

    #[error("outcome index {0} out of range")]
    OutcomeOutOfRange(usize),

    #[error("authentication failed: {0}")]
    AuthFailure(String),

    #[error("insufficient funds: have {have:.2} USDC, need {need:.2} USDC")]
    InsufficientFunds { have: f64, need: f64 },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("order rejected: {0}")]
    OrderRejected(String),

    #[error("numeric error: {0}")]
    Numeric(String),

    #[error("calibration failed: {0}")]
    CalibrationFailed(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}
