use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::engine::history::{SessionHistory, TickRow};
use crate::error::MakerError;
use crate::feeds::polymarket::MarketFeed;
use crate::gateway::wallet::WalletBroker;
use crate::math::calibrate::MleCalibrator;
use crate::math::kalman::KalmanEstimator;
use crate::math::stats::{nan_mean, rolling_sigma, std_of_diffs};
use crate::strategy::AvellanedaStrategy;
use crate::telemetry::writer;
use crate::types::{Quote, SessionResult, SessionStats, Side, TrackedToken};

/// Noise defaults when the MLE calibration cannot produce usable values.
const DEFAULT_Q_BASE: [f64; 4] = [0.01, 0.01, 0.1, 0.1];
const DEFAULT_R_BASE: [f64; 2] = [0.1, 1.0];
const DEFAULT_SIGMA_BASE: f64 = 0.01;
/// Calibrated kappa below this is a failed fit, not a liquid market.
const MIN_KAPPA_BASE: f64 = 1e-4;

/// Immutable output of the calibration phase.
#[derive(Clone, Copy, Debug)]
pub struct CalibrationOutcome {
    pub q_base: [f64; 4],
    pub r_base: [f64; 2],
    pub sigma_base: f64,
    pub kappa_base: f64,
    pub kappa_fallback_used: bool,
}

/// Drives one market-making session: warm-up, calibration, trading, and
/// an idempotent shutdown that cancels orders and persists the results.
///
/// All state mutation happens on this task; the feed task only writes its
/// own book.
pub struct SessionRunner {
    config: Config,
    feed: Arc<MarketFeed>,
    broker: Box<dyn WalletBroker>,
    token: TrackedToken,
    shutdown_rx: watch::Receiver<bool>,

    history: SessionHistory,
    warmup_wmp: Vec<f64>,
    warmup_vol_diff: Vec<f64>,
    last_wmp: Option<f64>,

    inventory: i64,
    cash: f64,
    pnl: f64,
    stats: SessionStats,

    calibration: Option<CalibrationOutcome>,
    result: Option<SessionResult>,
}

impl SessionRunner {
    pub fn new(
        config: Config,
        feed: Arc<MarketFeed>,
        broker: Box<dyn WalletBroker>,
        token: TrackedToken,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            feed,
            broker,
            token,
            shutdown_rx,
            history: SessionHistory::default(),
            warmup_wmp: Vec::new(),
            warmup_vol_diff: Vec::new(),
            last_wmp: None,
            inventory: 0,
            cash: 0.0,
            pnl: 0.0,
            stats: SessionStats::default(),
            calibration: None,
            result: None,
        }
    }

    pub fn history(&self) -> &SessionHistory {
        &self.history
    }

    pub fn calibration(&self) -> Option<&CalibrationOutcome> {
        self.calibration.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Run the session to completion (or cancellation / fatal transport
    /// error). The shutdown path runs exactly once either way.
    pub async fn run(&mut self) -> Result<SessionResult, MakerError> {
        let outcome = self.run_inner().await;
        let result = self.finish().await;
        outcome.map(|_| result)
    }

    async fn run_inner(&mut self) -> Result<(), MakerError> {
        let mut estimator = match self.seed_estimator().await? {
            Some(est) => est,
            None => return Ok(()), // cancelled before the first book
        };
        if !self.warmup(&mut estimator).await? {
            return Ok(()); // cancelled mid-warm-up
        }
        let cal = self.calibrate();
        estimator.set_base_noise(cal.q_base, cal.r_base);
        self.trade(&mut estimator, cal).await
    }

    /// Idempotent shutdown: one cancel-all, one result row, one history
    /// snapshot. Safe to call again after `run` has already finished.
    pub async fn finish(&mut self) -> SessionResult {
        if let Some(result) = &self.result {
            return result.clone();
        }

        if let Err(e) = self.broker.cancel_all().await {
            warn!(error = %e, "cancel_all during shutdown failed");
        }

        let kappa_calibrated = self
            .calibration
            .map(|c| c.kappa_base)
            .unwrap_or(f64::NAN);
        let result = SessionResult {
            timestamp: chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string(),
            market: self.config.market_slug.clone(),
            token: self.token.outcome.clone(),
            real_mode: self.config.real_mode,
            pnl_final: self.pnl,
            inventory_final: self.inventory,
            cash_final: self.cash,
            kappa_calibrated,
        };

        if let Err(e) = writer::append_result(&self.config.data_dir, &result) {
            warn!(error = %e, "failed to persist session result");
        }
        if !self.history.is_empty() {
            match writer::write_history(&self.config.data_dir, kappa_calibrated, &self.history) {
                Ok(path) => info!(path = %path, "history snapshot written"),
                Err(e) => warn!(error = %e, "failed to write history snapshot"),
            }
        }

        info!(
            pnl = self.pnl,
            inventory = self.inventory,
            bids_placed = self.stats.bids_placed,
            asks_placed = self.stats.asks_placed,
            bids_filled = self.stats.bids_filled,
            asks_filled = self.stats.asks_filled,
            "session finished"
        );

        self.result = Some(result.clone());
        result
    }

    // ─── Phase 0: seed ─────────────────────────────────────────────────────

    /// Poll until the book shows a positive weighted mid, then seed the
    /// 4-state filter with it. None when cancelled first.
    async fn seed_estimator(&mut self) -> Result<Option<KalmanEstimator>, MakerError> {
        loop {
            if self.is_cancelled() {
                return Ok(None);
            }
            if !self.feed.is_alive() {
                return Err(MakerError::Transport(
                    "market feed terminated before the first book".into(),
                ));
            }
            let m = self.feed.metrics(&self.token.token_id);
            if m.wmp > 0.0 {
                info!(price = m.wmp, "filter seeded");
                return Ok(Some(KalmanEstimator::seeded(
                    m.wmp,
                    m.vol_diff,
                    self.config.q_factor_vol,
                    self.config.r_factor_spread,
                )));
            }
            self.sleep_tick().await;
        }
    }

    // ─── Phase 1: warm-up ──────────────────────────────────────────────────

    /// Collect the warm-up tape: one entry per tick whose wmp is positive
    /// and differs from the last seen value. Returns false when cancelled.
    async fn warmup(&mut self, estimator: &mut KalmanEstimator) -> Result<bool, MakerError> {
        info!(ticks = self.config.warmup_ticks, "warm-up phase started");

        while self.warmup_wmp.len() < self.config.warmup_ticks {
            if self.is_cancelled() {
                return Ok(false);
            }
            if !self.feed.is_alive() {
                return Err(MakerError::Transport("market feed terminated".into()));
            }

            let m = self.feed.metrics(&self.token.token_id);
            if m.wmp > 0.0 && Some(m.wmp) != self.last_wmp {
                self.warmup_wmp.push(m.wmp);
                self.warmup_vol_diff.push(m.vol_diff);
                self.history
                    .push_warmup(m.wmp, self.config.gamma_base, m.kappa);
                estimator.warmup_advance(m.wmp, m.vol_diff);
                self.last_wmp = Some(m.wmp);
                debug!(
                    tick = self.warmup_wmp.len(),
                    total = self.config.warmup_ticks,
                    wmp = m.wmp,
                    "warming up"
                );
            }
            self.sleep_tick().await;
        }

        info!("warm-up complete");
        Ok(true)
    }

    // ─── Phase 2: calibration ──────────────────────────────────────────────

    fn calibrate(&mut self) -> CalibrationOutcome {
        let config = &self.config;
        let calibrator = MleCalibrator::new(&self.warmup_wmp, &self.warmup_vol_diff);

        let mut mle_failed = false;
        let (q_base, r_base) = match (config.q_base_diag, config.r_base_diag) {
            (Some(q), Some(r)) => (q, r),
            _ => match calibrator.fit() {
                Ok((q, r)) => {
                    info!(?q, ?r, "noise covariances calibrated");
                    (q, r)
                }
                Err(e) => {
                    warn!(error = %e, "MLE calibration failed, using default noise");
                    mle_failed = true;
                    (DEFAULT_Q_BASE, DEFAULT_R_BASE)
                }
            },
        };

        let sigma_base = match config.sigma_base {
            Some(sigma) => sigma,
            None if mle_failed => DEFAULT_SIGMA_BASE,
            None => {
                let smoothed = calibrator.filter_tape(q_base, r_base);
                std_of_diffs(&smoothed).max(DEFAULT_SIGMA_BASE)
            }
        };

        let kappa_mean = nan_mean(&self.history.kappa);
        let (kappa_base, kappa_fallback_used) =
            if !kappa_mean.is_finite() || kappa_mean < MIN_KAPPA_BASE {
                info!(fallback = config.kappa_fallback, "kappa fit unusable, using fallback");
                (config.kappa_fallback, true)
            } else {
                info!(kappa = kappa_mean, "kappa calibrated");
                (kappa_mean, false)
            };

        self.history.backfill_calibration(sigma_base, kappa_base);

        let outcome = CalibrationOutcome {
            q_base,
            r_base,
            sigma_base,
            kappa_base,
            kappa_fallback_used,
        };
        self.calibration = Some(outcome);
        outcome
    }

    // ─── Phase 3: trading ──────────────────────────────────────────────────

    async fn trade(
        &mut self,
        estimator: &mut KalmanEstimator,
        cal: CalibrationOutcome,
    ) -> Result<(), MakerError> {
        let strategy = AvellanedaStrategy::new(
            self.config.gamma_base,
            self.config.total_secs,
            self.config.max_inventory,
        );
        let start = tokio::time::Instant::now();
        info!(secs = self.config.total_secs, "trading phase started");

        loop {
            if self.is_cancelled() {
                info!("session cancelled");
                return Ok(());
            }
            let elapsed = start.elapsed().as_secs_f64();
            if elapsed > self.config.total_secs {
                info!("session horizon reached");
                return Ok(());
            }
            if !self.feed.is_alive() {
                return Err(MakerError::Transport("market feed terminated".into()));
            }

            let m = self.feed.metrics(&self.token.token_id);
            if m.wmp > 0.0 && Some(m.wmp) != self.last_wmp {
                // Fixed per-tick order: filter, fills against the previous
                // quotes, fresh quotes, order replacement, bookkeeping.
                let sigma_roll = rolling_sigma(
                    &self.history.fair,
                    self.config.rolling_vol_window,
                    cal.sigma_base,
                );
                let spread = (m.best_ask - m.best_bid).abs();
                let fair = estimator.step(m.wmp, m.vol_diff, spread, sigma_roll);

                if !self.config.real_mode {
                    self.simulate_fills(m.best_bid, m.best_ask);
                }

                let quote = strategy.quote(
                    self.inventory,
                    fair,
                    cal.kappa_base,
                    sigma_roll,
                    elapsed,
                );

                if self.config.real_mode {
                    self.replace_orders(&quote).await;
                } else {
                    if quote.bid.is_finite() {
                        self.stats.bids_placed += 1;
                    }
                    if quote.ask.is_finite() {
                        self.stats.asks_placed += 1;
                    }
                }

                self.pnl = self.cash + self.inventory as f64 * fair;
                self.history.push_tick(TickRow {
                    wmp: m.wmp,
                    fair,
                    reservation: quote.reservation,
                    bid: quote.bid,
                    ask: quote.ask,
                    inventory: self.inventory,
                    pnl: self.pnl,
                    gamma: quote.gamma,
                    sigma: sigma_roll,
                    q_price: estimator.last_q00(),
                    r_price: estimator.last_r00(),
                    kappa: cal.kappa_base,
                });
                self.last_wmp = Some(m.wmp);

                debug!(
                    t_left = self.config.total_secs - elapsed,
                    inventory = self.inventory,
                    pnl = self.pnl,
                    fair,
                    "tick"
                );
            }

            self.sleep_tick().await;
        }
    }

    /// Simulation-only fill attribution: the book moving into last tick's
    /// resting quote fills one share at that quote.
    fn simulate_fills(&mut self, best_bid: f64, best_ask: f64) {
        let prev_bid = self.history.last_bid();
        if prev_bid.is_finite()
            && best_ask > 0.0
            && best_ask <= prev_bid
            && self.inventory < self.config.max_inventory
        {
            self.inventory += 1;
            self.cash -= prev_bid;
            self.stats.bids_filled += 1;
            debug!(price = prev_bid, inventory = self.inventory, "simulated buy fill");
        }

        let prev_ask = self.history.last_ask();
        if prev_ask.is_finite()
            && best_bid > 0.0
            && best_bid >= prev_ask
            && self.inventory > -self.config.max_inventory
        {
            self.inventory -= 1;
            self.cash += prev_ask;
            self.stats.asks_filled += 1;
            debug!(price = prev_ask, inventory = self.inventory, "simulated sell fill");
        }
    }

    /// Real-mode quote replacement: cancel everything, then post each
    /// finite leg sized in shares. Failures are logged and retried on the
    /// next tick.
    async fn replace_orders(&mut self, quote: &Quote) {
        if let Err(e) = self.broker.cancel_all().await {
            warn!(error = %e, "cancel_all failed, requoting anyway");
        }

        if quote.bid.is_finite() {
            let size = self.config.size_usdc / quote.bid;
            match self
                .broker
                .place_limit(&self.token.token_id, quote.bid, size, Side::Buy)
                .await
            {
                Ok(Some(_)) => self.stats.bids_placed += 1,
                Ok(None) => warn!(price = quote.bid, "bid rejected"),
                Err(e) => warn!(error = %e, "bid submission failed"),
            }
        }
        if quote.ask.is_finite() {
            let size = self.config.size_usdc / quote.ask;
            match self
                .broker
                .place_limit(&self.token.token_id, quote.ask, size, Side::Sell)
                .await
            {
                Ok(Some(_)) => self.stats.asks_placed += 1,
                Ok(None) => warn!(price = quote.ask, "ask rejected"),
                Err(e) => warn!(error = %e, "ask submission failed"),
            }
        }
    }

    // ─── Plumbing ──────────────────────────────────────────────────────────

    #[inline]
    fn is_cancelled(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    /// Tick sleep that wakes early on the cancel signal. A dropped sender
    /// degrades to a plain sleep.
    async fn sleep_tick(&mut self) {
        let duration = Duration::from_secs_f64(self.config.tick_secs);
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            changed = self.shutdown_rx.changed() => {
                if changed.is_err() {
                    tokio::time::sleep(duration).await;
                }
            }
        }
    }
}
