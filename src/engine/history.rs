/// Record-of-arrays tick history owned by the session.
///
/// Every column grows by exactly one entry per processed tick, warm-up
/// included, so a row index addresses one tick across all columns. The
/// telemetry writer gets an immutable view; nothing else mutates it.
#[derive(Clone, Debug, Default)]
pub struct SessionHistory {
    pub wmp: Vec<f64>,
    pub fair: Vec<f64>,
    pub reservation: Vec<f64>,
    pub our_bid: Vec<f64>,
    pub our_ask: Vec<f64>,
    pub inventory: Vec<i64>,
    pub pnl: Vec<f64>,
    pub gamma: Vec<f64>,
    pub sigma: Vec<f64>,
    pub q_price: Vec<f64>,
    pub r_price: Vec<f64>,
    pub kappa: Vec<f64>,
}

/// One trading-phase row.
#[derive(Clone, Copy, Debug)]
pub struct TickRow {
    pub wmp: f64,
    pub fair: f64,
    pub reservation: f64,
    pub bid: f64,
    pub ask: f64,
    pub inventory: i64,
    pub pnl: f64,
    pub gamma: f64,
    pub sigma: f64,
    pub q_price: f64,
    pub r_price: f64,
    pub kappa: f64,
}

impl SessionHistory {
    /// Warm-up placeholder row: no quotes yet, flat inventory, the raw wmp
    /// standing in for the fair price, and the observed (possibly NaN)
    /// kappa recorded for later averaging.
    pub fn push_warmup(&mut self, wmp: f64, gamma_base: f64, kappa: f64) {
        self.wmp.push(wmp);
        self.fair.push(wmp);
        self.reservation.push(f64::NAN);
        self.our_bid.push(f64::NAN);
        self.our_ask.push(f64::NAN);
        self.inventory.push(0);
        self.pnl.push(0.0);
        self.gamma.push(gamma_base);
        self.sigma.push(0.01);
        self.q_price.push(0.0);
        self.r_price.push(0.0);
        self.kappa.push(kappa);
    }

    pub fn push_tick(&mut self, row: TickRow) {
        self.wmp.push(row.wmp);
        self.fair.push(row.fair);
        self.reservation.push(row.reservation);
        self.our_bid.push(row.bid);
        self.our_ask.push(row.ask);
        self.inventory.push(row.inventory);
        self.pnl.push(row.pnl);
        self.gamma.push(row.gamma);
        self.sigma.push(row.sigma);
        self.q_price.push(row.q_price);
        self.r_price.push(row.r_price);
        self.kappa.push(row.kappa);
    }

    /// After calibration the warm-up rows get the calibrated sigma and
    /// kappa, replacing the placeholders recorded while observing.
    pub fn backfill_calibration(&mut self, sigma_base: f64, kappa_base: f64) {
        for s in &mut self.sigma {
            *s = sigma_base;
        }
        for k in &mut self.kappa {
            *k = kappa_base;
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.wmp.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.wmp.is_empty()
    }

    /// The previous tick's bid quote; NaN before any quote was posted.
    #[inline]
    pub fn last_bid(&self) -> f64 {
        self.our_bid.last().copied().unwrap_or(f64::NAN)
    }

    #[inline]
    pub fn last_ask(&self) -> f64 {
        self.our_ask.last().copied().unwrap_or(f64::NAN)
    }

    /// All columns share one length; broken only by a bug in the pushers.
    pub fn columns_aligned(&self) -> bool {
        let n = self.wmp.len();
        self.fair.len() == n
            && self.reservation.len() == n
            && self.our_bid.len() == n
            && self.our_ask.len() == n
            && self.inventory.len() == n
            && self.pnl.len() == n
            && self.gamma.len() == n
            && self.sigma.len() == n
            && self.q_price.len() == n
            && self.r_price.len() == n
            && self.kappa.len() == n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tick_row(inventory: i64) -> TickRow {
        TickRow {
            wmp: 0.5,
            fair: 0.5,
            reservation: 0.5,
            bid: 0.49,
            ask: 0.51,
            inventory,
            pnl: 0.0,
            gamma: 0.1,
            sigma: 0.02,
            q_price: 0.01,
            r_price: 0.1,
            kappa: 40.0,
        }
    }

    /// Scenario: a mix of warm-up and trading rows.
    /// Expected: every column stays the same length and the last quote
    /// accessors reflect the newest row.
    #[test]
    fn columns_grow_together() {
        let mut h = SessionHistory::default();
        assert!(h.is_empty());
        assert!(h.last_bid().is_nan());

        for i in 0..5 {
            h.push_warmup(0.5 + i as f64 * 0.001, 0.1, f64::NAN);
        }
        assert_eq!(h.len(), 5);
        assert!(h.columns_aligned());
        assert!(h.last_bid().is_nan());

        h.push_tick(tick_row(1));
        assert_eq!(h.len(), 6);
        assert!(h.columns_aligned());
        assert_eq!(h.last_bid(), 0.49);
        assert_eq!(h.last_ask(), 0.51);
    }

    /// Scenario: calibration backfill over warm-up placeholders.
    /// Expected: sigma and kappa columns are rewritten with the calibrated
    /// constants; other columns untouched.
    #[test]
    fn backfill_rewrites_sigma_and_kappa() {
        let mut h = SessionHistory::default();
        h.push_warmup(0.50, 0.1, f64::NAN);
        h.push_warmup(0.51, 0.1, 37.0);

        h.backfill_calibration(0.015, 42.0);
        assert!(h.sigma.iter().all(|&s| s == 0.015));
        assert!(h.kappa.iter().all(|&k| k == 42.0));
        assert_eq!(h.wmp, vec![0.50, 0.51]);
        assert!(h.our_bid.iter().all(|b| b.is_nan()));
    }
}
