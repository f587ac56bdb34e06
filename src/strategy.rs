use crate::types::Quote;

/// Avellaneda-Stoikov single-layer quoting.
///
/// Turns (inventory, fair price, kappa, sigma, elapsed time) into a
/// reservation price and symmetric optimal quotes around it. Inventory
/// aversion grows exponentially with position size, and a hard kill-switch
/// suppresses the accumulating leg at the inventory bound.
pub struct AvellanedaStrategy {
    gamma_base: f64,
    horizon_secs: f64,
    max_inventory: i64,
}

impl AvellanedaStrategy {
    pub fn new(gamma_base: f64, horizon_secs: f64, max_inventory: i64) -> Self {
        Self {
            gamma_base,
            horizon_secs,
            max_inventory,
        }
    }

    pub fn quote(
        &self,
        inventory: i64,
        fair_price: f64,
        kappa: f64,
        sigma: f64,
        elapsed_secs: f64,
    ) -> Quote {
        // Normalized time remaining, floored so the session end never
        // divides the spread away entirely.
        let t_t = ((self.horizon_secs - elapsed_secs) / self.horizon_secs).max(0.001);

        let q = inventory as f64;
        let gamma = self.gamma_base * (0.1 * q.abs()).exp();

        // Classic reservation-price skew uses the variance, not sigma.
        let skew = q * gamma * sigma * sigma * t_t;
        let reservation = fair_price - skew;

        let half_spread = (1.0 / gamma) * (1.0 + gamma / kappa).ln() * (1.0 + sigma) / 2.0;

        let mut bid = reservation - half_spread;
        let mut ask = reservation + half_spread;

        if inventory >= self.max_inventory {
            bid = f64::NAN;
        }
        if inventory <= -self.max_inventory {
            ask = f64::NAN;
        }

        Quote {
            bid,
            ask,
            reservation,
            gamma,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strategy() -> AvellanedaStrategy {
        AvellanedaStrategy::new(0.1, 300.0, 5)
    }

    /// Scenario: flat inventory at mid-session.
    /// Expected: reservation equals the fair price, quotes are symmetric
    /// around it, and bid < ask.
    #[test]
    fn flat_inventory_is_symmetric() {
        let q = strategy().quote(0, 0.50, 50.0, 0.01, 150.0);
        assert_eq!(q.reservation, 0.50);
        assert!((0.50 - q.bid - (q.ask - 0.50)).abs() < 1e-12);
        assert!(q.bid < q.ask);
        assert!((q.gamma - 0.1).abs() < 1e-12);
    }

    /// Scenario: long inventory 3 versus flat.
    /// Expected: the reservation drops below the fair price by
    /// q * gamma * sigma^2 * T_t, discouraging further buys.
    #[test]
    fn long_inventory_skews_down() {
        let sigma = 0.02;
        let q = strategy().quote(3, 0.50, 50.0, sigma, 0.0);
        let gamma = 0.1 * (0.3f64).exp();
        let expected_skew = 3.0 * gamma * sigma * sigma * 1.0;
        assert!((q.reservation - (0.50 - expected_skew)).abs() < 1e-12);
        assert!(q.reservation < 0.50);

        let short = strategy().quote(-3, 0.50, 50.0, sigma, 0.0);
        assert!(short.reservation > 0.50);
    }

    /// Scenario: increasing |inventory| with everything else fixed.
    /// Expected: the reservation moves monotonically away from the fair
    /// price, and both legs stay ordered while finite.
    #[test]
    fn skew_is_monotone_in_inventory() {
        let strat = strategy();
        let mut last_skew = 0.0;
        for q in 1..5 {
            let quote = strat.quote(q, 0.50, 50.0, 0.02, 100.0);
            let skew = 0.50 - quote.reservation;
            assert!(skew > last_skew, "skew not increasing at q = {q}");
            assert!(quote.bid < quote.ask);
            last_skew = skew;
        }
    }

    /// Scenario: inventory at +cap and beyond, then at -cap.
    /// Expected: the accumulating leg is NaN while the reducing leg
    /// survives.
    #[test]
    fn kill_switch_suppresses_one_leg() {
        let strat = strategy();

        let long = strat.quote(5, 0.50, 50.0, 0.01, 10.0);
        assert!(long.bid.is_nan());
        assert!(long.ask.is_finite());

        let very_long = strat.quote(7, 0.50, 50.0, 0.01, 10.0);
        assert!(very_long.bid.is_nan());

        let short = strat.quote(-5, 0.50, 50.0, 0.01, 10.0);
        assert!(short.ask.is_nan());
        assert!(short.bid.is_finite());
    }

    /// Scenario: elapsed sweeps across the horizon, including exactly T and
    /// past it.
    /// Expected: the spread stays finite everywhere; at and after T the
    /// floor T_t = 0.001 applies instead of a division blow-up.
    #[test]
    fn time_decay_is_finite_through_horizon() {
        let strat = strategy();
        for step in 0..=60 {
            let elapsed = 300.0 * step as f64 / 60.0;
            let q = strat.quote(1, 0.50, 50.0, 0.01, elapsed);
            assert!(q.bid.is_finite() && q.ask.is_finite(), "t = {elapsed}");
            assert!(q.ask > q.bid);
        }

        let at_end = strat.quote(2, 0.50, 50.0, 0.05, 300.0);
        let gamma = 0.1 * (0.2f64).exp();
        let expected_skew = 2.0 * gamma * 0.05 * 0.05 * 0.001;
        assert!((0.50 - at_end.reservation - expected_skew).abs() < 1e-15);

        let past_end = strat.quote(0, 0.50, 50.0, 0.05, 400.0);
        assert!(past_end.bid.is_finite() && past_end.ask.is_finite());
    }

    /// Scenario: higher sigma with fixed inventory and kappa.
    /// Expected: the half-spread widens with (1 + sigma).
    #[test]
    fn spread_widens_with_sigma() {
        let strat = strategy();
        let calm = strat.quote(0, 0.50, 50.0, 0.01, 0.0);
        let wild = strat.quote(0, 0.50, 50.0, 0.20, 0.0);
        assert!(wild.ask - wild.bid > calm.ask - calm.bid);
    }
}
