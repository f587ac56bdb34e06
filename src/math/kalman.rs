use nalgebra::{Cholesky, Matrix2, Matrix2x4, Matrix4, Vector2, Vector4};
use tracing::warn;

/// Noise diagonals are clamped here so the Cholesky solve never sees an
/// exactly-singular innovation covariance from scaling alone.
const NOISE_FLOOR: f64 = 1e-9;

/// Constant-velocity transition over [price, price_vel, vol_diff, vol_diff_vel].
#[inline]
pub fn transition_matrix() -> Matrix4<f64> {
    Matrix4::new(
        1.0, 1.0, 0.0, 0.0, //
        0.0, 1.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 1.0, //
        0.0, 0.0, 0.0, 1.0,
    )
}

/// Observation picks the price and vol_diff components.
#[inline]
pub fn observation_matrix() -> Matrix2x4<f64> {
    Matrix2x4::new(
        1.0, 0.0, 0.0, 0.0, //
        0.0, 0.0, 1.0, 0.0,
    )
}

/// Online 4-state Kalman filter producing the tick-by-tick fair price.
///
/// Seeded from the first positive weighted mid-price; the base noise
/// diagonals arrive later, once warm-up calibration has run. Each step
/// rescales Q by realized volatility and R by the market spread.
pub struct KalmanEstimator {
    x: Vector4<f64>,
    p: Matrix4<f64>,
    q_base: Vector4<f64>,
    r_base: Vector2<f64>,
    q_factor_vol: f64,
    r_factor_spread: f64,
    last_q00: f64,
    last_r00: f64,
}

impl KalmanEstimator {
    pub fn seeded(wmp: f64, vol_diff: f64, q_factor_vol: f64, r_factor_spread: f64) -> Self {
        Self {
            x: Vector4::new(wmp, 0.0, vol_diff, 0.0),
            p: Matrix4::identity(),
            q_base: Vector4::zeros(),
            r_base: Vector2::zeros(),
            q_factor_vol,
            r_factor_spread,
            last_q00: 0.0,
            last_r00: 0.0,
        }
    }

    /// Install the calibrated base noise diagonals. Must happen before the
    /// first `step`.
    pub fn set_base_noise(&mut self, q_base: [f64; 4], r_base: [f64; 2]) {
        self.q_base = Vector4::from_column_slice(&q_base);
        self.r_base = Vector2::from_column_slice(&r_base);
    }

    /// Warm-up advance: predict, then pin the observed components. The
    /// velocity components keep their seeded zeros through warm-up.
    pub fn warmup_advance(&mut self, wmp: f64, vol_diff: f64) {
        self.x = transition_matrix() * self.x;
        self.x[0] = wmp;
        self.x[2] = vol_diff;
    }

    /// One predict/update cycle. Returns the filtered fair price.
    ///
    /// A singular innovation covariance leaves the state untouched and
    /// returns the prior price; the tick is still recorded by the caller.
    pub fn step(&mut self, wmp: f64, vol_diff: f64, spread: f64, sigma_roll: f64) -> f64 {
        let q_dyn = Matrix4::from_diagonal(
            &(self.q_base * (1.0 + sigma_roll * self.q_factor_vol)).map(|v| v.max(NOISE_FLOOR)),
        );
        let r_dyn = Matrix2::from_diagonal(
            &(self.r_base * (1.0 + spread * self.r_factor_spread)).map(|v| v.max(NOISE_FLOOR)),
        );
        self.last_q00 = q_dyn[(0, 0)];
        self.last_r00 = r_dyn[(0, 0)];

        let f = transition_matrix();
        let h = observation_matrix();

        let x_pred = f * self.x;
        let p_pred = f * self.p * f.transpose() + q_dyn;

        let z = Vector2::new(wmp, vol_diff);
        let innovation = z - h * x_pred;
        let s = h * p_pred * h.transpose() + r_dyn;

        // NaN never factors cleanly; bail out before it can reach the state.
        if !(s.iter().all(|v| v.is_finite()) && innovation.iter().all(|v| v.is_finite())) {
            warn!(spread, sigma_roll, "non-finite innovation, keeping prior state");
            return self.x[0];
        }
        let chol = match Cholesky::new(s) {
            Some(chol) => chol,
            None => {
                warn!(spread, sigma_roll, "singular innovation covariance, keeping prior state");
                return self.x[0];
            }
        };

        // K = P H' S^-1, computed as the transpose of S^-1 (H P) so the
        // factorization is solved instead of inverted.
        let gain = chol.solve(&(h * p_pred)).transpose();

        self.x = x_pred + gain * innovation;
        let p_next = (Matrix4::identity() - gain * h) * p_pred;
        // The Joseph-free update drifts asymmetric in floating point.
        self.p = 0.5 * (p_next + p_next.transpose());

        self.x[0]
    }

    #[inline]
    pub fn fair_price(&self) -> f64 {
        self.x[0]
    }

    #[inline]
    pub fn covariance(&self) -> &Matrix4<f64> {
        &self.p
    }

    /// Price entry of the last dynamic process-noise diagonal.
    #[inline]
    pub fn last_q00(&self) -> f64 {
        self.last_q00
    }

    /// Price entry of the last dynamic measurement-noise diagonal.
    #[inline]
    pub fn last_r00(&self) -> f64 {
        self.last_r00
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn estimator() -> KalmanEstimator {
        let mut est = KalmanEstimator::seeded(0.40, 0.0, 1.0, 1.0);
        est.set_base_noise([0.01, 0.01, 0.1, 0.1], [0.1, 1.0]);
        est
    }

    /// Scenario: constant observation (0.50, 0) fed for 200 ticks from a
    /// 0.40 seed.
    /// Expected: the fair price converges onto the observation.
    #[test]
    fn converges_to_constant_observation() {
        let mut est = estimator();
        let mut fair = 0.0;
        for _ in 0..200 {
            fair = est.step(0.50, 0.0, 0.02, 0.01);
        }
        assert!((fair - 0.50).abs() < 1e-3, "fair = {fair}");
    }

    /// Scenario: 100 alternating observations.
    /// Expected: P stays symmetric with non-negative diagonal throughout.
    #[test]
    fn covariance_stays_symmetric_psd_diagonal() {
        let mut est = estimator();
        for i in 0..100 {
            let wmp = if i % 2 == 0 { 0.48 } else { 0.52 };
            est.step(wmp, (i % 5) as f64 - 2.0, 0.04, 0.02);
            let p = est.covariance();
            for r in 0..4 {
                assert!(p[(r, r)] >= -1e-12, "negative diagonal at {r}: {}", p[(r, r)]);
                for c in 0..4 {
                    assert!(
                        (p[(r, c)] - p[(c, r)]).abs() < 1e-9,
                        "asymmetry at ({r},{c})"
                    );
                }
            }
        }
    }

    /// Scenario: a NaN spread poisons the dynamic R, so the innovation
    /// covariance has no Cholesky factor.
    /// Expected: the step returns the prior price and the state is unchanged.
    #[test]
    fn singular_innovation_keeps_prior() {
        let mut est = estimator();
        est.step(0.50, 0.0, 0.02, 0.01);
        let before = est.fair_price();
        let out = est.step(0.60, 0.0, f64::NAN, 0.01);
        assert_eq!(out, before);
        assert_eq!(est.fair_price(), before);
    }

    /// Scenario: warm-up advances with pinned observations.
    /// Expected: price and vol_diff track the pins, velocities stay zero.
    #[test]
    fn warmup_advance_pins_observed_components() {
        let mut est = KalmanEstimator::seeded(0.40, 1.0, 1.0, 1.0);
        est.warmup_advance(0.42, 2.0);
        est.warmup_advance(0.44, 3.0);
        assert_eq!(est.fair_price(), 0.44);
        assert_eq!(est.x[1], 0.0);
        assert_eq!(est.x[2], 3.0);
        assert_eq!(est.x[3], 0.0);
    }

    /// Scenario: wide spread versus tight spread with r_factor_spread = 1.
    /// Expected: the dynamic R price entry scales with the spread.
    #[test]
    fn dynamic_noise_scales_with_inputs() {
        let mut est = estimator();
        est.step(0.50, 0.0, 0.10, 0.0);
        let wide = est.last_r00();
        est.step(0.51, 0.0, 0.01, 0.0);
        let tight = est.last_r00();
        assert!(wide > tight, "wide = {wide}, tight = {tight}");
        assert!((wide - 0.1 * 1.10).abs() < 1e-12);

        est.step(0.52, 0.0, 0.01, 0.5);
        assert!((est.last_q00() - 0.01 * 1.5).abs() < 1e-12);
    }
}
