use nalgebra::{Matrix2, Vector2};

use crate::types::BookLevel;

/// Levels closer to the top of book than this are spread noise, not depth.
const MIN_DELTA: f64 = 0.005;
/// Residual-evaluation budget for the decay fit.
const MAX_EVALS: usize = 2000;
/// Decay rates below this are indistinguishable from a flat book.
const MIN_KAPPA: f64 = 1e-4;

/// Estimate the book's liquidity density kappa from the current depth.
///
/// Each level contributes a point (delta, size) where delta is the distance
/// from the same-side best price. Points with `delta > 0.005` and positive
/// size are fit to `v = A * exp(-k * delta)`; the decay rate is kappa.
/// Returns NaN when there are fewer than 2 usable points, the fit fails,
/// or the fitted rate is below 1e-4.
pub fn estimate_kappa(
    bids: &[BookLevel],
    asks: &[BookLevel],
    best_bid: f64,
    best_ask: f64,
) -> f64 {
    if bids.is_empty() || asks.is_empty() {
        return f64::NAN;
    }

    let mut deltas = Vec::with_capacity(bids.len() + asks.len());
    let mut sizes = Vec::with_capacity(bids.len() + asks.len());
    for level in bids {
        push_point(&mut deltas, &mut sizes, best_bid - level.price, level.size);
    }
    for level in asks {
        push_point(&mut deltas, &mut sizes, level.price - best_ask, level.size);
    }
    if deltas.len() < 2 {
        return f64::NAN;
    }

    match fit_exp_decay(&deltas, &sizes) {
        Some((_, k)) if k >= MIN_KAPPA => k,
        _ => f64::NAN,
    }
}

#[inline]
fn push_point(deltas: &mut Vec<f64>, sizes: &mut Vec<f64>, delta: f64, size: f64) {
    if delta > MIN_DELTA && size > 0.0 {
        deltas.push(delta);
        sizes.push(size);
    }
}

/// Nonlinear least-squares fit of `v = A * exp(-k * delta)` by damped
/// Gauss-Newton (Levenberg-Marquardt) iteration. Parameters are projected
/// to stay non-negative. Initial guess: A = first observed size, k = 1.
/// None when the iteration diverges or exhausts its evaluation budget
/// without improving.
pub fn fit_exp_decay(deltas: &[f64], sizes: &[f64]) -> Option<(f64, f64)> {
    debug_assert_eq!(deltas.len(), sizes.len());
    if deltas.len() < 2 {
        return None;
    }

    let mut a = sizes[0];
    let mut k = 1.0;
    let mut lambda = 1e-3;
    let mut evals = 0usize;

    let mut sse = sum_squares(deltas, sizes, a, k);
    evals += 1;

    while evals < MAX_EVALS {
        // Normal equations J'J step = -J'r at the current parameters.
        let mut jtj = Matrix2::<f64>::zeros();
        let mut jtr = Vector2::<f64>::zeros();
        for (&d, &v) in deltas.iter().zip(sizes) {
            let e = (-k * d).exp();
            let r = a * e - v;
            let ja = e;
            let jk = -a * d * e;
            jtj[(0, 0)] += ja * ja;
            jtj[(0, 1)] += ja * jk;
            jtj[(1, 0)] += ja * jk;
            jtj[(1, 1)] += jk * jk;
            jtr[0] += ja * r;
            jtr[1] += jk * r;
        }

        let mut damped = jtj;
        damped[(0, 0)] *= 1.0 + lambda;
        damped[(1, 1)] *= 1.0 + lambda;
        damped[(0, 0)] += 1e-12;
        damped[(1, 1)] += 1e-12;

        let step = match damped.lu().solve(&jtr) {
            Some(s) => s,
            None => {
                lambda *= 10.0;
                if lambda > 1e12 {
                    return None;
                }
                continue;
            }
        };

        let a_new: f64 = (a - step[0]).max(0.0);
        let k_new: f64 = (k - step[1]).max(0.0);
        let sse_new = sum_squares(deltas, sizes, a_new, k_new);
        evals += 1;

        if sse_new.is_finite() && sse_new < sse {
            let improvement = sse - sse_new;
            a = a_new;
            k = k_new;
            sse = sse_new;
            lambda = (lambda * 0.1).max(1e-12);
            if improvement <= 1e-12 * (1.0 + sse) {
                break;
            }
        } else {
            lambda *= 10.0;
            if lambda > 1e12 {
                break;
            }
        }
    }

    if a.is_finite() && k.is_finite() {
        Some((a, k))
    } else {
        None
    }
}

#[inline]
fn sum_squares(deltas: &[f64], sizes: &[f64], a: f64, k: f64) -> f64 {
    deltas
        .iter()
        .zip(sizes)
        .map(|(&d, &v)| {
            let r = a * (-k * d).exp() - v;
            r * r
        })
        .sum()
}
