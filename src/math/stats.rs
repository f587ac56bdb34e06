/// Population standard deviation of first differences.
/// Fewer than two points have no differences — returns 0.
pub fn std_of_diffs(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let n = (xs.len() - 1) as f64;
    let mean = xs.windows(2).map(|w| w[1] - w[0]).sum::<f64>() / n;
    let var = xs
        .windows(2)
        .map(|w| {
            let d = w[1] - w[0] - mean;
            d * d
        })
        .sum::<f64>()
        / n;
    var.sqrt()
}

/// Rolling volatility over the last `window` fair prices: std of first
/// differences, with `sigma_base` substituted when the window is flat.
#[inline]
pub fn rolling_sigma(fair_prices: &[f64], window: usize, sigma_base: f64) -> f64 {
    let n = fair_prices.len().min(window);
    let sigma = std_of_diffs(&fair_prices[fair_prices.len() - n..]);
    if sigma == 0.0 {
        sigma_base
    } else {
        sigma
    }
}

/// Mean ignoring NaN entries. NaN when nothing finite remains.
pub fn nan_mean(xs: &[f64]) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for &x in xs {
        if !x.is_nan() {
            sum += x;
            count += 1;
        }
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}
