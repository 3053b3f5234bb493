//! Numeric kernels shared by the calculators.
//!
//! Everything here is pure and works on plain slices. Sample statistics use
//! the `n - 1` denominator; functions return `None` when the statistic is
//! not defined for the input length.

use chrono::NaiveDate;
use nalgebra::{DMatrix, DVector};

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

pub fn sample_covariance(a: &[f64], b: &[f64]) -> Option<f64> {
    if a.len() != b.len() || a.len() < 2 {
        return None;
    }
    let ma = mean(a)?;
    let mb = mean(b)?;
    let sum: f64 = a.iter().zip(b).map(|(x, y)| (x - ma) * (y - mb)).sum();
    Some(sum / (a.len() as f64 - 1.0))
}

pub fn sample_variance(values: &[f64]) -> Option<f64> {
    sample_covariance(values, values)
}

pub fn sample_std(values: &[f64]) -> Option<f64> {
    sample_variance(values).map(|v| v.max(0.0).sqrt())
}

pub fn pearson_correlation(a: &[f64], b: &[f64]) -> Option<f64> {
    let cov = sample_covariance(a, b)?;
    let sa = sample_std(a)?;
    let sb = sample_std(b)?;
    if sa == 0.0 || sb == 0.0 {
        return None;
    }
    Some((cov / (sa * sb)).clamp(-1.0, 1.0))
}

/// Percentile with linear interpolation between order statistics
/// (`pct` in 0..=100, same convention as numpy's default).
pub fn percentile(values: &[f64], pct: f64) -> Option<f64> {
    if values.is_empty() || !(0.0..=100.0).contains(&pct) {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));

    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f64;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * frac)
}

/// Running product of `1 + r`.
pub fn cumulative_returns(returns: &[f64]) -> Vec<f64> {
    returns
        .iter()
        .scan(1.0, |acc, r| {
            *acc *= 1.0 + r;
            Some(*acc)
        })
        .collect()
}

/// Drawdown of each point of the cumulative curve from its running peak.
pub fn drawdowns(returns: &[f64]) -> Vec<f64> {
    let mut peak = f64::NEG_INFINITY;
    cumulative_returns(returns)
        .into_iter()
        .map(|c| {
            peak = peak.max(c);
            if peak > 0.0 { (c - peak) / peak } else { 0.0 }
        })
        .collect()
}

/// Most negative drawdown; 0 for a non-decreasing curve or an empty series.
pub fn max_drawdown(returns: &[f64]) -> f64 {
    drawdowns(returns).into_iter().fold(0.0, f64::min)
}

/// Simple returns `(p[t] - p[t-1]) / p[t-1]`, keyed by the later date.
/// The first observation has no return; non-finite results are dropped.
pub fn simple_returns(prices: &[(NaiveDate, f64)]) -> Vec<(NaiveDate, f64)> {
    prices
        .windows(2)
        .filter_map(|w| {
            let (_, prev) = w[0];
            let (date, price) = w[1];
            let r = (price - prev) / prev;
            r.is_finite().then_some((date, r))
        })
        .collect()
}

/// Sample covariance matrix of equally long columns.
pub fn covariance_matrix(columns: &[Vec<f64>]) -> Vec<Vec<f64>> {
    let n = columns.len();
    let mut cov = vec![vec![0.0; n]; n];
    for i in 0..n {
        for j in i..n {
            let c = sample_covariance(&columns[i], &columns[j]).unwrap_or(0.0);
            cov[i][j] = c;
            cov[j][i] = c;
        }
    }
    cov
}

/// Ordinary least squares of `y` on the given regressor columns plus an
/// intercept. Returns `(intercept, slopes)`.
///
/// Solved through SVD so collinear factors give the minimum-norm solution
/// instead of failing.
pub fn ols(y: &[f64], regressors: &[Vec<f64>]) -> Option<(f64, Vec<f64>)> {
    let rows = y.len();
    let k = regressors.len();
    if rows <= k || regressors.iter().any(|c| c.len() != rows) {
        return None;
    }

    let x = DMatrix::from_fn(rows, k + 1, |r, c| if c == 0 { 1.0 } else { regressors[c - 1][r] });
    let target = DVector::from_column_slice(y);
    let beta = x.svd(true, true).solve(&target, 1e-12).ok()?;

    if beta.iter().any(|b| !b.is_finite()) {
        return None;
    }
    Some((beta[0], beta.iter().skip(1).copied().collect()))
}
