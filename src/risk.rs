//! Benchmark-relative and tail risk of a portfolio return series.

use crate::config::TRADING_DAYS;
use crate::data::MarketData;
use crate::error::{AnalysisError, AnalysisResult};
use crate::returns::{self, ReturnSeries};
use crate::stats;
use chrono::NaiveDate;
use serde::Serialize;
use std::time::Duration;

#[derive(Clone, Debug, Serialize)]
pub struct RiskMetrics {
    pub beta: f64,
    /// Annualized Jensen's alpha against the benchmark.
    pub alpha: f64,
    pub max_drawdown: f64,
    /// 5th percentile of daily portfolio returns (historical VaR).
    pub value_at_risk_95: f64,
    pub observations: usize,
}

/// Computes risk metrics of `portfolio` against `benchmark` on their common
/// dates. `risk_free_annual` is converted to a daily rate with `/ 252`.
pub fn analyze_risk(
    portfolio: &ReturnSeries,
    benchmark: &ReturnSeries,
    risk_free_annual: f64,
) -> AnalysisResult<RiskMetrics> {
    let (dates, columns) = returns::align_series(&[portfolio, benchmark]);
    if dates.is_empty() {
        return Err(AnalysisError::empty("portfolio/benchmark overlap"));
    }
    let (p, b) = (&columns[0], &columns[1]);

    let beta = beta(p, b)?;
    let rf = risk_free_annual / TRADING_DAYS;
    let mean_p = stats::mean(p).unwrap_or(0.0);
    let mean_b = stats::mean(b).unwrap_or(0.0);
    let alpha = (mean_p - rf - beta * (mean_b - rf)) * TRADING_DAYS;

    // Drawdown and VaR describe the portfolio alone, over its full history.
    let own: Vec<f64> = portfolio.iter().map(|(_, r)| *r).collect();
    let value_at_risk_95 = stats::percentile(&own, 5.0)
        .ok_or_else(|| AnalysisError::empty("portfolio daily returns"))?;

    Ok(RiskMetrics {
        beta,
        alpha,
        max_drawdown: stats::max_drawdown(&own),
        value_at_risk_95,
        observations: dates.len(),
    })
}

/// `cov(p, b) / var(b)`. A flat benchmark leaves beta undefined.
pub fn beta(portfolio: &[f64], benchmark: &[f64]) -> AnalysisResult<f64> {
    let var_b = stats::sample_variance(benchmark).ok_or_else(|| {
        AnalysisError::degenerate("beta", "fewer than two overlapping observations")
    })?;
    if var_b == 0.0 {
        return Err(AnalysisError::degenerate("beta", "benchmark variance is zero"));
    }
    let cov = stats::sample_covariance(portfolio, benchmark)
        .ok_or_else(|| AnalysisError::degenerate("beta", "series lengths differ"))?;
    Ok(cov / var_b)
}

/// Fetches the benchmark's daily returns. Unlike portfolio tickers a missing
/// benchmark is an error: nothing downstream can run without it.
pub async fn fetch_benchmark_returns<M: MarketData + Sync>(
    source: &M,
    benchmark: &str,
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> AnalysisResult<ReturnSeries> {
    returns::fetch_returns(source, benchmark, start, end, timeout).await
}
