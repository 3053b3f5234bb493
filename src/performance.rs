//! Portfolio-level return series and annualized performance figures.

use crate::config::{MIN_VOLATILITY, TRADING_DAYS};
use crate::error::{AnalysisError, AnalysisResult};
use crate::returns::{self, AlignedReturns, ReturnSeries, ReturnSet};
use crate::stats;
use serde::Serialize;

#[derive(Clone, Debug, Serialize)]
pub struct PerformanceMetrics {
    pub annual_return: f64,
    pub annual_volatility: f64,
    /// Annual return over annual volatility, no risk-free adjustment.
    pub sharpe_ratio: f64,
    pub cumulative_returns: Vec<f64>,
    /// The weighted daily portfolio returns the figures were computed from.
    pub daily_returns: ReturnSeries,
}

/// Weighted sum of the aligned ticker returns on each common date.
pub fn portfolio_daily_returns(aligned: &AlignedReturns) -> ReturnSeries {
    aligned
        .dates
        .iter()
        .enumerate()
        .map(|(t, date)| {
            let r: f64 = aligned
                .columns
                .iter()
                .zip(&aligned.weights)
                .map(|(col, w)| w * col[t])
                .sum();
            (*date, r)
        })
        .collect()
}

pub fn calculate_portfolio_performance(set: &ReturnSet) -> AnalysisResult<PerformanceMetrics> {
    let aligned = returns::align(set)?;
    let daily = portfolio_daily_returns(&aligned);
    performance_from_daily(daily)
}

pub fn performance_from_daily(daily: ReturnSeries) -> AnalysisResult<PerformanceMetrics> {
    let values: Vec<f64> = daily.iter().map(|(_, r)| *r).collect();

    let mean = stats::mean(&values).ok_or_else(|| AnalysisError::empty("portfolio daily returns"))?;
    let std = stats::sample_std(&values).ok_or_else(|| {
        AnalysisError::degenerate("annual volatility", "fewer than two aligned observations")
    })?;

    let annual_return = mean * TRADING_DAYS;
    let annual_volatility = std * TRADING_DAYS.sqrt();
    if annual_volatility < MIN_VOLATILITY {
        return Err(AnalysisError::degenerate(
            "sharpe ratio",
            "portfolio volatility is zero",
        ));
    }

    Ok(PerformanceMetrics {
        annual_return,
        annual_volatility,
        sharpe_ratio: annual_return / annual_volatility,
        cumulative_returns: stats::cumulative_returns(&values),
        daily_returns: daily,
    })
}
