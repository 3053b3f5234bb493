//! Single-fund analyses: headline performance, risk against a benchmark,
//! factor exposure, side-by-side comparison and macro correlation.
//!
//! These work on close prices, like the dashboard figures they reproduce;
//! the portfolio engine uses adjusted closes.

use crate::config::{AnalysisConfig, MIN_VOLATILITY, TRADING_DAYS};
use crate::data::{Candle, MarketData};
use crate::error::{AnalysisError, AnalysisResult};
use crate::returns::{self, FetchWarning, ReturnSeries};
use crate::risk;
use crate::stats;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use std::time::Duration;
use tracing::{info, warn};

/// `(label, proxy ticker)` pairs regressed against in factor analysis.
pub const FACTOR_PROXIES: [(&str, &str); 11] = [
    ("Market", "^GSPC"),
    ("Size", "IWM"),
    ("Value", "IWD"),
    ("Growth", "IWF"),
    ("Momentum", "MTUM"),
    ("Quality", "QUAL"),
    ("Low Volatility", "USMV"),
    ("Dividend", "DVY"),
    ("High Yield", "HYG"),
    ("International", "EFA"),
    ("Emerging Markets", "EEM"),
];

pub const MACRO_INDICATORS: [(&str, &str); 13] = [
    ("S&P 500", "^GSPC"),
    ("10Y Treasury Yield", "^TNX"),
    ("VIX", "^VIX"),
    ("Gold", "GC=F"),
    ("Oil", "CL=F"),
    ("USD Index", "DX-Y.NYB"),
    ("Inflation Expectation (5Y)", "^FVX"),
    ("High Yield Bonds", "HYG"),
    ("Emerging Markets", "EEM"),
    ("Real Estate", "VNQ"),
    ("Investment Grade Bonds", "LQD"),
    ("Developed Markets", "EFA"),
    ("Commodities", "DBC"),
];

pub const DEFAULT_COMPARISON: [&str; 3] = ["SPY", "IVV", "VOO"];

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// Headline figures, in percent.
#[derive(Clone, Debug, Serialize)]
pub struct EtfSummary {
    pub ticker: String,
    pub annual_return_pct: f64,
    pub annual_volatility_pct: f64,
    /// `(return% - rf%) / vol%`.
    pub sharpe_ratio: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct BenchmarkRisk {
    pub beta: f64,
    /// Annualized, on excess returns over the daily risk-free rate.
    pub alpha: f64,
    pub sharpe_ratio: f64,
    pub max_drawdown: f64,
    pub annual_volatility: f64,
    /// `std(r_etf - r_benchmark) * √252`.
    pub tracking_error: f64,
    pub observations: usize,
}

#[derive(Clone, Debug, Serialize)]
pub struct FactorLoading {
    pub factor: String,
    pub proxy: String,
    pub exposure: f64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FactorExposure {
    pub ticker: String,
    pub intercept: f64,
    pub loadings: Vec<FactorLoading>,
    pub observations: usize,
    pub warnings: Vec<FetchWarning>,
}

#[derive(Clone, Debug, Serialize)]
pub struct EtfComparison {
    pub ticker: String,
    pub annual_return: f64,
    /// No risk-free adjustment. `None` for a flat price series.
    pub sharpe_ratio: Option<f64>,
    pub max_drawdown: f64,
    pub expense_ratio: Option<f64>,
    pub total_assets: Option<f64>,
    #[serde(rename = "yield")]
    pub yield_: Option<f64>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ComparisonReport {
    pub rows: Vec<EtfComparison>,
    pub warnings: Vec<FetchWarning>,
}

/// Pearson correlation matrix. Row/column 0 is the fund itself; an entry is
/// `None` when one of the two series is flat over the aligned window.
#[derive(Clone, Debug, Serialize)]
pub struct MacroCorrelation {
    pub labels: Vec<String>,
    pub matrix: Vec<Vec<Option<f64>>>,
    pub observations: usize,
    pub warnings: Vec<FetchWarning>,
}

impl MacroCorrelation {
    /// Correlation of the fund with each indicator, in label order.
    pub fn fund_row(&self) -> Vec<(&str, Option<f64>)> {
        self.labels
            .iter()
            .zip(self.matrix.first().into_iter().flatten())
            .skip(1)
            .map(|(label, c)| (label.as_str(), *c))
            .collect()
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Helpers
// ──────────────────────────────────────────────────────────────────────────────

pub fn close_returns(history: &[Candle]) -> ReturnSeries {
    let prices: Vec<(NaiveDate, f64)> = history.iter().map(|c| (c.date, c.close)).collect();
    stats::simple_returns(&prices)
}

async fn fetch_close_returns<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> AnalysisResult<ReturnSeries> {
    let history = returns::fetch_history(source, ticker, start, end, timeout).await?;
    let series = close_returns(&history);
    if series.is_empty() {
        return Err(AnalysisError::fetch(ticker, "not enough prices for a return"));
    }
    Ok(series)
}

/// Fetches every `(label, ticker)` concurrently. Failures become warnings;
/// survivors keep their input order.
async fn fetch_labelled<M: MarketData + Sync>(
    source: &M,
    entries: &[(&str, &str)],
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> (Vec<(String, String, ReturnSeries)>, Vec<FetchWarning>) {
    let fetches = entries.iter().map(|(label, ticker)| async move {
        let result = fetch_close_returns(source, ticker, start, end, timeout).await;
        (*label, *ticker, result)
    });

    let mut ok = Vec::new();
    let mut warnings = Vec::new();
    for (label, ticker, result) in join_all(fetches).await {
        match result {
            Ok(series) => ok.push((label.to_string(), ticker.to_string(), series)),
            Err(e) => {
                warn!("{} ({}) unavailable: {}", label, ticker, e);
                warnings.push(FetchWarning {
                    ticker: ticker.to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    (ok, warnings)
}

fn values(series: &ReturnSeries) -> Vec<f64> {
    series.iter().map(|(_, r)| *r).collect()
}

// ──────────────────────────────────────────────────────────────────────────────
// Analyses
// ──────────────────────────────────────────────────────────────────────────────

pub fn analyze_etf(ticker: &str, history: &[Candle], risk_free_annual: f64) -> AnalysisResult<EtfSummary> {
    let prices: Vec<(NaiveDate, f64)> = history.iter().map(|c| (c.date, c.adj_close)).collect();
    let daily = values(&stats::simple_returns(&prices));

    let mean = stats::mean(&daily).ok_or_else(|| AnalysisError::empty(format!("{} returns", ticker)))?;
    let std = stats::sample_std(&daily)
        .ok_or_else(|| AnalysisError::degenerate("annual volatility", "fewer than two returns"))?;
    let annual_return_pct = mean * TRADING_DAYS * 100.0;
    let annual_volatility_pct = std * TRADING_DAYS.sqrt() * 100.0;
    if annual_volatility_pct < MIN_VOLATILITY {
        return Err(AnalysisError::degenerate("sharpe ratio", "price series is flat"));
    }

    Ok(EtfSummary {
        ticker: ticker.to_string(),
        annual_return_pct,
        annual_volatility_pct,
        sharpe_ratio: (annual_return_pct - risk_free_annual * 100.0) / annual_volatility_pct,
    })
}

/// Beta, tracking error and alpha use the dates both series traded on;
/// drawdown, volatility and Sharpe describe the fund's whole history.
pub fn analyze_risk_and_benchmark(
    etf: &[Candle],
    benchmark: &[Candle],
    risk_free_annual: f64,
) -> AnalysisResult<BenchmarkRisk> {
    let etf_returns = close_returns(etf);
    let bench_returns = close_returns(benchmark);
    let (dates, columns) = returns::align_series(&[&etf_returns, &bench_returns]);
    if dates.len() < 2 {
        return Err(AnalysisError::empty("fund/benchmark overlap"));
    }
    let (e, b) = (&columns[0], &columns[1]);

    let beta = risk::beta(e, b)?;
    let rf = risk_free_annual / TRADING_DAYS;
    let mean_e = stats::mean(e).unwrap_or(0.0);
    let mean_b = stats::mean(b).unwrap_or(0.0);
    let alpha = ((mean_e - rf) - beta * (mean_b - rf)) * TRADING_DAYS;

    let diff: Vec<f64> = e.iter().zip(b).map(|(x, y)| x - y).collect();
    let tracking_error = stats::sample_std(&diff).unwrap_or(0.0) * TRADING_DAYS.sqrt();

    let own = values(&etf_returns);
    let std = stats::sample_std(&own)
        .ok_or_else(|| AnalysisError::degenerate("sharpe ratio", "fewer than two returns"))?;
    if std * TRADING_DAYS.sqrt() < MIN_VOLATILITY {
        return Err(AnalysisError::degenerate("sharpe ratio", "fund price series is flat"));
    }
    let mean_own = stats::mean(&own).unwrap_or(0.0);

    Ok(BenchmarkRisk {
        beta,
        alpha,
        sharpe_ratio: (mean_own - rf) / std * TRADING_DAYS.sqrt(),
        max_drawdown: stats::max_drawdown(&own),
        annual_volatility: std * TRADING_DAYS.sqrt(),
        tracking_error,
        observations: dates.len(),
    })
}

/// Regresses the fund's daily returns on the factor proxies' returns
/// (OLS with intercept) over their common dates.
pub async fn analyze_factor_exposure<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    cfg: &AnalysisConfig,
) -> AnalysisResult<FactorExposure> {
    let (fund, (factors, warnings)) = tokio::join!(
        fetch_close_returns(source, ticker, start, end, cfg.fetch_timeout),
        fetch_labelled(source, &FACTOR_PROXIES, start, end, cfg.fetch_timeout),
    );
    let fund = fund?;
    if factors.is_empty() {
        return Err(AnalysisError::empty("factor proxy returns"));
    }

    let mut series: Vec<&ReturnSeries> = vec![&fund];
    series.extend(factors.iter().map(|(_, _, s)| s));
    let (dates, mut columns) = returns::align_series(&series);
    if dates.is_empty() {
        return Err(AnalysisError::empty("fund/factor overlap"));
    }
    let y = columns.remove(0);

    let (intercept, slopes) = stats::ols(&y, &columns).ok_or_else(|| {
        AnalysisError::degenerate(
            "factor exposure",
            format!("{} aligned rows for {} factors", dates.len(), columns.len()),
        )
    })?;

    info!("{}: regressed on {} factors over {} days", ticker, factors.len(), dates.len());

    Ok(FactorExposure {
        ticker: ticker.to_string(),
        intercept,
        loadings: factors
            .into_iter()
            .zip(slopes)
            .map(|((factor, proxy, _), exposure)| FactorLoading { factor, proxy, exposure })
            .collect(),
        observations: dates.len(),
        warnings,
    })
}

async fn compare_one<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> AnalysisResult<EtfComparison> {
    let series = fetch_close_returns(source, ticker, start, end, timeout).await?;
    let daily = values(&series);
    let mean = stats::mean(&daily).unwrap_or(0.0);
    let annual_return = mean * TRADING_DAYS;
    let annual_volatility = stats::sample_std(&daily).unwrap_or(0.0) * TRADING_DAYS.sqrt();

    let info = match tokio::time::timeout(timeout, source.fetch_info(ticker)).await {
        Ok(Ok(info)) => Some(info),
        Ok(Err(e)) => {
            warn!("No fund metadata for {}: {}", ticker, e);
            None
        }
        Err(_) => {
            warn!("Timed out fetching metadata for {}", ticker);
            None
        }
    }
    .unwrap_or_default();

    Ok(EtfComparison {
        ticker: ticker.to_string(),
        annual_return,
        sharpe_ratio: (annual_volatility >= MIN_VOLATILITY).then(|| annual_return / annual_volatility),
        max_drawdown: stats::max_drawdown(&daily),
        expense_ratio: info.expense_ratio,
        total_assets: info.total_assets,
        yield_: info.yield_,
    })
}

pub async fn compare_etfs<M: MarketData + Sync>(
    source: &M,
    tickers: &[String],
    start: NaiveDate,
    end: NaiveDate,
    cfg: &AnalysisConfig,
) -> AnalysisResult<ComparisonReport> {
    let tickers: Vec<String> = tickers
        .iter()
        .map(|t| t.trim().to_uppercase())
        .filter(|t| !t.is_empty())
        .collect();
    if tickers.is_empty() {
        return Err(AnalysisError::empty("comparison (no tickers selected)"));
    }

    let rows = join_all(
        tickers
            .iter()
            .map(|t| compare_one(source, t, start, end, cfg.fetch_timeout)),
    )
    .await;

    let mut report = ComparisonReport {
        rows: Vec::new(),
        warnings: Vec::new(),
    };
    for (ticker, row) in tickers.into_iter().zip(rows) {
        match row {
            Ok(row) => report.rows.push(row),
            Err(e) => {
                warn!("Skipping {} in comparison: {}", ticker, e);
                report.warnings.push(FetchWarning {
                    ticker,
                    reason: e.to_string(),
                });
            }
        }
    }
    if report.rows.is_empty() {
        return Err(AnalysisError::empty("comparison (every ticker failed)"));
    }
    Ok(report)
}

pub async fn analyze_macro_correlation<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    cfg: &AnalysisConfig,
) -> AnalysisResult<MacroCorrelation> {
    let (fund, (indicators, warnings)) = tokio::join!(
        fetch_close_returns(source, ticker, start, end, cfg.fetch_timeout),
        fetch_labelled(source, &MACRO_INDICATORS, start, end, cfg.fetch_timeout),
    );
    let fund = fund?;
    if indicators.is_empty() {
        return Err(AnalysisError::empty("macro indicator returns"));
    }

    let mut labels = vec![ticker.to_string()];
    let mut series: Vec<&ReturnSeries> = vec![&fund];
    for (label, _, s) in &indicators {
        labels.push(label.clone());
        series.push(s);
    }

    let (dates, columns) = returns::align_series(&series);
    if dates.len() < 2 {
        return Err(AnalysisError::empty("fund/indicator overlap"));
    }

    let matrix = columns
        .iter()
        .map(|a| {
            columns
                .iter()
                .map(|b| stats::pearson_correlation(a, b))
                .collect()
        })
        .collect();

    Ok(MacroCorrelation {
        labels,
        matrix,
        observations: dates.len(),
        warnings,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Report
// ──────────────────────────────────────────────────────────────────────────────

pub fn print_summary(summary: &EtfSummary, risk: Option<&BenchmarkRisk>, benchmark: &str) {
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║  {:<10} Overview                                       ║", summary.ticker);
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Annual Return          : {:>+7.2}%                        ║", summary.annual_return_pct);
    println!("║  Annual Volatility      : {:>7.2}%                        ║", summary.annual_volatility_pct);
    println!("║  Sharpe Ratio           : {:>7.2}                         ║", summary.sharpe_ratio);
    if let Some(r) = risk {
        println!("╠════════════════════════════════════════════════════════════╣");
        println!("║  vs {:<10}                                             ║", benchmark);
        println!("║  Beta                   : {:>7.2}                         ║", r.beta);
        println!("║  Alpha (annual)         : {:>+7.2}%                        ║", r.alpha * 100.0);
        println!("║  Sharpe (rf-adjusted)   : {:>7.2}                         ║", r.sharpe_ratio);
        println!("║  Max Drawdown           : {:>7.2}%                        ║", r.max_drawdown * 100.0);
        println!("║  Tracking Error         : {:>7.2}%                        ║", r.tracking_error * 100.0);
    }
    println!("╚════════════════════════════════════════════════════════════╝");
}

pub fn print_factors(exposure: &FactorExposure) {
    println!("\nFactor exposure of {} ({} days)", exposure.ticker, exposure.observations);
    for l in &exposure.loadings {
        println!("  {:<18} {:<6} {:>+7.3}", l.factor, l.proxy, l.exposure);
    }
    println!("  {:<18} {:<6} {:>+9.5}", "Intercept", "", exposure.intercept);
}

pub fn print_comparison(report: &ComparisonReport) {
    let fmt = |v: Option<f64>, scale: f64| v.map_or("n/a".to_string(), |x| format!("{:.2}", x * scale));
    println!("\n  ETF      Return%  Sharpe  MaxDD%  Expense%        AUM  Yield%");
    for r in &report.rows {
        println!(
            "  {:<7} {:>8.2} {:>7} {:>7.2} {:>9} {:>10} {:>7}",
            r.ticker,
            r.annual_return * 100.0,
            fmt(r.sharpe_ratio, 1.0),
            r.max_drawdown * 100.0,
            fmt(r.expense_ratio, 100.0),
            r.total_assets.map_or("n/a".to_string(), |a| format!("{:.2}B", a / 1e9)),
            fmt(r.yield_, 100.0),
        );
    }
}

pub fn print_macro(correlation: &MacroCorrelation) {
    println!(
        "\nCorrelation of {} with macro indicators ({} days)",
        correlation.labels.first().map(String::as_str).unwrap_or("?"),
        correlation.observations
    );
    for (label, c) in correlation.fund_row() {
        match c {
            Some(c) => println!("  {:<28} {:>+6.2}", label, c),
            None => println!("  {:<28}    n/a", label),
        }
    }
}
