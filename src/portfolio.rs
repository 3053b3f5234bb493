use crate::allocation::{self, AllocationBreakdown};
use crate::config::AnalysisConfig;
use crate::data::MarketData;
use crate::error::{AnalysisError, AnalysisResult};
use crate::optimizer::{self, FrontierSample, OptimalPortfolio, OptimizerConfig, ReturnStatistics};
use crate::performance::{self, PerformanceMetrics};
use crate::returns::{self, AlignedReturns, FetchWarning};
use crate::risk::{self, RiskMetrics};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::Path;
use tracing::{info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

/// One holding. Share positions carry `shares` and `price`; weight positions
/// carry the weight the user entered in `input_weight`. `weight` is always
/// the normalized share of the whole portfolio.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticker: String,
    pub shares: Option<u64>,
    pub price: Option<f64>,
    pub input_weight: Option<f64>,
    pub weight: f64,
}

impl Position {
    /// Market value (`shares * price`) of a share position.
    pub fn value(&self) -> Option<f64> {
        Some(self.shares? as f64 * self.price?)
    }

    fn raw_weight(&self) -> f64 {
        self.value().or(self.input_weight).unwrap_or(0.0)
    }
}

/// Ordered list of positions whose weights sum to 1 whenever it is
/// non-empty. Every mutation validates first and renormalizes before
/// returning, so a failed edit leaves the portfolio untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Portfolio {
    positions: Vec<Position>,
}

fn normalize_ticker(ticker: &str) -> AnalysisResult<String> {
    let ticker = ticker.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(AnalysisError::invalid_position("<blank>", "ticker is empty"));
    }
    Ok(ticker)
}

fn check_weight(ticker: &str, weight: f64) -> AnalysisResult<()> {
    if !weight.is_finite() || weight <= 0.0 {
        return Err(AnalysisError::invalid_position(
            ticker,
            format!("weight must be positive, got {}", weight),
        ));
    }
    Ok(())
}

fn check_shares(ticker: &str, shares: u64, price: f64) -> AnalysisResult<()> {
    if shares == 0 {
        return Err(AnalysisError::invalid_position(ticker, "shares must be at least 1"));
    }
    if !price.is_finite() || price <= 0.0 {
        return Err(AnalysisError::invalid_position(
            ticker,
            format!("price must be positive, got {}", price),
        ));
    }
    Ok(())
}

impl Portfolio {
    pub fn from_weights(weights: &[(String, f64)]) -> AnalysisResult<Self> {
        let mut portfolio = Self::default();
        for (ticker, weight) in weights {
            portfolio.add_weight(ticker, *weight)?;
        }
        Ok(portfolio)
    }

    pub fn positions(&self) -> &[Position] {
        &self.positions
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn total_weight(&self) -> f64 {
        self.positions.iter().map(|p| p.weight).sum()
    }

    /// `(ticker, normalized weight)` pairs in position order.
    pub fn weights(&self) -> Vec<(String, f64)> {
        self.positions
            .iter()
            .map(|p| (p.ticker.clone(), p.weight))
            .collect()
    }

    pub fn is_share_based(&self) -> bool {
        self.positions.first().is_some_and(|p| p.shares.is_some())
    }

    fn find(&self, ticker: &str) -> Option<usize> {
        self.positions.iter().position(|p| p.ticker == ticker)
    }

    /// Adds shares of a ticker. Adding a ticker that is already held merges
    /// the share counts and takes the newer price.
    pub fn add_shares(&mut self, ticker: &str, shares: u64, price: f64) -> AnalysisResult<()> {
        let ticker = normalize_ticker(ticker)?;
        check_shares(&ticker, shares, price)?;
        if !self.is_empty() && !self.is_share_based() {
            return Err(AnalysisError::invalid_position(
                &ticker,
                "portfolio is weight-based; add a weight instead of shares",
            ));
        }

        match self.find(&ticker) {
            Some(i) => {
                let pos = &mut self.positions[i];
                pos.shares = Some(pos.shares.unwrap_or(0).saturating_add(shares));
                pos.price = Some(price);
            }
            None => self.positions.push(Position {
                ticker,
                shares: Some(shares),
                price: Some(price),
                input_weight: None,
                weight: 0.0,
            }),
        }
        self.normalize();
        Ok(())
    }

    /// Adds a raw weight. Duplicate tickers accumulate their raw weights.
    pub fn add_weight(&mut self, ticker: &str, weight: f64) -> AnalysisResult<()> {
        let ticker = normalize_ticker(ticker)?;
        check_weight(&ticker, weight)?;
        if self.is_share_based() {
            return Err(AnalysisError::invalid_position(
                &ticker,
                "portfolio is share-based; add shares and a price instead of a weight",
            ));
        }

        match self.find(&ticker) {
            Some(i) => {
                let pos = &mut self.positions[i];
                pos.input_weight = Some(pos.input_weight.unwrap_or(0.0) + weight);
            }
            None => self.positions.push(Position {
                ticker,
                shares: None,
                price: None,
                input_weight: Some(weight),
                weight: 0.0,
            }),
        }
        self.normalize();
        Ok(())
    }

    pub fn edit_shares(&mut self, ticker: &str, shares: u64, price: f64) -> AnalysisResult<()> {
        let ticker = normalize_ticker(ticker)?;
        check_shares(&ticker, shares, price)?;
        let i = self
            .find(&ticker)
            .ok_or_else(|| AnalysisError::invalid_position(&ticker, "not in portfolio"))?;
        if self.positions[i].shares.is_none() {
            return Err(AnalysisError::invalid_position(&ticker, "position is weight-based"));
        }
        self.positions[i].shares = Some(shares);
        self.positions[i].price = Some(price);
        self.normalize();
        Ok(())
    }

    pub fn edit_weight(&mut self, ticker: &str, weight: f64) -> AnalysisResult<()> {
        let ticker = normalize_ticker(ticker)?;
        check_weight(&ticker, weight)?;
        let i = self
            .find(&ticker)
            .ok_or_else(|| AnalysisError::invalid_position(&ticker, "not in portfolio"))?;
        if self.positions[i].shares.is_some() {
            return Err(AnalysisError::invalid_position(&ticker, "position is share-based"));
        }
        self.positions[i].input_weight = Some(weight);
        self.normalize();
        Ok(())
    }

    pub fn remove(&mut self, ticker: &str) -> AnalysisResult<Position> {
        let ticker = normalize_ticker(ticker)?;
        let i = self
            .find(&ticker)
            .ok_or_else(|| AnalysisError::invalid_position(&ticker, "not in portfolio"))?;
        let removed = self.positions.remove(i);
        self.normalize();
        Ok(removed)
    }

    fn normalize(&mut self) {
        let total: f64 = self.positions.iter().map(Position::raw_weight).sum();
        for pos in &mut self.positions {
            pos.weight = if total > 0.0 { pos.raw_weight() / total } else { 0.0 };
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// CSV Import / Export
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ShareRecord<'a> {
    #[serde(rename = "ETF")]
    etf: &'a str,
    #[serde(rename = "Shares")]
    shares: u64,
    #[serde(rename = "Price")]
    price: f64,
    #[serde(rename = "Value")]
    value: f64,
    #[serde(rename = "Weight")]
    weight: f64,
}

#[derive(Serialize)]
struct WeightRecord<'a> {
    #[serde(rename = "ETF")]
    etf: &'a str,
    #[serde(rename = "Weight")]
    weight: f64,
}

/// Either export layout. `Value` is ignored on import and recomputed.
#[derive(Deserialize)]
struct ImportRecord {
    #[serde(rename = "ETF")]
    etf: String,
    #[serde(rename = "Shares", default)]
    shares: Option<u64>,
    #[serde(rename = "Price", default)]
    price: Option<f64>,
    #[serde(rename = "Weight", default)]
    weight: Option<f64>,
}

impl Portfolio {
    /// Writes `ETF,Shares,Price,Value,Weight` for share portfolios and
    /// `ETF,Weight` for weight portfolios.
    pub fn write_csv<W: io::Write>(&self, writer: W) -> AnalysisResult<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let share_based = self.is_share_based();
        for pos in &self.positions {
            match (share_based, pos.shares, pos.price) {
                (true, Some(shares), Some(price)) => wtr.serialize(ShareRecord {
                    etf: &pos.ticker,
                    shares,
                    price,
                    value: shares as f64 * price,
                    weight: pos.weight,
                })?,
                _ => wtr.serialize(WeightRecord {
                    etf: &pos.ticker,
                    weight: pos.weight,
                })?,
            }
        }
        if self.is_empty() {
            wtr.write_record(["ETF", "Weight"])?;
        }
        wtr.flush()?;
        Ok(())
    }

    /// Parses either export layout. Rows with both `Shares` and `Price`
    /// become share positions; otherwise `Weight` is required.
    pub fn read_csv<R: io::Read>(reader: R) -> AnalysisResult<Self> {
        let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
        let mut portfolio = Self::default();
        for record in rdr.deserialize::<ImportRecord>() {
            let record = record?;
            match (record.shares, record.price, record.weight) {
                (Some(shares), Some(price), _) => portfolio.add_shares(&record.etf, shares, price)?,
                (_, _, Some(weight)) => portfolio.add_weight(&record.etf, weight)?,
                _ => {
                    return Err(AnalysisError::invalid_position(
                        &record.etf,
                        "row needs Shares and Price, or Weight",
                    ));
                }
            }
        }
        Ok(portfolio)
    }

    pub fn save_csv(&self, path: &Path) -> AnalysisResult<()> {
        let file = std::fs::File::create(path)?;
        self.write_csv(file)?;
        info!("Saved {} positions to {}", self.len(), path.display());
        Ok(())
    }

    pub fn load_csv(path: &Path) -> AnalysisResult<Self> {
        let file = std::fs::File::open(path)?;
        let portfolio = Self::read_csv(file)?;
        info!("Loaded {} positions from {}", portfolio.len(), path.display());
        Ok(portfolio)
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Analysis Pipeline
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct AnalysisRequest {
    pub start: NaiveDate,
    /// Inclusive.
    pub end: NaiveDate,
    pub config: AnalysisConfig,
}

#[derive(Clone, Debug, Serialize)]
pub struct PortfolioReport {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub benchmark: String,
    /// Tickers that survived fetching, in analysis order.
    pub tickers: Vec<String>,
    pub warnings: Vec<FetchWarning>,
    pub performance: PerformanceMetrics,
    pub risk: Option<RiskMetrics>,
    pub allocation: AllocationBreakdown,
    pub frontier: Vec<FrontierSample>,
    /// Solver result. `converged == false` marks a best-effort answer.
    pub optimal: Option<OptimalPortfolio>,
    /// Metrics or steps that could not be produced, with the reason.
    pub notes: Vec<String>,
}

struct FrontierOutcome {
    samples: Vec<FrontierSample>,
    optimal: Option<OptimalPortfolio>,
    note: Option<String>,
}

fn run_frontier(aligned: &AlignedReturns, cfg: &OptimizerConfig) -> FrontierOutcome {
    let stats = match ReturnStatistics::from_aligned(aligned) {
        Ok(stats) => stats,
        Err(e) => {
            return FrontierOutcome {
                samples: Vec::new(),
                optimal: None,
                note: Some(format!("optimizer skipped: {}", e)),
            };
        }
    };

    let samples = optimizer::sample_frontier(&stats, cfg.samples, cfg.seed);
    let (optimal, note) = match optimizer::max_sharpe_portfolio(&stats, cfg) {
        Ok(optimal) => (Some(optimal), None),
        Err(AnalysisError::OptimizationFailed { reason, best_effort }) => {
            (Some(*best_effort), Some(format!("optimizer returned a best-effort result: {}", reason)))
        }
        Err(e) => (None, Some(format!("optimizer skipped: {}", e))),
    };
    FrontierOutcome { samples, optimal, note }
}

/// Full portfolio analysis: returns → performance → risk against the
/// benchmark → allocation → frontier and max-Sharpe weights.
///
/// An empty or degenerate portfolio return series aborts. A benchmark that
/// cannot be fetched, a degenerate risk computation or a non-converged
/// optimizer is recorded in `notes` instead.
pub async fn analyze_portfolio<M: MarketData + Sync>(
    source: &M,
    portfolio: &Portfolio,
    request: &AnalysisRequest,
) -> AnalysisResult<PortfolioReport> {
    if portfolio.is_empty() {
        return Err(AnalysisError::empty("portfolio (no positions)"));
    }
    let cfg = &request.config;
    let positions = portfolio.weights();

    let set = returns::build_return_set(source, &positions, request.start, request.end, cfg.fetch_timeout).await;
    let performance = performance::calculate_portfolio_performance(&set)?;
    let aligned = returns::align(&set)?;

    let mut notes = Vec::new();

    let benchmark = risk::fetch_benchmark_returns(
        source,
        &cfg.benchmark,
        request.start,
        request.end,
        cfg.fetch_timeout,
    )
    .await;
    let risk = match benchmark
        .and_then(|b| risk::analyze_risk(&performance.daily_returns, &b, cfg.risk_free_rate))
    {
        Ok(r) => Some(r),
        Err(e) => {
            warn!("Risk metrics unavailable: {}", e);
            notes.push(format!("risk: {}", e));
            None
        }
    };

    let allocation = allocation::analyze_asset_allocation(source, &positions, cfg.fetch_timeout).await;

    let optimizer_cfg = OptimizerConfig::from(cfg);
    let tickers = aligned.tickers.clone();
    let outcome = match tokio::task::spawn_blocking(move || run_frontier(&aligned, &optimizer_cfg)).await {
        Ok(outcome) => outcome,
        Err(e) => FrontierOutcome {
            samples: Vec::new(),
            optimal: None,
            note: Some(format!("optimizer task failed: {}", e)),
        },
    };
    if let Some(note) = outcome.note {
        warn!("{}", note);
        notes.push(note);
    }

    info!(
        "Analyzed {} of {} positions ({} warnings)",
        tickers.len(),
        portfolio.len(),
        set.warnings.len()
    );

    Ok(PortfolioReport {
        start: request.start,
        end: request.end,
        benchmark: cfg.benchmark.clone(),
        tickers,
        warnings: set.warnings,
        performance,
        risk,
        allocation,
        frontier: outcome.samples,
        optimal: outcome.optimal,
        notes,
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// Report
// ──────────────────────────────────────────────────────────────────────────────

/// Pretty-prints a portfolio report to stdout.
pub fn print_report(portfolio: &Portfolio, report: &PortfolioReport) {
    let perf = &report.performance;
    println!("\n╔════════════════════════════════════════════════════════════╗");
    println!("║               ETF Lens Portfolio Report                   ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Period: {} → {}                          ║", report.start, report.end);
    println!(
        "║  Annual Return          : {:>+7.2}%                        ║",
        perf.annual_return * 100.0
    );
    println!(
        "║  Annual Volatility      : {:>7.2}%                        ║",
        perf.annual_volatility * 100.0
    );
    println!(
        "║  Sharpe Ratio           : {:>7.2}                         ║",
        perf.sharpe_ratio
    );
    if let Some(last) = perf.cumulative_returns.last() {
        println!(
            "║  Cumulative Return      : {:>+7.2}%                        ║",
            (last - 1.0) * 100.0
        );
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Risk vs {:<10}                                        ║", report.benchmark);
    match &report.risk {
        Some(risk) => {
            println!("║  Beta                   : {:>7.2}                         ║", risk.beta);
            println!(
                "║  Alpha (annual)         : {:>+7.2}%                        ║",
                risk.alpha * 100.0
            );
            println!(
                "║  Max Drawdown           : {:>7.2}%                        ║",
                risk.max_drawdown * 100.0
            );
            println!(
                "║  VaR (95%, daily)       : {:>7.2}%                        ║",
                risk.value_at_risk_95 * 100.0
            );
        }
        None => println!("║  unavailable (see notes)                                  ║"),
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║  Symbol   Weight    Optimal                                ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    for pos in portfolio.positions() {
        let optimal = report.optimal.as_ref().and_then(|o| {
            o.tickers
                .iter()
                .position(|t| t == &pos.ticker)
                .map(|i| o.weights[i])
        });
        match optimal {
            Some(w) => println!(
                "║  {:<8} {:>7.2}%   {:>7.2}%                              ║",
                pos.ticker,
                pos.weight * 100.0,
                w * 100.0
            ),
            None => println!(
                "║  {:<8} {:>7.2}%      n/a                               ║",
                pos.ticker,
                pos.weight * 100.0
            ),
        }
    }

    if let Some(opt) = &report.optimal {
        println!("╠════════════════════════════════════════════════════════════╣");
        println!(
            "║  Max-Sharpe: ret {:>+6.2}%  vol {:>6.2}%  sharpe {:>5.2}{}   ║",
            opt.annual_return * 100.0,
            opt.annual_volatility * 100.0,
            opt.sharpe_ratio,
            if opt.converged { "  " } else { " *" }
        );
        if let Some(best) = report
            .frontier
            .iter()
            .max_by(|a, b| a.sharpe.total_cmp(&b.sharpe))
        {
            println!(
                "║  Best of {:>6} samples: sharpe {:>5.2}                     ║",
                report.frontier.len(),
                best.sharpe
            );
        }
    }

    println!("╠════════════════════════════════════════════════════════════╣");
    println!("║                   Asset Allocation                        ║");
    println!("╠════════════════════════════════════════════════════════════╣");
    let mut categories: Vec<_> = report.allocation.iter().collect();
    categories.sort_by(|a, b| b.1.total_cmp(a.1));
    for (category, w) in categories {
        println!("║  {:<40} {:>7.2}%        ║", category, w * 100.0);
    }

    if !report.warnings.is_empty() || !report.notes.is_empty() {
        println!("╠════════════════════════════════════════════════════════════╣");
        for w in &report.warnings {
            println!("║  ⚠ {}: {}", w.ticker, w.reason);
        }
        for note in &report.notes {
            println!("║  ⚠ {}", note);
        }
    }

    println!("╚════════════════════════════════════════════════════════════╝");
    if report.optimal.as_ref().is_some_and(|o| !o.converged) {
        println!("* solver stopped before converging; weights are best-effort");
    }
    println!();
    println!("⚠  Educational use only. Not financial advice.");
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StockData;
    use crate::data::mock::{MockMarketData, day};
    use approx::assert_relative_eq;

    fn assert_normalized(p: &Portfolio) {
        assert_relative_eq!(p.total_weight(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_share_weights_follow_value() {
        let mut p = Portfolio::default();
        p.add_shares("spy", 10, 400.0).unwrap();
        p.add_shares("QQQ", 20, 100.0).unwrap();

        assert_normalized(&p);
        assert_eq!(p.positions()[0].ticker, "SPY");
        assert_relative_eq!(p.positions()[0].weight, 4000.0 / 6000.0, epsilon = 1e-12);
        assert_relative_eq!(p.positions()[1].weight, 2000.0 / 6000.0, epsilon = 1e-12);
    }

    #[test]
    fn test_every_edit_renormalizes() {
        let mut p = Portfolio::default();
        p.add_shares("SPY", 10, 400.0).unwrap();
        p.add_shares("QQQ", 20, 100.0).unwrap();
        p.add_shares("SPY", 5, 500.0).unwrap();
        assert_eq!(p.len(), 2);
        assert_eq!(p.positions()[0].shares, Some(15));
        assert_normalized(&p);

        p.edit_shares("QQQ", 75, 100.0).unwrap();
        assert_relative_eq!(p.positions()[0].weight, 0.5, epsilon = 1e-12);
        assert_normalized(&p);

        p.remove("SPY").unwrap();
        assert_eq!(p.weights(), vec![("QQQ".to_string(), 1.0)]);

        p.remove("QQQ").unwrap();
        assert!(p.is_empty());
        assert_eq!(p.total_weight(), 0.0);
    }

    #[test]
    fn test_rejected_edit_leaves_portfolio_unchanged() {
        let mut p = Portfolio::from_weights(&[("SPY".into(), 0.6), ("AGG".into(), 0.4)]).unwrap();
        let before = p.clone();

        assert!(p.add_weight("GLD", -0.1).is_err());
        assert!(p.add_weight("GLD", f64::NAN).is_err());
        assert!(p.add_shares("GLD", 1, 10.0).is_err());
        assert!(p.edit_weight("TLT", 0.2).is_err());
        assert!(p.remove("TLT").is_err());
        assert!(p.add_weight("  ", 0.2).is_err());

        assert_eq!(p, before);
    }

    #[test]
    fn test_zero_shares_or_price_is_invalid() {
        let mut p = Portfolio::default();
        assert!(matches!(
            p.add_shares("SPY", 0, 10.0),
            Err(AnalysisError::InvalidPosition { .. })
        ));
        assert!(matches!(
            p.add_shares("SPY", 1, 0.0),
            Err(AnalysisError::InvalidPosition { .. })
        ));
        assert!(p.is_empty());
    }

    #[test]
    fn test_weights_are_normalized_from_raw_input() {
        let mut p = Portfolio::from_weights(&[("SPY".into(), 3.0), ("AGG".into(), 1.0)]).unwrap();
        assert_relative_eq!(p.positions()[0].weight, 0.75, epsilon = 1e-12);

        p.edit_weight("AGG", 3.0).unwrap();
        assert_relative_eq!(p.positions()[0].weight, 0.5, epsilon = 1e-12);
        assert_normalized(&p);
    }

    #[test]
    fn test_share_csv_round_trip() {
        let mut p = Portfolio::default();
        p.add_shares("SPY", 10, 412.37).unwrap();
        p.add_shares("AGG", 33, 98.125).unwrap();
        p.add_shares("GLD", 7, 187.5).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("portfolio.csv");
        p.save_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("ETF,Shares,Price,Value,Weight"));

        let loaded = Portfolio::load_csv(&path).unwrap();
        let triples = |p: &Portfolio| -> Vec<(String, Option<u64>, Option<f64>)> {
            p.positions()
                .iter()
                .map(|x| (x.ticker.clone(), x.shares, x.price))
                .collect()
        };
        assert_eq!(triples(&loaded), triples(&p));
        for (a, b) in loaded.positions().iter().zip(p.positions()) {
            assert_relative_eq!(a.weight, b.weight, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_weight_csv_layout() {
        let p = Portfolio::from_weights(&[("SPY".into(), 0.5), ("AGG".into(), 0.5)]).unwrap();
        let mut buf = Vec::new();
        p.write_csv(&mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text.lines().next(), Some("ETF,Weight"));

        let loaded = Portfolio::read_csv(text.as_bytes()).unwrap();
        assert_eq!(loaded.weights(), p.weights());
    }

    #[test]
    fn test_import_recomputes_value_and_weight() {
        let csv = "ETF,Shares,Price,Value,Weight\nSPY,10,100,999,0.9\nAGG,30,100,1,0.1\n";
        let p = Portfolio::read_csv(csv.as_bytes()).unwrap();
        assert_eq!(p.positions()[0].value(), Some(1000.0));
        assert_relative_eq!(p.positions()[0].weight, 0.25, epsilon = 1e-12);
    }

    #[test]
    fn test_import_row_without_shares_or_weight_fails() {
        let csv = "ETF,Shares,Price\nSPY,10,\n";
        assert!(matches!(
            Portfolio::read_csv(csv.as_bytes()),
            Err(AnalysisError::InvalidPosition { .. })
        ));
    }

    fn request(samples: usize) -> AnalysisRequest {
        AnalysisRequest {
            start: day(2023, 1, 1),
            end: day(2023, 12, 31),
            config: AnalysisConfig {
                frontier_samples: samples,
                ..AnalysisConfig::default()
            },
        }
    }

    fn market() -> MockMarketData {
        let start = day(2023, 1, 1);
        MockMarketData::default()
            .with_stock(StockData::new_mock("SPY", start, 200, 0.0005, 0.011, 1))
            .with_stock(StockData::new_mock("AGG", start, 200, 0.0001, 0.004, 2))
            .with_stock(StockData::new_mock("GLD", start, 200, 0.0003, 0.009, 3))
            .with_stock(StockData::new_mock("^GSPC", start, 200, 0.0004, 0.010, 4))
            .with_category("SPY", Some("Large Blend"))
            .with_category("AGG", Some("Intermediate Core Bond"))
    }

    #[tokio::test]
    async fn test_analyze_portfolio_end_to_end() {
        let p = Portfolio::from_weights(&[
            ("SPY".into(), 0.5),
            ("AGG".into(), 0.3),
            ("GLD".into(), 0.2),
        ])
        .unwrap();

        let report = analyze_portfolio(&market(), &p, &request(500)).await.unwrap();

        assert_eq!(report.tickers, vec!["AGG", "GLD", "SPY"]);
        assert!(report.warnings.is_empty());
        assert!(report.risk.is_some());
        assert_eq!(report.frontier.len(), 500);
        let opt = report.optimal.as_ref().unwrap();
        assert_relative_eq!(opt.weights.iter().sum::<f64>(), 1.0, epsilon = 1e-9);
        let alloc_total: f64 = report.allocation.values().sum();
        assert_relative_eq!(alloc_total, 1.0, epsilon = 1e-9);
        assert_relative_eq!(report.allocation["Other"], 0.2, epsilon = 1e-9);
    }

    #[tokio::test]
    async fn test_missing_ticker_is_a_warning() {
        let p = Portfolio::from_weights(&[("SPY".into(), 0.5), ("NOPE".into(), 0.5)]).unwrap();
        let report = analyze_portfolio(&market(), &p, &request(100)).await.unwrap();

        assert_eq!(report.tickers, vec!["SPY"]);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.warnings[0].ticker, "NOPE");
        assert_eq!(report.optimal.as_ref().unwrap().weights, vec![1.0]);
    }

    #[tokio::test]
    async fn test_missing_benchmark_keeps_the_rest_of_the_report() {
        let p = Portfolio::from_weights(&[("SPY".into(), 1.0)]).unwrap();
        let mut req = request(10);
        req.config.benchmark = "NOBENCH".to_string();
        let report = analyze_portfolio(&market(), &p, &req).await.unwrap();

        assert!(report.risk.is_none());
        assert!(report.notes.iter().any(|n| n.starts_with("risk:") && n.contains("NOBENCH")));
        assert!(report.performance.annual_volatility > 0.0);
        assert_eq!(report.tickers, vec!["SPY".to_string()]);
        assert_eq!(report.optimal.as_ref().map(|o| o.weights.clone()), Some(vec![1.0]));
        assert!(!report.frontier.is_empty());
    }

    #[tokio::test]
    async fn test_empty_portfolio_is_empty_dataset() {
        let err = analyze_portfolio(&market(), &Portfolio::default(), &request(10))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyDataset { .. }));
    }
}
