//! Return Series Builder: turns (ticker, weight) positions into per-ticker
//! daily simple-return series, skipping tickers that cannot be fetched.

use crate::data::{Candle, MarketData};
use crate::error::{AnalysisError, AnalysisResult};
use crate::stats;
use chrono::NaiveDate;
use futures_util::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Ordered `(date, simple return)` pairs.
pub type ReturnSeries = Vec<(NaiveDate, f64)>;

#[derive(Clone, Debug, Serialize)]
pub struct TickerReturns {
    pub returns: ReturnSeries,
    pub weight: f64,
}

/// A ticker that was left out of the result, and why.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct FetchWarning {
    pub ticker: String,
    pub reason: String,
}

/// Builder output. Keyed by ticker so iteration order is deterministic
/// regardless of the order fetches completed in.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ReturnSet {
    pub series: BTreeMap<String, TickerReturns>,
    pub warnings: Vec<FetchWarning>,
}

impl ReturnSet {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn tickers(&self) -> Vec<String> {
        self.series.keys().cloned().collect()
    }

    #[allow(dead_code)]
    pub fn insert(&mut self, ticker: &str, returns: ReturnSeries, weight: f64) {
        self.series
            .insert(ticker.to_string(), TickerReturns { returns, weight });
    }
}

/// Return columns restricted to the dates every ticker traded on.
#[derive(Clone, Debug)]
pub struct AlignedReturns {
    pub dates: Vec<NaiveDate>,
    pub tickers: Vec<String>,
    /// One column per ticker, same order as `tickers`.
    pub columns: Vec<Vec<f64>>,
    pub weights: Vec<f64>,
}

impl AlignedReturns {
    pub fn len(&self) -> usize {
        self.dates.len()
    }
}

/// `fetch_history` under a timeout. A timeout or an empty history is a
/// `FetchFailure` like any other.
pub async fn fetch_history<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> AnalysisResult<Vec<Candle>> {
    let history = match tokio::time::timeout(timeout, source.fetch_history(ticker, start, end)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(AnalysisError::fetch(
                ticker,
                format!("timed out after {:.1}s", timeout.as_secs_f64()),
            ));
        }
    };

    if history.is_empty() {
        return Err(AnalysisError::fetch(ticker, "empty price history"));
    }
    Ok(history)
}

/// Fetches adjusted closes for one ticker and converts them to returns.
/// Every failure mode (error, timeout, empty or one-point history) is a
/// `FetchFailure`.
pub async fn fetch_returns<M: MarketData + Sync>(
    source: &M,
    ticker: &str,
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> AnalysisResult<ReturnSeries> {
    let history = fetch_history(source, ticker, start, end, timeout).await?;

    let prices: Vec<(NaiveDate, f64)> = history.iter().map(|c| (c.date, c.adj_close)).collect();
    let returns = stats::simple_returns(&prices);
    if returns.is_empty() {
        return Err(AnalysisError::fetch(
            ticker,
            format!("{} price point(s) is not enough for a return", history.len()),
        ));
    }

    debug!("{}: {} daily returns", ticker, returns.len());
    Ok(returns)
}

/// Builds the per-ticker return set. Tickers are fetched concurrently, each
/// under its own timeout; failures become warnings and never abort the rest.
pub async fn build_return_set<M: MarketData + Sync>(
    source: &M,
    positions: &[(String, f64)],
    start: NaiveDate,
    end: NaiveDate,
    timeout: Duration,
) -> ReturnSet {
    let mut weights: BTreeMap<String, f64> = BTreeMap::new();
    for (ticker, weight) in positions {
        let ticker = ticker.trim().to_uppercase();
        if ticker.is_empty() {
            continue;
        }
        if weights.contains_key(&ticker) {
            debug!("Duplicate ticker {} in request; merging weights", ticker);
        }
        *weights.entry(ticker).or_insert(0.0) += weight;
    }

    info!(
        "Fetching {} tickers ({} → {})",
        weights.len(),
        start,
        end
    );

    let fetches = weights.keys().map(|ticker| async move {
        let result = fetch_returns(source, ticker, start, end, timeout).await;
        (ticker.clone(), result)
    });
    let results = join_all(fetches).await;

    let mut set = ReturnSet::default();
    for (ticker, result) in results {
        match result {
            Ok(returns) => {
                let weight = weights.get(&ticker).copied().unwrap_or(0.0);
                set.series.insert(ticker, TickerReturns { returns, weight });
            }
            Err(e) => {
                warn!("Skipping {}: {}", ticker, e);
                let reason = match e {
                    AnalysisError::FetchFailure { reason, .. } => reason,
                    other => other.to_string(),
                };
                set.warnings.push(FetchWarning { ticker, reason });
            }
        }
    }

    set
}

/// Inner-joins several series on date. Returns the common dates and one
/// value column per input series.
pub fn align_series(series: &[&ReturnSeries]) -> (Vec<NaiveDate>, Vec<Vec<f64>>) {
    let Some((first, rest)) = series.split_first() else {
        return (Vec::new(), Vec::new());
    };

    let mut common: BTreeSet<NaiveDate> = first.iter().map(|(d, _)| *d).collect();
    for s in rest {
        let dates: BTreeSet<NaiveDate> = s.iter().map(|(d, _)| *d).collect();
        common = common.intersection(&dates).copied().collect();
    }

    let dates: Vec<NaiveDate> = common.into_iter().collect();
    let columns = series
        .iter()
        .map(|s| {
            let lookup: HashMap<NaiveDate, f64> = s.iter().copied().collect();
            dates.iter().map(|d| lookup[d]).collect()
        })
        .collect();

    (dates, columns)
}

/// Aligns every ticker of the set to the common trading dates.
pub fn align(set: &ReturnSet) -> AnalysisResult<AlignedReturns> {
    if set.is_empty() {
        return Err(AnalysisError::empty("portfolio returns (no ticker survived fetching)"));
    }

    let series: Vec<&ReturnSeries> = set.series.values().map(|t| &t.returns).collect();
    let (dates, columns) = align_series(&series);
    if dates.is_empty() {
        return Err(AnalysisError::empty("portfolio returns (tickers share no trading dates)"));
    }

    Ok(AlignedReturns {
        dates,
        tickers: set.tickers(),
        columns,
        weights: set.series.values().map(|t| t.weight).collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mock::{day, MockMarketData};

    fn series(start: NaiveDate, values: &[f64]) -> ReturnSeries {
        values
            .iter()
            .enumerate()
            .map(|(i, &v)| (start + chrono::Days::new(i as u64), v))
            .collect()
    }

    #[tokio::test]
    async fn test_failed_ticker_is_warned_not_fatal() {
        let source = MockMarketData::default().with_prices("SPY", day(2024, 1, 1), &[100.0, 101.0, 102.0]);
        let positions = vec![("BAD".to_string(), 0.5), ("SPY".to_string(), 0.5)];

        let set = build_return_set(
            &source,
            &positions,
            day(2024, 1, 1),
            day(2024, 1, 31),
            Duration::from_secs(5),
        )
        .await;

        assert_eq!(set.tickers(), vec!["SPY".to_string()]);
        assert_eq!(set.warnings.len(), 1);
        assert_eq!(set.warnings[0].ticker, "BAD");
        assert_eq!(set.series["SPY"].returns.len(), 2);
        assert_eq!(set.series["SPY"].weight, 0.5);
    }

    #[tokio::test]
    async fn test_slow_ticker_times_out_as_fetch_failure() {
        let source = MockMarketData::default()
            .with_prices("SPY", day(2024, 1, 1), &[100.0, 101.0])
            .with_prices("SLOW", day(2024, 1, 1), &[100.0, 101.0])
            .with_slow("SLOW");
        let positions = vec![("SPY".to_string(), 0.5), ("SLOW".to_string(), 0.5)];

        let set = build_return_set(
            &source,
            &positions,
            day(2024, 1, 1),
            day(2024, 1, 31),
            Duration::from_millis(50),
        )
        .await;

        assert_eq!(set.tickers(), vec!["SPY".to_string()]);
        assert!(set.warnings[0].reason.contains("timed out"));
    }

    #[tokio::test]
    async fn test_single_price_point_is_rejected() {
        let source = MockMarketData::default().with_prices("ONE", day(2024, 1, 1), &[50.0]);
        let err = fetch_returns(&source, "ONE", day(2024, 1, 1), day(2024, 1, 2), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::FetchFailure { .. }));
    }

    #[tokio::test]
    async fn test_tickers_are_normalized_and_merged() {
        let source = MockMarketData::default().with_prices("QQQ", day(2024, 1, 1), &[10.0, 11.0]);
        let positions = vec![("qqq".to_string(), 0.25), (" QQQ ".to_string(), 0.75)];
        let set = build_return_set(
            &source,
            &positions,
            day(2024, 1, 1),
            day(2024, 1, 2),
            Duration::from_secs(1),
        )
        .await;
        assert_eq!(set.len(), 1);
        assert_eq!(set.series["QQQ"].weight, 1.0);
    }

    #[test]
    fn test_align_drops_dates_missing_any_ticker() {
        let mut set = ReturnSet::default();
        set.insert("A", series(day(2024, 1, 1), &[0.01, 0.02, 0.03, 0.04]), 0.5);
        set.insert("B", series(day(2024, 1, 2), &[0.10, 0.20, 0.30, 0.40]), 0.5);

        let aligned = align(&set).unwrap();
        assert_eq!(aligned.dates, vec![day(2024, 1, 2), day(2024, 1, 3), day(2024, 1, 4)]);
        assert_eq!(aligned.columns[0], vec![0.02, 0.03, 0.04]);
        assert_eq!(aligned.columns[1], vec![0.10, 0.20, 0.30]);
    }

    #[test]
    fn test_align_empty_set_is_empty_dataset() {
        let err = align(&ReturnSet::default()).unwrap_err();
        assert!(matches!(err, AnalysisError::EmptyDataset { .. }));
    }

    #[test]
    fn test_align_disjoint_dates_is_empty_dataset() {
        let mut set = ReturnSet::default();
        set.insert("A", series(day(2024, 1, 1), &[0.01]), 0.5);
        set.insert("B", series(day(2024, 2, 1), &[0.01]), 0.5);
        assert!(matches!(align(&set), Err(AnalysisError::EmptyDataset { .. })));
    }
}
