use crate::error::{AnalysisError, AnalysisResult};
use chrono::{DateTime, Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A single daily bar (OHLCV plus dividend/split adjusted close).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub adj_close: f64,
    pub volume: f64,
}

/// Fund metadata. Every field is optional because providers omit them freely.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FundInfo {
    pub symbol: String,
    pub long_name: Option<String>,
    pub category: Option<String>,
    pub expense_ratio: Option<f64>,
    pub total_assets: Option<f64>,
    #[serde(rename = "yield")]
    pub yield_: Option<f64>,
}

/// Price/metadata collaborator. Both calls are fallible, per ticker, and may
/// take network time; callers wrap them in a timeout.
pub trait MarketData {
    fn fetch_history(
        &self,
        ticker: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> impl Future<Output = AnalysisResult<Vec<Candle>>> + Send;

    fn fetch_info(&self, ticker: &str) -> impl Future<Output = AnalysisResult<FundInfo>> + Send;
}

/// Holds historical data for a specific symbol.
#[derive(Clone, Debug)]
pub struct StockData {
    pub symbol: String,
    pub history: Vec<Candle>,
}

impl StockData {
    pub fn closes(&self) -> Vec<(NaiveDate, f64)> {
        self.history.iter().map(|c| (c.date, c.close)).collect()
    }

    pub fn adj_closes(&self) -> Vec<(NaiveDate, f64)> {
        self.history.iter().map(|c| (c.date, c.adj_close)).collect()
    }

    /// Random-walk history for tests and demos. Starts at 100 on `start`,
    /// one bar per calendar day.
    #[allow(dead_code)]
    pub fn new_mock(symbol: &str, start: NaiveDate, days: usize, drift: f64, vol: f64, seed: u64) -> Self {
        use rand::SeedableRng;
        use rand_distr::{Distribution, Normal};

        let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
        let mut history = Vec::with_capacity(days);
        let Ok(noise) = Normal::new(drift, vol.max(1e-12)) else {
            return Self {
                symbol: symbol.to_uppercase(),
                history,
            };
        };
        let mut price: f64 = 100.0;
        let mut date = start;

        for _ in 0..days {
            let change: f64 = noise.sample(&mut rng);
            let open = price;
            let close = (open * (1.0 + change)).max(0.01);
            history.push(Candle {
                date,
                open,
                high: open.max(close),
                low: open.min(close),
                close,
                adj_close: close,
                volume: 1_000.0,
            });
            price = close;
            date = date + Days::new(1);
        }

        Self {
            symbol: symbol.to_uppercase(),
            history,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Yahoo Finance
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Deserialize, Serialize, Debug)]
struct YahooChartResponse {
    chart: YahooChart,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooChart {
    result: Option<Vec<YahooResult>>,
    error: Option<serde_json::Value>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooResult {
    #[serde(default)]
    timestamp: Vec<i64>,
    indicators: YahooIndicators,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooIndicators {
    quote: Vec<YahooQuote>,
    #[serde(default)]
    adjclose: Vec<YahooAdjClose>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooQuote {
    #[serde(default)]
    open: Vec<Option<f64>>,
    #[serde(default)]
    high: Vec<Option<f64>>,
    #[serde(default)]
    low: Vec<Option<f64>>,
    #[serde(default)]
    close: Vec<Option<f64>>,
    #[serde(default)]
    volume: Vec<Option<f64>>,
}

#[derive(Deserialize, Serialize, Debug)]
struct YahooAdjClose {
    #[serde(default)]
    adjclose: Vec<Option<f64>>,
}

const CACHE_MAX_AGE_SECS: u64 = 86_400;

pub struct YahooFinance {
    client: reqwest::Client,
    cache_dir: Option<PathBuf>,
    max_attempts: usize,
}

impl YahooFinance {
    pub fn new(timeout: std::time::Duration) -> AnalysisResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent("Mozilla/5.0")
            .build()?;
        Ok(Self {
            client,
            cache_dir: Some(PathBuf::from(".cache")),
            max_attempts: 3,
        })
    }

    async fn get_json<T>(&self, ticker: &str, url: &str) -> AnalysisResult<T>
    where
        T: serde::de::DeserializeOwned,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;
            let outcome = match self.client.get(url).send().await {
                Ok(resp) => match resp.error_for_status() {
                    Ok(resp) => resp.json::<T>().await.map_err(AnalysisError::from),
                    Err(e) => Err(e.into()),
                },
                Err(e) => Err(e.into()),
            };

            match outcome {
                Ok(v) => return Ok(v),
                Err(e) => {
                    if attempts >= self.max_attempts {
                        return Err(AnalysisError::fetch(ticker, e));
                    }
                    warn!(
                        "Failed to fetch {} (attempt {}/{}): {}",
                        ticker, attempts, self.max_attempts, e
                    );
                }
            }

            tokio::time::sleep(std::time::Duration::from_secs(2)).await;
        }
    }

    async fn chart(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> AnalysisResult<YahooChartResponse> {
        let cache_file = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(cache_file_name(ticker, start, end)));

        if let Some(path) = cache_file.as_deref() {
            if let Some(cached) = read_fresh_cache(path) {
                info!("Loading {} from cache...", ticker);
                return Ok(cached);
            }
        }

        // period2 is exclusive on Yahoo's side; push it one day out so the
        // end date is included when it was a trading day.
        let period1 = start.and_hms_opt(0, 0, 0).map(|t| t.and_utc().timestamp()).unwrap_or(0);
        let period2 = (end + Days::new(1))
            .and_hms_opt(0, 0, 0)
            .map(|t| t.and_utc().timestamp())
            .unwrap_or(period1);
        let url = format!(
            "https://query1.finance.yahoo.com/v8/finance/chart/{}?period1={}&period2={}&interval=1d&events=div%2Csplits",
            ticker, period1, period2
        );
        debug!("GET {}", url);

        let response: YahooChartResponse = self.get_json(ticker, &url).await?;

        if let Some(path) = cache_file.as_deref() {
            if let Err(e) = write_cache(path, &response) {
                warn!("Could not write cache for {}: {}", ticker, e);
            }
        }

        Ok(response)
    }
}

impl MarketData for YahooFinance {
    async fn fetch_history(&self, ticker: &str, start: NaiveDate, end: NaiveDate) -> AnalysisResult<Vec<Candle>> {
        let response = self.chart(ticker, start, end).await?;
        let candles = chart_to_candles(ticker, &response)?;
        Ok(candles
            .into_iter()
            .filter(|c| c.date >= start && c.date <= end)
            .collect())
    }

    async fn fetch_info(&self, ticker: &str) -> AnalysisResult<FundInfo> {
        let url = format!(
            "https://query2.finance.yahoo.com/v10/finance/quoteSummary/{}?modules=fundProfile,summaryDetail,defaultKeyStatistics,price",
            ticker
        );
        let value: serde_json::Value = self.get_json(ticker, &url).await?;
        parse_fund_info(ticker, &value)
    }
}

fn cache_file_name(ticker: &str, start: NaiveDate, end: NaiveDate) -> String {
    let safe: String = ticker
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("{}_{}_{}.json", safe, start.format("%Y%m%d"), end.format("%Y%m%d"))
}

fn read_fresh_cache(path: &Path) -> Option<YahooChartResponse> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let age = std::time::SystemTime::now().duration_since(modified).ok()?;
    if age.as_secs() >= CACHE_MAX_AGE_SECS {
        info!("Cache expired for {}, fetching...", path.display());
        return None;
    }
    let file = std::fs::File::open(path).ok()?;
    serde_json::from_reader(std::io::BufReader::new(file)).ok()
}

fn write_cache(path: &Path, response: &YahooChartResponse) -> AnalysisResult<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let file = std::fs::File::create(path)?;
    serde_json::to_writer(std::io::BufWriter::new(file), response)?;
    Ok(())
}

fn chart_to_candles(ticker: &str, response: &YahooChartResponse) -> AnalysisResult<Vec<Candle>> {
    if let Some(err) = &response.chart.error {
        if !err.is_null() {
            return Err(AnalysisError::fetch(ticker, format!("provider error: {}", err)));
        }
    }

    let result = response
        .chart
        .result
        .as_ref()
        .and_then(|r| r.first())
        .ok_or_else(|| AnalysisError::fetch(ticker, "no data found"))?;
    let quotes = result
        .indicators
        .quote
        .first()
        .ok_or_else(|| AnalysisError::fetch(ticker, "response has no quote block"))?;
    let adjclose = result.indicators.adjclose.first().map(|a| &a.adjclose);

    let at = |v: &Vec<Option<f64>>, i: usize| v.get(i).copied().flatten();

    let mut history = Vec::with_capacity(result.timestamp.len());
    for (i, &timestamp) in result.timestamp.iter().enumerate() {
        let Some(date) = DateTime::from_timestamp(timestamp, 0).map(|t| t.date_naive()) else {
            continue;
        };
        let Some(close) = at(&quotes.close, i) else {
            continue;
        };
        let adj_close = adjclose.and_then(|a| at(a, i)).unwrap_or(close);

        history.push(Candle {
            date,
            open: at(&quotes.open, i).unwrap_or(close),
            high: at(&quotes.high, i).unwrap_or(close),
            low: at(&quotes.low, i).unwrap_or(close),
            close,
            adj_close,
            volume: at(&quotes.volume, i).unwrap_or(0.0),
        });
    }

    Ok(history)
}

fn parse_fund_info(ticker: &str, value: &serde_json::Value) -> AnalysisResult<FundInfo> {
    let result = value
        .pointer("/quoteSummary/result/0")
        .ok_or_else(|| AnalysisError::fetch(ticker, "quoteSummary returned no result"))?;

    let raw = |path: &str| result.pointer(path).and_then(|v| v.as_f64());
    let text = |path: &str| {
        result
            .pointer(path)
            .and_then(|v| v.as_str())
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    Ok(FundInfo {
        symbol: ticker.to_uppercase(),
        long_name: text("/price/longName"),
        category: text("/fundProfile/categoryName"),
        expense_ratio: raw("/fundProfile/feesExpensesInvestment/annualReportExpenseRatio/raw"),
        total_assets: raw("/defaultKeyStatistics/totalAssets/raw")
            .or_else(|| raw("/summaryDetail/totalAssets/raw")),
        yield_: raw("/summaryDetail/yield/raw"),
    })
}

// ──────────────────────────────────────────────────────────────────────────────
// In-memory source for tests
// ──────────────────────────────────────────────────────────────────────────────


#[cfg(test)]
mod tests {
    use super::*;

    const CHART_JSON: &str = r#"{
        "chart": {
            "result": [{
                "timestamp": [1704205800, 1704292200, 1704378600],
                "indicators": {
                    "quote": [{
                        "open": [100.0, 101.0, null],
                        "high": [102.0, 103.0, null],
                        "low": [99.0, 100.0, null],
                        "close": [101.0, 102.0, null],
                        "volume": [1000, 1200, null]
                    }],
                    "adjclose": [{ "adjclose": [100.5, 101.5, null] }]
                }
            }],
            "error": null
        }
    }"#;

    #[test]
    fn test_chart_parsing_uses_adjusted_close_and_skips_nulls() {
        let response: YahooChartResponse = serde_json::from_str(CHART_JSON).unwrap();
        let candles = chart_to_candles("SPY", &response).unwrap();

        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].date, NaiveDate::from_ymd_opt(2024, 1, 2).unwrap());
        assert_eq!(candles[0].close, 101.0);
        assert_eq!(candles[0].adj_close, 100.5);
        assert_eq!(candles[1].adj_close, 101.5);
    }

    #[test]
    fn test_chart_without_result_is_fetch_failure() {
        let response: YahooChartResponse = serde_json::from_str(
            r#"{"chart":{"result":null,"error":{"code":"Not Found","description":"No data found"}}}"#,
        )
        .unwrap();
        let err = chart_to_candles("NOPE", &response).unwrap_err();
        assert!(matches!(err, AnalysisError::FetchFailure { .. }));
    }

    #[test]
    fn test_adjclose_falls_back_to_close() {
        let json = CHART_JSON.replace(r#""adjclose": [{ "adjclose": [100.5, 101.5, null] }]"#, r#""adjclose": []"#);
        let response: YahooChartResponse = serde_json::from_str(&json).unwrap();
        let candles = chart_to_candles("SPY", &response).unwrap();
        assert_eq!(candles[0].adj_close, candles[0].close);
    }

    #[test]
    fn test_parse_fund_info() {
        let value = serde_json::json!({
            "quoteSummary": {
                "result": [{
                    "price": { "longName": "SPDR S&P 500 ETF Trust" },
                    "fundProfile": {
                        "categoryName": "Large Blend",
                        "feesExpensesInvestment": { "annualReportExpenseRatio": { "raw": 0.0945 } }
                    },
                    "summaryDetail": { "yield": { "raw": 0.0123 }, "totalAssets": { "raw": 5.0e11 } }
                }]
            }
        });
        let info = parse_fund_info("spy", &value).unwrap();
        assert_eq!(info.symbol, "SPY");
        assert_eq!(info.category.as_deref(), Some("Large Blend"));
        assert_eq!(info.expense_ratio, Some(0.0945));
        assert_eq!(info.total_assets, Some(5.0e11));
        assert_eq!(info.yield_, Some(0.0123));
    }

    #[test]
    fn test_parse_fund_info_blank_category_is_none() {
        let value = serde_json::json!({
            "quoteSummary": { "result": [{ "fundProfile": { "categoryName": "  " } }] }
        });
        let info = parse_fund_info("XYZ", &value).unwrap();
        assert!(info.category.is_none());
    }

    #[test]
    fn test_cache_file_name_is_filesystem_safe() {
        let name = cache_file_name(
            "^GSPC",
            NaiveDate::from_ymd_opt(2022, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 7, 31).unwrap(),
        );
        assert_eq!(name, "_GSPC_20220101_20240731.json");
    }

    #[test]
    fn test_new_mock_is_reproducible() {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let a = StockData::new_mock("SPY", start, 50, 0.0005, 0.01, 7);
        let b = StockData::new_mock("SPY", start, 50, 0.0005, 0.01, 7);
        assert_eq!(a.history, b.history);
        assert!(a.history.iter().all(|c| c.close > 0.0));
    }
}
