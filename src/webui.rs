use crate::config::{AnalysisConfig, MAX_FRONTIER_SAMPLES};
use crate::data::MarketData;
use crate::error::AnalysisError;
use crate::etf;
use crate::narrative::{self, NarrativeClient, RiskProfile};
use crate::portfolio::{self, AnalysisRequest, Portfolio, PortfolioReport, Position};
use crate::returns;
use anyhow::Result;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

struct WebState<M> {
    source: Arc<M>,
    config: AnalysisConfig,
    default_period: (NaiveDate, NaiveDate),
    narrative: Arc<NarrativeClient>,
    portfolio: Arc<Mutex<PortfolioRuntimeState>>,
}

impl<M> Clone for WebState<M> {
    fn clone(&self) -> Self {
        Self {
            source: Arc::clone(&self.source),
            config: self.config.clone(),
            default_period: self.default_period,
            narrative: Arc::clone(&self.narrative),
            portfolio: Arc::clone(&self.portfolio),
        }
    }
}

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[derive(Clone, Debug, Serialize)]
struct ApiError {
    error: String,
    kind: String,
}

#[derive(Clone, Debug, Serialize, Default)]
struct PortfolioRuntimeState {
    portfolio: Portfolio,
    last_report: Option<PortfolioReport>,
    last_error: Option<String>,
    updated_at: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct ConfigView {
    benchmark: String,
    risk_free_rate: f64,
    frontier_samples: usize,
    seed: u64,
    default_start: NaiveDate,
    default_end: NaiveDate,
    narrative_enabled: bool,
}

#[derive(Clone, Debug, Serialize)]
struct FullUiState {
    portfolio: PortfolioRuntimeState,
    config: ConfigView,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct Period {
    start: Option<NaiveDate>,
    end: Option<NaiveDate>,
}

#[derive(Clone, Debug, Deserialize)]
struct EtfRequest {
    ticker: String,
    #[serde(flatten)]
    period: Period,
    benchmark: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct EtfResponse {
    summary: etf::EtfSummary,
    benchmark: String,
    risk: Option<etf::BenchmarkRisk>,
    risk_error: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
struct CompareRequest {
    tickers: Vec<String>,
    #[serde(flatten)]
    period: Period,
}

#[derive(Clone, Debug, Deserialize)]
struct TickerRequest {
    ticker: String,
    #[serde(flatten)]
    period: Period,
}

#[derive(Clone, Debug, Deserialize)]
struct PositionRequest {
    ticker: String,
    shares: Option<u64>,
    price: Option<f64>,
    weight: Option<f64>,
}

#[derive(Clone, Debug, Deserialize)]
struct PositionEdit {
    shares: Option<u64>,
    price: Option<f64>,
    weight: Option<f64>,
}

#[derive(Clone, Debug, Default, Deserialize)]
struct AnalyzeRequest {
    #[serde(flatten)]
    period: Period,
    benchmark: Option<String>,
    samples: Option<usize>,
    seed: Option<u64>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
enum SummaryKind {
    Performance,
    Risk,
    Factors,
    Compare,
    Macro,
    Recommendation,
    Prediction,
    Portfolio,
}

#[derive(Clone, Debug, Deserialize)]
struct SummaryRequest {
    kind: SummaryKind,
    #[serde(default)]
    data: serde_json::Value,
    risk_profile: Option<RiskProfile>,
    market_conditions: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
struct SummaryResponse {
    summary: Option<String>,
    configured: bool,
}

pub async fn run_webui_server<M>(
    port: u16,
    source: M,
    config: AnalysisConfig,
    default_period: (NaiveDate, NaiveDate),
    narrative: NarrativeClient,
) -> Result<()>
where
    M: MarketData + Send + Sync + 'static,
{
    let state = WebState {
        source: Arc::new(source),
        config,
        default_period,
        narrative: Arc::new(narrative),
        portfolio: Arc::new(Mutex::new(PortfolioRuntimeState::default())),
    };

    let app = router(state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    info!("WebUI listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn router<M>(state: WebState<M>) -> Router
where
    M: MarketData + Send + Sync + 'static,
{
    Router::new()
        .route("/api/health", get(health))
        .route("/api/state", get(full_state::<M>))
        .route("/api/etf", post(analyze_etf::<M>))
        .route("/api/compare", post(compare::<M>))
        .route("/api/factors", post(factors::<M>))
        .route("/api/macro", post(macro_correlation::<M>))
        .route(
            "/api/portfolio/positions",
            get(list_positions::<M>).post(add_position::<M>),
        )
        .route(
            "/api/portfolio/positions/:ticker",
            put(edit_position::<M>).delete(remove_position::<M>),
        )
        .route("/api/portfolio/analyze", post(analyze::<M>))
        .route("/api/summary", post(summary::<M>))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn full_state<M>(State(state): State<WebState<M>>) -> ApiResult<FullUiState> {
    let (default_start, default_end) = state.default_period;
    Ok(Json(FullUiState {
        portfolio: state.portfolio.lock().await.clone(),
        config: ConfigView {
            benchmark: state.config.benchmark.clone(),
            risk_free_rate: state.config.risk_free_rate,
            frontier_samples: state.config.frontier_samples,
            seed: state.config.seed,
            default_start,
            default_end,
            narrative_enabled: state.narrative.is_configured(),
        },
    }))
}

fn resolve_period<M>(
    state: &WebState<M>,
    period: &Period,
) -> Result<(NaiveDate, NaiveDate), (StatusCode, Json<ApiError>)> {
    let start = period.start.unwrap_or(state.default_period.0);
    let end = period.end.unwrap_or(state.default_period.1);
    if start >= end {
        return Err(api_err(StatusCode::BAD_REQUEST, "start must be before end"));
    }
    Ok((start, end))
}

fn normalized_ticker(raw: &str) -> Result<String, (StatusCode, Json<ApiError>)> {
    let ticker = raw.trim().to_uppercase();
    if ticker.is_empty() {
        return Err(api_err(StatusCode::BAD_REQUEST, "ticker is required"));
    }
    Ok(ticker)
}

async fn analyze_etf<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<EtfRequest>,
) -> ApiResult<EtfResponse>
where
    M: MarketData + Send + Sync + 'static,
{
    let ticker = normalized_ticker(&req.ticker)?;
    let (start, end) = resolve_period(&state, &req.period)?;
    let benchmark = match req.benchmark.as_deref() {
        Some(b) => normalized_ticker(b)?,
        None => state.config.benchmark.clone(),
    };
    let timeout = state.config.fetch_timeout;

    let (history, bench_history) = tokio::join!(
        returns::fetch_history(state.source.as_ref(), &ticker, start, end, timeout),
        returns::fetch_history(state.source.as_ref(), &benchmark, start, end, timeout),
    );
    let history = history.map_err(analysis_err)?;
    let summary = etf::analyze_etf(&ticker, &history, state.config.risk_free_rate).map_err(analysis_err)?;

    let risk = bench_history.and_then(|b| {
        etf::analyze_risk_and_benchmark(&history, &b, state.config.risk_free_rate)
    });
    let (risk, risk_error) = match risk {
        Ok(r) => (Some(r), None),
        Err(e) => {
            warn!("Benchmark analysis for {} failed: {}", ticker, e);
            (None, Some(e.to_string()))
        }
    };

    Ok(Json(EtfResponse {
        summary,
        benchmark,
        risk,
        risk_error,
    }))
}

async fn compare<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<CompareRequest>,
) -> ApiResult<etf::ComparisonReport>
where
    M: MarketData + Send + Sync + 'static,
{
    let (start, end) = resolve_period(&state, &req.period)?;
    etf::compare_etfs(state.source.as_ref(), &req.tickers, start, end, &state.config)
        .await
        .map(Json)
        .map_err(analysis_err)
}

async fn factors<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<TickerRequest>,
) -> ApiResult<etf::FactorExposure>
where
    M: MarketData + Send + Sync + 'static,
{
    let ticker = normalized_ticker(&req.ticker)?;
    let (start, end) = resolve_period(&state, &req.period)?;
    etf::analyze_factor_exposure(state.source.as_ref(), &ticker, start, end, &state.config)
        .await
        .map(Json)
        .map_err(analysis_err)
}

async fn macro_correlation<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<TickerRequest>,
) -> ApiResult<etf::MacroCorrelation>
where
    M: MarketData + Send + Sync + 'static,
{
    let ticker = normalized_ticker(&req.ticker)?;
    let (start, end) = resolve_period(&state, &req.period)?;
    etf::analyze_macro_correlation(state.source.as_ref(), &ticker, start, end, &state.config)
        .await
        .map(Json)
        .map_err(analysis_err)
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio editing
// ──────────────────────────────────────────────────────────────────────────────

async fn list_positions<M>(State(state): State<WebState<M>>) -> ApiResult<Vec<Position>> {
    Ok(Json(state.portfolio.lock().await.portfolio.positions().to_vec()))
}

async fn add_position<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<PositionRequest>,
) -> ApiResult<Vec<Position>> {
    let mut ps = state.portfolio.lock().await;
    let result = match (req.shares, req.price, req.weight) {
        (Some(shares), Some(price), None) => ps.portfolio.add_shares(&req.ticker, shares, price),
        (None, None, Some(weight)) => ps.portfolio.add_weight(&req.ticker, weight),
        _ => {
            return Err(api_err(
                StatusCode::BAD_REQUEST,
                "provide either shares and price, or weight",
            ));
        }
    };
    result.map_err(analysis_err)?;
    ps.last_report = None;
    Ok(Json(ps.portfolio.positions().to_vec()))
}

async fn edit_position<M>(
    State(state): State<WebState<M>>,
    Path(ticker): Path<String>,
    Json(req): Json<PositionEdit>,
) -> ApiResult<Vec<Position>> {
    let mut ps = state.portfolio.lock().await;
    let result = match (req.shares, req.price, req.weight) {
        (Some(shares), Some(price), None) => ps.portfolio.edit_shares(&ticker, shares, price),
        (None, None, Some(weight)) => ps.portfolio.edit_weight(&ticker, weight),
        _ => {
            return Err(api_err(
                StatusCode::BAD_REQUEST,
                "provide either shares and price, or weight",
            ));
        }
    };
    result.map_err(analysis_err)?;
    ps.last_report = None;
    Ok(Json(ps.portfolio.positions().to_vec()))
}

async fn remove_position<M>(
    State(state): State<WebState<M>>,
    Path(ticker): Path<String>,
) -> ApiResult<Vec<Position>> {
    let mut ps = state.portfolio.lock().await;
    ps.portfolio.remove(&ticker).map_err(analysis_err)?;
    ps.last_report = None;
    Ok(Json(ps.portfolio.positions().to_vec()))
}

async fn analyze<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<AnalyzeRequest>,
) -> ApiResult<PortfolioReport>
where
    M: MarketData + Send + Sync + 'static,
{
    let (start, end) = resolve_period(&state, &req.period)?;
    let mut config = state.config.clone();
    if let Some(b) = req.benchmark.as_deref() {
        config.benchmark = normalized_ticker(b)?;
    }
    if let Some(samples) = req.samples {
        if samples > MAX_FRONTIER_SAMPLES {
            return Err(api_err(
                StatusCode::BAD_REQUEST,
                &format!("samples must be at most {}", MAX_FRONTIER_SAMPLES),
            ));
        }
        config.frontier_samples = samples;
    }
    if let Some(seed) = req.seed {
        config.seed = seed;
    }

    // Analyze a snapshot so edits are not blocked while prices download.
    let snapshot = state.portfolio.lock().await.portfolio.clone();
    let request = AnalysisRequest { start, end, config };
    let result = portfolio::analyze_portfolio(state.source.as_ref(), &snapshot, &request).await;

    let mut ps = state.portfolio.lock().await;
    ps.updated_at = Some(chrono::Local::now().to_rfc3339());
    match result {
        Ok(report) => {
            // Only keep the report if the portfolio did not change underneath it.
            ps.last_report = (ps.portfolio == snapshot).then(|| report.clone());
            ps.last_error = None;
            Ok(Json(report))
        }
        Err(e) => {
            ps.last_error = Some(e.to_string());
            Err(analysis_err(e))
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Narrative summary
// ──────────────────────────────────────────────────────────────────────────────

fn build_prompt(
    kind: SummaryKind,
    data: &serde_json::Value,
    risk_profile: Option<RiskProfile>,
    market_conditions: Option<&str>,
) -> Result<String, &'static str> {
    if data.is_null() {
        return Err("data is required");
    }
    Ok(match kind {
        SummaryKind::Performance => narrative::etf_performance_prompt(data),
        SummaryKind::Risk => narrative::risk_prompt(data),
        SummaryKind::Factors => narrative::factor_prompt(data),
        SummaryKind::Compare => narrative::comparison_prompt(data),
        SummaryKind::Macro => narrative::macro_prompt(data),
        SummaryKind::Recommendation => {
            narrative::recommendation_prompt(data, risk_profile.unwrap_or_default())
        }
        SummaryKind::Prediction => {
            let conditions = market_conditions
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .ok_or("market_conditions is required for a prediction")?;
            narrative::prediction_prompt(data, conditions)
        }
        SummaryKind::Portfolio => narrative::portfolio_prompt(data),
    })
}

async fn summary<M>(
    State(state): State<WebState<M>>,
    Json(req): Json<SummaryRequest>,
) -> ApiResult<SummaryResponse> {
    let mut data = req.data;
    if data.is_null() && matches!(req.kind, SummaryKind::Portfolio) {
        if let Some(report) = state.portfolio.lock().await.last_report.as_ref() {
            data = serde_json::to_value(report).map_err(internal_err)?;
        }
    }

    let prompt = build_prompt(req.kind, &data, req.risk_profile, req.market_conditions.as_deref())
        .map_err(|msg| api_err(StatusCode::BAD_REQUEST, msg))?;

    Ok(Json(SummaryResponse {
        summary: state.narrative.summarize(&prompt).await,
        configured: state.narrative.is_configured(),
    }))
}

// ──────────────────────────────────────────────────────────────────────────────
// Errors
// ──────────────────────────────────────────────────────────────────────────────

fn api_err(status: StatusCode, message: &str) -> (StatusCode, Json<ApiError>) {
    (
        status,
        Json(ApiError {
            error: message.to_string(),
            kind: "bad_request".to_string(),
        }),
    )
}

fn analysis_err(err: AnalysisError) -> (StatusCode, Json<ApiError>) {
    let status = match &err {
        AnalysisError::InvalidPosition { .. } => StatusCode::BAD_REQUEST,
        AnalysisError::FetchFailure { .. } => StatusCode::BAD_GATEWAY,
        AnalysisError::EmptyDataset { .. } | AnalysisError::DegenerateInput { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ApiError {
            error: err.to_string(),
            kind: err.kind().to_string(),
        }),
    )
}

fn internal_err<E: std::fmt::Display>(err: E) -> (StatusCode, Json<ApiError>) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiError {
            error: err.to_string(),
            kind: "internal".to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::StockData;
    use crate::data::mock::{MockMarketData, day};

    fn test_state() -> WebState<MockMarketData> {
        let start = day(2023, 1, 1);
        let source = MockMarketData::default()
            .with_stock(StockData::new_mock("SPY", start, 120, 0.0005, 0.011, 1))
            .with_stock(StockData::new_mock("AGG", start, 120, 0.0001, 0.004, 2))
            .with_stock(StockData::new_mock("^GSPC", start, 120, 0.0004, 0.010, 3))
            .with_category("SPY", Some("Large Blend"));
        let narrative = NarrativeClient::from_env().unwrap();
        WebState {
            source: Arc::new(source),
            config: AnalysisConfig {
                frontier_samples: 200,
                ..AnalysisConfig::default()
            },
            default_period: (start, day(2023, 12, 31)),
            narrative: Arc::new(narrative),
            portfolio: Arc::new(Mutex::new(PortfolioRuntimeState::default())),
        }
    }

    fn weight(ticker: &str, w: f64) -> Json<PositionRequest> {
        Json(PositionRequest {
            ticker: ticker.to_string(),
            shares: None,
            price: None,
            weight: Some(w),
        })
    }

    #[tokio::test]
    async fn test_position_edits_keep_weights_normalized() {
        let state = test_state();

        add_position(State(state.clone()), weight("spy", 3.0)).await.unwrap();
        let Json(positions) = add_position(State(state.clone()), weight("AGG", 1.0)).await.unwrap();
        assert_eq!(positions.len(), 2);
        assert!((positions[0].weight - 0.75).abs() < 1e-12);

        let edit = PositionEdit {
            shares: None,
            price: None,
            weight: Some(3.0),
        };
        let Json(positions) = edit_position(State(state.clone()), Path("AGG".to_string()), Json(edit))
            .await
            .unwrap();
        assert!((positions[1].weight - 0.5).abs() < 1e-12);

        let Json(positions) = remove_position(State(state.clone()), Path("SPY".to_string()))
            .await
            .unwrap();
        assert_eq!(positions.len(), 1);
        assert!((positions[0].weight - 1.0).abs() < 1e-12);
    }

    #[tokio::test]
    async fn test_invalid_position_is_bad_request() {
        let state = test_state();
        let (status, Json(body)) = add_position(State(state.clone()), weight("SPY", -1.0))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body.kind, "invalid_position");

        let (status, _) = remove_position(State(state), Path("NOPE".to_string()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_analyze_stores_report() {
        let state = test_state();
        add_position(State(state.clone()), weight("SPY", 0.6)).await.unwrap();
        add_position(State(state.clone()), weight("AGG", 0.4)).await.unwrap();

        let Json(report) = analyze(State(state.clone()), Json(AnalyzeRequest::default()))
            .await
            .unwrap();
        assert_eq!(report.frontier.len(), 200);
        assert!(report.optimal.is_some());

        let Json(full) = full_state(State(state)).await.unwrap();
        assert!(full.portfolio.last_report.is_some());
        assert!(full.portfolio.last_error.is_none());
    }

    #[tokio::test]
    async fn test_analyze_empty_portfolio_is_unprocessable() {
        let state = test_state();
        let (status, Json(body)) = analyze(State(state.clone()), Json(AnalyzeRequest::default()))
            .await
            .unwrap_err();
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body.kind, "empty_dataset");
        assert!(state.portfolio.lock().await.last_error.is_some());
    }

    #[tokio::test]
    async fn test_oversized_sample_count_is_rejected() {
        let state = test_state();
        add_position(State(state.clone()), weight("SPY", 1.0)).await.unwrap();

        let req = AnalyzeRequest {
            samples: Some(10_000_000_000),
            ..AnalyzeRequest::default()
        };
        let (status, Json(body)) = analyze(State(state.clone()), Json(req)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.error.contains("samples"));
        assert!(state.portfolio.lock().await.last_report.is_none());
    }

    #[tokio::test]
    async fn test_etf_endpoint_reports_benchmark_failure_inline() {
        let state = test_state();
        let req = EtfRequest {
            ticker: "spy".to_string(),
            period: Period::default(),
            benchmark: Some("MISSING".to_string()),
        };
        let Json(resp) = analyze_etf(State(state), Json(req)).await.unwrap();
        assert_eq!(resp.summary.ticker, "SPY");
        assert!(resp.risk.is_none());
        assert!(resp.risk_error.is_some());
    }

    #[tokio::test]
    async fn test_reversed_period_is_rejected() {
        let state = test_state();
        let req = TickerRequest {
            ticker: "SPY".to_string(),
            period: Period {
                start: Some(day(2023, 6, 1)),
                end: Some(day(2023, 1, 1)),
            },
        };
        let (status, _) = factors(State(state), Json(req)).await.unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_prediction_prompt_needs_conditions() {
        let data = serde_json::json!({"ticker": "SPY"});
        assert!(build_prompt(SummaryKind::Prediction, &data, None, Some("  ")).is_err());
        assert!(build_prompt(SummaryKind::Prediction, &data, None, Some("rates falling")).is_ok());
        assert!(build_prompt(SummaryKind::Risk, &serde_json::Value::Null, None, None).is_err());

        let p = build_prompt(SummaryKind::Recommendation, &data, None, None).unwrap();
        assert!(p.contains("neutral risk profile"));
    }

    #[test]
    fn test_router_builds() {
        let _ = router(test_state());
    }
}
