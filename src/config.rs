use chrono::NaiveDate;
use rayon::ThreadPoolBuilder;
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;
use tracing::{info, warn};

static RAYON_INIT: OnceLock<()> = OnceLock::new();

pub fn init_cpu_parallelism() {
    RAYON_INIT.get_or_init(|| {
        let num_threads = num_cpus::get().max(1);
        match ThreadPoolBuilder::new().num_threads(num_threads).build_global() {
            Ok(_) => info!(
                "Initialized Rayon thread pool with {} threads (all logical CPU cores)",
                num_threads
            ),
            Err(e) => warn!(
                "Rayon thread pool already initialized or unavailable ({}). Using existing configuration.",
                e
            ),
        }
    });
}

/// Trading days per year used for every annualized figure.
pub const TRADING_DAYS: f64 = 252.0;
/// Annual risk-free rate assumed by alpha and the risk-adjusted Sharpe variants.
pub const RISK_FREE_RATE: f64 = 0.02;
/// Monte Carlo portfolios drawn for the frontier sketch.
pub const FRONTIER_SAMPLES: usize = 10_000;
/// Upper bound on sample counts accepted from API requests.
pub const MAX_FRONTIER_SAMPLES: usize = 100 * FRONTIER_SAMPLES;
/// Samples generated per RNG stream; fixes the output independent of thread count.
pub const FRONTIER_CHUNK: usize = 1_024;
pub const DEFAULT_SEED: u64 = 42;
pub const DEFAULT_BENCHMARK: &str = "^GSPC";
pub const FETCH_TIMEOUT_SECS: u64 = 20;

// ── Solver Settings ─────────────────────────────────────────────────────────
pub const SOLVER_MAX_ITERATIONS: usize = 2_000;
/// Largest accepted KKT violation, relative to the gradient's largest component.
pub const SOLVER_TOLERANCE: f64 = 1e-6;
/// A stalled line search still counts as converged within this multiple of the tolerance.
pub const SOLVER_STALL_FACTOR: f64 = 1e3;
/// Armijo sufficient-increase constant.
pub const SOLVER_ARMIJO: f64 = 1e-4;
pub const SOLVER_MIN_STEP: f64 = 1e-14;
/// Below this annualized volatility a Sharpe ratio is treated as undefined.
pub const MIN_VOLATILITY: f64 = 1e-12;

pub const DEFAULT_START_DATE: &str = "2022-01-01";
pub const DEFAULT_END_DATE: &str = "2024-07-31";

pub fn parse_date(s: &str) -> Result<NaiveDate, chrono::ParseError> {
    NaiveDate::parse_from_str(s.trim(), "%Y-%m-%d")
}

/// Tunables for one analysis pass. Defaults come from the constants above,
/// overridden by `ETF_LENS_*` environment variables.
#[derive(Clone, Debug)]
pub struct AnalysisConfig {
    pub risk_free_rate: f64,
    pub fetch_timeout: Duration,
    pub frontier_samples: usize,
    pub seed: u64,
    pub benchmark: String,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            risk_free_rate: RISK_FREE_RATE,
            fetch_timeout: Duration::from_secs(FETCH_TIMEOUT_SECS),
            frontier_samples: FRONTIER_SAMPLES,
            seed: DEFAULT_SEED,
            benchmark: DEFAULT_BENCHMARK.to_string(),
        }
    }
}

impl AnalysisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            risk_free_rate: env_or("ETF_LENS_RISK_FREE_RATE", defaults.risk_free_rate),
            fetch_timeout: Duration::from_secs(env_or(
                "ETF_LENS_FETCH_TIMEOUT_SECS",
                FETCH_TIMEOUT_SECS,
            )),
            frontier_samples: env_or("ETF_LENS_FRONTIER_SAMPLES", defaults.frontier_samples),
            seed: env_or("ETF_LENS_SEED", defaults.seed),
            benchmark: std::env::var("ETF_LENS_BENCHMARK")
                .ok()
                .map(|v| v.trim().to_uppercase())
                .filter(|v| !v.is_empty())
                .unwrap_or(defaults.benchmark),
        }
    }
}

fn env_or<T: FromStr + Copy + std::fmt::Display>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(v) => v,
            Err(_) => {
                warn!("Ignoring unparsable {}={} ; using default {}", key, raw, default);
                default
            }
        },
        Err(_) => default,
    }
}
