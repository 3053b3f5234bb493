use crate::config::{
    AnalysisConfig, FRONTIER_CHUNK, MIN_VOLATILITY, SOLVER_ARMIJO, SOLVER_MAX_ITERATIONS,
    SOLVER_MIN_STEP, SOLVER_STALL_FACTOR, SOLVER_TOLERANCE, TRADING_DAYS,
};
use crate::error::{AnalysisError, AnalysisResult};
use crate::returns::{self, AlignedReturns, ReturnSet};
use crate::stats;
use rand::{Rng, SeedableRng};
use rand::rngs::StdRng;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{debug, info, warn};

// ──────────────────────────────────────────────────────────────────────────────
// Data Structures
// ──────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Debug)]
pub struct OptimizerConfig {
    /// Random portfolios drawn for the frontier sketch.
    pub samples: usize,
    pub seed: u64,
    pub max_iterations: usize,
    /// Largest violation of the first-order optimality conditions accepted
    /// as converged, relative to the gradient's magnitude.
    pub tolerance: f64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::from(&AnalysisConfig::default())
    }
}

impl From<&AnalysisConfig> for OptimizerConfig {
    fn from(cfg: &AnalysisConfig) -> Self {
        Self {
            samples: cfg.frontier_samples,
            seed: cfg.seed,
            max_iterations: SOLVER_MAX_ITERATIONS,
            tolerance: SOLVER_TOLERANCE,
        }
    }
}

/// One random portfolio of the frontier sketch (annualized figures).
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct FrontierSample {
    pub volatility: f64,
    pub annual_return: f64,
    pub sharpe: f64,
}

/// Solver output: one weight per ticker on the unit simplex.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct OptimalPortfolio {
    pub tickers: Vec<String>,
    pub weights: Vec<f64>,
    pub annual_return: f64,
    pub annual_volatility: f64,
    pub sharpe_ratio: f64,
    pub iterations: usize,
    pub converged: bool,
}

#[allow(dead_code)]
#[derive(Clone, Debug, Serialize)]
pub struct FrontierResult {
    pub samples: Vec<FrontierSample>,
    pub optimal: OptimalPortfolio,
}

/// Mean daily return vector and sample covariance matrix of aligned returns.
#[derive(Clone, Debug)]
pub struct ReturnStatistics {
    pub tickers: Vec<String>,
    pub means: Vec<f64>,
    pub cov: Vec<Vec<f64>>,
}

impl ReturnStatistics {
    pub fn from_aligned(aligned: &AlignedReturns) -> AnalysisResult<Self> {
        if aligned.len() < 2 {
            return Err(AnalysisError::degenerate(
                "covariance matrix",
                "fewer than two aligned observations",
            ));
        }
        let means = aligned
            .columns
            .iter()
            .map(|c| stats::mean(c).unwrap_or(0.0))
            .collect();
        Ok(Self {
            tickers: aligned.tickers.clone(),
            means,
            cov: stats::covariance_matrix(&aligned.columns),
        })
    }

    pub fn len(&self) -> usize {
        self.means.len()
    }

    /// `(annual return, annual volatility)` of a weight vector.
    pub fn annualized(&self, weights: &[f64]) -> (f64, f64) {
        let ret = portfolio_return(weights, &self.means) * TRADING_DAYS;
        let vol = (portfolio_variance(weights, &self.cov).max(0.0) * TRADING_DAYS).sqrt();
        (ret, vol)
    }

    /// Annualized Sharpe (no risk-free term), `None` when volatility is zero.
    fn sharpe(&self, weights: &[f64]) -> Option<f64> {
        let (ret, vol) = self.annualized(weights);
        let s = ret / vol;
        (vol >= MIN_VOLATILITY && s.is_finite()).then_some(s)
    }

    /// Gradient of the annualized Sharpe ratio with respect to the weights:
    /// `√252 · (μ/σ − (μ·w) Σw / σ³)` with σ the daily volatility.
    fn sharpe_gradient(&self, weights: &[f64]) -> Vec<f64> {
        let sigma_w = mat_vec_mul(&self.cov, weights);
        let var = dot(weights, &sigma_w).max(f64::MIN_POSITIVE);
        let vol = var.sqrt();
        let ret = dot(weights, &self.means);
        let scale = TRADING_DAYS.sqrt();
        self.means
            .iter()
            .zip(&sigma_w)
            .map(|(m, sw)| scale * (m / vol - ret * sw / (var * vol)))
            .collect()
    }

    fn portfolio(&self, weights: Vec<f64>, iterations: usize, converged: bool) -> OptimalPortfolio {
        let (annual_return, annual_volatility) = self.annualized(&weights);
        OptimalPortfolio {
            tickers: self.tickers.clone(),
            sharpe_ratio: if annual_volatility >= MIN_VOLATILITY {
                annual_return / annual_volatility
            } else {
                0.0
            },
            weights,
            annual_return,
            annual_volatility,
            iterations,
            converged,
        }
    }
}

// ──────────────────────────────────────────────────────────────────────────────
// Portfolio Variance Helper
// ──────────────────────────────────────────────────────────────────────────────

fn portfolio_return(weights: &[f64], means: &[f64]) -> f64 {
    dot(weights, means)
}

fn portfolio_variance(weights: &[f64], cov: &[Vec<f64>]) -> f64 {
    dot(weights, &mat_vec_mul(cov, weights))
}

fn mat_vec_mul(matrix: &[Vec<f64>], v: &[f64]) -> Vec<f64> {
    matrix.iter().map(|row| dot(row, v)).collect()
}

fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

// ──────────────────────────────────────────────────────────────────────────────
// Monte Carlo Frontier Sketch
// ──────────────────────────────────────────────────────────────────────────────

/// Independent U(0,1) draws normalized to sum to one. This over-samples the
/// middle of the simplex; good enough for a picture, not a uniform sampler.
fn generate_random_weights(n: usize, rng: &mut impl Rng) -> Option<Vec<f64>> {
    let raw: Vec<f64> = (0..n).map(|_| rng.gen_range(0.0..1.0)).collect();
    let sum: f64 = raw.iter().sum();
    (sum > 0.0).then(|| raw.iter().map(|v| v / sum).collect())
}

fn chunk_seed(seed: u64, chunk: usize) -> u64 {
    seed ^ (chunk as u64 + 1).wrapping_mul(0x9E37_79B9_7F4A_7C15)
}

/// Draws `samples` random portfolios and evaluates each one.
///
/// Work is split into fixed-size chunks with their own RNG stream, so the
/// result depends only on `seed`, never on the rayon thread count. Draws
/// with zero volatility have no Sharpe ratio and are left out.
pub fn sample_frontier(stats: &ReturnStatistics, samples: usize, seed: u64) -> Vec<FrontierSample> {
    let n = stats.len();
    if n == 0 || samples == 0 {
        return Vec::new();
    }

    let chunks = samples.div_ceil(FRONTIER_CHUNK);
    let out: Vec<FrontierSample> = (0..chunks)
        .into_par_iter()
        .map(|chunk| {
            let mut rng = StdRng::seed_from_u64(chunk_seed(seed, chunk));
            let count = FRONTIER_CHUNK.min(samples - chunk * FRONTIER_CHUNK);
            (0..count)
                .filter_map(|_| {
                    let weights = generate_random_weights(n, &mut rng)?;
                    let (annual_return, volatility) = stats.annualized(&weights);
                    let sharpe = annual_return / volatility;
                    (volatility >= MIN_VOLATILITY && sharpe.is_finite()).then_some(FrontierSample {
                        volatility,
                        annual_return,
                        sharpe,
                    })
                })
                .collect::<Vec<_>>()
        })
        .collect::<Vec<_>>()
        .into_iter()
        .flatten()
        .collect();

    debug!("Frontier sketch: {} of {} samples usable", out.len(), samples);
    out
}

// ──────────────────────────────────────────────────────────────────────────────
// Optimizer: Maximum Sharpe on the Simplex
// ──────────────────────────────────────────────────────────────────────────────

/// Euclidean projection onto `{w : w ≥ 0, Σw = 1}`.
fn project_simplex(v: &[f64]) -> Vec<f64> {
    let mut u = v.to_vec();
    u.sort_by(|a, b| b.total_cmp(a));

    let mut cssv = 0.0;
    let mut theta = 0.0;
    for (i, ui) in u.iter().enumerate() {
        cssv += ui;
        let t = (cssv - 1.0) / (i as f64 + 1.0);
        if ui - t > 0.0 {
            theta = t;
        }
    }

    let mut w: Vec<f64> = v.iter().map(|x| (x - theta).max(0.0)).collect();
    let sum: f64 = w.iter().sum();
    if sum > 0.0 {
        w.iter_mut().for_each(|x| *x /= sum);
    } else {
        let n = w.len() as f64;
        w.iter_mut().for_each(|x| *x = 1.0 / n);
    }
    w
}

/// Violation of the simplex KKT conditions for maximization: every weight in
/// the support must share one gradient value λ, and no weight outside the
/// support may have a gradient above λ.
fn kkt_residual(weights: &[f64], grad: &[f64]) -> f64 {
    const SUPPORT: f64 = 1e-12;
    let (num, den) = weights
        .iter()
        .zip(grad)
        .filter(|(w, _)| **w > SUPPORT)
        .fold((0.0, 0.0), |(n, d), (w, g)| (n + w * g, d + w));
    let lambda = if den > 0.0 { num / den } else { 0.0 };

    weights
        .iter()
        .zip(grad)
        .map(|(w, g)| {
            if *w > SUPPORT {
                (g - lambda).abs()
            } else {
                (g - lambda).max(0.0)
            }
        })
        .fold(0.0, f64::max)
}

/// Maximizes `(μ·w·252) / √(wᵀΣw·252)` subject to `Σw = 1`, `0 ≤ wᵢ ≤ 1`.
///
/// Projected gradient ascent from the equal-weight portfolio with Armijo
/// backtracking. Projection keeps every iterate exactly feasible, and Σ is
/// never inverted, so a singular covariance matrix slows the search down
/// but cannot blow it up.
pub fn max_sharpe_portfolio(stats: &ReturnStatistics, cfg: &OptimizerConfig) -> AnalysisResult<OptimalPortfolio> {
    let n = stats.len();
    if n == 0 {
        return Err(AnalysisError::empty("optimizer input"));
    }
    if n == 1 {
        let (_, vol) = stats.annualized(&[1.0]);
        if vol < MIN_VOLATILITY {
            return Err(AnalysisError::degenerate("sharpe ratio", "single asset has zero volatility"));
        }
        return Ok(stats.portfolio(vec![1.0], 0, true));
    }

    let mut w = vec![1.0 / n as f64; n];
    let mut f = stats.sharpe(&w).ok_or_else(|| {
        AnalysisError::degenerate("sharpe ratio", "equal-weight portfolio has zero volatility")
    })?;

    let mut step: f64 = 1.0;
    let mut residual = f64::INFINITY;
    let mut iterations = 0;

    for iteration in 0..cfg.max_iterations {
        iterations = iteration;
        let grad = stats.sharpe_gradient(&w);
        if grad.iter().any(|g| !g.is_finite()) {
            warn!("Non-finite Sharpe gradient at iteration {}", iteration);
            break;
        }

        let grad_scale = grad.iter().fold(1.0_f64, |m, g| m.max(g.abs()));
        residual = kkt_residual(&w, &grad);
        if residual <= cfg.tolerance * grad_scale {
            debug!("Max-Sharpe solver converged after {} iterations", iteration);
            return Ok(stats.portfolio(w, iteration, true));
        }

        // Backtracking line search along the projected arc.
        let mut t = (step * 2.0).min(1e6);
        let mut accepted = None;
        while t >= SOLVER_MIN_STEP {
            let candidate: Vec<f64> = w.iter().zip(&grad).map(|(wi, gi)| wi + t * gi).collect();
            let candidate = project_simplex(&candidate);
            let ascent: f64 = grad
                .iter()
                .zip(candidate.iter().zip(&w))
                .map(|(g, (c, wi))| g * (c - wi))
                .sum();

            if let Some(fc) = stats.sharpe(&candidate) {
                if fc >= f + SOLVER_ARMIJO * ascent {
                    accepted = Some((candidate, fc));
                    break;
                }
            }
            t *= 0.5;
        }

        match accepted {
            Some((candidate, fc)) => {
                w = candidate;
                f = fc;
                step = t;
                iterations = iteration + 1;
            }
            None if residual <= SOLVER_STALL_FACTOR * cfg.tolerance * grad_scale => {
                // No representable ascent step left; the gradient noise floor is reached.
                debug!(
                    "Max-Sharpe line search stalled at iteration {} within tolerance (KKT residual {:.3e})",
                    iteration, residual
                );
                return Ok(stats.portfolio(w, iteration, true));
            }
            None => {
                warn!(
                    "Max-Sharpe line search stalled at iteration {} (KKT residual {:.3e})",
                    iteration, residual
                );
                break;
            }
        }
    }

    Err(AnalysisError::OptimizationFailed {
        reason: format!(
            "KKT residual {:.3e} above tolerance after {} iterations",
            residual, iterations
        ),
        best_effort: Box::new(stats.portfolio(w, iterations, false)),
    })
}

/// Frontier sketch plus the numerically optimal max-Sharpe weights.
/// Stored weights in the return set are ignored; the search starts fresh.
#[allow(dead_code)]
pub fn optimize_portfolio(set: &ReturnSet, cfg: &OptimizerConfig) -> AnalysisResult<FrontierResult> {
    let aligned = returns::align(set)?;
    let stats = ReturnStatistics::from_aligned(&aligned)?;

    info!(
        "Optimizing portfolio with {} assets over {} days, {} random samples...",
        stats.len(),
        aligned.len(),
        cfg.samples
    );

    let samples = sample_frontier(&stats, cfg.samples, cfg.seed);
    let optimal = max_sharpe_portfolio(&stats, cfg)?;
    Ok(FrontierResult { samples, optimal })
}

// ──────────────────────────────────────────────────────────────────────────────
// Tests
// ──────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::mock::day;
    use crate::data::StockData;
    use crate::returns::ReturnSeries;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn mock_set(n: usize, days: usize) -> ReturnSet {
        let symbols = ["AAAA", "BBBB", "CCCC", "DDDD", "EEEE"];
        let mut set = ReturnSet::default();
        for i in 0..n {
            let data = StockData::new_mock(
                symbols[i % symbols.len()],
                day(2023, 1, 1),
                days,
                0.0002 * (i as f64 + 1.0),
                0.01 + 0.004 * i as f64,
                100 + i as u64,
            );
            let returns: ReturnSeries = stats::simple_returns(&data.adj_closes());
            set.insert(&data.symbol, returns, 1.0 / n as f64);
        }
        set
    }

    fn stats_of(set: &ReturnSet) -> ReturnStatistics {
        ReturnStatistics::from_aligned(&returns::align(set).unwrap()).unwrap()
    }

    fn assert_on_simplex(w: &[f64]) {
        assert!(w.iter().all(|x| (0.0..=1.0).contains(x)), "weights out of bounds: {w:?}");
        let sum: f64 = w.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6, "weights sum to {sum}");
    }

    #[test]
    fn test_covariance_matrix_symmetry() {
        let stats = stats_of(&mock_set(3, 120));
        assert_eq!(stats.means.len(), 3);
        for i in 0..3 {
            for j in 0..3 {
                assert!((stats.cov[i][j] - stats.cov[j][i]).abs() < 1e-15);
            }
            assert!(stats.cov[i][i] > 0.0, "Variance should be positive");
        }
    }

    #[test]
    fn test_random_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..100 {
            let w = generate_random_weights(5, &mut rng).unwrap();
            assert_on_simplex(&w);
        }
    }

    #[test]
    fn test_frontier_is_reproducible_for_a_seed() {
        let stats = stats_of(&mock_set(4, 200));
        let a = sample_frontier(&stats, 3_000, 9);
        let b = sample_frontier(&stats, 3_000, 9);
        let c = sample_frontier(&stats, 3_000, 10);

        assert_eq!(a.len(), 3_000);
        assert_eq!(a, b);
        assert_ne!(a, c);
        for s in &a {
            assert_relative_eq!(s.sharpe, s.annual_return / s.volatility, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_single_asset_is_fully_allocated() {
        let stats = stats_of(&mock_set(1, 100));
        let opt = max_sharpe_portfolio(&stats, &OptimizerConfig::default()).unwrap();
        assert_eq!(opt.weights, vec![1.0]);
        assert!(opt.converged);
    }

    #[test]
    fn test_optimum_beats_every_sample() {
        let set = mock_set(4, 250);
        let result = optimize_portfolio(
            &set,
            &OptimizerConfig {
                samples: 5_000,
                ..OptimizerConfig::default()
            },
        )
        .unwrap();

        assert_on_simplex(&result.optimal.weights);
        assert!(result.optimal.converged);
        let best_sample = result
            .samples
            .iter()
            .map(|s| s.sharpe)
            .fold(f64::NEG_INFINITY, f64::max);
        assert!(result.optimal.sharpe_ratio >= best_sample - 1e-6);
    }

    #[test]
    fn test_dominant_asset_takes_everything() {
        // Uncorrelated assets, one with a much better mean/variance trade-off
        // → the tangency portfolio leans heavily on it but stays feasible.
        let stats = ReturnStatistics {
            tickers: vec!["A".into(), "B".into()],
            means: vec![0.001, -0.001],
            cov: vec![vec![0.0001, 0.0], vec![0.0, 0.0001]],
        };
        let opt = max_sharpe_portfolio(&stats, &OptimizerConfig::default()).unwrap();
        assert_relative_eq!(opt.weights[0], 1.0, epsilon = 1e-9);
        assert_relative_eq!(opt.weights[1], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_known_interior_tangency_portfolio() {
        // Diagonal Σ: unconstrained tangency weights ∝ Σ⁻¹μ = [10, 5] → [2/3, 1/3].
        let stats = ReturnStatistics {
            tickers: vec!["A".into(), "B".into()],
            means: vec![0.001, 0.001],
            cov: vec![vec![0.0001, 0.0], vec![0.0, 0.0002]],
        };
        let opt = max_sharpe_portfolio(&stats, &OptimizerConfig::default()).unwrap();
        assert!(opt.converged);
        assert_relative_eq!(opt.weights[0], 2.0 / 3.0, epsilon = 1e-4);
        assert_relative_eq!(opt.weights[1], 1.0 / 3.0, epsilon = 1e-4);
    }

    #[test]
    fn test_identical_assets_do_not_crash() {
        let mut set = ReturnSet::default();
        let data = StockData::new_mock("TWIN", day(2023, 1, 1), 150, 0.0005, 0.01, 3);
        let r = stats::simple_returns(&data.adj_closes());
        set.insert("TWIN1", r.clone(), 0.5);
        set.insert("TWIN2", r, 0.5);

        match optimize_portfolio(&set, &OptimizerConfig { samples: 100, ..OptimizerConfig::default() }) {
            Ok(result) => assert_on_simplex(&result.optimal.weights),
            Err(AnalysisError::OptimizationFailed { best_effort, .. }) => {
                assert_on_simplex(&best_effort.weights)
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_converges_on_realistic_return_sets() {
        let mut failures = Vec::new();
        for n in [3usize, 5, 8] {
            for seed in 0..40u64 {
                let mut set = ReturnSet::default();
                for i in 0..n {
                    let symbol = format!("E{i}");
                    let data = StockData::new_mock(
                        &symbol,
                        day(2022, 1, 1),
                        600,
                        0.0001 * (i as f64 + 1.0),
                        0.008 + 0.003 * i as f64,
                        seed * 31 + i as u64,
                    );
                    set.insert(&symbol, stats::simple_returns(&data.adj_closes()), 1.0 / n as f64);
                }
                match max_sharpe_portfolio(&stats_of(&set), &OptimizerConfig::default()) {
                    Ok(opt) => {
                        assert!(opt.converged);
                        assert_on_simplex(&opt.weights);
                    }
                    Err(AnalysisError::DegenerateInput { .. }) => {}
                    Err(e) => failures.push(format!("n={n} seed={seed}: {e}")),
                }
            }
        }
        assert!(failures.is_empty(), "solver failed on {} sets: {:?}", failures.len(), failures);
    }

    #[test]
    fn test_iteration_budget_exhaustion_reports_best_effort() {
        let stats = stats_of(&mock_set(3, 200));
        let cfg = OptimizerConfig {
            max_iterations: 0,
            ..OptimizerConfig::default()
        };
        match max_sharpe_portfolio(&stats, &cfg) {
            Err(AnalysisError::OptimizationFailed { best_effort, .. }) => {
                assert!(!best_effort.converged);
                assert_on_simplex(&best_effort.weights);
            }
            other => panic!("expected OptimizationFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_flat_assets_are_degenerate() {
        let stats = ReturnStatistics {
            tickers: vec!["A".into(), "B".into()],
            means: vec![0.0, 0.0],
            cov: vec![vec![0.0, 0.0], vec![0.0, 0.0]],
        };
        assert!(matches!(
            max_sharpe_portfolio(&stats, &OptimizerConfig::default()),
            Err(AnalysisError::DegenerateInput { .. })
        ));
    }

    #[test]
    fn test_project_simplex_keeps_feasible_points() {
        let w = project_simplex(&[0.2, 0.3, 0.5]);
        for (a, b) in w.iter().zip([0.2, 0.3, 0.5]) {
            assert_relative_eq!(*a, b, epsilon = 1e-12);
        }
        assert_on_simplex(&project_simplex(&[5.0, -3.0, 0.1]));
    }

    proptest! {
        #[test]
        fn prop_projection_lands_on_simplex(v in prop::collection::vec(-10.0f64..10.0, 1..8)) {
            let w = project_simplex(&v);
            prop_assert!(w.iter().all(|x| (0.0..=1.0).contains(x)));
            prop_assert!((w.iter().sum::<f64>() - 1.0).abs() < 1e-9);
        }

        #[test]
        fn prop_solver_output_is_feasible(
            means in prop::collection::vec(-0.002f64..0.002, 2..5),
            vols in prop::collection::vec(0.005f64..0.03, 5),
        ) {
            let n = means.len();
            let cov: Vec<Vec<f64>> = (0..n)
                .map(|i| (0..n).map(|j| if i == j { vols[i] * vols[i] } else { 0.3 * vols[i] * vols[j] }).collect())
                .collect();
            let stats = ReturnStatistics {
                tickers: (0..n).map(|i| format!("T{i}")).collect(),
                means,
                cov,
            };
            let weights = match max_sharpe_portfolio(&stats, &OptimizerConfig::default()) {
                Ok(opt) => opt.weights,
                Err(AnalysisError::OptimizationFailed { best_effort, .. }) => best_effort.weights,
                Err(e) => return Err(TestCaseError::fail(e.to_string())),
            };
            prop_assert!(weights.iter().all(|x| (0.0..=1.0).contains(x)));
            prop_assert!((weights.iter().sum::<f64>() - 1.0).abs() < 1e-6);
        }
    }
}
