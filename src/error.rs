//! Error taxonomy for the analysis core.
//!
//! Per-ticker fetch problems are recoverable and usually end up as
//! warnings; everything else aborts the analysis pass that raised it.

use crate::optimizer::OptimalPortfolio;
use thiserror::Error;

pub type AnalysisResult<T> = Result<T, AnalysisError>;

#[derive(Error, Debug)]
pub enum AnalysisError {
    /// Network failure, unknown ticker, empty history or timeout for one ticker.
    #[error("failed to fetch {ticker}: {reason}")]
    FetchFailure { ticker: String, reason: String },

    /// Nothing survived fetching and date alignment.
    #[error("no data available for {context}")]
    EmptyDataset { context: String },

    /// A metric is undefined for this input (zero variance and the like).
    #[error("{metric} is undefined: {reason}")]
    DegenerateInput { metric: String, reason: String },

    /// The solver stopped without satisfying its tolerance. The best
    /// iterate it reached is still a valid simplex point.
    #[error("optimization did not converge: {reason}")]
    OptimizationFailed {
        reason: String,
        best_effort: Box<OptimalPortfolio>,
    },

    #[error("invalid position {ticker}: {reason}")]
    InvalidPosition { ticker: String, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl AnalysisError {
    pub fn fetch(ticker: &str, reason: impl std::fmt::Display) -> Self {
        Self::FetchFailure {
            ticker: ticker.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn empty(context: impl Into<String>) -> Self {
        Self::EmptyDataset {
            context: context.into(),
        }
    }

    pub fn degenerate(metric: &str, reason: impl Into<String>) -> Self {
        Self::DegenerateInput {
            metric: metric.to_string(),
            reason: reason.into(),
        }
    }

    pub fn invalid_position(ticker: &str, reason: impl Into<String>) -> Self {
        Self::InvalidPosition {
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }

    /// Short machine-readable tag, used by the JSON API.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::FetchFailure { .. } => "fetch_failure",
            Self::EmptyDataset { .. } => "empty_dataset",
            Self::DegenerateInput { .. } => "degenerate_input",
            Self::OptimizationFailed { .. } => "optimization_nonconvergence",
            Self::InvalidPosition { .. } => "invalid_position",
            Self::Io(_) | Self::Csv(_) | Self::Http(_) | Self::Json(_) => "io",
        }
    }
}
