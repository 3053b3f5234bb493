//! Optional LLM commentary on analysis results.
//!
//! Talks to any OpenAI-compatible chat-completions endpoint. Every failure
//! is logged and turned into `None`; nothing numeric depends on it.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_LANGUAGE: &str = "Korean";
const REQUEST_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RiskProfile {
    Conservative,
    #[default]
    Neutral,
    Aggressive,
}

impl fmt::Display for RiskProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Conservative => "conservative",
            Self::Neutral => "neutral",
            Self::Aggressive => "aggressive",
        };
        f.write_str(label)
    }
}

pub struct NarrativeClient {
    http: reqwest::Client,
    api_key: Option<String>,
    base_url: String,
    model: String,
    language: String,
}

impl NarrativeClient {
    /// Reads `OPENAI_API_KEY`, `OPENAI_BASE_URL`, `ETF_LENS_LLM_MODEL` and
    /// `ETF_LENS_LLM_LANGUAGE`. A missing key is not an error here; it makes
    /// every `summarize` call return `None`.
    pub fn from_env() -> Result<Self> {
        let var = |key: &str| std::env::var(key).ok().filter(|v| !v.trim().is_empty());
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("building LLM HTTP client")?;

        Ok(Self {
            http,
            api_key: var("OPENAI_API_KEY"),
            base_url: var("OPENAI_BASE_URL").unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            model: var("ETF_LENS_LLM_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            language: var("ETF_LENS_LLM_LANGUAGE").unwrap_or_else(|| DEFAULT_LANGUAGE.to_string()),
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }

    fn system_prompt(&self) -> String {
        format!(
            "You are a seasoned ETF investment analyst who knows global markets and a wide range of ETF strategies. \
             Answer in {}, clearly and concisely, for novice and experienced investors alike. \
             Take current market conditions and plausible future scenarios into account.",
            self.language
        )
    }

    async fn complete(&self, prompt: &str) -> Result<String> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| anyhow!("OPENAI_API_KEY is not set"))?;

        let body = serde_json::json!({
            "model": self.model,
            "messages": [
                { "role": "system", "content": self.system_prompt() },
                { "role": "user", "content": prompt },
            ],
        });

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!("POST {} (model {})", url, self.model);
        let response = self
            .http
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .context("sending chat completion request")?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("chat completion failed with {}: {}", status, text));
        }

        let json: serde_json::Value = response.json().await.context("decoding chat completion")?;
        extract_content(&json).ok_or_else(|| anyhow!("response has no message content"))
    }

    /// Sends `prompt` and returns the model's answer, or `None` on any failure.
    pub async fn summarize(&self, prompt: &str) -> Option<String> {
        if !self.is_configured() {
            warn!("Narrative summary skipped: OPENAI_API_KEY is not set");
            return None;
        }
        match self.complete(prompt).await {
            Ok(text) => {
                info!("Narrative summary received ({} chars)", text.len());
                Some(text)
            }
            Err(e) => {
                warn!("Narrative summary failed: {:#}", e);
                None
            }
        }
    }
}

fn extract_content(json: &serde_json::Value) -> Option<String> {
    json.pointer("/choices/0/message/content")?
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

// ──────────────────────────────────────────────────────────────────────────────
// Prompts
// ──────────────────────────────────────────────────────────────────────────────

fn render<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|e| format!("<unserializable: {}>", e))
}

fn numbered(intro: String, points: &[&str]) -> String {
    let mut prompt = intro;
    prompt.push_str("\n\n");
    for (i, point) in points.iter().enumerate() {
        prompt.push_str(&format!("{}. {}\n", i + 1, point));
    }
    prompt
}

pub fn etf_performance_prompt<T: Serialize>(data: &T) -> String {
    numbered(
        format!("ETF performance data:\n{}", render(data)),
        &[
            "Analyze the ETF's performance based on this data.",
            "Refer explicitly to the key indicators: annual return, volatility and Sharpe ratio.",
            "Explain the strengths and weaknesses of this ETF.",
            "Give 3 actionable insights for investors.",
            "Comment briefly on the outlook given current market conditions.",
        ],
    )
}

pub fn risk_prompt<T: Serialize>(data: &T) -> String {
    numbered(
        format!("Risk and benchmark analysis for the ETF:\n{}", render(data)),
        &[
            "Interpret the key risk indicators (beta, maximum drawdown, tracking error).",
            "Analyze how the ETF performs relative to its benchmark.",
            "List 5 points investors must consider.",
            "Describe which investors this level of risk suits.",
            "Predict how the risk profile may change under current market conditions.",
        ],
    )
}

pub fn factor_prompt<T: Serialize>(data: &T) -> String {
    numbered(
        format!("Factor exposure regression for the ETF:\n{}", render(data)),
        &[
            "Explain the exposure to each factor in detail.",
            "Interpret what this exposure means for investment strategy.",
            "Analyze how it may affect the ETF's performance.",
            "Weigh its pros and cons in the current market.",
            "Suggest what kind of portfolio this ETF fits.",
        ],
    )
}

pub fn comparison_prompt<T: Serialize>(data: &T) -> String {
    numbered(
        format!("Comparison data for several ETFs:\n{}", render(data)),
        &[
            "Summarize each ETF's main characteristics, advantages and disadvantages.",
            "Compare them on performance, risk and cost.",
            "Explain which type of investor each ETF suits.",
            "Say which ETF looks most promising under current conditions.",
            "Assess each ETF for long-term and short-term holding.",
        ],
    )
}

pub fn macro_prompt<T: Serialize>(data: &T) -> String {
    numbered(
        format!("Correlations between the ETF and macroeconomic indicators:\n{}", render(data)),
        &[
            "Interpret the correlation with each indicator.",
            "Explain how these correlations should inform investment decisions.",
            "Analyze the ETF's outlook in the current economic situation.",
            "Forecast the key indicators over the next 6 months and the ETF's likely response.",
            "Suggest how the ETF could hedge macro risk inside a portfolio.",
        ],
    )
}

pub fn recommendation_prompt<T: Serialize>(data: &T, profile: RiskProfile) -> String {
    numbered(
        format!(
            "ETF data:\n{}\n\nThe investor has a {} risk profile.",
            render(data),
            profile
        ),
        &[
            "Recommend buy, hold or sell and explain the reasoning.",
            "Give expected performance for 6 months, 1 year and 3 years with concrete figures.",
            "Name 3 major risks with their likelihood and impact.",
            "Describe the role this ETF could play in the investor's portfolio.",
            "List 3 cautions for investing in it under current conditions.",
        ],
    )
}

pub fn prediction_prompt<T: Serialize>(data: &T, market_conditions: &str) -> String {
    numbered(
        format!(
            "ETF data:\n{}\n\nCurrent market conditions as described by the investor:\n{}",
            render(data),
            market_conditions.trim()
        ),
        &[
            "Predict performance over the next 6-12 months with an expected return range.",
            "Describe 3 positive and 3 negative scenarios.",
            "Analyze how volatility and risk are likely to change.",
            "Say whether the ETF belongs in a portfolio today and why.",
            "Advise on strategy or timing to get the most out of it.",
        ],
    )
}

pub fn portfolio_prompt<T: Serialize>(report: &T) -> String {
    numbered(
        format!("Multi-ETF portfolio analysis (weights, performance, risk, allocation, max-Sharpe weights):\n{}", render(report)),
        &[
            "Summarize the portfolio's performance and risk.",
            "Compare the current weights with the max-Sharpe weights and explain the difference.",
            "Comment on diversification across the asset allocation categories.",
            "Suggest 3 concrete adjustments.",
        ],
    )
}
