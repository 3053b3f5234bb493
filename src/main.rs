mod allocation;
mod config;
mod data;
mod error;
mod etf;
mod narrative;
mod optimizer;
mod performance;
mod portfolio;
mod returns;
mod risk;
mod stats;
mod webui;

use anyhow::{bail, Result};
use chrono::NaiveDate;
use clap::Parser;
use config::AnalysisConfig;
use data::YahooFinance;
use narrative::{NarrativeClient, RiskProfile};
use portfolio::{AnalysisRequest, Portfolio};
use std::path::PathBuf;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "ETF Lens: ETF and multi-ETF portfolio analytics",
    after_help = "EXAMPLES:
    # Overview of QQQ against the S&P 500
    cargo run --release -- --etf QQQ

    # Add factor exposure, macro correlation and a comparison
    cargo run --release -- --etf SPY --factors --macro --compare SPY,IVV,VOO

    # Analyze and optimize a portfolio stored as CSV
    cargo run --release -- --portfolio my_etfs.csv --samples 20000 --seed 7

    # Serve the JSON API
    cargo run --release -- --webui --webui-port 8080"
)]
struct Args {
    /// ETF ticker for the single-fund analyses
    #[arg(long, default_value = "SPY")]
    etf: String,

    /// Benchmark ticker (default: ^GSPC, or ETF_LENS_BENCHMARK)
    #[arg(long)]
    benchmark: Option<String>,

    /// First day of the analysis window (YYYY-MM-DD)
    #[arg(long, value_parser = config::parse_date, default_value = config::DEFAULT_START_DATE)]
    start: NaiveDate,

    /// Last day of the analysis window, inclusive (YYYY-MM-DD)
    #[arg(long, value_parser = config::parse_date, default_value = config::DEFAULT_END_DATE)]
    end: NaiveDate,

    /// Compare ETFs side by side, comma-separated (bare flag: SPY,IVV,VOO)
    #[arg(long, value_delimiter = ',', num_args = 0..)]
    compare: Option<Vec<String>>,

    /// Regress the ETF on style/size/region factor proxies
    #[arg(long)]
    factors: bool,

    /// Correlate the ETF with macro indicators
    #[arg(long = "macro")]
    macro_correlation: bool,

    /// Analyze the portfolio in this CSV (ETF,Shares,Price or ETF,Weight)
    #[arg(long)]
    portfolio: Option<PathBuf>,

    /// Write the normalized portfolio to this CSV
    #[arg(long)]
    export: Option<PathBuf>,

    /// Seed for the frontier sampler
    #[arg(long)]
    seed: Option<u64>,

    /// Number of random frontier portfolios
    #[arg(long)]
    samples: Option<usize>,

    /// Ask the LLM for narrative commentary (needs OPENAI_API_KEY)
    #[arg(long)]
    summary: bool,

    /// Investor risk profile for the recommendation prompt
    #[arg(long, value_enum)]
    risk_profile: Option<RiskProfile>,

    /// Free-text market conditions for the prediction prompt
    #[arg(long)]
    market_conditions: Option<String>,

    /// Launch the JSON API server
    #[arg(long)]
    webui: bool,

    /// WebUI server port
    #[arg(long, default_value_t = 8080)]
    webui_port: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("etf_lens=info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();
    config::init_cpu_parallelism();

    let args = Args::parse();
    if args.start >= args.end {
        bail!("--start ({}) must be before --end ({})", args.start, args.end);
    }

    let mut cfg = AnalysisConfig::from_env();
    if let Some(b) = &args.benchmark {
        cfg.benchmark = b.trim().to_uppercase();
    }
    if let Some(seed) = args.seed {
        cfg.seed = seed;
    }
    if let Some(samples) = args.samples {
        cfg.frontier_samples = samples;
    }

    let source = YahooFinance::new(cfg.fetch_timeout)?;
    let llm = NarrativeClient::from_env()?;

    if args.webui {
        match webui::run_webui_server(args.webui_port, source, cfg, (args.start, args.end), llm).await {
            Ok(_) => info!("WebUI exited."),
            Err(e) => error!("WebUI failed: {}", e),
        }
        return Ok(());
    }

    if let Some(path) = &args.portfolio {
        run_portfolio(&args, path, &source, cfg, &llm).await?;
        return Ok(());
    }
    if args.export.is_some() {
        warn!("--export needs --portfolio; nothing to write");
    }

    run_etf(&args, &source, &cfg, &llm).await;
    Ok(())
}

async fn run_portfolio(
    args: &Args,
    path: &std::path::Path,
    source: &YahooFinance,
    cfg: AnalysisConfig,
    client: &NarrativeClient,
) -> Result<()> {
    let portfolio = Portfolio::load_csv(path)?;
    if let Some(out) = &args.export {
        portfolio.save_csv(out)?;
    }

    let request = AnalysisRequest {
        start: args.start,
        end: args.end,
        config: cfg,
    };
    let report = portfolio::analyze_portfolio(source, &portfolio, &request).await?;
    portfolio::print_report(&portfolio, &report);

    if args.summary {
        print_narrative("Portfolio commentary", client, &narrative::portfolio_prompt(&report)).await;
    }
    Ok(())
}

async fn run_etf(args: &Args, source: &YahooFinance, cfg: &AnalysisConfig, client: &NarrativeClient) {
    let ticker = args.etf.trim().to_uppercase();
    let (start, end, timeout) = (args.start, args.end, cfg.fetch_timeout);

    let (history, bench) = tokio::join!(
        returns::fetch_history(source, &ticker, start, end, timeout),
        returns::fetch_history(source, &cfg.benchmark, start, end, timeout),
    );

    match history {
        Ok(history) => match etf::analyze_etf(&ticker, &history, cfg.risk_free_rate) {
            Ok(summary) => {
                let risk = bench
                    .and_then(|b| etf::analyze_risk_and_benchmark(&history, &b, cfg.risk_free_rate))
                    .map_err(|e| warn!("Benchmark analysis failed: {}", e))
                    .ok();
                etf::print_summary(&summary, risk.as_ref(), &cfg.benchmark);

                if args.summary {
                    print_narrative("Performance", client, &narrative::etf_performance_prompt(&summary)).await;
                    if let Some(risk) = &risk {
                        print_narrative("Risk", client, &narrative::risk_prompt(risk)).await;
                    }
                    if let Some(profile) = args.risk_profile {
                        let prompt = narrative::recommendation_prompt(&(&summary, &risk), profile);
                        print_narrative("Recommendation", client, &prompt).await;
                    }
                    if let Some(conditions) = args.market_conditions.as_deref().filter(|c| !c.trim().is_empty()) {
                        let prompt = narrative::prediction_prompt(&(&summary, &risk), conditions);
                        print_narrative("Outlook", client, &prompt).await;
                    }
                }
            }
            Err(e) => error!("{} analysis failed: {}", ticker, e),
        },
        Err(e) => error!("Could not load {}: {}", ticker, e),
    }

    if args.factors {
        match etf::analyze_factor_exposure(source, &ticker, start, end, cfg).await {
            Ok(exposure) => {
                etf::print_factors(&exposure);
                if args.summary {
                    print_narrative("Factors", client, &narrative::factor_prompt(&exposure)).await;
                }
            }
            Err(e) => error!("Factor analysis failed: {}", e),
        }
    }

    if let Some(tickers) = &args.compare {
        let tickers: Vec<String> = if tickers.is_empty() {
            etf::DEFAULT_COMPARISON.iter().map(|t| t.to_string()).collect()
        } else {
            tickers.clone()
        };
        match etf::compare_etfs(source, &tickers, start, end, cfg).await {
            Ok(report) => {
                etf::print_comparison(&report);
                if args.summary {
                    print_narrative("Comparison", client, &narrative::comparison_prompt(&report.rows)).await;
                }
            }
            Err(e) => error!("Comparison failed: {}", e),
        }
    }

    if args.macro_correlation {
        match etf::analyze_macro_correlation(source, &ticker, start, end, cfg).await {
            Ok(correlation) => {
                etf::print_macro(&correlation);
                if args.summary {
                    print_narrative("Macro", client, &narrative::macro_prompt(&correlation)).await;
                }
            }
            Err(e) => error!("Macro correlation failed: {}", e),
        }
    }
}

async fn print_narrative(title: &str, client: &NarrativeClient, prompt: &str) {
    if let Some(text) = client.summarize(prompt).await {
        println!("\n── {} ──\n{}", title, text);
    }
}
