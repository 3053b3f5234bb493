//! Weight per fund category.

use crate::data::MarketData;
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::warn;

pub const UNKNOWN_CATEGORY: &str = "Other";

/// Category label → aggregate weight.
pub type AllocationBreakdown = BTreeMap<String, f64>;

/// Sums weights per category; blank or missing categories count as "Other".
pub fn aggregate_categories(entries: &[(Option<String>, f64)]) -> AllocationBreakdown {
    let mut breakdown = AllocationBreakdown::new();
    for (category, weight) in entries {
        let label = category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(UNKNOWN_CATEGORY);
        *breakdown.entry(label.to_string()).or_insert(0.0) += weight;
    }
    breakdown
}

/// Looks up each ticker's fund category and accumulates its weight.
/// Metadata failures are logged and the weight goes to "Other".
pub async fn analyze_asset_allocation<M: MarketData + Sync>(
    source: &M,
    positions: &[(String, f64)],
    timeout: Duration,
) -> AllocationBreakdown {
    let lookups = positions.iter().map(|(ticker, weight)| async move {
        let category = match tokio::time::timeout(timeout, source.fetch_info(ticker)).await {
            Ok(Ok(info)) => info.category,
            Ok(Err(e)) => {
                warn!("Error fetching info for {}: {}", ticker, e);
                None
            }
            Err(_) => {
                warn!("Timed out fetching info for {}", ticker);
                None
            }
        };
        (category, *weight)
    });

    let entries = join_all(lookups).await;
    aggregate_categories(&entries)
}
