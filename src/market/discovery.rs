use tracing::info;

use crate::error::MakerError;
use crate::types::{MarketCatalog, TrackedToken};

/// Resolve a market by its Gamma event slug.
///
/// The first event in the response carries the title and a markets array;
/// the first market's `outcomes` and `clobTokenIds` are JSON-array strings
/// with parallel ordering.
pub async fn resolve_market(
    client: &reqwest::Client,
    gamma_api_url: &str,
    slug: &str,
) -> Result<MarketCatalog, MakerError> {
    let url = format!("{gamma_api_url}/events?slug={slug}");
    info!(%url, "resolving market");

    let resp = client
        .get(&url)
        .send()
        .await
        .map_err(|e| MakerError::Transport(format!("event lookup: {e}")))?;
    let text = resp
        .text()
        .await
        .map_err(|e| MakerError::Transport(format!("event body: {e}")))?;
    let events: serde_json::Value = serde_json::from_str(&text)
        .map_err(|e| MakerError::Transport(format!("event json: {e}")))?;

    parse_catalog(&events, slug)
}

fn parse_catalog(events: &serde_json::Value, slug: &str) -> Result<MarketCatalog, MakerError> {
    let event = events
        .as_array()
        .and_then(|arr| arr.first())
        .ok_or_else(|| MakerError::MarketNotFound(slug.to_string()))?;

    let title = event
        .get("title")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .to_string();

    let market = event
        .get("markets")
        .and_then(|m| m.as_array())
        .and_then(|arr| arr.first())
        .ok_or_else(|| MakerError::MarketNotFound(format!("{slug}: no markets in event")))?;

    let question = market
        .get("question")
        .and_then(|q| q.as_str())
        .unwrap_or("")
        .to_string();

    let outcomes = parse_string_list(market, "outcomes");
    let token_ids = parse_string_list(market, "clobTokenIds");

    if outcomes.is_empty() || outcomes.len() != token_ids.len() {
        return Err(MakerError::MarketNotFound(format!(
            "{slug}: outcomes/token ids missing or mismatched"
        )));
    }

    Ok(MarketCatalog {
        title,
        question,
        outcomes,
        token_ids,
    })
}

/// Fields like `outcomes` arrive as a JSON array *string*, so they parse
/// twice: once as part of the event, once as their own document.
fn parse_string_list(market: &serde_json::Value, key: &str) -> Vec<String> {
    match market.get(key) {
        Some(serde_json::Value::String(s)) => serde_json::from_str(s).unwrap_or_default(),
        Some(serde_json::Value::Array(arr)) => arr
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

impl MarketCatalog {
    /// Pick the outcome token the session will quote.
    pub fn select_outcome(&self, index: usize) -> Result<TrackedToken, MakerError> {
        if index >= self.outcomes.len() {
            return Err(MakerError::OutcomeOutOfRange(index));
        }
        Ok(TrackedToken {
            outcome: self.outcomes[index].clone(),
            token_id: self.token_ids[index].clone(),
        })
    }
}
