use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::watch;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::MakerError;
use crate::math::curvefit::estimate_kappa;
use crate::types::{BookLevel, MarketMetrics};

/// Receive timeout that drives keep-alive pings.
const KEEPALIVE_AFTER: Duration = Duration::from_secs(5);
/// Upper bound on the initial connect, so shutdown never waits on a stuck
/// handshake.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Consecutive bad frames before the feed gives up.
const MAX_CONSECUTIVE_FAILURES: u32 = 10;

#[derive(Default)]
struct TokenBook {
    bids: Vec<BookLevel>,
    asks: Vec<BookLevel>,
    metrics: MarketMetrics,
}

/// Live order book for the subscribed outcome tokens.
///
/// The WebSocket task is the only writer; the session task reads derived
/// metrics through the lock, so a getter never observes a half-applied
/// event. Restart after a dropped connection is the orchestrator's concern.
pub struct MarketFeed {
    ws_url: String,
    asset_ids: Vec<String>,
    books: RwLock<HashMap<String, TokenBook>>,
    alive: AtomicBool,
}

impl MarketFeed {
    pub fn new(ws_url: String, asset_ids: Vec<String>) -> Arc<Self> {
        Arc::new(Self {
            ws_url,
            asset_ids,
            books: RwLock::new(HashMap::new()),
            alive: AtomicBool::new(true),
        })
    }

    /// False once the reader task has terminated (connection closed or too
    /// many consecutive bad frames).
    #[inline]
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    // ─── Getters (session task) ────────────────────────────────────────────

    /// Snapshot of the derived metrics for one asset. Default (zeros, NaN
    /// kappa) until the first book event lands.
    pub fn metrics(&self, asset_id: &str) -> MarketMetrics {
        self.books
            .read()
            .get(asset_id)
            .map(|b| b.metrics)
            .unwrap_or_default()
    }

    pub fn best_bid(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).best_bid
    }

    pub fn best_ask(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).best_ask
    }

    pub fn wmp(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).wmp
    }

    pub fn vol_diff(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).vol_diff
    }

    pub fn total_bid_vol(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).vol_bid
    }

    pub fn total_ask_vol(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).vol_ask
    }

    pub fn kappa(&self, asset_id: &str) -> f64 {
        self.metrics(asset_id).kappa
    }

    // ─── Event application (writer task, also driven directly in tests) ────

    /// Replace the whole book for one asset and recompute its metrics.
    pub fn apply_book(&self, asset_id: &str, bids: Vec<BookLevel>, asks: Vec<BookLevel>) {
        let mut books = self.books.write();
        let book = books.entry(asset_id.to_string()).or_default();
        book.bids = bids;
        book.asks = asks;
        sort_book(book);
        recompute_metrics(book);
    }

    /// Patch a single level. Size zero removes it. The side comes from the
    /// payload when present; otherwise the level is classified against the
    /// delivered best quotes.
    pub fn apply_price_change(
        &self,
        asset_id: &str,
        price: f64,
        size: f64,
        side: Option<crate::types::Side>,
        best_bid: f64,
        best_ask: f64,
    ) {
        let mut books = self.books.write();
        let book = books.entry(asset_id.to_string()).or_default();

        let is_bid = match side {
            Some(crate::types::Side::Buy) => true,
            Some(crate::types::Side::Sell) => false,
            None => price <= best_bid || (best_ask > 0.0 && price < best_ask),
        };
        let levels = if is_bid { &mut book.bids } else { &mut book.asks };

        match levels.iter().position(|l| (l.price - price).abs() < 1e-9) {
            Some(i) if size <= 0.0 => {
                levels.remove(i);
            }
            Some(i) => levels[i].size = size,
            None if size > 0.0 => levels.push(BookLevel { price, size }),
            None => {}
        }
        sort_book(book);
        recompute_metrics(book);
    }

    // ─── Reader task ───────────────────────────────────────────────────────

    /// Connect, subscribe to the configured assets, and apply incoming
    /// events until cancelled or the transport dies.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), MakerError> {
        let result = self.listen(&mut shutdown).await;
        self.alive.store(false, Ordering::Relaxed);
        result
    }

    async fn listen(&self, shutdown: &mut watch::Receiver<bool>) -> Result<(), MakerError> {
        info!(url = %self.ws_url, assets = self.asset_ids.len(), "connecting to market stream");
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(&self.ws_url))
            .await
            .map_err(|_| MakerError::Transport("connect timed out".into()))?
            .map_err(|e| MakerError::Transport(format!("connect: {e}")))?;
        let (mut write, mut read) = ws.split();

        let subscribe = serde_json::json!({
            "assets_ids": self.asset_ids,
            "type": "market",
        });
        write
            .send(Message::Text(subscribe.to_string()))
            .await
            .map_err(|e| MakerError::Transport(format!("subscribe: {e}")))?;
        info!("subscribed to market channel");

        let mut consecutive_failures = 0u32;
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    // A dropped sender counts as a cancel.
                    if changed.is_err() || *shutdown.borrow() {
                        info!("market feed cancelled");
                        return Ok(());
                    }
                }
                frame = tokio::time::timeout(KEEPALIVE_AFTER, read.next()) => match frame {
                    Err(_) => {
                        // Quiet connection: nudge the server.
                        if write.send(Message::Text("PING".into())).await.is_err() {
                            return Err(MakerError::Transport("keep-alive send failed".into()));
                        }
                    }
                    Ok(None) => {
                        warn!("market stream closed by peer");
                        return Ok(());
                    }
                    Ok(Some(Err(e))) => {
                        consecutive_failures += 1;
                        warn!(error = %e, consecutive_failures, "frame error");
                        if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                            return Err(MakerError::Transport(format!(
                                "{MAX_CONSECUTIVE_FAILURES} consecutive frame failures: {e}"
                            )));
                        }
                    }
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if text == "PONG" || text == "PING" {
                            consecutive_failures = 0;
                            continue;
                        }
                        match serde_json::from_str::<serde_json::Value>(&text) {
                            Ok(envelope) => {
                                consecutive_failures = 0;
                                self.apply_envelope(&envelope);
                            }
                            Err(e) => {
                                consecutive_failures += 1;
                                debug!(error = %e, "unparseable frame");
                                if consecutive_failures >= MAX_CONSECUTIVE_FAILURES {
                                    return Err(MakerError::Transport(format!(
                                        "{MAX_CONSECUTIVE_FAILURES} consecutive bad frames"
                                    )));
                                }
                            }
                        }
                    }
                    Ok(Some(Ok(_))) => {
                        // Binary/ping/pong frames carry nothing we track.
                        consecutive_failures = 0;
                    }
                },
            }
        }
    }

    /// The wire envelope is either a single event object or a list of them.
    fn apply_envelope(&self, envelope: &serde_json::Value) {
        match envelope {
            serde_json::Value::Array(events) => {
                for event in events {
                    self.apply_event(event);
                }
            }
            serde_json::Value::Object(_) => self.apply_event(envelope),
            _ => {}
        }
    }

    fn apply_event(&self, event: &serde_json::Value) {
        match event.get("event_type").and_then(|t| t.as_str()) {
            Some("book") => {
                let asset_id = match event.get("asset_id").and_then(|a| a.as_str()) {
                    Some(id) => id,
                    None => return,
                };
                let bids = parse_levels(event.get("bids"));
                let asks = parse_levels(event.get("asks"));
                self.apply_book(asset_id, bids, asks);
            }
            Some("price_change") => {
                let changes = match event.get("price_changes").and_then(|c| c.as_array()) {
                    Some(c) => c,
                    None => return,
                };
                for change in changes {
                    let asset_id = match change.get("asset_id").and_then(|a| a.as_str()) {
                        Some(id) => id,
                        None => continue,
                    };
                    let price = field_f64(change, "price");
                    let size = field_f64(change, "size");
                    if !price.is_finite() || !size.is_finite() {
                        continue;
                    }
                    let side = change.get("side").and_then(|s| s.as_str()).map(|s| {
                        if s.eq_ignore_ascii_case("buy") {
                            crate::types::Side::Buy
                        } else {
                            crate::types::Side::Sell
                        }
                    });
                    let best_bid = field_f64(change, "best_bid");
                    let best_ask = field_f64(change, "best_ask");
                    self.apply_price_change(asset_id, price, size, side, best_bid, best_ask);
                }
            }
            // Everything else (tick_size_change, last_trade_price, ...) is noise here.
            _ => {}
        }
    }
}

fn sort_book(book: &mut TokenBook) {
    book.bids
        .sort_unstable_by(|a, b| b.price.partial_cmp(&a.price).unwrap_or(std::cmp::Ordering::Equal));
    book.asks
        .sort_unstable_by(|a, b| a.price.partial_cmp(&b.price).unwrap_or(std::cmp::Ordering::Equal));
}

fn recompute_metrics(book: &mut TokenBook) {
    let best_bid = book.bids.first().map_or(0.0, |l| l.price);
    let best_ask = book.asks.first().map_or(0.0, |l| l.price);
    let vol_bid: f64 = book.bids.iter().map(|l| l.size).sum();
    let vol_ask: f64 = book.asks.iter().map(|l| l.size).sum();

    // Volumes cross over: ask depth pulls the mid toward the bid and
    // vice versa, pricing the pressured side closer.
    let wmp = if vol_bid + vol_ask > 0.0 {
        (best_bid * vol_ask + best_ask * vol_bid) / (vol_bid + vol_ask)
    } else {
        (best_bid + best_ask) / 2.0
    };

    let kappa = estimate_kappa(&book.bids, &book.asks, best_bid, best_ask);

    book.metrics = MarketMetrics {
        best_bid,
        best_ask,
        wmp,
        vol_bid,
        vol_ask,
        vol_diff: vol_bid - vol_ask,
        kappa,
    };
}

/// Levels arrive as `{"price": "0.49", "size": "120.5"}` string pairs.
fn parse_levels(raw: Option<&serde_json::Value>) -> Vec<BookLevel> {
    let arr = match raw.and_then(|v| v.as_array()) {
        Some(arr) => arr,
        None => return Vec::new(),
    };
    arr.iter()
        .filter_map(|level| {
            let price = field_f64(level, "price");
            let size = field_f64(level, "size");
            if price.is_finite() && size.is_finite() {
                Some(BookLevel { price, size })
            } else {
                None
            }
        })
        .collect()
}

/// Numeric field that may arrive as a JSON string or a bare number.
fn field_f64(value: &serde_json::Value, key: &str) -> f64 {
    match value.get(key) {
        Some(serde_json::Value::String(s)) => s.parse().unwrap_or(f64::NAN),
        Some(v) => v.as_f64().unwrap_or(f64::NAN),
        None => f64::NAN,
    }
}
