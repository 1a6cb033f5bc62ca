use std::collections::HashMap;

use chrono::{TimeZone, Utc};
use reqwest::Client;
use serde::Deserialize;
use tokio::time::{sleep, Duration};

use crate::models::PairSnapshot;

const DEXSCREENER_API_BASE: &str = "https://api.dexscreener.com/latest/dex";
const MAX_RETRIES: u32 = 3;
const INITIAL_BACKOFF_MS: u64 = 2000; // Start with 2 seconds

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected status {0}")]
    Status(reqwest::StatusCode),
    #[error("all queries failed")]
    AllQueriesFailed,
}

/// Provider-level row filters, applied before the snapshot is handed to the
/// engine.
#[derive(Debug, Clone, Default)]
pub struct ProviderFilters {
    pub min_liquidity_usd: f64,
    /// Quote symbols to drop (e.g. USDC/USDT pairs), matched uppercased.
    pub exclude_quotes: Vec<String>,
}

/// Aggregates DexScreener `/search` results for a list of queries into one
/// normalized snapshot: Solana pairs only, field conversion at the boundary,
/// dedup by pair address keeping the highest 24h volume.
///
/// A failing query is logged and skipped; the fetch only errors when every
/// query failed.
#[derive(Clone)]
pub struct MarketDataClient {
    client: Client,
    base_url: String,
    queries: Vec<String>,
    filters: ProviderFilters,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    pairs: Vec<PairData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PairData {
    #[serde(default)]
    chain_id: String,
    #[serde(default)]
    dex_id: String,
    #[serde(default)]
    url: String,
    #[serde(default)]
    pair_address: String,
    #[serde(default)]
    base_token: TokenInfo,
    #[serde(default)]
    quote_token: TokenInfo,
    price_usd: Option<String>,
    #[serde(default)]
    liquidity: LiquidityData,
    #[serde(default)]
    volume: VolumeData,
    #[serde(default)]
    txns: TxnsData,
    #[serde(default)]
    price_change: PriceChange,
    /// Milliseconds since epoch.
    pair_created_at: Option<i64>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenInfo {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    address: String,
}

#[derive(Debug, Deserialize, Default)]
struct LiquidityData {
    #[serde(default)]
    usd: f64,
}

#[derive(Debug, Deserialize, Default)]
struct VolumeData {
    #[serde(default)]
    h24: f64,
}

#[derive(Debug, Deserialize, Default)]
struct TxnsData {
    #[serde(default)]
    h1: TxnWindow,
}

#[derive(Debug, Deserialize, Default)]
struct TxnWindow {
    #[serde(default)]
    buys: u32,
    #[serde(default)]
    sells: u32,
}

#[derive(Debug, Deserialize, Default)]
struct PriceChange {
    h1: Option<f64>,
    h6: Option<f64>,
    h24: Option<f64>,
}

impl MarketDataClient {
    pub fn new(queries: Vec<String>, filters: ProviderFilters) -> Self {
        Self::with_base_url(DEXSCREENER_API_BASE.to_string(), queries, filters)
    }

    pub fn with_base_url(base_url: String, queries: Vec<String>, filters: ProviderFilters) -> Self {
        Self {
            client: Client::new(),
            base_url,
            queries,
            filters,
        }
    }

    /// Fetch and normalize one snapshot across all configured queries.
    pub async fn fetch_snapshot(&self) -> Result<Vec<PairSnapshot>, ProviderError> {
        let mut rows: Vec<(String, PairSnapshot)> = Vec::new();
        let mut failures = 0;

        for query in &self.queries {
            match self.search_with_retry(query).await {
                Ok(response) => {
                    for pair in response.pairs {
                        if let Some((address, row)) = self.normalize(pair) {
                            rows.push((address, row));
                        }
                    }
                }
                Err(e) => {
                    failures += 1;
                    tracing::warn!(query = %query, error = %e, "search query failed, skipping");
                }
            }
        }

        if failures == self.queries.len() && !self.queries.is_empty() {
            return Err(ProviderError::AllQueriesFailed);
        }

        Ok(Self::dedup_by_address(rows))
    }

    async fn search_with_retry(&self, query: &str) -> Result<SearchResponse, ProviderError> {
        let mut last_error = None;

        for attempt in 1..=MAX_RETRIES {
            match self.search_once(query).await {
                Ok(response) => {
                    if attempt > 1 {
                        tracing::info!(query = %query, attempt, "search succeeded after retry");
                    }
                    return Ok(response);
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        let backoff_ms = INITIAL_BACKOFF_MS * 2_u64.pow(attempt - 1);
                        tracing::warn!(
                            query = %query,
                            attempt,
                            error = %e,
                            backoff_ms,
                            "search attempt failed, retrying"
                        );
                        sleep(Duration::from_millis(backoff_ms)).await;
                    }
                    last_error = Some(e);
                }
            }
        }

        Err(last_error.expect("retry loop ran at least once"))
    }

    async fn search_once(&self, query: &str) -> Result<SearchResponse, ProviderError> {
        let url = format!("{}/search", self.base_url);
        let response = self.client.get(&url).query(&[("q", query)]).send().await?;
        if !response.status().is_success() {
            return Err(ProviderError::Status(response.status()));
        }
        Ok(response.json().await?)
    }

    /// One-time conversion at the input boundary: Solana pairs only,
    /// DexScreener percents become signed fractions, txns-1h is buys+sells,
    /// the 6h change stands in for the 4h window. Rows failing the provider
    /// filters return None.
    fn normalize(&self, pair: PairData) -> Option<(String, PairSnapshot)> {
        if pair.chain_id.to_lowercase() != "solana" {
            return None;
        }
        if pair.base_token.symbol.is_empty() || pair.quote_token.symbol.is_empty() {
            return None;
        }
        if pair.liquidity.usd < self.filters.min_liquidity_usd {
            return None;
        }
        if self
            .filters
            .exclude_quotes
            .iter()
            .any(|q| q.eq_ignore_ascii_case(&pair.quote_token.symbol))
        {
            return None;
        }

        let price_usd = pair.price_usd.as_deref().and_then(|s| s.parse::<f64>().ok());
        let txns_1h = pair.txns.h1.buys + pair.txns.h1.sells;
        let liquidity_usd = pair.liquidity.usd;
        let volume_24h_usd = pair.volume.h24;
        let change_1h = pair.price_change.h1.map(|p| p / 100.0);
        let change_4h = pair.price_change.h6.map(|p| p / 100.0);
        let change_24h = pair.price_change.h24.map(|p| p / 100.0);
        let created_at = pair
            .pair_created_at
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single());

        let momentum_score = momentum_score(
            txns_1h,
            volume_24h_usd / liquidity_usd.max(1.0),
            change_24h,
        );

        let row = PairSnapshot {
            pair: format!("{}/{}", pair.base_token.symbol, pair.quote_token.symbol),
            venue: pair.dex_id.to_lowercase(),
            price_usd,
            liquidity_usd,
            volume_24h_usd,
            txns_1h,
            momentum_score,
            change_1h,
            change_4h,
            change_24h,
            created_at,
            url: pair.url,
            base_address: pair.base_token.address,
        };
        Some((pair.pair_address, row))
    }

    /// Keep the highest-volume row per pair address.
    fn dedup_by_address(rows: Vec<(String, PairSnapshot)>) -> Vec<PairSnapshot> {
        let mut best: HashMap<String, PairSnapshot> = HashMap::new();
        for (address, row) in rows {
            match best.get(&address) {
                Some(existing) if existing.volume_24h_usd >= row.volume_24h_usd => {}
                _ => {
                    best.insert(address, row);
                }
            }
        }
        let mut out: Vec<PairSnapshot> = best.into_values().collect();
        // stable output order for downstream determinism
        out.sort_by(|a, b| {
            b.volume_24h_usd
                .partial_cmp(&a.volume_24h_usd)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.pair.cmp(&b.pair))
        });
        out
    }
}

/// Heuristic 0-100 activity score from tx-rate, turnover and 24h change.
/// The engine treats it as an opaque snapshot field.
fn momentum_score(txns_1h: u32, turnover: f64, change_24h: Option<f64>) -> u8 {
    let tx_pts = (txns_1h as f64 / 10.0).min(40.0);
    let turnover_pts = (turnover * 12.5).min(35.0);
    let change_pts = match change_24h {
        Some(c) if c > 0.0 => (c * 50.0).min(25.0),
        _ => 0.0,
    };
    (tx_pts + turnover_pts + change_pts).round().clamp(0.0, 100.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_body() -> String {
        serde_json::json!({
            "pairs": [
                {
                    "chainId": "solana",
                    "dexId": "Raydium",
                    "url": "https://dexscreener.com/solana/abc",
                    "pairAddress": "abc",
                    "baseToken": { "symbol": "WIF", "address": "wif-mint" },
                    "quoteToken": { "symbol": "SOL", "address": "sol-mint" },
                    "priceUsd": "1.25",
                    "liquidity": { "usd": 50000.0 },
                    "volume": { "h24": 150000.0 },
                    "txns": { "h1": { "buys": 220, "sells": 180 } },
                    "priceChange": { "h1": 4.2, "h6": 11.0, "h24": 38.5 },
                    "pairCreatedAt": 1700000000000i64
                },
                {
                    "chainId": "solana",
                    "dexId": "raydium",
                    "pairAddress": "abc",
                    "baseToken": { "symbol": "WIF", "address": "wif-mint" },
                    "quoteToken": { "symbol": "SOL", "address": "sol-mint" },
                    "priceUsd": "1.24",
                    "liquidity": { "usd": 48000.0 },
                    "volume": { "h24": 90000.0 },
                    "txns": { "h1": { "buys": 10, "sells": 5 } }
                },
                {
                    "chainId": "ethereum",
                    "dexId": "uniswap",
                    "pairAddress": "eth1",
                    "baseToken": { "symbol": "PEPE", "address": "x" },
                    "quoteToken": { "symbol": "WETH", "address": "y" },
                    "priceUsd": "0.5",
                    "liquidity": { "usd": 90000.0 },
                    "volume": { "h24": 10000.0 }
                },
                {
                    "chainId": "solana",
                    "dexId": "orca",
                    "pairAddress": "usdc1",
                    "baseToken": { "symbol": "BONK", "address": "z" },
                    "quoteToken": { "symbol": "USDC", "address": "u" },
                    "priceUsd": "0.00002",
                    "liquidity": { "usd": 60000.0 },
                    "volume": { "h24": 80000.0 }
                }
            ]
        })
        .to_string()
    }

    fn filters() -> ProviderFilters {
        ProviderFilters {
            min_liquidity_usd: 1000.0,
            exclude_quotes: vec!["USDC".to_string(), "USDT".to_string()],
        }
    }

    #[tokio::test]
    async fn test_fetch_normalizes_filters_and_dedups() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "wif".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(sample_body())
            .create_async()
            .await;

        let client = MarketDataClient::with_base_url(
            server.url(),
            vec!["wif".to_string()],
            filters(),
        );
        let snapshot = client.fetch_snapshot().await.unwrap();
        mock.assert_async().await;

        // ethereum row dropped, USDC quote excluded, duplicate pairAddress
        // collapsed to the higher-volume row
        assert_eq!(snapshot.len(), 1);
        let row = &snapshot[0];
        assert_eq!(row.pair, "WIF/SOL");
        assert_eq!(row.venue, "raydium");
        assert_eq!(row.price_usd, Some(1.25));
        assert_eq!(row.txns_1h, 400);
        assert_eq!(row.volume_24h_usd, 150000.0);
        // percents became fractions
        assert!((row.change_1h.unwrap() - 0.042).abs() < 1e-12);
        assert!((row.change_4h.unwrap() - 0.11).abs() < 1e-12);
        assert!((row.change_24h.unwrap() - 0.385).abs() < 1e-12);
        assert!(row.created_at.is_some());
    }

    #[tokio::test]
    async fn test_failing_query_is_skipped_not_fatal() {
        let mut server = mockito::Server::new_async().await;
        let ok = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "good".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(sample_body())
            .create_async()
            .await;
        let bad = server
            .mock("GET", "/search")
            .match_query(mockito::Matcher::UrlEncoded("q".into(), "bad".into()))
            .with_status(500)
            .expect(MAX_RETRIES as usize)
            .create_async()
            .await;

        let client = MarketDataClient::with_base_url(
            server.url(),
            vec!["good".to_string(), "bad".to_string()],
            filters(),
        );
        let snapshot = client.fetch_snapshot().await.unwrap();
        ok.assert_async().await;
        bad.assert_async().await;
        assert_eq!(snapshot.len(), 1);
    }

    #[tokio::test]
    async fn test_all_queries_failing_is_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _bad = server
            .mock("GET", "/search")
            .with_status(500)
            .expect(MAX_RETRIES as usize)
            .create_async()
            .await;

        let client = MarketDataClient::with_base_url(
            server.url(),
            vec!["only".to_string()],
            ProviderFilters::default(),
        );
        let result = client.fetch_snapshot().await;
        assert!(matches!(result, Err(ProviderError::AllQueriesFailed)));
    }

    #[test]
    fn test_momentum_score_saturates() {
        assert_eq!(momentum_score(0, 0.0, None), 0);
        // 400 txns (40) + turnover 3.0 (37.5 capped at 35) + +50% (25)
        assert_eq!(momentum_score(400, 3.0, Some(0.5)), 100);
        // negative change contributes nothing
        assert!(momentum_score(200, 1.0, Some(-0.5)) < 50);
    }

    #[test]
    fn test_missing_price_survives_normalization() {
        let client = MarketDataClient::with_base_url(
            "http://unused".to_string(),
            vec![],
            ProviderFilters::default(),
        );
        let pair = PairData {
            chain_id: "solana".to_string(),
            dex_id: "raydium".to_string(),
            url: String::new(),
            pair_address: "p1".to_string(),
            base_token: TokenInfo { symbol: "A".to_string(), address: String::new() },
            quote_token: TokenInfo { symbol: "SOL".to_string(), address: String::new() },
            price_usd: None,
            liquidity: LiquidityData { usd: 5000.0 },
            volume: VolumeData { h24: 1000.0 },
            txns: TxnsData::default(),
            price_change: PriceChange::default(),
            pair_created_at: None,
        };
        let (_, row) = client.normalize(pair).unwrap();
        assert_eq!(row.price_usd, None);
        assert_eq!(row.usable_price(), None);
    }
}
