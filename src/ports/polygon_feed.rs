use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;

use crate::feed::{Bar, FeedError, MarketDataFeed, Quote};

/// Aggregate-bar and NBBO-quote client for a Polygon-style REST API.
pub struct PolygonFeed {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl PolygonFeed {
    pub fn new(base_url: &str, api_key: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    status: Option<String>,
    results: Option<Vec<AggBar>>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    t: i64,
    c: f64,
}

#[derive(Debug, Deserialize)]
struct QuotesResponse {
    status: Option<String>,
    results: Option<Vec<NbboQuote>>,
}

#[derive(Debug, Deserialize)]
struct NbboQuote {
    bid_price: Option<Decimal>,
    ask_price: Option<Decimal>,
}

fn bars_from_payload(payload: AggsResponse, ticker: &str) -> Result<Vec<Bar>, FeedError> {
    if payload.status.as_deref() != Some("OK") {
        return Err(FeedError::InvalidPayload(format!(
            "aggregates status {:?} for {}",
            payload.status, ticker
        )));
    }
    let results = payload
        .results
        .ok_or_else(|| FeedError::MissingData(format!("no aggregates for {}", ticker)))?;
    Ok(results
        .into_iter()
        .map(|bar| Bar {
            ts_ms: bar.t,
            close: bar.c,
        })
        .collect())
}

fn quote_from_payload(payload: QuotesResponse, symbol: &str) -> Result<Quote, FeedError> {
    if payload.status.as_deref() != Some("OK") {
        return Err(FeedError::InvalidPayload(format!(
            "quote status {:?} for {}",
            payload.status, symbol
        )));
    }
    let newest = payload
        .results
        .and_then(|mut results| {
            if results.is_empty() {
                None
            } else {
                Some(results.remove(0))
            }
        })
        .ok_or_else(|| FeedError::MissingData(format!("no quotes for {}", symbol)))?;
    match (newest.bid_price, newest.ask_price) {
        (Some(bid), Some(ask)) => Ok(Quote { bid, ask }),
        _ => Err(FeedError::MissingData(format!(
            "quote for {} is missing a side",
            symbol
        ))),
    }
}

#[async_trait]
impl MarketDataFeed for PolygonFeed {
    async fn get_bars(
        &self,
        ticker: &str,
        start_ms: i64,
        end_ms: i64,
        interval_min: u32,
    ) -> Result<Vec<Bar>, FeedError> {
        let url = format!(
            "{}/v2/aggs/ticker/{}/range/{}/minute/{}/{}",
            self.base_url, ticker, interval_min, start_ms, end_ms
        );
        let response = self
            .client
            .get(&url)
            .query(&[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", "50000"),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Http(format!(
                "HTTP {} fetching bars for {}",
                response.status(),
                ticker
            )));
        }
        let payload: AggsResponse = response
            .json()
            .await
            .map_err(|e| FeedError::InvalidPayload(e.to_string()))?;
        bars_from_payload(payload, ticker)
    }

    async fn get_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
        let url = format!("{}/v3/quotes/{}", self.base_url, symbol);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("limit", "1"),
                ("sort", "timestamp"),
                ("order", "desc"),
                ("apiKey", self.api_key.as_str()),
            ])
            .send()
            .await
            .map_err(|e| FeedError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(FeedError::Http(format!(
                "HTTP {} fetching quote for {}",
                response.status(),
                symbol
            )));
        }
        let payload: QuotesResponse = response
            .json()
            .await
            .map_err(|e| FeedError::InvalidPayload(e.to_string()))?;
        quote_from_payload(payload, symbol)
    }
}
