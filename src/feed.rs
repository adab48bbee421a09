use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bar {
    pub ts_ms: i64,
    pub close: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub bid: Decimal,
    pub ask: Decimal,
}

#[derive(Debug)]
pub enum FeedError {
    Http(String),
    InvalidPayload(String),
    MissingData(String),
}

impl fmt::Display for FeedError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FeedError::Http(detail) => write!(f, "feed http error: {}", detail),
            FeedError::InvalidPayload(detail) => write!(f, "invalid feed payload: {}", detail),
            FeedError::MissingData(detail) => write!(f, "missing feed data: {}", detail),
        }
    }
}

impl Error for FeedError {}

#[async_trait]
pub trait MarketDataFeed: Send + Sync {
    async fn get_bars(
        &self,
        ticker: &str,
        start_ms: i64,
        end_ms: i64,
        interval_min: u32,
    ) -> Result<Vec<Bar>, FeedError>;

    async fn get_quote(&self, symbol: &str) -> Result<Quote, FeedError>;
}

/// Close prices for a set of tickers joined on a shared timestamp index.
/// Columns are forward-filled; a ticker is only admitted with at least
/// `min_samples` raw bars over the requested range.
#[derive(Debug)]
pub struct MarketFrame {
    index: Vec<i64>,
    columns: HashMap<String, Vec<Option<f64>>>,
}

impl MarketFrame {
    pub fn from_series(series: HashMap<String, Vec<Bar>>, min_samples: usize) -> Option<Self> {
        let mut admitted: HashMap<String, HashMap<i64, f64>> = HashMap::new();
        let mut index_set: BTreeSet<i64> = BTreeSet::new();
        for (ticker, bars) in series {
            if bars.len() < min_samples {
                log::warn!(
                    "[DATA] {} has {} bars, need {}; excluding this cycle",
                    ticker,
                    bars.len(),
                    min_samples
                );
                continue;
            }
            let mut by_ts = HashMap::with_capacity(bars.len());
            for bar in &bars {
                index_set.insert(bar.ts_ms);
                by_ts.insert(bar.ts_ms, bar.close);
            }
            admitted.insert(ticker, by_ts);
        }
        if admitted.is_empty() {
            return None;
        }

        let index: Vec<i64> = index_set.into_iter().collect();
        let mut columns = HashMap::with_capacity(admitted.len());
        for (ticker, by_ts) in admitted {
            let mut column = Vec::with_capacity(index.len());
            let mut last: Option<f64> = None;
            for ts in &index {
                if let Some(close) = by_ts.get(ts) {
                    last = Some(*close);
                }
                column.push(last);
            }
            columns.insert(ticker, column);
        }
        Some(Self { index, columns })
    }

    pub fn has_ticker(&self, ticker: &str) -> bool {
        self.columns.contains_key(ticker)
    }

    pub fn column(&self, ticker: &str) -> Option<&[Option<f64>]> {
        self.columns.get(ticker).map(|c| c.as_slice())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn latest_close(&self, ticker: &str) -> Option<f64> {
        self.columns.get(ticker).and_then(|c| c.last().copied())?
    }
}

/// Fetch bars for every ticker in one fan-out and join the results into a
/// frame. Per-ticker failures exclude that ticker from the cycle; only a
/// fully empty result is reported as `None`.
pub async fn fetch_frame(
    feed: &Arc<dyn MarketDataFeed>,
    tickers: &BTreeSet<String>,
    lookback_days: u32,
    interval_min: u32,
    min_samples: usize,
) -> Option<MarketFrame> {
    let end_ms = Utc::now().timestamp_millis();
    let start_ms = end_ms - i64::from(lookback_days) * 86_400_000;

    let mut set: JoinSet<(String, Result<Vec<Bar>, FeedError>)> = JoinSet::new();
    for ticker in tickers {
        let feed = Arc::clone(feed);
        let ticker = ticker.clone();
        set.spawn(async move {
            let bars = feed.get_bars(&ticker, start_ms, end_ms, interval_min).await;
            (ticker, bars)
        });
    }

    // Join every download before any of the data is used.
    let mut series: HashMap<String, Vec<Bar>> = HashMap::new();
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((ticker, Ok(bars))) => {
                series.insert(ticker, bars);
            }
            Ok((ticker, Err(e))) => {
                log::warn!("[DATA] failed to fetch bars for {}: {}", ticker, e);
            }
            Err(e) => {
                log::error!("[DATA] bar download task failed: {}", e);
            }
        }
    }
    if series.is_empty() {
        log::error!("[DATA] no valid market data downloaded");
        return None;
    }
    MarketFrame::from_series(series, min_samples)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bars(points: &[(i64, f64)]) -> Vec<Bar> {
        points
            .iter()
            .map(|(ts_ms, close)| Bar {
                ts_ms: *ts_ms,
                close: *close,
            })
            .collect()
    }

    #[test]
    fn from_series_drops_tickers_below_min_samples() {
        let mut series = HashMap::new();
        series.insert("AAA".to_string(), bars(&[(1, 10.0), (2, 11.0), (3, 12.0)]));
        series.insert("BBB".to_string(), bars(&[(1, 20.0)]));
        let frame = MarketFrame::from_series(series, 2).unwrap();
        assert!(frame.has_ticker("AAA"));
        assert!(!frame.has_ticker("BBB"));
    }

    #[test]
    fn from_series_returns_none_when_nothing_qualifies() {
        let mut series = HashMap::new();
        series.insert("AAA".to_string(), bars(&[(1, 10.0)]));
        assert!(MarketFrame::from_series(series, 5).is_none());
    }

    #[test]
    fn columns_are_joined_and_forward_filled() {
        let mut series = HashMap::new();
        series.insert("AAA".to_string(), bars(&[(1, 10.0), (3, 12.0)]));
        series.insert("BBB".to_string(), bars(&[(1, 20.0), (2, 21.0)]));
        let frame = MarketFrame::from_series(series, 2).unwrap();
        assert_eq!(frame.len(), 3);
        assert_eq!(
            frame.column("AAA").unwrap(),
            &[Some(10.0), Some(10.0), Some(12.0)]
        );
        assert_eq!(
            frame.column("BBB").unwrap(),
            &[Some(20.0), Some(21.0), Some(21.0)]
        );
        assert_eq!(frame.latest_close("BBB"), Some(21.0));
    }

    #[test]
    fn leading_gaps_stay_undefined() {
        let mut series = HashMap::new();
        series.insert("AAA".to_string(), bars(&[(1, 10.0), (2, 11.0)]));
        series.insert("BBB".to_string(), bars(&[(2, 21.0), (3, 22.0)]));
        let frame = MarketFrame::from_series(series, 2).unwrap();
        assert_eq!(frame.column("BBB").unwrap()[0], None);
    }
}
