use async_trait::async_trait;
use once_cell::sync::Lazy;
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::broker::{
    BrokerError, BrokerFactory, BrokerSession, OrderKind, OrderRequest, OrderStatus, OrderTicket,
    OrderUpdate,
};
use crate::feed::MarketDataFeed;

static FILL_PROBABILITY: Lazy<f64> = Lazy::new(|| {
    std::env::var("PAPER_FILL_PROBABILITY")
        .ok()
        .and_then(|value| value.parse::<f64>().ok())
        .map(|p| p.clamp(0.0, 1.0))
        .unwrap_or(1.0)
});

/// In-memory venue for dry runs and tests. Market orders always fill at the
/// feed's current mid; limit orders fill at their limit price subject to the
/// configured probability, otherwise they stay pending until cancelled.
pub struct PaperVenue {
    feed: Arc<dyn MarketDataFeed>,
    fill_probability: f64,
}

impl PaperVenue {
    pub fn new(feed: Arc<dyn MarketDataFeed>) -> Self {
        Self {
            feed,
            fill_probability: *FILL_PROBABILITY,
        }
    }

    pub fn with_fill_probability(feed: Arc<dyn MarketDataFeed>, fill_probability: f64) -> Self {
        Self {
            feed,
            fill_probability: fill_probability.clamp(0.0, 1.0),
        }
    }
}

#[async_trait]
impl BrokerFactory for PaperVenue {
    async fn connect(&self, client_id: u32) -> Result<Arc<dyn BrokerSession>, BrokerError> {
        log::info!("[PAPER] client {} connected", client_id);
        Ok(Arc::new(PaperSession {
            client_id,
            feed: Arc::clone(&self.feed),
            fill_probability: self.fill_probability,
            orders: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(0),
        }))
    }
}

#[derive(Debug, Clone)]
struct PaperOrder {
    status: OrderStatus,
    filled_price: Option<Decimal>,
}

pub struct PaperSession {
    client_id: u32,
    feed: Arc<dyn MarketDataFeed>,
    fill_probability: f64,
    orders: Mutex<HashMap<String, PaperOrder>>,
    next_id: AtomicUsize,
}

#[async_trait]
impl BrokerSession for PaperSession {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderTicket, BrokerError> {
        let order_id = format!(
            "paper-{}-{}",
            self.client_id,
            self.next_id.fetch_add(1, Ordering::SeqCst)
        );
        let order = match &request.kind {
            OrderKind::Limit { limit_price } => {
                let fills = rand::thread_rng().gen::<f64>() < self.fill_probability;
                if fills {
                    PaperOrder {
                        status: OrderStatus::Filled,
                        filled_price: Some(*limit_price),
                    }
                } else {
                    PaperOrder {
                        status: OrderStatus::Submitted,
                        filled_price: None,
                    }
                }
            }
            OrderKind::Market => {
                let quote = self.feed.get_quote(&request.symbol).await.map_err(|e| {
                    BrokerError::Other(format!("no mark price for {}: {}", request.symbol, e))
                })?;
                PaperOrder {
                    status: OrderStatus::Filled,
                    filled_price: Some((quote.bid + quote.ask) / Decimal::TWO),
                }
            }
        };
        log::debug!(
            "[PAPER] client {} {} {} {} x{} -> {:?}",
            self.client_id,
            order_id,
            request.action,
            request.symbol,
            request.quantity,
            order.status
        );
        self.orders.lock().unwrap().insert(order_id.clone(), order);
        Ok(OrderTicket { order_id })
    }

    async fn poll_status(&self, ticket: &OrderTicket) -> Result<OrderUpdate, BrokerError> {
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(&ticket.order_id)
            .ok_or_else(|| BrokerError::UnknownOrder(ticket.order_id.clone()))?;
        Ok(OrderUpdate {
            status: order.status,
            filled_price: order.filled_price,
        })
    }

    async fn cancel(&self, ticket: &OrderTicket) -> Result<(), BrokerError> {
        let mut orders = self.orders.lock().unwrap();
        if let Some(order) = orders.get_mut(&ticket.order_id) {
            if !order.status.is_terminal() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn disconnect(&self) {
        log::debug!("[PAPER] client {} disconnected", self.client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::OrderAction;
    use crate::feed::{Bar, FeedError, Quote};
    use rust_decimal_macros::dec;

    struct OneQuoteFeed;

    #[async_trait]
    impl MarketDataFeed for OneQuoteFeed {
        async fn get_bars(
            &self,
            ticker: &str,
            _start_ms: i64,
            _end_ms: i64,
            _interval_min: u32,
        ) -> Result<Vec<Bar>, FeedError> {
            Err(FeedError::MissingData(ticker.to_string()))
        }

        async fn get_quote(&self, symbol: &str) -> Result<Quote, FeedError> {
            if symbol == "AAA" {
                Ok(Quote {
                    bid: dec!(9.98),
                    ask: dec!(10.02),
                })
            } else {
                Err(FeedError::MissingData(symbol.to_string()))
            }
        }
    }

    fn request(symbol: &str, kind: OrderKind) -> OrderRequest {
        OrderRequest {
            symbol: symbol.to_string(),
            action: OrderAction::Buy,
            quantity: 5,
            kind,
        }
    }

    async fn session(fill_probability: f64) -> Arc<dyn BrokerSession> {
        PaperVenue::with_fill_probability(Arc::new(OneQuoteFeed), fill_probability)
            .connect(9)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn limit_orders_fill_at_their_limit_price() {
        let session = session(1.0).await;
        let ticket = session
            .place_order(&request(
                "AAA",
                OrderKind::Limit {
                    limit_price: dec!(9.99),
                },
            ))
            .await
            .unwrap();
        let update = session.poll_status(&ticket).await.unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.filled_price, Some(dec!(9.99)));
    }

    #[tokio::test]
    async fn market_orders_fill_at_the_quote_mid() {
        let session = session(0.0).await;
        let ticket = session
            .place_order(&request("AAA", OrderKind::Market))
            .await
            .unwrap();
        let update = session.poll_status(&ticket).await.unwrap();
        assert_eq!(update.status, OrderStatus::Filled);
        assert_eq!(update.filled_price, Some(dec!(10.00)));
    }

    #[tokio::test]
    async fn unfilled_limit_orders_stay_pending_until_cancelled() {
        let session = session(0.0).await;
        let ticket = session
            .place_order(&request(
                "AAA",
                OrderKind::Limit {
                    limit_price: dec!(9.99),
                },
            ))
            .await
            .unwrap();
        assert_eq!(
            session.poll_status(&ticket).await.unwrap().status,
            OrderStatus::Submitted
        );
        session.cancel(&ticket).await.unwrap();
        assert_eq!(
            session.poll_status(&ticket).await.unwrap().status,
            OrderStatus::Cancelled
        );
    }

    #[tokio::test]
    async fn market_order_without_a_mark_price_is_refused() {
        let session = session(1.0).await;
        let result = session.place_order(&request("ZZZ", OrderKind::Market)).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn polling_an_unknown_order_is_an_error() {
        let session = session(1.0).await;
        let result = session
            .poll_status(&OrderTicket {
                order_id: "missing".to_string(),
            })
            .await;
        assert!(matches!(result, Err(BrokerError::UnknownOrder(_))));
    }
}
