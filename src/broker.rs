use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderAction {
    Buy,
    Sell,
}

impl OrderAction {
    pub fn opposite(self) -> Self {
        match self {
            OrderAction::Buy => OrderAction::Sell,
            OrderAction::Sell => OrderAction::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderAction::Buy => "BUY",
            OrderAction::Sell => "SELL",
        }
    }
}

impl fmt::Display for OrderAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Submitted,
    Filled,
    Cancelled,
    Inactive,
    Rejected,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, OrderStatus::Submitted)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderKind {
    Limit { limit_price: Decimal },
    Market,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: u32,
    pub kind: OrderKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderTicket {
    pub order_id: String,
}

/// Snapshot of an order's venue-side state. `filled_price` is populated once
/// the venue reports a fill; it may lag `status` on venues that report the
/// two separately.
#[derive(Debug, Clone)]
pub struct OrderUpdate {
    pub status: OrderStatus,
    pub filled_price: Option<Decimal>,
}

#[derive(Debug)]
pub enum BrokerError {
    ConnectionFailure(String),
    UnknownOrder(String),
    Other(String),
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            BrokerError::ConnectionFailure(detail) => {
                write!(f, "venue connection failure: {}", detail)
            }
            BrokerError::UnknownOrder(order_id) => write!(f, "unknown order: {}", order_id),
            BrokerError::Other(detail) => write!(f, "venue error: {}", detail),
        }
    }
}

impl Error for BrokerError {}

/// One exclusive venue connection. A session must never be shared between two
/// concurrently running workers.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    async fn place_order(&self, request: &OrderRequest) -> Result<OrderTicket, BrokerError>;
    async fn poll_status(&self, ticket: &OrderTicket) -> Result<OrderUpdate, BrokerError>;
    async fn cancel(&self, ticket: &OrderTicket) -> Result<(), BrokerError>;
    async fn disconnect(&self);
}

#[async_trait]
pub trait BrokerFactory: Send + Sync {
    async fn connect(&self, client_id: u32) -> Result<Arc<dyn BrokerSession>, BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opposite_action_flips_side() {
        assert_eq!(OrderAction::Buy.opposite(), OrderAction::Sell);
        assert_eq!(OrderAction::Sell.opposite(), OrderAction::Buy);
    }

    #[test]
    fn submitted_is_the_only_non_terminal_status() {
        assert!(!OrderStatus::Submitted.is_terminal());
        for status in [
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Inactive,
            OrderStatus::Rejected,
        ] {
            assert!(status.is_terminal());
        }
    }
}
