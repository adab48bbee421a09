use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::time::{sleep, Duration};

use crate::broker::{
    BrokerError, BrokerSession, OrderAction, OrderKind, OrderRequest, OrderStatus, OrderTicket,
    OrderUpdate,
};
use crate::config::BotConfig;
use crate::feed::MarketDataFeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FillKind {
    Limit,
    Market,
}

/// A completed order. Market fills carry a real fill price just like limit
/// fills; downstream accounting never special-cases the fill kind.
#[derive(Debug, Clone)]
pub struct OrderResult {
    pub symbol: String,
    pub action: OrderAction,
    pub quantity: u32,
    pub fill_price: Decimal,
    pub fill_kind: FillKind,
}

#[derive(Debug)]
pub enum OrderError {
    QuoteUnavailable(String),
    InvalidPrice(Decimal),
    InvalidQuantity,
    OrderFailed(String),
    Broker(BrokerError),
}

impl fmt::Display for OrderError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OrderError::QuoteUnavailable(symbol) => write!(f, "no usable quote for {}", symbol),
            OrderError::InvalidPrice(price) => write!(f, "invalid price: {}", price),
            OrderError::InvalidQuantity => write!(f, "computed quantity is zero"),
            OrderError::OrderFailed(detail) => write!(f, "order failed: {}", detail),
            OrderError::Broker(e) => write!(f, "broker error: {}", e),
        }
    }
}

impl Error for OrderError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OrderError::Broker(e) => Some(e),
            _ => None,
        }
    }
}

impl From<BrokerError> for OrderError {
    fn from(err: BrokerError) -> Self {
        OrderError::Broker(err)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EscalationPolicy {
    pub initial_timeout: Duration,
    pub escalation_timeout: Duration,
    pub max_escalations: u32,
}

impl EscalationPolicy {
    fn timeout_for_round(&self, round: u32) -> Duration {
        if round == 0 {
            self.initial_timeout
        } else {
            self.escalation_timeout
        }
    }
}

#[derive(Debug, Clone)]
pub struct OrderParams {
    pub tick_size: Decimal,
    pub entry: EscalationPolicy,
    pub exit: EscalationPolicy,
    pub entry_market_timeout: Duration,
    pub poll_interval: Duration,
}

impl OrderParams {
    pub fn from_config(cfg: &BotConfig) -> Self {
        Self {
            tick_size: cfg.tick_size,
            entry: EscalationPolicy {
                initial_timeout: Duration::from_secs(cfg.entry_initial_timeout_secs),
                escalation_timeout: Duration::from_secs(cfg.entry_escalation_timeout_secs),
                max_escalations: cfg.entry_max_escalations,
            },
            exit: EscalationPolicy {
                initial_timeout: Duration::from_secs(cfg.exit_initial_timeout_secs),
                escalation_timeout: Duration::from_secs(cfg.exit_escalation_timeout_secs),
                max_escalations: cfg.exit_max_escalations,
            },
            entry_market_timeout: Duration::from_secs(cfg.entry_market_timeout_secs),
            poll_interval: Duration::from_millis(cfg.order_poll_interval_ms),
        }
    }
}

enum WaitOutcome {
    Terminal(OrderUpdate),
    TimedOut,
}

/// Drives one order through quote -> limit -> escalate -> market fallback
/// against a single venue session.
pub struct OrderExecutor {
    session: Arc<dyn BrokerSession>,
    feed: Arc<dyn MarketDataFeed>,
    params: OrderParams,
}

impl OrderExecutor {
    pub fn new(
        session: Arc<dyn BrokerSession>,
        feed: Arc<dyn MarketDataFeed>,
        params: OrderParams,
    ) -> Self {
        Self {
            session,
            feed,
            params,
        }
    }

    /// NBBO mid, snapped to the tick grid. Fails when either side of the
    /// quote is missing or non-positive.
    pub async fn reference_price(&self, symbol: &str) -> Result<Decimal, OrderError> {
        let quote = self
            .feed
            .get_quote(symbol)
            .await
            .map_err(|e| {
                log::warn!("[QUOTE] failed to fetch NBBO for {}: {}", symbol, e);
                OrderError::QuoteUnavailable(symbol.to_string())
            })?;
        if quote.bid <= Decimal::ZERO || quote.ask <= Decimal::ZERO {
            log::warn!(
                "[QUOTE] invalid NBBO for {}: bid={} ask={}",
                symbol,
                quote.bid,
                quote.ask
            );
            return Err(OrderError::QuoteUnavailable(symbol.to_string()));
        }
        let mid = (quote.bid + quote.ask) / Decimal::TWO;
        Ok(round_to_tick(mid, self.params.tick_size))
    }

    pub fn sized_quantity(&self, notional: Decimal, price: Decimal) -> Result<u32, OrderError> {
        if price <= Decimal::ZERO {
            return Err(OrderError::InvalidPrice(price));
        }
        let quantity = (notional / price).ceil().to_u32().unwrap_or(0);
        if quantity == 0 {
            return Err(OrderError::InvalidQuantity);
        }
        Ok(quantity)
    }

    /// Entry side of the protocol: tiered limit orders, then a market order
    /// with a bounded wait. An unfilled market entry is cancelled and
    /// reported as failed -- the engine must not assume a position exists.
    pub async fn entry_with_escalation(
        &self,
        symbol: &str,
        action: OrderAction,
        notional: Decimal,
    ) -> Result<OrderResult, OrderError> {
        let base_price = self.reference_price(symbol).await?;
        let quantity = self.sized_quantity(notional, base_price)?;
        let price = match self
            .run_limit_rounds(symbol, action, quantity, base_price, self.params.entry, "ENTRY")
            .await?
        {
            LimitRoundsOutcome::Filled(result) => return Ok(result),
            LimitRoundsOutcome::Exhausted(price) => price,
        };

        log::info!(
            "[ENTRY] all escalated limit orders for {} unfilled; placing market order",
            symbol
        );
        let ticket = self
            .session
            .place_order(&OrderRequest {
                symbol: symbol.to_string(),
                action,
                quantity,
                kind: OrderKind::Market,
            })
            .await?;
        match self
            .wait_for_fill(&ticket, Some(self.params.entry_market_timeout))
            .await?
        {
            WaitOutcome::Terminal(update) if update.status == OrderStatus::Filled => {
                log::info!("[ENTRY] market order for {} filled", symbol);
                Ok(self.result(symbol, action, quantity, update.filled_price, price, FillKind::Market))
            }
            WaitOutcome::Terminal(update) => Err(OrderError::OrderFailed(format!(
                "market entry for {} ended {:?} without fill",
                symbol, update.status
            ))),
            WaitOutcome::TimedOut => {
                log::info!(
                    "[ENTRY] market order for {} did not fill within {:?}; cancelling and moving on",
                    symbol,
                    self.params.entry_market_timeout
                );
                self.cancel_if_pending(&ticket, symbol).await;
                Err(OrderError::OrderFailed(format!(
                    "market entry for {} timed out",
                    symbol
                )))
            }
        }
    }

    /// Exit side of the protocol: the reverse action for the same quantity.
    /// The final market order blocks without a bound until the venue reports
    /// a terminal state -- an open position must eventually be flattened.
    pub async fn exit_with_escalation(
        &self,
        symbol: &str,
        entry_action: OrderAction,
        quantity: u32,
    ) -> Result<OrderResult, OrderError> {
        let action = entry_action.opposite();
        let base_price = self.reference_price(symbol).await?;
        let price = match self
            .run_limit_rounds(symbol, action, quantity, base_price, self.params.exit, "EXIT")
            .await?
        {
            LimitRoundsOutcome::Filled(result) => return Ok(result),
            LimitRoundsOutcome::Exhausted(price) => price,
        };

        log::info!(
            "[EXIT] all escalated exit limit orders for {} unfilled; placing market order",
            symbol
        );
        let ticket = self
            .session
            .place_order(&OrderRequest {
                symbol: symbol.to_string(),
                action,
                quantity,
                kind: OrderKind::Market,
            })
            .await?;
        match self.wait_for_fill(&ticket, None).await? {
            WaitOutcome::Terminal(update) if update.status == OrderStatus::Filled => {
                log::info!("[EXIT] market exit order for {} filled", symbol);
                Ok(self.result(symbol, action, quantity, update.filled_price, price, FillKind::Market))
            }
            WaitOutcome::Terminal(update) => {
                log::error!(
                    "[EXIT] market exit for {} ended {:?} without fill; position remains open",
                    symbol,
                    update.status
                );
                Err(OrderError::OrderFailed(format!(
                    "market exit for {} ended {:?}",
                    symbol, update.status
                )))
            }
            // unreachable: the unbounded wait only resolves on a terminal state
            WaitOutcome::TimedOut => Err(OrderError::OrderFailed(format!(
                "market exit for {} timed out",
                symbol
            ))),
        }
    }

    async fn run_limit_rounds(
        &self,
        symbol: &str,
        action: OrderAction,
        quantity: u32,
        base_price: Decimal,
        policy: EscalationPolicy,
        stage: &str,
    ) -> Result<LimitRoundsOutcome, OrderError> {
        let mut price = base_price;
        for round in 0..=policy.max_escalations {
            log::info!(
                "[{}] attempt {}: placing {} limit order for {} ({} shares) at {}",
                stage,
                round + 1,
                action,
                symbol,
                quantity,
                price
            );
            let ticket = self
                .session
                .place_order(&OrderRequest {
                    symbol: symbol.to_string(),
                    action,
                    quantity,
                    kind: OrderKind::Limit { limit_price: price },
                })
                .await?;
            let timeout = policy.timeout_for_round(round);
            match self.wait_for_fill(&ticket, Some(timeout)).await? {
                WaitOutcome::Terminal(update) if update.status == OrderStatus::Filled => {
                    log::info!(
                        "[{}] order for {} filled at {} on attempt {}",
                        stage,
                        symbol,
                        price,
                        round + 1
                    );
                    return Ok(LimitRoundsOutcome::Filled(self.result(
                        symbol,
                        action,
                        quantity,
                        update.filled_price,
                        price,
                        FillKind::Limit,
                    )));
                }
                WaitOutcome::Terminal(update) => {
                    log::info!(
                        "[{}] order for {} ended {:?} at {}; escalating",
                        stage,
                        symbol,
                        update.status,
                        price
                    );
                }
                WaitOutcome::TimedOut => {
                    log::info!(
                        "[{}] order for {} did not fill within {:?} at {}; cancelling and escalating",
                        stage,
                        symbol,
                        timeout,
                        price
                    );
                    self.cancel_if_pending(&ticket, symbol).await;
                }
            }
            // one tick toward urgency: up for BUY, down for SELL
            price = escalate_price(price, action, self.params.tick_size);
        }
        Ok(LimitRoundsOutcome::Exhausted(price))
    }

    fn result(
        &self,
        symbol: &str,
        action: OrderAction,
        quantity: u32,
        reported_price: Option<Decimal>,
        reference_price: Decimal,
        fill_kind: FillKind,
    ) -> OrderResult {
        // estimate with the protocol's own price when the venue omits it
        let fill_price = reported_price.unwrap_or(reference_price);
        OrderResult {
            symbol: symbol.to_string(),
            action,
            quantity,
            fill_price,
            fill_kind,
        }
    }

    async fn wait_for_fill(
        &self,
        ticket: &OrderTicket,
        timeout: Option<Duration>,
    ) -> Result<WaitOutcome, OrderError> {
        let start = Instant::now();
        loop {
            sleep(self.params.poll_interval).await;
            let update = self.session.poll_status(ticket).await?;
            log::debug!(
                "[ORDER] {} status after {:.1?}: {:?}",
                ticket.order_id,
                start.elapsed(),
                update.status
            );
            if update.status.is_terminal() {
                return Ok(WaitOutcome::Terminal(update));
            }
            if let Some(limit) = timeout {
                if start.elapsed() > limit {
                    log::debug!(
                        "[ORDER] timeout reached for {} after {:.1?}",
                        ticket.order_id,
                        start.elapsed()
                    );
                    return Ok(WaitOutcome::TimedOut);
                }
            }
        }
    }

    /// Best-effort: cancellation failures are logged, never escalated.
    async fn cancel_if_pending(&self, ticket: &OrderTicket, symbol: &str) {
        match self.session.cancel(ticket).await {
            Ok(()) => log::debug!("[ORDER] cancelled {} for {}", ticket.order_id, symbol),
            Err(e) => log::warn!(
                "[ORDER] failed to cancel {} for {}: {}",
                ticket.order_id,
                symbol,
                e
            ),
        }
    }
}

enum LimitRoundsOutcome {
    Filled(OrderResult),
    Exhausted(Decimal),
}

/// Snap a price to the nearest multiple of `tick`.
pub fn round_to_tick(price: Decimal, tick: Decimal) -> Decimal {
    if tick <= Decimal::ZERO {
        return price;
    }
    let multiples = (price / tick).round();
    (multiples * tick).normalize()
}

fn escalate_price(price: Decimal, action: OrderAction, tick: Decimal) -> Decimal {
    let moved = match action {
        OrderAction::Buy => price + tick,
        OrderAction::Sell => price - tick,
    };
    round_to_tick(moved, tick)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{Bar, FeedError, MarketDataFeed, Quote};
    use async_trait::async_trait;
    use rust_decimal_macros::dec;
    use std::collections::HashMap;
    use std::str::FromStr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn dec_s(value: &str) -> Decimal {
        Decimal::from_str(value).unwrap()
    }

    #[derive(Debug, Clone, Copy)]
    struct FillRule {
        fill_limits: bool,
        fill_market: bool,
    }

    struct ScriptedOrder {
        request: OrderRequest,
        will_fill: bool,
        cancelled: bool,
        polls: u32,
    }

    struct ScriptedBroker {
        default_rule: FillRule,
        rules: HashMap<String, FillRule>,
        market_fill_price: Option<Decimal>,
        market_fill_after_polls: u32,
        placed: Mutex<Vec<OrderRequest>>,
        cancelled: Mutex<Vec<String>>,
        orders: Mutex<HashMap<String, ScriptedOrder>>,
        next_id: AtomicUsize,
    }

    impl ScriptedBroker {
        fn new(default_rule: FillRule) -> Self {
            Self {
                default_rule,
                rules: HashMap::new(),
                market_fill_price: None,
                market_fill_after_polls: 0,
                placed: Mutex::new(Vec::new()),
                cancelled: Mutex::new(Vec::new()),
                orders: Mutex::new(HashMap::new()),
                next_id: AtomicUsize::new(0),
            }
        }

        fn placed_requests(&self) -> Vec<OrderRequest> {
            self.placed.lock().unwrap().clone()
        }

        fn cancelled_ids(&self) -> Vec<String> {
            self.cancelled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BrokerSession for ScriptedBroker {
        async fn place_order(&self, request: &OrderRequest) -> Result<OrderTicket, BrokerError> {
            let order_id = format!("scripted-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
            let rule = self
                .rules
                .get(&request.symbol)
                .copied()
                .unwrap_or(self.default_rule);
            let will_fill = match request.kind {
                OrderKind::Limit { .. } => rule.fill_limits,
                OrderKind::Market => rule.fill_market,
            };
            self.placed.lock().unwrap().push(request.clone());
            self.orders.lock().unwrap().insert(
                order_id.clone(),
                ScriptedOrder {
                    request: request.clone(),
                    will_fill,
                    cancelled: false,
                    polls: 0,
                },
            );
            Ok(OrderTicket { order_id })
        }

        async fn poll_status(&self, ticket: &OrderTicket) -> Result<OrderUpdate, BrokerError> {
            let mut orders = self.orders.lock().unwrap();
            let order = orders
                .get_mut(&ticket.order_id)
                .ok_or_else(|| BrokerError::UnknownOrder(ticket.order_id.clone()))?;
            order.polls += 1;
            if order.cancelled {
                return Ok(OrderUpdate {
                    status: OrderStatus::Cancelled,
                    filled_price: None,
                });
            }
            if order.will_fill && order.polls > self.market_fill_after_polls {
                let filled_price = match &order.request.kind {
                    OrderKind::Limit { limit_price } => Some(*limit_price),
                    OrderKind::Market => self.market_fill_price,
                };
                return Ok(OrderUpdate {
                    status: OrderStatus::Filled,
                    filled_price,
                });
            }
            Ok(OrderUpdate {
                status: OrderStatus::Submitted,
                filled_price: None,
            })
        }

        async fn cancel(&self, ticket: &OrderTicket) -> Result<(), BrokerError> {
            self.cancelled.lock().unwrap().push(ticket.order_id.clone());
            if let Some(order) = self.orders.lock().unwrap().get_mut(&ticket.order_id) {
                order.cancelled = true;
            }
            Ok(())
        }

        async fn disconnect(&self) {}
    }

    struct StaticFeed {
        quotes: HashMap<String, Quote>,
    }

    impl StaticFeed {
        fn with_quote(symbol: &str, bid: &str, ask: &str) -> Self {
            let mut quotes = HashMap::new();
            quotes.insert(
                symbol.to_string(),
                Quote {
                    bid: dec_s(bid),
                    ask: dec_s(ask),
                },
            );
            Self { quotes }
        }
    }

    #[async_trait]
    impl MarketDataFeed for StaticFeed {
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
            self.quotes
                .get(symbol)
                .copied()
                .ok_or_else(|| FeedError::MissingData(symbol.to_string()))
        }
    }

    fn test_params() -> OrderParams {
        OrderParams {
            tick_size: dec!(0.01),
            entry: EscalationPolicy {
                initial_timeout: Duration::from_millis(30),
                escalation_timeout: Duration::from_millis(20),
                max_escalations: 3,
            },
            exit: EscalationPolicy {
                initial_timeout: Duration::from_millis(30),
                escalation_timeout: Duration::from_millis(20),
                max_escalations: 2,
            },
            entry_market_timeout: Duration::from_millis(60),
            poll_interval: Duration::from_millis(5),
        }
    }

    fn executor(broker: Arc<ScriptedBroker>, feed: StaticFeed) -> OrderExecutor {
        OrderExecutor::new(broker, Arc::new(feed), test_params())
    }

    fn limit_prices(requests: &[OrderRequest]) -> Vec<Decimal> {
        requests
            .iter()
            .filter_map(|r| match r.kind {
                OrderKind::Limit { limit_price } => Some(limit_price),
                OrderKind::Market => None,
            })
            .collect()
    }

    #[test]
    fn round_to_tick_snaps_to_grid() {
        assert_eq!(round_to_tick(dec!(100.123), dec!(0.01)), dec!(100.12));
        assert_eq!(round_to_tick(dec!(100.127), dec!(0.01)), dec!(100.13));
        assert_eq!(round_to_tick(dec!(100.10), dec!(0.25)), dec!(100.0));
    }

    #[tokio::test]
    async fn sized_quantity_rounds_up() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: true,
            fill_market: true,
        }));
        let exec = executor(broker, StaticFeed::with_quote("AAA", "1", "1"));
        assert_eq!(
            exec.sized_quantity(dec!(500), dec!(33.33)).unwrap(),
            16
        );
    }

    #[tokio::test]
    async fn sized_quantity_rejects_non_positive_price() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: true,
            fill_market: true,
        }));
        let exec = executor(broker, StaticFeed::with_quote("AAA", "1", "1"));
        assert!(matches!(
            exec.sized_quantity(dec!(500), dec!(0)),
            Err(OrderError::InvalidPrice(_))
        ));
    }

    #[tokio::test]
    async fn reference_price_requires_both_quote_sides() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: true,
            fill_market: true,
        }));
        let exec = executor(broker, StaticFeed::with_quote("AAA", "0", "100.01"));
        assert!(matches!(
            exec.reference_price("AAA").await,
            Err(OrderError::QuoteUnavailable(_))
        ));
    }

    #[tokio::test]
    async fn first_attempt_fills_at_the_snapped_mid() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: true,
            fill_market: false,
        }));
        let exec = executor(broker.clone(), StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let result = exec
            .entry_with_escalation("AAA", OrderAction::Buy, dec!(500))
            .await
            .unwrap();
        assert_eq!(result.fill_kind, FillKind::Limit);
        assert_eq!(result.fill_price, dec!(100.00));
        assert_eq!(result.quantity, 5);
        assert_eq!(broker.placed_requests().len(), 1);
    }

    #[tokio::test]
    async fn buy_escalation_walks_up_one_tick_per_round() {
        let mut broker = ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: true,
        });
        broker.market_fill_price = Some(dec!(100.05));
        let broker = Arc::new(broker);
        let exec = executor(broker.clone(), StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let result = exec
            .entry_with_escalation("AAA", OrderAction::Buy, dec!(500))
            .await
            .unwrap();

        let prices = limit_prices(&broker.placed_requests());
        assert_eq!(
            prices,
            vec![dec!(100.00), dec!(100.01), dec!(100.02), dec!(100.03)]
        );
        for step in prices.windows(2) {
            assert_eq!(step[1] - step[0], dec!(0.01));
        }
        assert_eq!(result.fill_kind, FillKind::Market);
        assert_eq!(result.fill_price, dec!(100.05));
        // every timed-out limit attempt was cancelled
        assert_eq!(broker.cancelled_ids().len(), 4);
    }

    #[tokio::test]
    async fn sell_escalation_walks_down_one_tick_per_round() {
        let mut broker = ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: true,
        });
        broker.market_fill_price = Some(dec!(99.9));
        let broker = Arc::new(broker);
        let exec = executor(broker.clone(), StaticFeed::with_quote("AAA", "99.99", "100.01"));
        exec.entry_with_escalation("AAA", OrderAction::Sell, dec!(500))
            .await
            .unwrap();

        let prices = limit_prices(&broker.placed_requests());
        assert_eq!(
            prices,
            vec![dec!(100.00), dec!(99.99), dec!(99.98), dec!(99.97)]
        );
        for step in prices.windows(2) {
            assert_eq!(step[0] - step[1], dec!(0.01));
        }
    }

    #[tokio::test]
    async fn entry_market_timeout_reports_failure_and_cancels() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: false,
        }));
        let exec = executor(broker.clone(), StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let err = exec
            .entry_with_escalation("AAA", OrderAction::Buy, dec!(500))
            .await
            .unwrap_err();
        assert!(matches!(err, OrderError::OrderFailed(_)));
        // 4 limit attempts + the market fallback, all cancelled
        assert_eq!(broker.cancelled_ids().len(), 5);
    }

    #[tokio::test]
    async fn market_fill_without_reported_price_uses_protocol_price() {
        // venue omits the fill price; the result must still carry one
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: true,
        }));
        let exec = executor(broker, StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let result = exec
            .entry_with_escalation("AAA", OrderAction::Buy, dec!(500))
            .await
            .unwrap();
        assert_eq!(result.fill_kind, FillKind::Market);
        assert_eq!(result.fill_price, dec!(100.04));
    }

    #[tokio::test]
    async fn exit_reverses_the_entry_action() {
        let broker = Arc::new(ScriptedBroker::new(FillRule {
            fill_limits: true,
            fill_market: false,
        }));
        let exec = executor(broker.clone(), StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let result = exec
            .exit_with_escalation("AAA", OrderAction::Sell, 7)
            .await
            .unwrap();
        assert_eq!(result.action, OrderAction::Buy);
        assert_eq!(result.quantity, 7);
        assert_eq!(result.fill_kind, FillKind::Limit);
    }

    #[tokio::test]
    async fn exit_market_fallback_waits_for_a_late_fill() {
        let mut broker = ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: true,
        });
        // market fill arrives long after the bounded entry timeout would have
        // given up; the exit path keeps waiting
        broker.market_fill_after_polls = 20;
        broker.market_fill_price = Some(dec!(99.5));
        let broker = Arc::new(broker);
        let exec = executor(broker, StaticFeed::with_quote("AAA", "99.99", "100.01"));
        let result = exec
            .exit_with_escalation("AAA", OrderAction::Buy, 3)
            .await
            .unwrap();
        assert_eq!(result.fill_kind, FillKind::Market);
        assert_eq!(result.fill_price, dec!(99.5));
    }

    #[tokio::test]
    async fn rejected_attempt_escalates_without_cancel() {
        // terminal-but-unfilled attempts escalate directly
        struct RejectingBroker {
            inner: ScriptedBroker,
        }

        #[async_trait]
        impl BrokerSession for RejectingBroker {
            async fn place_order(
                &self,
                request: &OrderRequest,
            ) -> Result<OrderTicket, BrokerError> {
                self.inner.place_order(request).await
            }

            async fn poll_status(&self, ticket: &OrderTicket) -> Result<OrderUpdate, BrokerError> {
                let update = self.inner.poll_status(ticket).await?;
                if update.status == OrderStatus::Filled {
                    return Ok(update);
                }
                Ok(OrderUpdate {
                    status: OrderStatus::Rejected,
                    filled_price: None,
                })
            }

            async fn cancel(&self, ticket: &OrderTicket) -> Result<(), BrokerError> {
                self.inner.cancel(ticket).await
            }

            async fn disconnect(&self) {}
        }

        let mut inner = ScriptedBroker::new(FillRule {
            fill_limits: false,
            fill_market: true,
        });
        inner.market_fill_price = Some(dec!(100.10));
        let broker = Arc::new(RejectingBroker { inner });
        let exec = OrderExecutor::new(
            broker.clone(),
            Arc::new(StaticFeed::with_quote("AAA", "99.99", "100.01")),
            test_params(),
        );
        let result = exec
            .entry_with_escalation("AAA", OrderAction::Buy, dec!(500))
            .await
            .unwrap();
        assert_eq!(result.fill_kind, FillKind::Market);
        assert!(broker.inner.cancelled_ids().is_empty());
        assert_eq!(limit_prices(&broker.inner.placed_requests()).len(), 4);
    }
}
