use anyhow::{bail, Context, Result};
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use tokio::time::{sleep, Duration};

use crate::broker::{BrokerFactory, BrokerSession, OrderAction};
use crate::config::{load_pair_file, BotConfig, PairSpec};
use crate::cooldown::CooldownRegistry;
use crate::feed::{fetch_frame, MarketDataFeed};
use crate::order::{OrderError, OrderExecutor, OrderParams, OrderResult};
use crate::pool::dispatch_entry_sessions;
use crate::ports::paper_broker::PaperVenue;
use crate::ports::polygon_feed::PolygonFeed;
use crate::session::SessionContext;
use crate::signal::zscore;
use crate::store::{ClosedLeg, ProfitRecord, TradeLeg, TradeStateStore};

/// Top-level control loop. Single-task, not reentrant: the cooldown registry
/// and the trade store are only touched here, between dispatches.
pub struct PairsBot {
    cfg: Arc<BotConfig>,
    ctx: SessionContext,
    primary: Arc<dyn BrokerSession>,
    executor: OrderExecutor,
    store: TradeStateStore,
    cooldown: CooldownRegistry,
    pairs: Vec<PairSpec>,
}

fn build_feed(cfg: &BotConfig) -> Result<Arc<dyn MarketDataFeed>> {
    match cfg.feed_name.as_str() {
        "polygon" => {
            if cfg.polygon_api_key.trim().is_empty() {
                bail!("POLYGON_API_KEY is required for the polygon feed");
            }
            Ok(Arc::new(PolygonFeed::new(
                &cfg.polygon_base_url,
                &cfg.polygon_api_key,
            )))
        }
        other => bail!("unknown market data feed '{}'", other),
    }
}

fn build_factory(
    cfg: &BotConfig,
    feed: &Arc<dyn MarketDataFeed>,
) -> Result<Arc<dyn BrokerFactory>> {
    match cfg.venue_name.as_str() {
        "paper" => Ok(Arc::new(PaperVenue::new(Arc::clone(feed)))),
        other => bail!("unknown trading venue '{}'", other),
    }
}

impl PairsBot {
    pub async fn new(cfg: BotConfig) -> Result<Self> {
        cfg.validate()?;
        let pairs = load_pair_file(&cfg.pair_file)?;
        let cfg = Arc::new(cfg);
        let feed = build_feed(&cfg)?;
        let factory = build_factory(&cfg, &feed)?;
        let primary = factory
            .connect(cfg.primary_client_id)
            .await
            .map_err(|e| anyhow::anyhow!("{}", e))
            .context("venue unreachable at startup (primary session)")?;
        log::info!(
            "[CONFIG] connected primary session (client {})",
            cfg.primary_client_id
        );
        let executor = OrderExecutor::new(
            Arc::clone(&primary),
            Arc::clone(&feed),
            OrderParams::from_config(&cfg),
        );
        let store = TradeStateStore::new(cfg.trades_file.clone(), cfg.profits_file.clone());
        let ctx = SessionContext {
            cfg: Arc::clone(&cfg),
            feed,
            factory,
        };
        Ok(Self {
            cfg,
            ctx,
            primary,
            executor,
            store,
            cooldown: CooldownRegistry::new(),
            pairs,
        })
    }

    pub async fn run(&mut self) -> Result<()> {
        log::info!(
            "[CONFIG] feed={} venue={} universe={} pairs",
            self.cfg.feed_name,
            self.cfg.venue_name,
            self.pairs.len()
        );

        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    let _ = shutdown_tx.send(true);
                }
                Err(e) => log::error!("[SHUTDOWN] failed to listen for interrupt: {}", e),
            }
        });

        loop {
            log::info!("[SCAN] checking for new trade entries");
            self.check_for_entries().await;
            log::info!("[SCAN] monitoring open trades for exit conditions");
            if let Err(e) = self.monitor_and_exit().await {
                log::error!("[EXIT] monitoring cycle failed: {:?}", e);
            }
            if *shutdown_rx.borrow() {
                break;
            }
            log::info!(
                "[SCAN] sleeping {}s before next scan",
                self.cfg.poll_sleep_secs
            );
            tokio::select! {
                _ = sleep(Duration::from_secs(self.cfg.poll_sleep_secs)) => {}
                _ = shutdown_rx.changed() => break,
            }
        }

        log::info!("[SHUTDOWN] interrupt received; disconnecting");
        self.primary.disconnect().await;
        let (closed, total) = self.store.profit_summary();
        log::info!(
            "[SHUTDOWN] {} closed trades on the ledger, net profit {}",
            closed,
            total
        );
        Ok(())
    }

    async fn check_for_entries(&mut self) {
        let now = Utc::now().timestamp();
        let open_keys: HashSet<String> = self
            .store
            .load()
            .iter()
            .map(|leg| leg.pair_key.clone())
            .collect();
        let mut eligible = Vec::new();
        for pair in &self.pairs {
            let key = pair.key();
            if self.cooldown.is_blocked(&key, now) {
                log::info!(
                    "[COOLDOWN] pair {} blocked until {}; skipping",
                    key,
                    self.cooldown.blocked_until(&key).unwrap_or(now)
                );
                continue;
            }
            // at most one open trade per pair
            if open_keys.contains(&key) {
                continue;
            }
            eligible.push(pair.clone());
        }
        if eligible.is_empty() {
            log::debug!("[SCAN] no eligible pairs this cycle");
            return;
        }

        let outcome = dispatch_entry_sessions(&self.ctx, eligible).await;
        for entered in outcome.entered {
            let leg1 = leg_from_result(&entered.leg1);
            let leg2 = leg_from_result(&entered.leg2);
            match self.store.append_pair(leg1, leg2, &entered.pair_key) {
                Ok(()) => log::info!(
                    "[ENTRY] entered trade for pair {} with z-score {:.3}",
                    entered.pair_key,
                    entered.z
                ),
                Err(e) => log::error!(
                    "[STORE] failed to persist entry for {}: {:?}",
                    entered.pair_key,
                    e
                ),
            }
        }
        let now = Utc::now().timestamp();
        for key in outcome.failed_pairs {
            self.cooldown.block(&key, now, self.cfg.cooldown_secs);
            log::warn!(
                "[COOLDOWN] pair {} on cooldown for {}s after entry failure",
                key,
                self.cfg.cooldown_secs
            );
        }
    }

    async fn monitor_and_exit(&mut self) -> Result<()> {
        let trades = self.store.load();
        if trades.len() < 2 {
            return Ok(());
        }
        if trades.len() % 2 != 0 {
            log::error!(
                "[STORE] open-legs store has odd length {}; trailing leg ignored",
                trades.len()
            );
        }

        let tickers: BTreeSet<String> = trades.iter().map(|leg| leg.symbol.clone()).collect();
        let Some(frame) = fetch_frame(
            &self.ctx.feed,
            &tickers,
            self.cfg.lookback_days,
            self.cfg.bar_interval_min,
            self.cfg.min_bar_samples,
        )
        .await
        else {
            log::warn!("[EXIT] no market data available; skipping exit checks");
            return Ok(());
        };

        let mut removals = Vec::new();
        let mut index = 0;
        while index + 1 < trades.len() {
            let (leg1, leg2) = (&trades[index], &trades[index + 1]);
            let Some(z) = zscore(&frame, &leg1.symbol, &leg2.symbol, self.cfg.zscore_window)
            else {
                log::warn!(
                    "[EXIT_CHECK] could not compute z-score for pair ({}, {})",
                    leg1.symbol,
                    leg2.symbol
                );
                index += 2;
                continue;
            };
            log::info!(
                "[EXIT_CHECK] pair ({}, {}): z={:.3}",
                leg1.symbol,
                leg2.symbol,
                z
            );
            if self.cfg.exit_z_low <= z && z <= self.cfg.exit_z_high {
                match self.close_pair(leg1, leg2).await {
                    Ok(record) => {
                        log::info!(
                            "[EXIT] closed pair {} with net profit {}",
                            record.pair_key,
                            record.net_profit
                        );
                        self.store.append_profit(record)?;
                        removals.push(index);
                        removals.push(index + 1);
                    }
                    Err(e) => log::error!("[EXIT] failed to close pair {}: {}", leg1.pair_key, e),
                }
            }
            index += 2;
        }
        if !removals.is_empty() {
            self.store.remove(&removals)?;
        }
        Ok(())
    }

    async fn close_pair(
        &self,
        leg1: &TradeLeg,
        leg2: &TradeLeg,
    ) -> Result<ProfitRecord, OrderError> {
        // fail fast on a dead quote so leg1 cannot be flattened while leg2
        // is stranded without a reference price
        self.executor.reference_price(&leg1.symbol).await?;
        self.executor.reference_price(&leg2.symbol).await?;

        let exit1 = self
            .executor
            .exit_with_escalation(&leg1.symbol, leg1.action, leg1.quantity)
            .await?;
        let exit2 = match self
            .executor
            .exit_with_escalation(&leg2.symbol, leg2.action, leg2.quantity)
            .await
        {
            Ok(result) => result,
            Err(e) => {
                log::error!(
                    "[SAFETY] exit leg {} failed after {} was flattened: {}; trade kept for retry",
                    leg2.symbol,
                    leg1.symbol,
                    e
                );
                return Err(e);
            }
        };

        let profit1 = leg_profit(leg1, exit1.fill_price);
        let profit2 = leg_profit(leg2, exit2.fill_price);
        Ok(ProfitRecord {
            pair_key: leg1.pair_key.clone(),
            leg1: closed_leg(leg1, &exit1, profit1),
            leg2: closed_leg(leg2, &exit2, profit2),
            net_profit: profit1 + profit2,
            entry_time: leg1.entry_time,
            exit_time: Utc::now().timestamp(),
        })
    }
}

fn leg_from_result(result: &OrderResult) -> TradeLeg {
    TradeLeg {
        // pair_key and entry_time are stamped by the store on append
        pair_key: String::new(),
        symbol: result.symbol.clone(),
        action: result.action,
        quantity: result.quantity,
        entry_price: result.fill_price,
        fill_kind: result.fill_kind,
        entry_time: 0,
    }
}

fn closed_leg(entry: &TradeLeg, exit: &OrderResult, profit: Decimal) -> ClosedLeg {
    ClosedLeg {
        symbol: entry.symbol.clone(),
        action: entry.action,
        quantity: entry.quantity,
        entry_price: entry.entry_price,
        exit_price: exit.fill_price,
        profit,
    }
}

/// Realized profit for one leg: `(exit - entry) * qty` for a BUY-opened leg,
/// `(entry - exit) * qty` for a SELL-opened leg.
fn leg_profit(leg: &TradeLeg, exit_price: Decimal) -> Decimal {
    let quantity = Decimal::from(leg.quantity);
    match leg.action {
        OrderAction::Buy => (exit_price - leg.entry_price) * quantity,
        OrderAction::Sell => (leg.entry_price - exit_price) * quantity,
    }
}
