use std::collections::BTreeSet;
use std::sync::Arc;

use crate::broker::{BrokerFactory, OrderAction};
use crate::config::{BotConfig, PairSpec};
use crate::feed::{fetch_frame, MarketDataFeed};
use crate::order::{OrderError, OrderExecutor, OrderParams, OrderResult};
use crate::signal::zscore;

/// Everything a session needs, passed explicitly instead of living in
/// process-wide state.
#[derive(Clone)]
pub struct SessionContext {
    pub cfg: Arc<BotConfig>,
    pub feed: Arc<dyn MarketDataFeed>,
    pub factory: Arc<dyn BrokerFactory>,
}

#[derive(Debug)]
pub struct EnteredPair {
    pub pair_key: String,
    pub leg1: OrderResult,
    pub leg2: OrderResult,
    pub z: f64,
}

/// Entries achieved by one session plus the pairs whose entry attempts
/// failed. Cooldown placement is left to the orchestrator, which is the only
/// mutator of the registry.
#[derive(Debug, Default)]
pub struct SessionOutcome {
    pub entered: Vec<EnteredPair>,
    pub failed_pairs: Vec<String>,
}

impl SessionOutcome {
    pub fn merge(&mut self, other: SessionOutcome) {
        self.entered.extend(other.entered);
        self.failed_pairs.extend(other.failed_pairs);
    }
}

/// Evaluate and execute entries for one batch of pairs over one exclusive
/// venue connection. A connection failure aborts only this batch; sibling
/// sessions are unaffected.
pub async fn run_session(
    ctx: SessionContext,
    batch: Vec<PairSpec>,
    client_id: u32,
) -> SessionOutcome {
    let mut outcome = SessionOutcome::default();

    let session = match ctx.factory.connect(client_id).await {
        Ok(session) => session,
        Err(e) => {
            log::error!(
                "[SESSION] venue connection failed for client {}: {}",
                client_id,
                e
            );
            return outcome;
        }
    };

    let tickers: BTreeSet<String> = batch
        .iter()
        .flat_map(|pair| [pair.first.clone(), pair.second.clone()])
        .collect();
    let frame = match fetch_frame(
        &ctx.feed,
        &tickers,
        ctx.cfg.lookback_days,
        ctx.cfg.bar_interval_min,
        ctx.cfg.min_bar_samples,
    )
    .await
    {
        Some(frame) => frame,
        None => {
            log::warn!(
                "[SESSION] no valid market data for client {}; skipping batch",
                client_id
            );
            session.disconnect().await;
            return outcome;
        }
    };

    let executor = OrderExecutor::new(
        Arc::clone(&session),
        Arc::clone(&ctx.feed),
        OrderParams::from_config(&ctx.cfg),
    );

    for pair in &batch {
        let key = pair.key();
        let Some(z) = zscore(&frame, &pair.first, &pair.second, ctx.cfg.zscore_window) else {
            log::warn!("[SESSION] could not compute z-score for pair {}", key);
            continue;
        };

        let (action1, action2) = if z > ctx.cfg.enter_threshold_short && z > 0.0 {
            (OrderAction::Sell, OrderAction::Buy)
        } else if z < ctx.cfg.enter_threshold_long && z < 0.0 {
            (OrderAction::Buy, OrderAction::Sell)
        } else {
            log::debug!("[SESSION] no entry conditions met for {} (z={:.3})", key, z);
            continue;
        };
        log::info!(
            "[ENTRY] signal for pair {}: {} {} / {} {} (z={:.3})",
            key,
            action1,
            pair.first,
            action2,
            pair.second,
            z
        );

        let leg1 = match executor
            .entry_with_escalation(&pair.first, action1, ctx.cfg.capital_per_trade)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                log::warn!(
                    "[ENTRY] first leg ({} {}) failed for pair {}: {}",
                    action1,
                    pair.first,
                    key,
                    e
                );
                if warrants_cooldown(&e) {
                    outcome.failed_pairs.push(key);
                }
                continue;
            }
        };

        let leg2 = match executor
            .entry_with_escalation(&pair.second, action2, ctx.cfg.capital_per_trade)
            .await
        {
            Ok(leg) => leg,
            Err(e) => {
                log::warn!(
                    "[ENTRY] second leg ({} {}) failed for pair {} after first leg filled: {}; unwinding {}",
                    action2,
                    pair.second,
                    key,
                    e,
                    pair.first
                );
                // single-leg exposure must not survive the failure
                match executor
                    .exit_with_escalation(&pair.first, leg1.action, leg1.quantity)
                    .await
                {
                    Ok(unwind) => log::info!(
                        "[SAFETY] unwound {} {} x{} at {}",
                        unwind.action,
                        unwind.symbol,
                        unwind.quantity,
                        unwind.fill_price
                    ),
                    Err(unwind_err) => log::error!(
                        "[SAFETY] FAILED to unwind {} after second-leg failure: {}",
                        pair.first,
                        unwind_err
                    ),
                }
                outcome.failed_pairs.push(key);
                continue;
            }
        };

        outcome.entered.push(EnteredPair {
            pair_key: key,
            leg1,
            leg2,
            z,
        });
    }

    session.disconnect().await;
    outcome
}

/// Quote and sizing problems skip the pair for this cycle only; a failure of
/// actual order execution puts the pair on cooldown.
fn warrants_cooldown(err: &OrderError) -> bool {
    matches!(err, OrderError::OrderFailed(_) | OrderError::Broker(_))
}
