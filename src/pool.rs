use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{sleep, Duration};

use crate::config::PairSpec;
use crate::session::{run_session, SessionContext, SessionOutcome};

pub fn chunk_pairs(pairs: &[PairSpec], chunk_size: usize) -> Vec<Vec<PairSpec>> {
    if chunk_size == 0 {
        return vec![pairs.to_vec()];
    }
    pairs.chunks(chunk_size).map(|c| c.to_vec()).collect()
}

/// Partition the eligible pairs into batches and run one session per batch,
/// at most `max_parallel_sessions` at a time. Each session gets a connection
/// identity of `client_id_base + batch_index`, unique among live sessions,
/// and launches are staggered to avoid overwhelming venue connection setup.
/// A failed session is logged and excluded; it never aborts the pool.
pub async fn dispatch_entry_sessions(
    ctx: &SessionContext,
    pairs: Vec<PairSpec>,
) -> SessionOutcome {
    let mut merged = SessionOutcome::default();
    if pairs.is_empty() {
        return merged;
    }

    let chunks = chunk_pairs(&pairs, ctx.cfg.batch_size);
    log::info!(
        "[POOL] dispatching {} pairs in {} batches (max {} parallel)",
        pairs.len(),
        chunks.len(),
        ctx.cfg.max_parallel_sessions
    );

    let semaphore = Arc::new(Semaphore::new(ctx.cfg.max_parallel_sessions));
    let stagger = Duration::from_millis(ctx.cfg.session_stagger_ms);
    let mut set: JoinSet<SessionOutcome> = JoinSet::new();
    for (index, chunk) in chunks.into_iter().enumerate() {
        let ctx = ctx.clone();
        let semaphore = Arc::clone(&semaphore);
        let client_id = ctx.cfg.client_id_base + index as u32;
        set.spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                // only on shutdown of the semaphore, which we never do
                return SessionOutcome::default();
            };
            run_session(ctx, chunk, client_id).await
        });
        sleep(stagger).await;
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(outcome) => merged.merge(outcome),
            Err(e) => log::error!("[POOL] session task failed: {}", e),
        }
    }
    merged
}
