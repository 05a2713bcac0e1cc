//! Queue worker loop and retry policy

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use super::Queue;
use crate::data::QueueItem;
use crate::error::AppError;
use crate::metrics::QUEUE_ITEMS_TOTAL;

/// Attempts after which a retried item is given up on.
pub const MAX_ATTEMPTS: i64 = 20;

const BASE_BACKOFF_SECS: u64 = 10;
const MAX_BACKOFF_SECS: u64 = 600;

/// What the worker should do with an item after handling it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Handled; remove the row.
    Done,
    /// Failed transiently; reschedule with backoff.
    Retry,
    /// Failed permanently; remove the row.
    Drop,
}

/// Delay before the `attempt`-th retry (1-based): doubling from 10 s,
/// plus up to one second of jitter, never above 10 minutes.
pub fn next_backoff(attempt: u32) -> Duration {
    let pow = attempt.saturating_sub(1).min(20);
    let secs = BASE_BACKOFF_SECS
        .saturating_mul(1u64 << pow)
        .min(MAX_BACKOFF_SECS);
    let jitter_ms = rand::thread_rng().gen_range(0..1000u64);
    let total_ms = (secs * 1000 + jitter_ms).min(MAX_BACKOFF_SECS * 1000);
    Duration::from_millis(total_ms)
}

/// Drain queue `name` until `shutdown` flips.
///
/// One item is handled at a time. An empty queue sleeps for
/// `poll_interval` or until an enqueue or the shutdown signal wakes it.
pub async fn run_worker<F, Fut>(
    queue: Queue,
    name: &'static str,
    poll_interval: Duration,
    mut shutdown: watch::Receiver<bool>,
    handler: F,
) where
    F: Fn(QueueItem) -> Fut,
    Fut: Future<Output = Outcome>,
{
    tracing::info!(queue = name, "Queue worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let next = match queue.peek(name).await {
            Ok(next) => next,
            Err(error) => {
                tracing::error!(queue = name, %error, "Failed to peek queue");
                None
            }
        };

        let Some(item) = next else {
            tokio::select! {
                _ = queue.notified() => {}
                _ = tokio::time::sleep(poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        let outcome = handler(item.clone()).await;
        if let Err(error) = settle(&queue, name, &item, outcome).await {
            tracing::error!(queue = name, id = item.id, %error, "Failed to settle queue item");
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = shutdown.changed() => {}
            }
        }
    }

    tracing::info!(queue = name, "Queue worker stopped");
}

async fn settle(
    queue: &Queue,
    name: &str,
    item: &QueueItem,
    outcome: Outcome,
) -> Result<(), AppError> {
    match outcome {
        Outcome::Done => {
            queue.dequeue(item).await?;
            QUEUE_ITEMS_TOTAL.with_label_values(&[name, "done"]).inc();
        }
        Outcome::Drop => {
            queue.dequeue(item).await?;
            QUEUE_ITEMS_TOTAL.with_label_values(&[name, "dropped"]).inc();
            tracing::warn!(queue = name, id = item.id, attempts = item.attempts, "Dropped queue item");
        }
        Outcome::Retry => {
            let attempts = item.attempts + 1;
            if attempts >= MAX_ATTEMPTS {
                queue.dequeue(item).await?;
                QUEUE_ITEMS_TOTAL.with_label_values(&[name, "exhausted"]).inc();
                tracing::warn!(queue = name, id = item.id, attempts, "Giving up on queue item");
            } else {
                let delay = next_backoff(attempts as u32);
                queue.reschedule(item, delay).await?;
                QUEUE_ITEMS_TOTAL.with_label_values(&[name, "retried"]).inc();
                tracing::debug!(queue = name, id = item.id, attempts, ?delay, "Rescheduled queue item");
            }
        }
    }

    Ok(())
}
