//! Bounded reconnection around a single connect-and-stream attempt.
//!
//! The retry budget counts consecutive failures since the last successful
//! upgrade: while the loop runs, a reset hook registered on the connect-callback
//! slot zeroes the counter each time a dial succeeds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::ConsumerError;
use crate::hook::ConnectHook;

/// Reconnect attempts made by the reconnecting stream variants.
pub const DEFAULT_RETRIES: u32 = 5;

/// Pause between a failed attempt and the next one.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(500);

#[derive(Debug)]
pub enum AttemptOutcome {
    /// The stream was closed on purpose; stop without reporting anything.
    Done,
    Failed(ConsumerError),
}

#[async_trait]
pub trait Attempt: Send {
    async fn attempt(&mut self) -> AttemptOutcome;
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub retries: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(retries: u32, delay: Duration) -> Self {
        Self { retries, delay }
    }
}

/// Runs `action` until it reports [`AttemptOutcome::Done`] or the budget of
/// `policy.retries` reconnects is spent.
///
/// Every failure is pushed onto `errors` before the next attempt. The channel
/// is expected to hold a single slot, so a caller that stops draining it
/// stalls reconnection. A dropped receiver ends the loop.
pub async fn retry_action<A>(
    action: &mut A,
    errors: &mpsc::Sender<ConsumerError>,
    hook: &ConnectHook,
    policy: RetryPolicy,
) where
    A: Attempt + ?Sized,
{
    let attempts = Arc::new(AtomicU32::new(0));
    let _restore = {
        let attempts = attempts.clone();
        hook.wrap(move || attempts.store(0, Ordering::SeqCst))
    };

    while attempts.load(Ordering::SeqCst) <= policy.retries {
        let err = match action.attempt().await {
            AttemptOutcome::Done => {
                debug!(target = "firehose.retry", "stream closed locally");
                return;
            }
            AttemptOutcome::Failed(err) => err,
        };

        let made = attempts.fetch_add(1, Ordering::SeqCst) + 1;
        warn!(
            target = "firehose.retry",
            error = %err,
            attempt = made,
            retries = policy.retries,
            "stream attempt failed"
        );
        if errors.send(err).await.is_err() {
            debug!(target = "firehose.retry", "error receiver dropped; giving up");
            return;
        }
        if made <= policy.retries {
            tokio::time::sleep(policy.delay).await;
        }
    }
    debug!(
        target = "firehose.retry",
        retries = policy.retries,
        "retry budget exhausted"
    );
}
