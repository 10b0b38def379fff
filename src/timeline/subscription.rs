//! Timer-driven subscription handles
//!
//! A [`Subscription`] owns one background task that runs a worker on a fixed
//! interval, on an external trigger, or both. Stopping sets a flag and wakes
//! the task; a request already in flight is allowed to settle and its result
//! is dropped instead of being delivered.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::error::FeedError;

/// Shared cancellation flag checked before delivering results.
#[derive(Clone, Debug, Default)]
pub struct StopFlag(Arc<AtomicBool>);

impl StopFlag {
    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// One unit of periodic work.
#[async_trait]
pub(crate) trait Tick: Send + 'static {
    /// Do one round of work. Implementations must check `stop` after every
    /// await point and before invoking user callbacks.
    async fn tick(&mut self, stop: &StopFlag) -> Result<(), FeedError>;

    fn name(&self) -> &str;
}

/// Handle to a running poll loop. Dropping the handle stops the loop.
pub struct Subscription {
    shutdown_tx: broadcast::Sender<()>,
    stopped: StopFlag,
    trigger: Arc<Notify>,
    handle: Option<JoinHandle<Result<(), FeedError>>>,
}

impl Subscription {
    pub(crate) fn spawn<W: Tick>(mut worker: W, interval: Duration, immediate: bool) -> Self {
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        let stopped = StopFlag::default();
        let trigger = Arc::new(Notify::new());

        let stop = stopped.clone();
        let wake = trigger.clone();
        let period = interval.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            if !immediate {
                // The first tick of an interval completes at once
                ticker.tick().await;
            }

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {}
                    _ = wake.notified() => {}
                }
                if stop.is_stopped() {
                    break;
                }

                match worker.tick(&stop).await {
                    Ok(()) => {}
                    Err(e) if e.is_retryable() => {
                        log::warn!("{} tick failed, retrying next interval: {}", worker.name(), e);
                    }
                    Err(e) => {
                        log::warn!("{} stopped: {}", worker.name(), e);
                        stop.stop();
                        return Err(e);
                    }
                }
            }
            log::debug!("{} stopped", worker.name());
            Ok(())
        });

        Self {
            shutdown_tx,
            stopped,
            trigger,
            handle: Some(handle),
        }
    }

    /// Stop future ticks. Results of a tick already running are discarded.
    pub fn stop(&self) {
        self.stopped.stop();
        let _ = self.shutdown_tx.send(());
    }

    /// Run a tick now instead of waiting for the next interval.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_stopped()
    }

    /// Wait for the loop to finish. Returns the error that ended it, if any.
    /// Call [`Subscription::stop`] first unless the loop is expected to fail.
    pub async fn join(mut self) -> Result<(), FeedError> {
        match self.handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                FeedError::transport(format!("subscription task failed: {}", e))
            })?,
            None => Ok(()),
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        ticks: Arc<AtomicUsize>,
        fail_at: Option<usize>,
    }

    #[async_trait]
    impl Tick for Counter {
        async fn tick(&mut self, _stop: &StopFlag) -> Result<(), FeedError> {
            let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
            if Some(n) == self.fail_at {
                return Err(FeedError::Validation("bad chapter".into()));
            }
            Ok(())
        }

        fn name(&self) -> &str {
            "counter"
        }
    }

    #[tokio::test]
    async fn test_trigger_and_stop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::spawn(
            Counter { ticks: ticks.clone(), fail_at: None },
            Duration::from_secs(3600),
            false,
        );

        sub.trigger();
        for _ in 0..100 {
            if ticks.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(ticks.load(Ordering::SeqCst), 1);

        sub.stop();
        assert!(sub.is_stopped());
        sub.join().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_error_ends_loop() {
        let ticks = Arc::new(AtomicUsize::new(0));
        let sub = Subscription::spawn(
            Counter { ticks: ticks.clone(), fail_at: Some(2) },
            Duration::from_millis(5),
            true,
        );
        let err = sub.join().await.unwrap_err();
        assert!(matches!(err, FeedError::Validation(_)));
        assert_eq!(ticks.load(Ordering::SeqCst), 2);
    }
}
