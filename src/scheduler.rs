//! Independent periodic tasks sharing one cancellation scope.
//!
//! Each task gets its own interval and a child [`CancellationToken`]. A pass
//! that returns an error is logged and skipped; the task keeps its cadence.
//! [`Scheduler::shutdown`] cancels every task and waits for all of them.

use std::future::Future;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

pub struct Scheduler {
    token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Scheduler {
    /// A scheduler whose tasks stop when `parent` is cancelled.
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            tasks: Vec::new(),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Run `pass` every `period`, first after one period has elapsed.
    pub fn spawn_periodic<F, Fut>(&mut self, name: &'static str, period: Duration, mut pass: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let token = self.token.child_token();
        let period = period.max(Duration::from_millis(1));
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = tokio::select! {
                    _ = token.cancelled() => break,
                    r = pass() => r,
                };
                if let Err(e) = outcome {
                    if token.is_cancelled() {
                        break;
                    }
                    warn!(task = name, error = %e, "periodic pass failed");
                }
            }
            trace!(task = name, "periodic task stopped");
        });
        self.tasks.push((name, handle));
    }

    /// Run a long-lived task until it returns or the scheduler is cancelled.
    pub fn spawn<Fut>(&mut self, name: &'static str, task: Fut)
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = task => {}
            }
            trace!(task = name, "task stopped");
        });
        self.tasks.push((name, handle));
    }

    /// Cancel every task and wait for each to finish.
    pub async fn shutdown(&mut self) {
        self.token.cancel();
        for (name, handle) in self.tasks.drain(..) {
            if let Err(e) = handle.await
                && e.is_panic()
            {
                warn!(task = name, "task panicked");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
