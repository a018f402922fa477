//! Background reconnection
//!
//! The monitor runs a reconnect attempt on a fixed period until one succeeds or
//! the retry budget is spent, then stops by itself. Each attempt result is
//! fed to a [`RetryBudget`], which answers with
//! [`ControlFlow::Break`] when the loop should end. At most one monitor
//! loop runs per [`ReconnectMonitor`]; starting a running monitor is a
//! no-op.

use std::ops::ControlFlow;
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::UaDriverError;

/// Future produced by one reconnect attempt
pub type AttemptFuture = BoxFuture<'static, Result<(), UaDriverError>>;

/// Why a monitor loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorExit {
    Connected { attempts: u32 },
    RetriesExhausted { attempts: u32 },
}

/// Counts consecutive failed attempts against a limit
#[derive(Debug, Clone)]
pub struct RetryBudget {
    max_retries: u32,
    attempts: u32,
    failures: u32,
}

impl RetryBudget {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            attempts: 0,
            failures: 0,
        }
    }

    /// Account for one attempt; `Break` ends the loop
    ///
    /// A success always breaks. Failures break once they exceed the
    /// allowed retries, so at most `max_retries + 1` attempts run.
    pub fn record<E>(&mut self, outcome: &Result<(), E>) -> ControlFlow<MonitorExit> {
        self.attempts += 1;
        match outcome {
            Ok(()) => ControlFlow::Break(MonitorExit::Connected {
                attempts: self.attempts,
            }),
            Err(_) => {
                self.failures += 1;
                if self.failures > self.max_retries {
                    ControlFlow::Break(MonitorExit::RetriesExhausted {
                        attempts: self.attempts,
                    })
                } else {
                    ControlFlow::Continue(())
                }
            }
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

/// Single-slot periodic reconnect task
pub struct ReconnectMonitor {
    runtime: Handle,
    handle: Mutex<Option<JoinHandle<MonitorExit>>>,
}

impl ReconnectMonitor {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            handle: Mutex::new(None),
        }
    }

    /// Start attempting every `interval`, first attempt one interval from now
    ///
    /// Returns `false` if a loop is already running.
    pub fn start<F>(&self, interval: Duration, max_retries: u32, attempt: F) -> bool
    where
        F: Fn() -> AttemptFuture + Send + Sync + 'static,
    {
        let mut handle = self.handle.lock();
        if handle.as_ref().is_some_and(|h| !h.is_finished()) {
            return false;
        }

        debug!(?interval, max_retries, "Reconnect monitor started");
        *handle = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut budget = RetryBudget::new(max_retries);

            loop {
                ticker.tick().await;
                let outcome = attempt().await;
                if let Err(e) = &outcome {
                    warn!(attempt = budget.attempts() + 1, error = %e, "Reconnect attempt failed");
                }
                if let ControlFlow::Break(exit) = budget.record(&outcome) {
                    info!(?exit, "Reconnect monitor stopped");
                    return exit;
                }
            }
        }));
        true
    }

    pub fn stop(&self) {
        if let Some(handle) = self.handle.lock().take() {
            handle.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for ReconnectMonitor {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.get_mut().take() {
            handle.abort();
        }
    }
}
