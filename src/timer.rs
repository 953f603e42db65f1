//! Cancellable timers
//!
//! Session expiry, will delay and the takeover close grace run as one-shot
//! spawned tokio tasks; housekeeping such as the retained purge runs on a
//! ticker. Each callback re-acquires whatever locks it needs
//! when it fires; cancelling a timer that already fired does nothing.

use std::ops::ControlFlow;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Timer facility bound to a tokio runtime
#[derive(Clone)]
pub struct Timers {
    handle: Handle,
}

impl Timers {
    /// Bind to the runtime of the calling context
    pub fn current() -> Option<Self> {
        Handle::try_current().ok().map(|handle| Self { handle })
    }

    /// Run `callback` once after `delay`
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce() + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            callback();
        });
        TimerHandle(task.abort_handle())
    }

    /// Run `callback` every `period`, first after one full period, until it
    /// breaks or the timer is cancelled
    pub fn every<F>(&self, period: Duration, mut callback: F) -> TimerHandle
    where
        F: FnMut() -> ControlFlow<()> + Send + 'static,
    {
        let task = self.handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if callback().is_break() {
                    break;
                }
            }
        });
        TimerHandle(task.abort_handle())
    }
}

/// Handle to a scheduled timer
#[derive(Debug)]
pub struct TimerHandle(AbortHandle);

impl TimerHandle {
    /// Cancel the timer. No effect if it already fired.
    pub fn cancel(self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}
