//! Cancellable repeating timer on the tokio runtime.
//!
//! Used for connection heartbeats and battle ticks. The callback runs on a
//! runtime task; a shared liveness flag is checked before every fire and
//! again before the timer re-arms, so a fire racing with `cancel` is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Returned by a timer callback to keep or stop the timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerControl {
    Continue,
    Stop,
}

pub struct RepeatingTimer {
    alive: Arc<AtomicBool>,
    task: JoinHandle<()>,
}

impl RepeatingTimer {
    /// Arms a timer whose first fire happens one `period` from now.
    pub fn start<F>(handle: &Handle, period: Duration, mut on_fire: F) -> Self
    where
        F: FnMut() -> TimerControl + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let alive = Arc::new(AtomicBool::new(true));
        let flag = Arc::clone(&alive);

        let task = handle.spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
                if on_fire() == TimerControl::Stop {
                    flag.store(false, Ordering::SeqCst);
                    break;
                }
                if !flag.load(Ordering::SeqCst) {
                    break;
                }
            }
        });

        Self { alive, task }
    }

    pub fn is_active(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.task.abort();
    }
}

impl Drop for RepeatingTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[tokio::test]
    async fn test_timer_fires_until_stopped() {
        let fires = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fires);

        let timer = RepeatingTimer::start(&Handle::current(), Duration::from_millis(10), move || {
            if counter.fetch_add(1, Ordering::SeqCst) + 1 == 3 {
                TimerControl::Stop
            } else {
                TimerControl::Continue
            }
        });

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 3);
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn test_cancelled_timer_never_fires_again() {
        let fires = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fires);

        let timer = RepeatingTimer::start(&Handle::current(), Duration::from_millis(10), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            TimerControl::Continue
        });

        tokio::time::sleep(Duration::from_millis(45)).await;
        timer.cancel();
        let after_cancel = fires.load(Ordering::SeqCst);
        assert!(after_cancel >= 1);

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_eq!(fires.load(Ordering::SeqCst), after_cancel);
        assert!(!timer.is_active());
    }

    #[tokio::test]
    async fn test_first_fire_waits_one_period() {
        let fires = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&fires);

        let _timer = RepeatingTimer::start(&Handle::current(), Duration::from_millis(200), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            TimerControl::Continue
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fires.load(Ordering::SeqCst), 0);
    }
}
