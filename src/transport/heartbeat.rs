//! Periodic heartbeat task
//!
//! `HeartbeatScheduler` owns a tokio task that calls a tick function on a
//! fixed interval. The tick returns false to end the task on its own (the
//! connection manager does so once it has been dropped). `stop` cancels the
//! task; it must be called before connections are torn down.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

#[derive(Debug)]
pub struct HeartbeatScheduler {
    task: JoinHandle<()>,
    interval: Duration,
}

impl HeartbeatScheduler {
    /// Spawns the task. The first tick fires one full `interval` after start.
    pub fn start<F>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let interval = interval.max(Duration::from_millis(1));
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !tick() {
                    break;
                }
            }
        });

        Self { task, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn stop(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatScheduler {
    fn drop(&mut self) {
        self.task.abort();
    }
}
