//! Single-pending timeout scheduling.
//!
//! The state machine only ever cares about its latest requested timeout,
//! so the ticker keeps exactly one armed: scheduling supersedes whatever
//! was pending. Fired timeouts carry their `(height, round, step)` tag and
//! the driver drops any that are stale by the time they arrive.

use std::time::Duration;
use tenderbft_core::TimeoutInfo;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Idle re-arm distance when nothing is pending.
const FAR_FUTURE: Duration = Duration::from_secs(86_400);

/// Capacity of the tick stream. Ticks are consumed promptly by the
/// driver; this only buffers across its brief busy periods.
const TICK_BUFFER: usize = 16;

/// Schedules `(height, round, step)`-tagged timeouts, one pending at a
/// time.
pub struct TimeoutTicker {
    schedule_tx: mpsc::UnboundedSender<TimeoutInfo>,
    task: JoinHandle<()>,
}

impl TimeoutTicker {
    /// Start the ticker task. Returns the ticker handle and the stream of
    /// fired timeouts.
    pub fn spawn() -> (Self, mpsc::Receiver<TimeoutInfo>) {
        let (schedule_tx, mut schedule_rx) = mpsc::unbounded_channel::<TimeoutInfo>();
        let (tick_tx, tick_rx) = mpsc::channel(TICK_BUFFER);

        let task = tokio::spawn(async move {
            let sleep = tokio::time::sleep(FAR_FUTURE);
            tokio::pin!(sleep);
            let mut pending: Option<TimeoutInfo> = None;

            loop {
                tokio::select! {
                    maybe = schedule_rx.recv() => match maybe {
                        Some(info) => {
                            trace!(%info, "armed timeout");
                            sleep.as_mut().reset(Instant::now() + info.duration);
                            pending = Some(info);
                        }
                        // All schedule handles dropped: shut down.
                        None => break,
                    },
                    () = &mut sleep, if pending.is_some() => {
                        let info = pending.take().expect("guarded by is_some");
                        debug!(%info, "timeout fired");
                        if tick_tx.send(info).await.is_err() {
                            break;
                        }
                        sleep.as_mut().reset(Instant::now() + FAR_FUTURE);
                    }
                }
            }
        });

        (Self { schedule_tx, task }, tick_rx)
    }

    /// Arm a timeout, superseding any pending one.
    pub fn schedule(&self, info: TimeoutInfo) {
        // Failure means the task is gone, which only happens at shutdown.
        let _ = self.schedule_tx.send(info);
    }

    /// Stop the ticker. Idempotent.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for TimeoutTicker {
    fn drop(&mut self) {
        self.stop();
    }
}
