//! Background worker of a shard copy
//!
//! One thread per shard copy drains a crossbeam channel of tasks: merges the
//! engine requests after publishing a segment, and refreshes it requests when
//! a flush on the write path failed. On every tick it also runs the periodic
//! refresh, expires idle search contexts and removes retired segments nothing
//! references anymore.

use std::sync::Weak;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam::channel::{self, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::engine::ShardEngine;

/// Upper bound on the time between housekeeping passes
const TICK: Duration = Duration::from_millis(200);

#[derive(Debug)]
pub enum WorkerTask {
    Refresh,
    Merge,
    Shutdown,
}

pub struct ShardWorker {
    tx: Sender<WorkerTask>,
    join: Mutex<Option<thread::JoinHandle<()>>>,
}

impl ShardWorker {
    /// Start the worker. It holds only a weak handle, so dropping the engine stops it.
    pub fn spawn(
        engine: Weak<ShardEngine>,
        name: String,
        refresh_interval: Option<Duration>,
    ) -> std::io::Result<Self> {
        let (tx, rx) = channel::unbounded();
        let join = thread::Builder::new().name(name).spawn(move || {
            let tick = refresh_interval.map_or(TICK, |i| i.min(TICK));
            let mut last_refresh = Instant::now();
            loop {
                let task = match rx.recv_timeout(tick) {
                    Ok(task) => Some(task),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                };
                let Some(engine) = engine.upgrade() else {
                    break;
                };
                match task {
                    Some(WorkerTask::Shutdown) => break,
                    Some(WorkerTask::Refresh) => {
                        refresh(&engine);
                        last_refresh = Instant::now();
                    }
                    Some(WorkerTask::Merge) => merge(&engine),
                    None => {
                        if let Some(interval) = refresh_interval {
                            if last_refresh.elapsed() >= interval {
                                if engine.has_unrefreshed_changes() {
                                    refresh(&engine);
                                }
                                last_refresh = Instant::now();
                            }
                        }
                    }
                }
                engine.housekeeping();
            }
            debug!("shard worker stopped");
        })?;
        Ok(Self {
            tx,
            join: Mutex::new(Some(join)),
        })
    }

    /// Retry a refresh off the caller's thread
    pub fn request_refresh(&self) {
        let _ = self.tx.send(WorkerTask::Refresh);
    }

    /// Run the merges the policy asks for
    pub fn request_merge(&self) {
        let _ = self.tx.send(WorkerTask::Merge);
    }

    /// Stop the thread and wait for it; a no-op after the first call
    pub fn shutdown(&self) {
        let _ = self.tx.send(WorkerTask::Shutdown);
        if let Some(handle) = self.join.lock().take() {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

/// A successful refresh queues its own merge request
fn refresh(engine: &ShardEngine) {
    if let Err(e) = engine.refresh() {
        warn!(shard = %engine.key(), error = %e, "background refresh failed");
    }
}

fn merge(engine: &ShardEngine) {
    match engine.maybe_merge() {
        Ok(0) => {}
        Ok(n) => debug!(shard = %engine.key(), merges = n, "background merges done"),
        Err(e) => warn!(shard = %engine.key(), error = %e, "background merge failed"),
    }
}
