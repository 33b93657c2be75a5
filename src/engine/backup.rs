//! Background persistence of dirty instances.
//!
//! Services with `StoreInterval::Every(d)` own a [`BackupScheduler`]: a named
//! thread that drains the service's dirty queue every `d` until stopped. The
//! thread only holds a `Weak` reference, so a dropped service ends the loop.

use std::io;
use std::sync::Weak;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{bounded, select, Sender};

use crate::error::MonitorResult;

use super::DirtyQueue;

/// A service whose dirty instances can be written back.
pub trait BackupTarget: Send + Sync {
    /// Used in the thread name and log lines.
    fn name(&self) -> &'static str;

    fn dirty_queue(&self) -> &DirtyQueue;

    /// Persists the instance behind `tenant:id` if it is still dirty. A key
    /// whose instance is gone is not an error.
    ///
    /// # Errors
    ///
    /// Storage failures; the key is retried on the next drain.
    fn persist_key(&self, key: &str) -> MonitorResult<()>;
}

/// Outcome of one drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainStats {
    pub stored: usize,
    pub failed: usize,
}

fn jitter() {
    thread::sleep(Duration::from_nanos(rand::random::<u64>() % 1000));
}

/// Persists every queued key once. Failed keys are queued again after the
/// drain so a failing key cannot spin the loop.
pub fn drain(target: &dyn BackupTarget) -> DrainStats {
    let queue = target.dirty_queue();
    let mut stats = DrainStats::default();
    let mut failed = Vec::new();

    while let Some(key) = queue.pop() {
        match target.persist_key(&key) {
            Ok(()) => stats.stored += 1,
            Err(e) => {
                tracing::warn!(service = target.name(), key = %key, error = %e, "failed to persist instance");
                failed.push(key);
            }
        }
        jitter();
    }

    stats.failed = failed.len();
    for key in failed {
        queue.push(key);
    }
    if stats.stored > 0 || stats.failed > 0 {
        tracing::debug!(service = target.name(), stored = stats.stored, failed = stats.failed, "backup drain");
    }
    stats
}

/// Owns the backup thread of one service.
#[derive(Debug)]
pub struct BackupScheduler {
    stop_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackupScheduler {
    /// Spawns the loop: drain, then wait `interval` or the stop signal.
    ///
    /// # Errors
    ///
    /// The thread could not be spawned.
    pub fn start(target: Weak<dyn BackupTarget>, name: &str, interval: Duration) -> io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let handle = thread::Builder::new()
            .name(format!("cgmon-backup-{name}"))
            .spawn(move || loop {
                match target.upgrade() {
                    Some(t) => {
                        drain(t.as_ref());
                    }
                    None => break,
                }
                select! {
                    recv(stop_rx) -> _ => break,
                    default(interval) => {}
                }
            })?;
        Ok(Self {
            stop_tx: Some(stop_tx),
            handle: Some(handle),
        })
    }

    /// Signals the thread and waits for it. Idempotent.
    pub fn stop(&mut self) {
        // Dropping the sender disconnects the channel, which wakes the select.
        self.stop_tx.take();
        if let Some(handle) = self.handle.take() {
            // The last owner of a service can be the backup thread itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                tracing::error!("backup thread panicked");
            }
        }
    }
}

impl Drop for BackupScheduler {
    fn drop(&mut self) {
        self.stop();
    }
}
