//! Wake-timer capability.
//!
//! The client owns at most one pending wake at a time and replaces it by
//! cancelling and rescheduling. Implementations must never run a callback
//! inline from `schedule_once`.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

/// Opaque handle of a scheduled callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

impl TimerHandle {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TimerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

pub type TimerCallback = Box<dyn FnOnce() + Send + 'static>;

/// Schedule-once-after-delay / cancel.
pub trait Timer: Send + Sync {
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle;

    /// Cancel a pending callback. Cancelling a fired or unknown handle is a no-op.
    fn cancel(&self, handle: TimerHandle);
}

/// Timer backed by `tokio::time::sleep` on a runtime handle.
pub struct TokioTimer {
    runtime: Handle,
    next_id: AtomicU64,
    tasks: Arc<Mutex<HashMap<u64, JoinHandle<()>>>>,
}

impl TokioTimer {
    pub fn new(runtime: Handle) -> Self {
        Self {
            runtime,
            next_id: AtomicU64::new(1),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of callbacks scheduled but not yet fired or cancelled.
    pub fn pending(&self) -> usize {
        self.tasks.lock().map(|tasks| tasks.len()).unwrap_or(0)
    }
}

impl Timer for TokioTimer {
    fn schedule_once(&self, delay: Duration, callback: TimerCallback) -> TimerHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let tasks = Arc::clone(&self.tasks);

        // Hold the table lock across spawn so the task cannot remove its
        // entry before it is inserted.
        let mut table = match self.tasks.lock() {
            Ok(table) => table,
            Err(poisoned) => poisoned.into_inner(),
        };
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let still_scheduled = match tasks.lock() {
                Ok(mut table) => table.remove(&id).is_some(),
                Err(poisoned) => poisoned.into_inner().remove(&id).is_some(),
            };
            if still_scheduled {
                callback();
            }
        });
        table.insert(id, task);
        TimerHandle(id)
    }

    fn cancel(&self, handle: TimerHandle) {
        let task = match self.tasks.lock() {
            Ok(mut table) => table.remove(&handle.0),
            Err(poisoned) => poisoned.into_inner().remove(&handle.0),
        };
        if let Some(task) = task {
            task.abort();
        }
    }
}

impl fmt::Debug for TokioTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokioTimer")
            .field("pending", &self.pending())
            .finish()
    }
}
