// Execution tokens and cooperative cancellation
//
// One token is live per job at a time, rotated on every claim. Work that
// outlives its run (a timed-out attempt, a lease the sweep reclaimed)
// holds a stale token; anything it tries to apply afterwards is refused.
// Within one process the registry is the fast check; across processes the
// status compare-and-transition is the backstop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;
use uuid::Uuid;

/// Proof of holding the current run of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionToken {
    pub job_id: Uuid,
    token: Uuid,
}

/// Cancellation flag for one run. Set once, observed cooperatively at
/// rider boundaries and in the executor's select loop.
pub struct CancelSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl CancelSignal {
    fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Release);
        self.notify.notify_waiters();
    }

    pub fn is_triggered(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Resolves once the signal has been triggered. The notified future is
    /// registered before the flag check so a trigger between the two is
    /// never missed.
    pub async fn triggered(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        loop {
            if self.is_triggered() {
                return;
            }
            notified.as_mut().await;
            notified.set(self.notify.notified());
        }
    }
}

struct RunEntry {
    token: Uuid,
    cancel: Arc<CancelSignal>,
}

/// In-process table of live runs, keyed by job id.
#[derive(Default)]
pub struct TokenRegistry {
    runs: Mutex<HashMap<Uuid, RunEntry>>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, RunEntry>> {
        self.runs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Issue a fresh token for a newly claimed run, superseding any run
    /// this process still has for the job. The superseded run's cancel
    /// signal is triggered so it stops issuing side effects promptly.
    pub fn issue(&self, job_id: Uuid) -> (ExecutionToken, Arc<CancelSignal>) {
        let cancel = Arc::new(CancelSignal::new());
        let token = ExecutionToken {
            job_id,
            token: Uuid::new_v4(),
        };
        let previous = self.lock().insert(
            job_id,
            RunEntry {
                token: token.token,
                cancel: Arc::clone(&cancel),
            },
        );
        if let Some(previous) = previous {
            previous.cancel.trigger();
        }
        (token, cancel)
    }

    pub fn is_current(&self, token: &ExecutionToken) -> bool {
        self.lock()
            .get(&token.job_id)
            .map(|entry| entry.token == token.token)
            .unwrap_or(false)
    }

    /// Drop the run entry, only if `token` still owns it.
    pub fn release(&self, token: &ExecutionToken) {
        let mut runs = self.lock();
        if runs
            .get(&token.job_id)
            .map(|entry| entry.token == token.token)
            .unwrap_or(false)
        {
            runs.remove(&token.job_id);
        }
    }

    /// Request cooperative cancellation of the job's live run, if this
    /// process has one. Returns whether a run was signalled.
    pub fn request_cancel(&self, job_id: Uuid) -> bool {
        match self.lock().get(&job_id) {
            Some(entry) => {
                entry.cancel.trigger();
                true
            }
            None => false,
        }
    }
}
