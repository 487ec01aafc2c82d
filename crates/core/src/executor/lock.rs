use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::sleep::CancelToken;

/// Process-wide "one cast at a time" lock. Ownership is logical: the inner
/// mutex is only held to flip the holder, never across a cast.
#[derive(Debug, Default)]
pub struct CastLock {
    holder: Mutex<Option<String>>,
    released: Condvar,
}

/// Releases the cast lock on drop.
#[derive(Debug)]
pub struct CastGuard<'a> {
    lock: &'a CastLock,
}

impl Drop for CastGuard<'_> {
    fn drop(&mut self) {
        *self.lock.slot() = None;
        self.lock.released.notify_all();
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contended {
    Busy { holder: String },
    TimedOut { holder: String },
    Cancelled,
}

impl Contended {
    pub fn reason(&self) -> &'static str {
        match self {
            Contended::Busy { .. } => "lock_busy",
            Contended::TimedOut { .. } => "lock_timeout",
            Contended::Cancelled => "stopped",
        }
    }
}

impl CastLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self) -> MutexGuard<'_, Option<String>> {
        self.holder.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn holder(&self) -> Option<String> {
        self.slot().clone()
    }

    pub fn try_acquire(&self, owner: &str) -> Result<CastGuard<'_>, Contended> {
        let mut slot = self.slot();
        match slot.as_ref() {
            Some(h) => Err(Contended::Busy { holder: h.clone() }),
            None => {
                *slot = Some(owner.to_string());
                Ok(CastGuard { lock: self })
            }
        }
    }

    /// Wait up to `timeout` for the lock, checking `cancel` every `poll`.
    pub fn acquire_within(
        &self,
        owner: &str,
        timeout: Duration,
        poll: Duration,
        cancel: &CancelToken,
    ) -> Result<CastGuard<'_>, Contended> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.slot();
        loop {
            if slot.is_none() {
                *slot = Some(owner.to_string());
                return Ok(CastGuard { lock: self });
            }
            if cancel.is_cancelled() {
                return Err(Contended::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                let holder = slot.clone().unwrap_or_default();
                return Err(Contended::TimedOut { holder });
            }
            let step = poll.min(deadline - now).max(Duration::from_millis(1));
            slot = self
                .released
                .wait_timeout(slot, step)
                .map(|(g, _)| g)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}
