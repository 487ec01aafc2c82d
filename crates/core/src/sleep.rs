use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::types::Millis;

/// Shared stop flag. Every wait in the engine goes through [`CancelToken::wait`]
/// so a stop request wakes sleepers immediately instead of at the end of
/// their timeout.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cv.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait up to `dur` or until cancelled. Returns `true` if cancelled.
    pub fn wait(&self, dur: Duration) -> bool {
        let (flag, cv) = &*self.inner;
        let guard = flag.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cv
            .wait_timeout_while(guard, dur, |cancelled| !*cancelled)
            .unwrap_or_else(|e| e.into_inner());
        *guard
    }

    pub fn wait_ms(&self, ms: u64) -> bool {
        self.wait(Duration::from_millis(ms))
    }
}

/// Monotonic milliseconds since the start of a run.
#[derive(Debug, Clone, Copy)]
pub struct RunClock {
    origin: Instant,
}

impl RunClock {
    pub fn start() -> Self {
        Self { origin: Instant::now() }
    }

    pub fn now_ms(&self) -> Millis {
        self.origin.elapsed().as_millis() as Millis
    }

    pub fn instant_at(&self, ms: Millis) -> Instant {
        self.origin + Duration::from_millis(ms)
    }
}

/// `ms` with +/-`ratio` random jitter, never below 1ms.
pub fn jittered(ms: u64, ratio: f64) -> Duration {
    if ms == 0 || ratio <= 0.0 {
        return Duration::from_millis(ms);
    }
    let base = ms as f64;
    let spread = base * ratio.min(1.0);
    let actual = base + rand::thread_rng().gen_range(-spread..=spread);
    Duration::from_secs_f64(actual.max(1.0) / 1000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wait_returns_false_on_timeout() {
        let t = CancelToken::new();
        let start = Instant::now();
        assert!(!t.wait_ms(20));
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(!t.is_cancelled());
    }

    #[test]
    fn cancel_wakes_a_long_wait_promptly() {
        let t = CancelToken::new();
        let t2 = t.clone();
        let h = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            t2.cancel();
        });
        let start = Instant::now();
        assert!(t.wait(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(2));
        h.join().unwrap();
        // already cancelled: returns immediately
        assert!(t.wait(Duration::from_secs(10)));
    }

    #[test]
    fn jitter_stays_in_range() {
        for _ in 0..100 {
            let d = jittered(100, 0.3);
            assert!(d >= Duration::from_millis(69) && d <= Duration::from_millis(131), "{:?}", d);
        }
        assert_eq!(jittered(50, 0.0), Duration::from_millis(50));
    }
}
