//! Re-armable one-shot timer built on `tokio::time::Sleep`.

use std::pin::Pin;

use crate::utils::KvError;

use tokio::time::{self, Duration, Instant, Sleep};

/// One-shot deadline that can be re-armed with a different duration and
/// explicitly disarmed. Intended to be polled as a guarded branch of a
/// `tokio::select!`:
///
/// ```no_compile
/// _ = timer.timeout(), if timer.is_armed() => { ... }
/// ```
///
/// Must be used within the context of a tokio runtime.
#[derive(Debug)]
pub struct Timer {
    /// Inner sleep future, pinned in a box so it can be awaited repeatedly.
    sleep: Pin<Box<Sleep>>,

    /// Duration used by the last `restart()`.
    last_dur: Duration,

    /// Whether a deadline is pending.
    armed: bool,
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

impl Timer {
    /// Creates a new timer in the disarmed state.
    pub fn new() -> Self {
        Timer {
            sleep: Box::pin(time::sleep(Duration::ZERO)),
            last_dur: Duration::ZERO,
            armed: false,
        }
    }

    /// Get the last timeout duration used.
    pub fn get_dur(&self) -> Duration {
        self.last_dur
    }

    /// Is there a pending deadline?
    pub fn is_armed(&self) -> bool {
        self.armed
    }

    /// Arms (or re-arms) the timer to fire `dur` from now.
    pub fn restart(&mut self, dur: Duration) -> Result<(), KvError> {
        if dur.is_zero() {
            return Err(KvError(format!(
                "invalid timeout duration {} ns",
                dur.as_nanos()
            )));
        }

        self.last_dur = dur;
        self.armed = true;
        self.sleep.as_mut().reset(Instant::now() + dur);
        Ok(())
    }

    /// Drops the pending deadline, if any.
    pub fn cancel(&mut self) {
        self.armed = false;
    }

    /// Waits for the deadline; the timer is disarmed once this returns.
    /// Awaiting a disarmed timer returns immediately.
    pub async fn timeout(&mut self) {
        if self.armed {
            self.sleep.as_mut().await;
            self.armed = false;
        }
    }
}
