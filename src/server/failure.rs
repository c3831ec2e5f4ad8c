//! Failure detector: suspects the primary when a request it should have
//! ordered stays unexecuted for too long.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, RwLock};

use crate::server::Digest;
use crate::utils::{KvError, Timer};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Duration;

/// Callback invoked when a failure is suspected.
pub type FailureHandler = Box<dyn Fn() + Send + Sync>;

/// Failure-detector collaborator consumed by the consensus engine.
pub trait FailureDetector: Send + Sync {
    /// A request was handed to the primary and should eventually execute.
    fn request_seen(&self, hash: &Digest);

    /// A request was executed locally.
    fn request_executed(&self, hash: &Digest);

    fn register_failure_handler(&self, handler: FailureHandler);
}

#[derive(Debug)]
enum DetectorEvent {
    Seen(Digest),
    Executed(Digest),
}

/// Request-tracking state owned by the detector thread.
#[derive(Debug, Default)]
struct Tracked {
    /// Seen requests in arrival order.
    ordered: VecDeque<Digest>,

    /// Seen requests not yet executed.
    outstanding: HashSet<Digest>,

    /// Seen requests executed but not yet popped from `ordered`.
    completed: HashSet<Digest>,
}

impl Tracked {
    fn seen(&mut self, hash: Digest) -> bool {
        if self.outstanding.contains(&hash) || self.completed.contains(&hash) {
            return false;
        }
        self.outstanding.insert(hash);
        self.ordered.push_back(hash);
        true
    }

    fn executed(&mut self, hash: Digest) {
        if self.outstanding.remove(&hash) {
            self.completed.insert(hash);
        }
    }

    /// Pops executed requests off the front; returns whether the oldest
    /// remaining request is still outstanding.
    fn pop_completed(&mut self) -> bool {
        while let Some(front) = self.ordered.front() {
            if !self.completed.remove(front) {
                return true;
            }
            self.ordered.pop_front();
        }
        false
    }
}

/// Timeout-based failure detector running as a background thread.
pub struct TimeoutDetector {
    /// Sender side of the event channel.
    tx_event: mpsc::UnboundedSender<DetectorEvent>,

    /// Registered failure handler, shared with the detector thread.
    handler: Arc<RwLock<Option<FailureHandler>>>,

    /// Join handle of the detector thread.
    _detector_handle: JoinHandle<()>,
}

impl TimeoutDetector {
    /// Creates the detector and spawns its thread.
    pub fn new_and_setup(
        me: impl ToString,
        timeout: Duration,
    ) -> Result<Self, KvError> {
        let me = me.to_string();
        if timeout.is_zero() {
            return logged_err!(me; "invalid failure timeout 0");
        }

        let (tx_event, rx_event) = mpsc::unbounded_channel();
        let handler = Arc::new(RwLock::new(None));
        let detector_handle = tokio::spawn(Self::detector_thread(
            me,
            timeout,
            rx_event,
            handler.clone(),
        ));

        Ok(TimeoutDetector {
            tx_event,
            handler,
            _detector_handle: detector_handle,
        })
    }

    /// Detector thread function.
    async fn detector_thread(
        me: String,
        timeout: Duration,
        mut rx_event: mpsc::UnboundedReceiver<DetectorEvent>,
        handler: Arc<RwLock<Option<FailureHandler>>>,
    ) {
        pf_debug!(me; "detector thread spawned");

        let mut tracked = Tracked::default();
        let mut timer = Timer::new();

        loop {
            tokio::select! {
                event = rx_event.recv() => {
                    match event {
                        Some(DetectorEvent::Seen(hash)) => {
                            if tracked.seen(hash) && !timer.is_armed() {
                                if let Err(e) = timer.restart(timeout) {
                                    pf_error!(me; "error arming timer: {}", e);
                                }
                            }
                        }
                        Some(DetectorEvent::Executed(hash)) => {
                            tracked.executed(hash);
                            if !tracked.pop_completed() {
                                timer.cancel();
                            }
                        }
                        None => break,
                    }
                },

                _ = timer.timeout(), if timer.is_armed() => {
                    if tracked.pop_completed() {
                        pf_warn!(me; "request unexecuted for {} ms, suspecting primary",
                                     timeout.as_millis());
                        if let Some(handler) = handler
                            .read()
                            .unwrap_or_else(|e| e.into_inner())
                            .as_ref()
                        {
                            handler();
                        }
                        if let Err(e) = timer.restart(timeout) {
                            pf_error!(me; "error arming timer: {}", e);
                        }
                    }
                },
            }
        }

        pf_debug!(me; "detector thread exited");
    }
}

impl FailureDetector for TimeoutDetector {
    fn request_seen(&self, hash: &Digest) {
        let _ = self.tx_event.send(DetectorEvent::Seen(*hash));
    }

    fn request_executed(&self, hash: &Digest) {
        let _ = self.tx_event.send(DetectorEvent::Executed(*hash));
    }

    fn register_failure_handler(&self, handler: FailureHandler) {
        *self.handler.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }
}

#[cfg(test)]
mod failure_tests {
    use super::*;
    use tokio::time;

    fn hash(b: u8) -> Digest {
        Digest::sha256(&[b])
    }

    #[test]
    fn tracked_ordering() {
        let mut tracked = Tracked::default();
        assert!(tracked.seen(hash(1)));
        assert!(tracked.seen(hash(2)));
        assert!(!tracked.seen(hash(1)));
        tracked.executed(hash(2));
        assert!(tracked.pop_completed());
        tracked.executed(hash(1));
        assert!(!tracked.pop_completed());
        assert!(tracked.ordered.is_empty());
        // never seen, no effect
        tracked.executed(hash(3));
        assert!(tracked.completed.is_empty());
    }

    fn setup(ms: u64) -> Result<(TimeoutDetector, mpsc::UnboundedReceiver<()>), KvError> {
        let fd = TimeoutDetector::new_and_setup("s", Duration::from_millis(ms))?;
        let (tx, rx) = mpsc::unbounded_channel();
        fd.register_failure_handler(Box::new(move || {
            let _ = tx.send(());
        }));
        Ok((fd, rx))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn fires_on_stuck_request() -> Result<(), KvError> {
        assert!(TimeoutDetector::new_and_setup("s", Duration::ZERO).is_err());
        let (fd, mut rx) = setup(100)?;
        fd.request_seen(&hash(1));
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .map_err(|e| KvError::msg(e))?;
        // re-armed while still stuck
        time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .map_err(|e| KvError::msg(e))?;
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn quiet_when_executed() -> Result<(), KvError> {
        let (fd, mut rx) = setup(100)?;
        fd.request_seen(&hash(1));
        fd.request_seen(&hash(2));
        fd.request_executed(&hash(2));
        fd.request_executed(&hash(1));
        time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
        Ok(())
    }
}
