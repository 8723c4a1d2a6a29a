//! Finisher threads and the async-op tracker.
//!
//! A finisher is a named worker draining a serialized queue of closures.
//! The cache runs one for payload flushes, one for descriptor appends, one
//! for user-visible completions and one general work queue.

use std::thread;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::Mutex;
use tracing::debug;

use crate::image::Completion;

enum FinisherCommand {
    Run(Box<dyn FnOnce() + Send>),
    Shutdown,
}

pub(crate) struct Finisher {
    name: &'static str,
    tx: Sender<FinisherCommand>,
}

impl Finisher {
    pub fn new(name: &'static str) -> Self {
        let (tx, rx) = unbounded();
        let _ = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                while let Ok(cmd) = rx.recv() {
                    match cmd {
                        FinisherCommand::Run(work) => work(),
                        FinisherCommand::Shutdown => break,
                    }
                }
            });
        Self { name, tx }
    }

    /// Queue work onto this finisher. Work submitted after shutdown is
    /// silently dropped.
    pub fn queue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.tx.send(FinisherCommand::Run(Box::new(work))).is_err() {
            debug!(finisher = self.name, "work dropped after shutdown");
        }
    }
}

impl Drop for Finisher {
    fn drop(&mut self) {
        let _ = self.tx.send(FinisherCommand::Shutdown);
    }
}

#[derive(Default)]
struct TrackerState {
    outstanding: usize,
    waiters: Vec<Completion>,
}

/// Counts in-flight internal operations and lets shutdown wait for zero.
#[derive(Default)]
pub(crate) struct OpTracker {
    state: Mutex<TrackerState>,
}

impl OpTracker {
    pub fn start_op(&self) {
        self.state.lock().outstanding += 1;
    }

    pub fn finish_op(&self) {
        let waiters = {
            let mut state = self.state.lock();
            debug_assert!(state.outstanding > 0);
            state.outstanding -= 1;
            if state.outstanding == 0 {
                std::mem::take(&mut state.waiters)
            } else {
                Vec::new()
            }
        };
        for waiter in waiters {
            waiter(Ok(()));
        }
    }

    /// Fire `on_drained` once no operations are in flight.
    pub fn wait(&self, on_drained: Completion) {
        let fire_now = {
            let mut state = self.state.lock();
            if state.outstanding == 0 {
                true
            } else {
                state.waiters.push(on_drained);
                return;
            }
        };
        if fire_now {
            on_drained(Ok(()));
        }
    }

    #[cfg(test)]
    pub fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn finisher_runs_work_in_order() {
        let finisher = Finisher::new("test-finisher");
        let hits = Arc::new(AtomicU32::new(0));
        let (tx, rx) = mpsc::channel();
        for expect in 0..4u32 {
            let hits = hits.clone();
            let tx = tx.clone();
            finisher.queue(move || {
                let seen = hits.fetch_add(1, Ordering::SeqCst);
                tx.send(seen == expect).unwrap();
            });
        }
        for _ in 0..4 {
            assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        }
    }

    #[test]
    fn tracker_waits_for_zero() {
        let tracker = OpTracker::default();
        let (tx, rx) = mpsc::channel();
        tracker.start_op();
        tracker.start_op();
        tracker.wait(Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().is_err());
        tracker.finish_op();
        assert!(rx.try_recv().is_err());
        tracker.finish_op();
        assert!(rx.recv_timeout(Duration::from_secs(1)).unwrap().is_ok());
        assert_eq!(tracker.outstanding(), 0);
    }

    #[test]
    fn tracker_wait_fires_immediately_when_idle() {
        let tracker = OpTracker::default();
        let (tx, rx) = mpsc::channel();
        tracker.wait(Box::new(move |r| tx.send(r).unwrap()));
        assert!(rx.try_recv().unwrap().is_ok());
    }
}
