//! Sync points and the gather primitive backing them.
//!
//! A sync point is an ordering fence: it may only be appended to the log
//! after every write bearing its generation and the previous sync point are
//! durable. Each sync point owns a *prior-persist gather*; every write
//! request of the generation contributes one sub-completion, and one more
//! sub stands for "predecessor is durable".

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::error::CacheResult;
use crate::image::Completion;

struct GatherState {
    outstanding: usize,
    activated: bool,
    finished: bool,
    status: CacheResult<()>,
    finisher: Option<Completion>,
}

/// Counting sub-completion barrier.
///
/// Subs may be created until [`Gather::activate`]; the finisher fires once
/// the gather is activated and every sub has completed. The first error
/// reported by any sub wins.
pub(crate) struct Gather {
    state: Mutex<GatherState>,
}

impl Gather {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(GatherState {
                outstanding: 0,
                activated: false,
                finished: false,
                status: Ok(()),
                finisher: None,
            }),
        })
    }

    pub fn set_finisher(&self, finisher: Completion) {
        let mut state = self.state.lock();
        debug_assert!(state.finisher.is_none());
        debug_assert!(!state.finished);
        state.finisher = Some(finisher);
    }

    pub fn new_sub(self: &Arc<Self>) -> GatherSub {
        let mut state = self.state.lock();
        debug_assert!(!state.activated, "sub created after activation");
        state.outstanding += 1;
        GatherSub {
            gather: self.clone(),
        }
    }

    /// No further subs will be created; fire when outstanding reaches zero.
    pub fn activate(&self) {
        let finisher = {
            let mut state = self.state.lock();
            debug_assert!(!state.activated);
            state.activated = true;
            Self::take_finisher(&mut state)
        };
        if let Some((finisher, status)) = finisher {
            finisher(status);
        }
    }

    fn sub_complete(&self, result: CacheResult<()>) {
        let finisher = {
            let mut state = self.state.lock();
            debug_assert!(state.outstanding > 0);
            state.outstanding -= 1;
            if state.status.is_ok() {
                if let Err(err) = result {
                    state.status = Err(err);
                }
            }
            Self::take_finisher(&mut state)
        };
        if let Some((finisher, status)) = finisher {
            finisher(status);
        }
    }

    fn take_finisher(state: &mut GatherState) -> Option<(Completion, CacheResult<()>)> {
        if state.activated && state.outstanding == 0 && !state.finished {
            state.finished = true;
            state
                .finisher
                .take()
                .map(|finisher| (finisher, state.status.clone()))
        } else {
            None
        }
    }

    #[cfg(test)]
    fn outstanding(&self) -> usize {
        self.state.lock().outstanding
    }
}

/// One sub-completion of a [`Gather`].
#[must_use = "a gather sub must be completed"]
pub(crate) struct GatherSub {
    gather: Arc<Gather>,
}

impl GatherSub {
    pub fn complete(self, result: CacheResult<()>) {
        self.gather.sub_complete(result);
    }

    pub fn into_completion(self) -> Completion {
        Box::new(move |result| self.complete(result))
    }
}

struct SyncPointLinks {
    earlier: Option<Arc<SyncPoint>>,
    later: Option<Weak<SyncPoint>>,
    on_persisted: Vec<Completion>,
}

/// Ordering fence bearing one sync generation number.
pub(crate) struct SyncPoint {
    gen: u64,
    final_op_sequence: AtomicU64,
    writes: AtomicU64,
    bytes: AtomicU64,
    writes_completed: AtomicU64,
    persisted: AtomicBool,
    /// Completes once every write of this generation and the previous sync
    /// point are durable; its finisher appends this sync point's descriptor.
    pub prior_persisted: Arc<Gather>,
    links: Mutex<SyncPointLinks>,
}

impl SyncPoint {
    pub fn new(gen: u64) -> Arc<Self> {
        debug!(gen, "new sync point");
        Arc::new(Self {
            gen,
            final_op_sequence: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            writes_completed: AtomicU64::new(0),
            persisted: AtomicBool::new(false),
            prior_persisted: Gather::new(),
            links: Mutex::new(SyncPointLinks {
                earlier: None,
                later: None,
                on_persisted: Vec::new(),
            }),
        })
    }

    #[inline]
    pub fn gen(&self) -> u64 {
        self.gen
    }

    pub fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write_completed(&self) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn writes_completed(&self) -> u64 {
        self.writes_completed.load(Ordering::Relaxed)
    }

    pub fn set_final_op_sequence(&self, sequence: u64) {
        self.final_op_sequence.store(sequence, Ordering::Release);
    }

    pub fn final_op_sequence(&self) -> u64 {
        self.final_op_sequence.load(Ordering::Acquire)
    }

    #[inline]
    pub fn persisted(&self) -> bool {
        self.persisted.load(Ordering::Acquire)
    }

    /// Link `later` as this sync point's successor.
    pub fn link_successor(self: &Arc<Self>, later: &Arc<SyncPoint>) {
        {
            let mut links = self.links.lock();
            links.later = Some(Arc::downgrade(later));
        }
        later.links.lock().earlier = Some(self.clone());
    }

    pub fn earlier(&self) -> Option<Arc<SyncPoint>> {
        self.links.lock().earlier.clone()
    }

    /// Register work to run when this sync point is durable. If it already
    /// is, the callback is handed back for the caller to fire outside its
    /// locks.
    #[must_use = "a returned callback must be fired by the caller"]
    pub fn add_on_persisted(&self, callback: Completion) -> Option<Completion> {
        let mut links = self.links.lock();
        if self.persisted() {
            Some(callback)
        } else {
            links.on_persisted.push(callback);
            None
        }
    }

    /// Mark durable; unlink from the successor and return the callbacks to
    /// fire.
    pub fn mark_persisted(&self) -> Vec<Completion> {
        self.persisted.store(true, Ordering::Release);
        let mut links = self.links.lock();
        if let Some(later) = links.later.take().and_then(|weak| weak.upgrade()) {
            later.links.lock().earlier = None;
        }
        std::mem::take(&mut links.on_persisted)
    }
}

impl Drop for SyncPoint {
    fn drop(&mut self) {
        let links = self.links.lock();
        if !links.on_persisted.is_empty() {
            debug!(
                gen = self.gen,
                callbacks = links.on_persisted.len(),
                "sync point dropped with unfired callbacks"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CacheError;
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    #[test]
    fn gather_fires_after_activation_and_all_subs() {
        let gather = Gather::new();
        let (tx, rx) = mpsc::channel();
        gather.set_finisher(Box::new(move |r| tx.send(r).unwrap()));
        let a = gather.new_sub();
        let b = gather.new_sub();
        a.complete(Ok(()));
        assert!(rx.try_recv().is_err());
        gather.activate();
        assert!(rx.try_recv().is_err());
        b.complete(Ok(()));
        assert!(rx.try_recv().unwrap().is_ok());
        assert_eq!(gather.outstanding(), 0);
    }

    #[test]
    fn gather_with_no_subs_fires_on_activation() {
        let gather = Gather::new();
        let (tx, rx) = mpsc::channel();
        gather.set_finisher(Box::new(move |r| tx.send(r).unwrap()));
        gather.activate();
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn first_error_wins() {
        let gather = Gather::new();
        let (tx, rx) = mpsc::channel();
        gather.set_finisher(Box::new(move |r| tx.send(r).unwrap()));
        let a = gather.new_sub();
        let b = gather.new_sub();
        gather.activate();
        a.complete(Err(CacheError::TransactionAborted("boom".to_string())));
        b.complete(Ok(()));
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(CacheError::TransactionAborted(_))));
    }

    #[test]
    fn sync_point_chain_links_and_unlinks() {
        let first = SyncPoint::new(0);
        let second = SyncPoint::new(1);
        first.link_successor(&second);
        assert!(second.earlier().is_some());
        first.set_final_op_sequence(12);
        let callbacks = first.mark_persisted();
        assert!(callbacks.is_empty());
        assert!(second.earlier().is_none());
        assert_eq!(first.final_op_sequence(), 12);
    }

    #[test]
    fn on_persisted_after_persist_fires_immediately() {
        let point = SyncPoint::new(3);
        let fired = Arc::new(AtomicU32::new(0));
        {
            let fired = fired.clone();
            let deferred = point.add_on_persisted(Box::new(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            }));
            assert!(deferred.is_none());
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        for callback in point.mark_persisted() {
            callback(Ok(()));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        {
            let fired = fired.clone();
            let immediate = point
                .add_on_persisted(Box::new(move |_| {
                    fired.fetch_add(1, Ordering::SeqCst);
                }))
                .expect("already persisted");
            immediate(Ok(()));
        }
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn write_counters() {
        let point = SyncPoint::new(5);
        point.record_write(512);
        point.record_write(1024);
        point.record_write_completed();
        assert_eq!(point.writes(), 2);
        assert_eq!(point.writes_completed(), 1);
    }
}
