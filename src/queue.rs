//! Bounded admission queue: a concurrency cap plus a FIFO waiting line,
//! with slots keyed by an owning client handle so the handle's death
//! releases whatever slot it held.
//!
//! Kept deliberately dumb: the queue never runs I/O itself, it only
//! decides whether/when to invoke an opaque `Action`, and tracks nothing
//! but handles.

use std::collections::{HashSet, VecDeque};

use crate::coordinator::ClientHandle;

/// An opaque unit of work the queue runs when a slot becomes available.
/// Boxed because `put_blob` and `get_blob` close over different data.
pub type Action = Box<dyn FnOnce() + Send>;

/// Result of an `add` call.
#[derive(Debug, PartialEq, Eq)]
pub enum AddResult {
    AcceptedRunning,
    AcceptedWaiting,
    Full,
}

struct Waiting {
    handle: ClientHandle,
    action: Action,
}

/// A bounded concurrency coordinator for one admission class (puts or
/// gets).
pub struct AdmissionQueue {
    capacity: usize,
    max_waiting: usize,
    running: HashSet<ClientHandle>,
    waiting: VecDeque<Waiting>,
}

impl AdmissionQueue {
    pub fn new(capacity: usize, max_waiting: usize) -> Self {
        AdmissionQueue {
            capacity,
            max_waiting,
            running: HashSet::new(),
            waiting: VecDeque::new(),
        }
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.waiting.len()
    }

    /// True if `add` would currently return [`AddResult::Full`]. Callers
    /// that need to reply with a specific reason on refusal (rather than
    /// letting an unused action simply drop) check this before
    /// constructing the action, since `add` itself does not hand a
    /// refused action back to the caller.
    pub fn is_full(&self) -> bool {
        self.running.len() >= self.capacity && self.waiting.len() >= self.max_waiting
    }

    /// Admit `handle` and, depending on current occupancy, either run
    /// `action` immediately, queue it, or refuse admission outright.
    pub fn add(&mut self, handle: ClientHandle, action: Action) -> AddResult {
        if self.running.len() < self.capacity {
            self.running.insert(handle);
            action();
            AddResult::AcceptedRunning
        } else if self.waiting.len() < self.max_waiting {
            self.waiting.push_back(Waiting { handle, action });
            AddResult::AcceptedWaiting
        } else {
            AddResult::Full
        }
    }

    /// Remove `handle` from whichever set it occupies. If it was running
    /// and a waiter exists, promote the head of the waiting line into the
    /// running set and execute its action. A no-op for unknown handles.
    pub fn remove(&mut self, handle: ClientHandle) {
        if let Some(pos) = self.waiting.iter().position(|w| w.handle == handle) {
            self.waiting.remove(pos);
            return;
        }

        if self.running.remove(&handle) {
            if let Some(next) = self.waiting.pop_front() {
                self.running.insert(next.handle);
                (next.action)();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_action(counter: Arc<AtomicUsize>) -> Action {
        Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn running_under_capacity_runs_immediately() {
        let mut q = AdmissionQueue::new(2, 2);
        let ran = Arc::new(AtomicUsize::new(0));
        let result = q.add(ClientHandle::new(1), counting_action(ran.clone()));
        assert_eq!(result, AddResult::AcceptedRunning);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(q.running_count(), 1);
        assert_eq!(q.waiting_count(), 0);
    }

    #[test]
    fn overflow_waits_then_refuses() {
        let mut q = AdmissionQueue::new(1, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        let a = q.add(ClientHandle::new(1), counting_action(ran.clone()));
        let b = q.add(ClientHandle::new(2), counting_action(ran.clone()));
        let c = q.add(ClientHandle::new(3), counting_action(ran.clone()));

        assert_eq!(a, AddResult::AcceptedRunning);
        assert_eq!(b, AddResult::AcceptedWaiting);
        assert_eq!(c, AddResult::Full);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(q.running_count(), 1);
        assert_eq!(q.waiting_count(), 1);
    }

    #[test]
    fn remove_running_promotes_waiter() {
        let mut q = AdmissionQueue::new(1, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        q.add(ClientHandle::new(1), counting_action(ran.clone()));
        q.add(ClientHandle::new(2), counting_action(ran.clone()));
        assert_eq!(ran.load(Ordering::SeqCst), 1);

        q.remove(ClientHandle::new(1));
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(q.running_count(), 1);
        assert_eq!(q.waiting_count(), 0);
    }

    #[test]
    fn remove_waiting_drops_without_running() {
        let mut q = AdmissionQueue::new(1, 1);
        let ran = Arc::new(AtomicUsize::new(0));

        q.add(ClientHandle::new(1), counting_action(ran.clone()));
        q.add(ClientHandle::new(2), counting_action(ran.clone()));
        q.remove(ClientHandle::new(2));

        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(q.waiting_count(), 0);
    }

    #[test]
    fn remove_unknown_handle_is_noop() {
        let mut q = AdmissionQueue::new(1, 1);
        q.remove(ClientHandle::new(42));
        assert_eq!(q.running_count(), 0);
        assert_eq!(q.waiting_count(), 0);
    }

    #[test]
    fn capacity_invariant_holds_across_interleaving() {
        let mut q = AdmissionQueue::new(2, 3);
        let ran = Arc::new(AtomicUsize::new(0));

        for i in 0..4 {
            q.add(ClientHandle::new(i), counting_action(ran.clone()));
            assert!(q.running_count() <= 2);
            assert!(q.waiting_count() <= 3);
        }

        q.remove(ClientHandle::new(0));
        assert!(q.running_count() <= 2);
        q.remove(ClientHandle::new(1));
        assert!(q.running_count() <= 2);
    }
}
