//! # Response Timer
//!
//! Matches incoming replies to pending outgoing requests. Every send that
//! expects an answer registers a task with an expected reply count (1 for
//! direct sends, the group size for group delivery); replies accumulate until
//! the count is reached, the deadline passes, or the task is cancelled, and
//! the completion fires exactly once with whatever was collected.
//!
//! Task ids are allocated from a monotonic counter starting at 1 and are
//! never reused within an engine lifetime, so a deadline tick or a straggler
//! reply for an already-completed task simply finds no entry. Id 0 is the
//! wire sentinel for "no reply expected".
//!
//! The timer is plain data owned by the engine actor; deadlines are sleeps
//! the engine spawns, which report back as expiry commands.

use std::collections::HashMap;

use tracing::{debug, trace};

/// Callback invoked exactly once with the collected reply payloads.
pub type ResponseHandler = Box<dyn FnOnce(Vec<Vec<u8>>) + Send + 'static>;

struct PendingTask {
    expected_replies: u16,
    received: Vec<Vec<u8>>,
    completion: ResponseHandler,
}

#[derive(Default)]
pub struct ResponseTimer {
    next_id: u64,
    tasks: HashMap<u64, PendingTask>,
}

impl ResponseTimer {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn pending(&self) -> usize {
        self.tasks.len()
    }

    /// Register a pending task and return its message id.
    pub fn add_task(&mut self, expected_replies: u16, completion: ResponseHandler) -> u64 {
        self.next_id += 1;
        let id = self.next_id;
        self.tasks.insert(
            id,
            PendingTask {
                expected_replies: expected_replies.max(1),
                received: Vec::new(),
                completion,
            },
        );
        trace!(message_id = id, expected = expected_replies, "task added");
        id
    }

    /// Record one reply. Returns true when this reply completed the task.
    pub fn receive_reply(&mut self, message_id: u64, payload: Vec<u8>) -> bool {
        let Some(task) = self.tasks.get_mut(&message_id) else {
            // Late or duplicate reply after completion: dropped silently.
            trace!(message_id, "reply for unknown task dropped");
            return false;
        };
        task.received.push(payload);
        if task.received.len() < task.expected_replies as usize {
            return false;
        }
        let task = self.tasks.remove(&message_id).expect("entry checked above");
        debug!(message_id, replies = task.received.len(), "task completed");
        (task.completion)(task.received);
        true
    }

    /// Fire the completion with an empty reply vector and erase the task.
    pub fn cancel_task(&mut self, message_id: u64) {
        if let Some(task) = self.tasks.remove(&message_id) {
            debug!(message_id, "task cancelled");
            (task.completion)(Vec::new());
        }
    }

    /// Deadline tick: fire with whatever was collected, possibly nothing.
    pub fn expire_task(&mut self, message_id: u64) {
        if let Some(task) = self.tasks.remove(&message_id) {
            debug!(
                message_id,
                replies = task.received.len(),
                expected = task.expected_replies,
                "task expired"
            );
            (task.completion)(task.received);
        }
    }

    /// Teardown: every pending completion fires once with an empty vector.
    pub fn drain(&mut self) {
        for (message_id, task) in self.tasks.drain() {
            debug!(message_id, "task drained at shutdown");
            (task.completion)(Vec::new());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn recording() -> (ResponseHandler, Arc<Mutex<Vec<Vec<Vec<u8>>>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let inner = calls.clone();
        let handler = Box::new(move |replies: Vec<Vec<u8>>| {
            inner.lock().unwrap().push(replies);
        });
        (handler, calls)
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let mut timer = ResponseTimer::new();
        let a = timer.add_task(1, Box::new(|_| {}));
        let b = timer.add_task(1, Box::new(|_| {}));
        let c = timer.add_task(4, Box::new(|_| {}));
        assert!(a < b && b < c);
        assert!(a >= 1, "id 0 is reserved for no-reply sends");
    }

    #[test]
    fn completes_on_full_replication() {
        let mut timer = ResponseTimer::new();
        let (handler, calls) = recording();
        let id = timer.add_task(3, handler);

        assert!(!timer.receive_reply(id, b"one".to_vec()));
        assert!(!timer.receive_reply(id, b"two".to_vec()));
        assert!(timer.receive_reply(id, b"three".to_vec()));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 3);
        assert_eq!(calls[0][0], b"one");
    }

    #[test]
    fn expiry_delivers_partial_results() {
        let mut timer = ResponseTimer::new();
        let (handler, calls) = recording();
        let id = timer.add_task(4, handler);

        timer.receive_reply(id, b"only".to_vec());
        timer.expire_task(id);

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec![b"only".to_vec()]);
    }

    #[test]
    fn cancel_fires_empty_exactly_once() {
        let mut timer = ResponseTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let id = timer.add_task(2, Box::new(move |replies| {
            assert!(replies.is_empty());
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        timer.cancel_task(id);
        timer.cancel_task(id);
        timer.expire_task(id);
        assert!(!timer.receive_reply(id, b"late".to_vec()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replies_after_completion_are_dropped() {
        let mut timer = ResponseTimer::new();
        let (handler, calls) = recording();
        let id = timer.add_task(1, handler);

        assert!(timer.receive_reply(id, b"first".to_vec()));
        assert!(!timer.receive_reply(id, b"straggler".to_vec()));
        assert_eq!(calls.lock().unwrap().len(), 1);
        assert_eq!(timer.pending(), 0);
    }

    #[test]
    fn drain_completes_everything_empty() {
        let mut timer = ResponseTimer::new();
        let (first, first_calls) = recording();
        let (second, second_calls) = recording();
        timer.add_task(4, first);
        let id = timer.add_task(4, second);
        timer.receive_reply(id, b"partial".to_vec());

        timer.drain();
        assert_eq!(timer.pending(), 0);
        assert_eq!(first_calls.lock().unwrap()[0], Vec::<Vec<u8>>::new());
        // Partial results are discarded on teardown; callers observe empty.
        assert_eq!(second_calls.lock().unwrap()[0], Vec::<Vec<u8>>::new());
    }
}
