//! Dual-queue scheduler for coordination work.
//!
//! A priority-ordered ready queue is serviced first so catalog-online work
//! never starves behind backoffs; a time-ordered delay queue holds
//! operations waiting out a precondition or a transient failure. Listeners
//! can observe (and veto) inbound heartbeat messages and operation
//! execution without coupling to the queue's internals.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;

use crate::operations::Operation;
use crate::registry::{RegionReport, ServerName};

/// Observer hooks. Returning false from a veto hook suppresses processing
/// of that message/operation.
pub trait QueueListener: Send + Sync {
    fn on_heartbeat_message(&self, _server: &ServerName, _msg: &RegionReport) -> bool {
        true
    }

    fn before_operation(&self, _op: &Operation) -> bool {
        true
    }

    fn after_operation(&self, _op: &Operation) {}
}

struct ReadyEntry {
    priority: u8,
    seq: u64,
    op: Operation,
}

impl PartialEq for ReadyEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for ReadyEntry {}

impl PartialOrd for ReadyEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReadyEntry {
    // Reversed so the max-heap pops the lowest (priority, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

struct DelayedEntry {
    ready_at: Instant,
    priority: u8,
    seq: u64,
    op: Operation,
}

impl PartialEq for DelayedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.ready_at == other.ready_at && self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for DelayedEntry {}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for DelayedEntry {
    // Earliest expiry first; priority breaks same-instant ties.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .ready_at
            .cmp(&self.ready_at)
            .then(other.priority.cmp(&self.priority))
            .then(other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueInner {
    ready: BinaryHeap<ReadyEntry>,
    delayed: BinaryHeap<DelayedEntry>,
}

pub struct OperationQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    seq: AtomicU64,
    listeners: Mutex<Vec<Arc<dyn QueueListener>>>,
}

impl Default for OperationQueue {
    fn default() -> Self {
        OperationQueue {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            seq: AtomicU64::new(0),
            listeners: Mutex::new(Vec::new()),
        }
    }
}

impl OperationQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(OperationQueue::default())
    }

    pub fn add_listener(&self, listener: Arc<dyn QueueListener>) {
        self.listeners.lock().unwrap().push(listener);
    }

    /// Run heartbeat-message veto hooks. False means some listener claimed
    /// the message.
    pub fn allow_message(&self, server: &ServerName, msg: &RegionReport) -> bool {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .all(|l| l.on_heartbeat_message(server, msg))
    }

    pub fn allow_operation(&self, op: &Operation) -> bool {
        self.listeners
            .lock()
            .unwrap()
            .iter()
            .all(|l| l.before_operation(op))
    }

    pub fn operation_done(&self, op: &Operation) {
        for l in self.listeners.lock().unwrap().iter() {
            l.after_operation(op);
        }
    }

    pub fn submit(&self, op: Operation) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = ReadyEntry {
            priority: op.priority(),
            seq,
            op,
        };
        self.inner.lock().unwrap().ready.push(entry);
        self.notify.notify_one();
    }

    /// Park an operation until `delay` elapses (unmet precondition or
    /// retryable failure).
    pub fn submit_delayed(&self, op: Operation, delay: Duration) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let entry = DelayedEntry {
            ready_at: Instant::now() + delay,
            priority: op.priority(),
            seq,
            op,
        };
        self.inner.lock().unwrap().delayed.push(entry);
        self.notify.notify_one();
    }

    /// Operations still owned by the queue (ready + delayed).
    pub fn pending(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.ready.len() + inner.delayed.len()
    }

    /// Pop the next runnable operation, waiting up to `timeout`. Ready work
    /// always wins over expired delayed work of the same instant.
    pub async fn pop_ready_or_wait(&self, timeout: Duration) -> Option<Operation> {
        let deadline = Instant::now() + timeout;
        loop {
            let wait_until = {
                let mut inner = self.inner.lock().unwrap();
                if let Some(entry) = inner.ready.pop() {
                    return Some(entry.op);
                }
                let now = Instant::now();
                let next_ready = inner.delayed.peek().map(|d| d.ready_at);
                match next_ready {
                    Some(at) if at <= now => {
                        let entry = inner.delayed.pop().expect("peeked entry present");
                        return Some(entry.op);
                    }
                    Some(at) => at.min(deadline),
                    None => deadline,
                }
            };
            if Instant::now() >= deadline {
                return None;
            }
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(wait_until) => {}
            }
        }
    }
}
