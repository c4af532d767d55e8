//! Bounded per-component-type feedback queues

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::feedback::FeedbackSignal;
use crate::protocol::ComponentType;

/// A signal tagged with its submission sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct SequencedSignal {
    pub seq: u64,
    pub signal: FeedbackSignal,
}

/// FIFO queue that drops its oldest entry instead of blocking when full
pub struct FeedbackQueue {
    capacity: usize,
    entries: Mutex<VecDeque<SequencedSignal>>,
    dropped: AtomicU64,
}

impl FeedbackQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            dropped: AtomicU64::new(0),
        }
    }

    /// Append, evicting the oldest entry on overflow. Returns true if one was evicted.
    pub fn push(&self, entry: SequencedSignal) -> bool {
        let mut entries = self.entries.lock();
        let evicted = if entries.len() >= self.capacity {
            entries.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
            true
        } else {
            false
        };
        entries.push_back(entry);
        evicted
    }

    /// Pop up to `max` entries in submission order
    pub fn pop_batch(&self, max: usize) -> Vec<SequencedSignal> {
        let mut entries = self.entries.lock();
        let n = max.min(entries.len());
        entries.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// One [`FeedbackQueue`] per component type, sharing a sequence counter
pub struct FeedbackQueues {
    queues: HashMap<ComponentType, FeedbackQueue>,
    next_seq: AtomicU64,
}

impl FeedbackQueues {
    pub fn new(capacity: usize) -> Self {
        Self {
            queues: ComponentType::ALL
                .iter()
                .map(|t| (*t, FeedbackQueue::new(capacity)))
                .collect(),
            next_seq: AtomicU64::new(0),
        }
    }

    fn queue(&self, component_type: ComponentType) -> &FeedbackQueue {
        // Every ComponentType gets a queue in `new`.
        &self.queues[&component_type]
    }

    /// Route a signal to its type's queue. Returns (sequence number, evicted oldest).
    pub fn enqueue(&self, signal: FeedbackSignal) -> (u64, bool) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let evicted = self
            .queue(signal.component_type)
            .push(SequencedSignal { seq, signal });
        (seq, evicted)
    }

    pub fn pop_batch(&self, component_type: ComponentType, max: usize) -> Vec<SequencedSignal> {
        self.queue(component_type).pop_batch(max)
    }

    pub fn depth(&self, component_type: ComponentType) -> usize {
        self.queue(component_type).len()
    }

    pub fn total_depth(&self) -> usize {
        self.queues.values().map(FeedbackQueue::len).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.queues.values().map(FeedbackQueue::dropped).sum()
    }
}
