//! Per-peer packet queues
//!
//! [`StageQueue`] holds plaintext waiting for a usable session.
//! [`ReorderQueue`] reserves a slot per packet at submission time so crypto
//! workers may finish in any order while delivery stays in submission order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::DataPathError;

/// Bounded FIFO that drops its oldest entry when full
pub struct StageQueue {
    packets: Mutex<VecDeque<Vec<u8>>>,
    capacity: usize,
}

impl StageQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            packets: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Append a packet. Returns true when the oldest packet was evicted.
    pub fn push(&self, packet: Vec<u8>) -> bool {
        let mut packets = self.packets.lock();
        let evicted = if packets.len() >= self.capacity {
            packets.pop_front();
            true
        } else {
            false
        };
        packets.push_back(packet);
        evicted
    }

    /// Push only if nothing is waiting; used to stage a keepalive
    pub fn push_if_empty(&self, packet: Vec<u8>) -> bool {
        let mut packets = self.packets.lock();
        if packets.is_empty() {
            packets.push_back(packet);
            true
        } else {
            false
        }
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        self.packets.lock().drain(..).collect()
    }

    /// Put packets back at the head in their original order
    pub fn requeue_front(&self, batch: Vec<Vec<u8>>) {
        let mut packets = self.packets.lock();
        for packet in batch.into_iter().rev() {
            packets.push_front(packet);
        }
        while packets.len() > self.capacity {
            packets.pop_front();
        }
    }

    pub fn purge(&self) -> usize {
        let mut packets = self.packets.lock();
        let count = packets.len();
        packets.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.packets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.lock().is_empty()
    }
}

/// A reserved position in a [`ReorderQueue`]
pub struct Slot<T> {
    done: AtomicBool,
    value: Mutex<Option<T>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            done: AtomicBool::new(false),
            value: Mutex::new(None),
        }
    }

    pub fn complete(&self, value: T) {
        *self.value.lock() = Some(value);
        self.done.store(true, Ordering::Release);
    }

    /// Mark the slot finished with nothing to deliver
    pub fn fail(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

pub struct ReorderQueue<T> {
    slots: Mutex<VecDeque<Arc<Slot<T>>>>,
    capacity: usize,
}

impl<T> ReorderQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
        }
    }

    /// Reserve the next delivery position
    pub fn push(&self) -> Result<Arc<Slot<T>>, DataPathError> {
        let mut slots = self.slots.lock();
        if slots.len() >= self.capacity {
            return Err(DataPathError::QueueOverflow);
        }
        let slot = Arc::new(Slot::new());
        slots.push_back(slot.clone());
        Ok(slot)
    }

    /// Pop the finished prefix. Stops at the first unfinished slot; failed
    /// slots are skipped.
    pub fn drain_ready(&self) -> Vec<T> {
        let mut slots = self.slots.lock();
        let mut ready = Vec::new();
        while slots.front().is_some_and(|slot| slot.is_done()) {
            if let Some(slot) = slots.pop_front() {
                ready.extend(slot.value.lock().take());
            }
        }
        ready
    }

    pub fn purge(&self) -> usize {
        let mut slots = self.slots.lock();
        let count = slots.len();
        slots.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }
}
