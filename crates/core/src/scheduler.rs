//! Cancellable timers for the event loop.
//!
//! Timers live in a binary heap ordered by `(due, seq)`. Handles are generation-checked slot
//! indices: cancelling frees the slot and bumps its generation, the heap entry stays behind and is
//! discarded when it reaches the top. Cancelling twice, or after the timer fired, is a no-op.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use crate::time::Timestamp;

/// Handle of a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle {
    index: u32,
    generation: u32,
}

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    payload: Option<T>,
}

#[derive(Debug, PartialEq, Eq)]
struct Entry {
    due: Timestamp,
    seq: u64,
    index: u32,
    generation: u32,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max heap, earliest first.
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// A min-heap of timers carrying payloads of type `T`.
#[derive(Debug)]
pub struct Scheduler<T> {
    heap: BinaryHeap<Entry>,
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    seq: u64,
}

impl<T> Default for Scheduler<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            slots: Vec::new(),
            free: Vec::new(),
            seq: 0,
        }
    }
}

impl<T> Scheduler<T> {
    /// Create an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `payload` to fire at `due`.
    pub fn schedule(&mut self, due: Timestamp, payload: T) -> TimerHandle {
        let index = match self.free.pop() {
            Some(i) => i,
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    payload: None,
                });
                (self.slots.len() - 1) as u32
            }
        };
        let slot = &mut self.slots[index as usize];
        slot.payload = Some(payload);
        let generation = slot.generation;
        self.seq += 1;
        self.heap.push(Entry {
            due,
            seq: self.seq,
            index,
            generation,
        });
        TimerHandle { index, generation }
    }

    /// Cancel a timer. Returns the payload if the timer was still pending.
    pub fn cancel(&mut self, handle: TimerHandle) -> Option<T> {
        if !self.is_pending(handle) {
            return None;
        }
        self.release(handle.index)
    }

    /// The timer has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: TimerHandle) -> bool {
        self.slots
            .get(handle.index as usize)
            .map(|s| s.generation == handle.generation && s.payload.is_some())
            .unwrap_or(false)
    }

    /// Earliest due time of a pending timer.
    pub fn next_deadline(&mut self) -> Option<Timestamp> {
        self.drop_dead_top();
        self.heap.peek().map(|e| e.due)
    }

    /// Pop the earliest timer due at or before `now`.
    pub fn pop_expired(&mut self, now: Timestamp) -> Option<(TimerHandle, T)> {
        self.drop_dead_top();
        match self.heap.peek() {
            Some(top) if top.due <= now => {}
            _ => return None,
        }
        let entry = self.heap.pop()?;
        let handle = TimerHandle {
            index: entry.index,
            generation: entry.generation,
        };
        self.release(entry.index).map(|p| (handle, p))
    }

    /// Cancel every pending timer whose payload matches `pred`. Returns how many were cancelled.
    pub fn cancel_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> usize {
        let doomed: Vec<u32> = self
            .slots
            .iter()
            .enumerate()
            .filter(|(_, s)| s.payload.as_ref().map(&mut pred).unwrap_or(false))
            .map(|(i, _)| i as u32)
            .collect();
        for i in &doomed {
            self.release(*i);
        }
        doomed.len()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.payload.is_some()).count()
    }

    /// No timer is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn release(&mut self, index: u32) -> Option<T> {
        let slot = self.slots.get_mut(index as usize)?;
        let payload = slot.payload.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(index);
        payload
    }

    fn drop_dead_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            let live = self
                .slots
                .get(top.index as usize)
                .map(|s| s.generation == top.generation && s.payload.is_some())
                .unwrap_or(false);
            if live {
                break;
            }
            self.heap.pop();
        }
    }
}
