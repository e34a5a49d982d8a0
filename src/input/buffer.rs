//! Bounded, thread-safe FIFO of analog frames.
//!
//! The only mutable state shared between the producer and consumer loops.
//! Every operation is one short mutex critical section; the lock is never
//! held across I/O. When full, `push` silently evicts the oldest frame.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use crate::input::normalizer::AnalogFrame;

#[derive(Debug)]
pub struct InputBuffer {
    frames: Mutex<VecDeque<AnalogFrame>>,
    capacity: usize,
}

impl InputBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            frames: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Appends a frame, evicting the oldest when full. Never blocks beyond
    /// the lock, never fails.
    pub fn push(&self, frame: AnalogFrame) {
        let mut frames = self.lock();
        if frames.len() == self.capacity {
            frames.pop_front();
        }
        frames.push_back(frame);
    }

    /// Atomically takes the entire contents in arrival order, leaving the
    /// buffer empty. No frame is read twice or lost.
    pub fn drain(&self) -> Vec<AnalogFrame> {
        let mut frames = self.lock();
        frames.drain(..).collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// True once the buffer passes 80% capacity; the producer uses this to
    /// wake the consumer early.
    pub fn above_high_water(&self) -> bool {
        self.lock().len() > self.capacity * 4 / 5
    }

    // A poisoned mutex only means a panicking thread dropped the guard; the
    // frame queue itself stays coherent, so keep serving it.
    fn lock(&self) -> MutexGuard<'_, VecDeque<AnalogFrame>> {
        match self.frames.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
