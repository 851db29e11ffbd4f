//! A single-threaded bounded queue that drops the newest item instead of
//! blocking once full.
//!
//! The policy engine refills this queue once per tick with work to revisit
//! next tick (a pid to re-scan, a group to re-detect); a tick that produces
//! more candidates than the queue can hold should not stall the daemon, so
//! the newest overflow is dropped and the caller is told which value it was.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;

struct QueueState<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

/// A bounded FIFO queue, cheap to clone (shares one underlying buffer).
pub struct DelayQueue<T> {
    state: Rc<RefCell<QueueState<T>>>,
}

impl<T> Clone for DelayQueue<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

impl<T> DelayQueue<T> {
    /// Creates an empty queue holding at most `capacity` items.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(QueueState {
                buffer: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Enqueues `value`. Returns `Err(value)` without mutating the queue if
    /// it is already at capacity.
    pub fn push(&self, value: T) -> Result<(), T> {
        let mut state = self.state.borrow_mut();
        if state.buffer.len() >= state.capacity {
            return Err(value);
        }
        state.buffer.push_back(value);
        Ok(())
    }

    /// Removes and returns every queued item, oldest first.
    pub fn drain(&self) -> Vec<T> {
        self.state.borrow_mut().buffer.drain(..).collect()
    }

    /// Number of items currently queued.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.borrow().buffer.len()
    }

    /// Whether the queue is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_drain_preserve_fifo_order() {
        let q = DelayQueue::new(4);
        q.push(1).unwrap();
        q.push(2).unwrap();
        q.push(3).unwrap();
        assert_eq!(q.drain(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn full_queue_drops_the_newest_push() {
        let q = DelayQueue::new(2);
        q.push(1).unwrap();
        q.push(2).unwrap();
        assert_eq!(q.push(3), Err(3));
        assert_eq!(q.drain(), vec![1, 2]);
    }

    #[test]
    fn clone_shares_the_same_buffer() {
        let q = DelayQueue::new(4);
        let q2 = q.clone();
        q.push(1).unwrap();
        assert_eq!(q2.len(), 1);
    }
}
