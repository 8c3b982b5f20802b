//! Bounded FIFO queues
//!
//! Two flavours, one storage:
//!
//! - `FifoQueue<T>` - single-owner queue. Growth needs `&mut self`, so
//!   exclusive access is checked by the borrow checker.
//! - `MsgQueue<T>` - `FifoQueue` behind a mutex with a condvar for one
//!   blocked consumer. Each disk thread owns two of these (normal and
//!   low priority); batching senders push into them.
//!
//! Bulk pushes never block and never fail: they move as many items as
//! fit from the front of the caller's buffer and return the count, so
//! whatever is left stays at the front of that buffer in order.
//!
//! ```text
//!   caller buf: [a b c d e]      queue (cap 4): [x y _ _]
//!   push_back_from  ───────────────────────────────────────►  returns 2
//!   caller buf: [c d e]          queue:         [x y a b]
//! ```

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Fixed-capacity FIFO, optionally growable.
#[derive(Debug)]
pub struct FifoQueue<T> {
    buf: VecDeque<T>,
    capacity: usize,
    node_id: usize,
    resizable: bool,
}

impl<T> FifoQueue<T> {
    /// `node_id` is a placement hint only.
    pub fn new(node_id: usize, capacity: usize, resizable: bool) -> Self {
        let capacity = capacity.max(1);
        FifoQueue {
            buf: VecDeque::with_capacity(capacity),
            capacity,
            node_id,
            resizable,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.buf.len() >= self.capacity
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity - self.buf.len()
    }

    #[inline]
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    #[inline]
    pub fn is_resizable(&self) -> bool {
        self.resizable
    }

    /// Push one item, handing it back if the queue is full.
    pub fn push_back(&mut self, item: T) -> Result<(), T> {
        if self.is_full() {
            return Err(item);
        }
        self.buf.push_back(item);
        Ok(())
    }

    /// Move items from the front of `items` until full; returns how many.
    pub fn push_back_from(&mut self, items: &mut VecDeque<T>) -> usize {
        let n = self.remaining().min(items.len());
        self.buf.extend(items.drain(..n));
        n
    }

    /// Push, doubling the capacity first if the queue is full.
    ///
    /// Only resizable queues grow; a full fixed queue hands `item` back.
    pub fn push_expand(&mut self, item: T) -> Result<(), T> {
        if self.is_full() && !self.expand(self.capacity * 2) {
            return Err(item);
        }
        self.push_back(item)
    }

    #[inline]
    pub fn pop_front(&mut self) -> Option<T> {
        self.buf.pop_front()
    }

    /// Pop up to `max` items onto the end of `out`; returns how many.
    pub fn pop_front_n(&mut self, out: &mut Vec<T>, max: usize) -> usize {
        let n = max.min(self.buf.len());
        out.extend(self.buf.drain(..n));
        n
    }

    /// Grow to `new_capacity`, keeping order. No-op when not larger.
    ///
    /// Returns false if the queue is not resizable.
    pub fn expand(&mut self, new_capacity: usize) -> bool {
        if !self.resizable {
            return false;
        }
        if new_capacity > self.capacity {
            self.buf.reserve(new_capacity - self.buf.len());
            self.capacity = new_capacity;
        }
        true
    }

    /// Move all of `other` to the back of this queue, growing if needed.
    ///
    /// Returns the number moved; on a fixed queue that is at most
    /// `remaining()`, leftovers stay in `other`.
    pub fn append_expand(&mut self, other: &mut FifoQueue<T>) -> usize {
        let want = self.buf.len() + other.len();
        if want > self.capacity {
            self.expand(want.next_power_of_two());
        }
        self.push_back_from(&mut other.buf)
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.buf.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.buf.iter_mut()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    pub fn drain(&mut self) -> impl Iterator<Item = T> + '_ {
        self.buf.drain(..)
    }
}

struct MsgQueueState<T> {
    fifo: FifoQueue<T>,
    /// Set by `wakeup()`, consumed by the next blocking wait
    wake_pending: bool,
}

/// Lock-protected bounded queue with a blocking consumer side.
pub struct MsgQueue<T> {
    name: String,
    state: Mutex<MsgQueueState<T>>,
    not_empty: Condvar,
}

impl<T> MsgQueue<T> {
    pub fn new(name: impl Into<String>, node_id: usize, capacity: usize, resizable: bool) -> Self {
        MsgQueue {
            name: name.into(),
            state: Mutex::new(MsgQueueState {
                fifo: FifoQueue::new(node_id, capacity, resizable),
                wake_pending: false,
            }),
            not_empty: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MsgQueueState<T>> {
        // A panicking holder cannot leave the VecDeque half-updated
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bulk push from the front of `items`; never blocks.
    pub fn add(&self, items: &mut VecDeque<T>) -> usize {
        if items.is_empty() {
            return 0;
        }
        let n = self.lock().fifo.push_back_from(items);
        if n > 0 {
            self.not_empty.notify_one();
        }
        n
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        self.lock().fifo.push_back(item)?;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Push, growing a resizable queue when full.
    pub fn push_expand(&self, item: T) -> Result<(), T> {
        self.lock().fifo.push_expand(item)?;
        self.not_empty.notify_one();
        Ok(())
    }

    /// Non-blocking bulk pop onto `out`.
    pub fn fetch(&self, out: &mut Vec<T>, max: usize) -> usize {
        self.lock().fifo.pop_front_n(out, max)
    }

    /// Bulk pop, blocking while the queue is empty.
    ///
    /// Returns early with 0 on `wakeup()` or when `timeout` elapses.
    pub fn fetch_wait(&self, out: &mut Vec<T>, max: usize, timeout: Option<Duration>) -> usize {
        let mut guard = self.wait_locked(self.lock(), timeout);
        guard.fifo.pop_front_n(out, max)
    }

    /// Block until the queue is non-empty, woken, or timed out.
    ///
    /// Returns whether entries are present.
    pub fn wait(&self, timeout: Option<Duration>) -> bool {
        !self.wait_locked(self.lock(), timeout).fifo.is_empty()
    }

    fn wait_locked<'a>(
        &'a self,
        mut guard: MutexGuard<'a, MsgQueueState<T>>,
        timeout: Option<Duration>,
    ) -> MutexGuard<'a, MsgQueueState<T>> {
        if guard.fifo.is_empty() && !guard.wake_pending {
            guard = match timeout {
                Some(t) => {
                    self.not_empty
                        .wait_timeout_while(guard, t, |s| s.fifo.is_empty() && !s.wake_pending)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
                None => self
                    .not_empty
                    .wait_while(guard, |s| s.fifo.is_empty() && !s.wake_pending)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        guard.wake_pending = false;
        guard
    }

    /// Wake a blocked consumer even though nothing was queued.
    pub fn wakeup(&self) {
        self.lock().wake_pending = true;
        self.not_empty.notify_all();
    }

    /// Grow under the queue lock; false if not resizable.
    pub fn expand(&self, new_capacity: usize) -> bool {
        self.lock().fifo.expand(new_capacity)
    }

    pub fn len(&self) -> usize {
        self.lock().fifo.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().fifo.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.lock().fifo.is_full()
    }

    pub fn capacity(&self) -> usize {
        self.lock().fifo.capacity()
    }

    pub fn remaining(&self) -> usize {
        self.lock().fifo.remaining()
    }

    pub fn node_id(&self) -> usize {
        self.lock().fifo.node_id()
    }
}

impl<T> std::fmt::Debug for MsgQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MsgQueue")
            .field("name", &self.name)
            .field("len", &state.fifo.len())
            .field("capacity", &state.fifo.capacity())
            .finish()
    }
}
