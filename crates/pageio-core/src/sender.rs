//! Batching sender
//!
//! A `MsgSender` stages messages in a small local buffer and moves them
//! to its destination queues in bulk, so a producer touches a destination
//! lock once per batch instead of once per message.
//!
//! # Flush
//!
//! ```text
//!   start = random destination (0 if there is only one)
//!   for each destination once, starting at `start`, wrapping:
//!       offer the whole remaining run; keep what is refused
//!   refused messages stay at the front of the buffer, in order
//! ```
//!
//! Each destination is tried at most once per flush, even if an earlier
//! one drains in the meantime; the next flush starts over.
//!
//! # Thread-safe mode
//!
//! A thread-safe sender serializes `send`/`flush` with its own spinlock
//! but never holds it while pushing into a destination: the run is
//! detached, pushed unlocked, and the refused part is put back ahead of
//! anything buffered meanwhile. Detached messages still count against
//! the buffer size, so the buffer never exceeds it.

use std::collections::VecDeque;
use std::sync::Arc;

use rand::Rng;

use crate::error::TrySendError;
use crate::queue::MsgQueue;
use crate::spinlock::{SpinLock, SpinLockGuard};

struct SenderState<T> {
    buf: VecDeque<T>,
    /// Messages taken out by a flush that is pushing unlocked
    in_flight: usize,
}

impl<T> SenderState<T> {
    #[inline]
    fn occupied(&self) -> usize {
        self.buf.len() + self.in_flight
    }
}

pub struct MsgSender<T> {
    state: SpinLock<SenderState<T>>,
    buf_size: usize,
    dests: Vec<Arc<MsgQueue<T>>>,
    thread_safe: bool,
}

impl<T> MsgSender<T> {
    pub fn new(buf_size: usize, dests: Vec<Arc<MsgQueue<T>>>, thread_safe: bool) -> Self {
        let buf_size = buf_size.max(1);
        MsgSender {
            state: SpinLock::new(SenderState {
                buf: VecDeque::with_capacity(buf_size),
                in_flight: 0,
            }),
            buf_size,
            dests,
            thread_safe,
        }
    }

    /// Messages currently buffered (not counting a detached run)
    pub fn num_msgs(&self) -> usize {
        self.state.lock().buf.len()
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    pub fn num_dests(&self) -> usize {
        self.dests.len()
    }

    pub fn is_thread_safe(&self) -> bool {
        self.thread_safe
    }

    /// Buffer one message, flushing when the buffer fills.
    ///
    /// A full buffer is flushed first; if that frees nothing the message
    /// is handed back and the caller must retry or back off.
    pub fn send(&self, msg: T) -> Result<(), TrySendError<T>> {
        let mut st = self.state.lock();
        if st.occupied() >= self.buf_size {
            st = self.flush_locked(st).0;
            if st.occupied() >= self.buf_size {
                return Err(TrySendError(msg));
            }
        }
        st.buf.push_back(msg);
        if st.occupied() >= self.buf_size {
            drop(self.flush_locked(st));
        }
        Ok(())
    }

    /// Push buffered messages to the destinations; returns how many went.
    pub fn flush(&self) -> usize {
        let st = self.state.lock();
        self.flush_locked(st).1
    }

    /// Remove and return everything still buffered.
    pub fn take_buffered(&self) -> VecDeque<T> {
        std::mem::take(&mut self.state.lock().buf)
    }

    fn flush_locked<'a>(
        &'a self,
        mut st: SpinLockGuard<'a, SenderState<T>>,
    ) -> (SpinLockGuard<'a, SenderState<T>>, usize) {
        if !self.thread_safe {
            let sent = self.distribute(&mut st.buf);
            return (st, sent);
        }

        let mut run = std::mem::take(&mut st.buf);
        let detached = run.len();
        st.in_flight += detached;
        drop(st);

        let sent = self.distribute(&mut run);

        let mut st = self.state.lock();
        st.in_flight -= detached;
        while let Some(msg) = run.pop_back() {
            st.buf.push_front(msg);
        }
        (st, sent)
    }

    fn distribute(&self, run: &mut VecDeque<T>) -> usize {
        let n = self.dests.len();
        if n == 0 || run.is_empty() {
            return 0;
        }
        let mut idx = if n > 1 {
            rand::thread_rng().gen_range(0..n)
        } else {
            0
        };
        let mut sent = 0;
        for _ in 0..n {
            if run.is_empty() {
                break;
            }
            sent += self.dests[idx].add(run);
            idx = (idx + 1) % n;
        }
        sent
    }
}
