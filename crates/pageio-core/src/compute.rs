//! Pending computations
//!
//! A pending computation is algorithm state that asks for byte ranges,
//! is resumed with each range once it is available, and eventually
//! reports that it is done. Computations live in a `ComputePool` and are
//! addressed by `ComputeRef` handles (slot index + generation), never by
//! pointer.
//!
//! # Lifetime
//!
//! ```text
//!   alloc ──► ACTIVE ──try_mark_queued──► QUEUED ──clear_queued──► ACTIVE
//!                │                                                  │
//!                └───────────── has_completed() ◄───────────────────┘
//!                                    │
//!                               COMPLETE ──refcount hits 0──► RECLAIMED
//! ```
//!
//! The reference count is explicit: every in-flight request, the queue a
//! computation is parked on, and the submitting caller each hold one
//! count. Cloning a `ComputeRef` does not change it. `release()` drops a
//! count and reclaims the slot when it was the last one, the computation
//! is complete, and it is not queued. Reclaiming in any other situation
//! is a reference-accounting bug and panics with `lifetime violation`.

use std::fmt;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::error::{IoError, Result};
use crate::io::IoContext;
use crate::kerror;
use crate::page::{Extent, PageByteArray};
use crate::queue::FifoQueue;
use crate::request::{Access, Request};
use crate::spinlock::SpinLock;

/// Contract between the I/O paths and algorithm code.
pub trait UserCompute: Send {
    /// Resume with the bytes of one completed request.
    fn run(&mut self, page: &dyn PageByteArray);

    fn has_requests(&self) -> bool;

    /// Append up to `max` requests to `out`; returns how many.
    ///
    /// The pool stamps the computation's handle onto each request.
    fn fetch_requests(&mut self, ctx: &IoContext, out: &mut FifoQueue<Request>, max: usize) -> usize;

    fn has_completed(&self) -> bool;

    /// A request for `extent` failed with `errno` and will not be run.
    fn io_failed(&mut self, _extent: Extent, _errno: i32) {}
}

/// Observable phase of a pooled computation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComputeState {
    Active,
    Queued,
    Complete,
    Reclaimed,
}

const LIVE: u32 = 1 << 0;
const QUEUED: u32 = 1 << 1;

struct ComputeSlot {
    compute: SpinLock<Option<Box<dyn UserCompute>>>,
    refcnt: AtomicU32,
    flags: AtomicU32,
    generation: AtomicU32,
}

/// Counter snapshot of a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocs: u64,
    pub reclaims: u64,
    pub incs: u64,
    pub decs: u64,
    pub live: usize,
}

/// Fixed-size pool of computation slots.
pub struct ComputePool {
    name: String,
    slots: Box<[ComputeSlot]>,
    free: ArrayQueue<u32>,
    allocs: AtomicU64,
    reclaims: AtomicU64,
    incs: AtomicU64,
    decs: AtomicU64,
}

impl ComputePool {
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let slots = (0..capacity)
            .map(|_| ComputeSlot {
                compute: SpinLock::new(None),
                refcnt: AtomicU32::new(0),
                flags: AtomicU32::new(0),
                generation: AtomicU32::new(0),
            })
            .collect();
        let free = ArrayQueue::new(capacity);
        for i in 0..capacity as u32 {
            let _ = free.push(i);
        }
        Arc::new(ComputePool {
            name: name.into(),
            slots,
            free,
            allocs: AtomicU64::new(0),
            reclaims: AtomicU64::new(0),
            incs: AtomicU64::new(0),
            decs: AtomicU64::new(0),
        })
    }

    /// Place `compute` in a free slot. Its reference count starts at 0.
    pub fn alloc(self: &Arc<Self>, compute: Box<dyn UserCompute>) -> Result<ComputeRef> {
        let index = self.free.pop().ok_or(IoError::PoolExhausted)?;
        let slot = &self.slots[index as usize];
        *slot.compute.lock() = Some(compute);
        slot.refcnt.store(0, Ordering::Relaxed);
        slot.flags.store(LIVE, Ordering::Release);
        self.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(ComputeRef {
            pool: Arc::clone(self),
            index,
            generation: slot.generation.load(Ordering::Acquire),
        })
    }

    /// Return a computation's slot.
    ///
    /// # Panics
    ///
    /// If the computation is still referenced, queued, incomplete, or
    /// was already reclaimed.
    pub fn free(&self, compute: &ComputeRef) {
        assert!(
            std::ptr::eq(self, compute.pool.as_ref()),
            "computation belongs to pool {}",
            compute.pool.name
        );
        compute.reclaim();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn num_live(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocs: self.allocs.load(Ordering::Relaxed),
            reclaims: self.reclaims.load(Ordering::Relaxed),
            incs: self.incs.load(Ordering::Relaxed),
            decs: self.decs.load(Ordering::Relaxed),
            live: self.num_live(),
        }
    }
}

/// Handle to a pooled computation.
#[derive(Clone)]
pub struct ComputeRef {
    pool: Arc<ComputePool>,
    index: u32,
    generation: u32,
}

#[cold]
fn lifetime_violation(what: &str, r: &ComputeRef) -> ! {
    kerror!(
        "lifetime violation: {} (pool {}, slot {}, generation {})",
        what,
        r.pool.name,
        r.index,
        r.generation
    );
    panic!("lifetime violation: {} (slot {})", what, r.index);
}

impl ComputeRef {
    fn slot(&self) -> &ComputeSlot {
        let slot = &self.pool.slots[self.index as usize];
        if slot.generation.load(Ordering::Acquire) != self.generation {
            lifetime_violation("stale computation handle", self);
        }
        slot
    }

    #[inline]
    pub fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub fn pool(&self) -> &Arc<ComputePool> {
        &self.pool
    }

    pub fn inc_ref(&self) {
        self.slot().refcnt.fetch_add(1, Ordering::AcqRel);
        self.pool.incs.fetch_add(1, Ordering::Relaxed);
    }

    /// Drop one count without reclaiming; returns the remaining count.
    pub fn dec_ref(&self) -> u32 {
        let prev = self.slot().refcnt.fetch_sub(1, Ordering::AcqRel);
        if prev == 0 {
            lifetime_violation("reference count underflow", self);
        }
        self.pool.decs.fetch_add(1, Ordering::Relaxed);
        prev - 1
    }

    pub fn ref_count(&self) -> u32 {
        self.slot().refcnt.load(Ordering::Acquire)
    }

    /// Set the queued flag; false if it was already set.
    ///
    /// Only the thread currently holding the computation off any queue
    /// may call this.
    pub fn try_mark_queued(&self) -> bool {
        self.slot().flags.fetch_or(QUEUED, Ordering::AcqRel) & QUEUED == 0
    }

    pub fn clear_queued(&self) {
        self.slot().flags.fetch_and(!QUEUED, Ordering::AcqRel);
    }

    pub fn is_queued(&self) -> bool {
        self.slot().flags.load(Ordering::Acquire) & QUEUED != 0
    }

    /// Run `f` on the computation with its slot locked.
    pub fn with_compute<R>(&self, f: impl FnOnce(&mut dyn UserCompute) -> R) -> R {
        let mut guard = self.slot().compute.lock();
        if let Some(compute) = guard.as_mut() {
            return f(&mut **compute);
        }
        drop(guard);
        lifetime_violation("computation already reclaimed", self)
    }

    pub fn is_complete(&self) -> bool {
        self.with_compute(|c| c.has_completed())
    }

    pub fn has_requests(&self) -> bool {
        self.with_compute(|c| c.has_requests())
    }

    pub fn state(&self) -> ComputeState {
        let slot = &self.pool.slots[self.index as usize];
        let guard = slot.compute.lock();
        let flags = slot.flags.load(Ordering::Acquire);
        if slot.generation.load(Ordering::Acquire) != self.generation || flags & LIVE == 0 {
            return ComputeState::Reclaimed;
        }
        if flags & QUEUED != 0 {
            return ComputeState::Queued;
        }
        match guard.as_ref() {
            Some(c) if c.has_completed() => ComputeState::Complete,
            Some(_) => ComputeState::Active,
            None => ComputeState::Reclaimed,
        }
    }

    /// Ask the computation for up to `max` requests and stamp them with
    /// this handle.
    pub fn fetch_into(&self, ctx: &IoContext, out: &mut FifoQueue<Request>, max: usize) -> usize {
        let start = out.len();
        let n = self.with_compute(|c| c.fetch_requests(ctx, out, max));
        for req in out.iter_mut().skip(start) {
            if req.compute().is_none() {
                req.set_compute(Some(self.clone()));
            }
        }
        n
    }

    /// Drop one count; reclaim when it was the last holder of a complete,
    /// unqueued computation. Returns whether this call reclaimed the slot.
    ///
    /// Safe to race with other holders: the final LIVE flag swap decides
    /// which caller reclaims.
    pub fn release(&self) -> bool {
        if self.dec_ref() != 0 {
            return false;
        }
        let slot = &self.pool.slots[self.index as usize];
        let done = {
            let guard = slot.compute.lock();
            if slot.generation.load(Ordering::Acquire) != self.generation {
                return false;
            }
            matches!(guard.as_ref(), Some(c) if c.has_completed())
        };
        if !done || slot.refcnt.load(Ordering::Acquire) != 0 {
            return false;
        }
        if slot
            .flags
            .compare_exchange(LIVE, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.retire(slot);
        true
    }

    /// Checked reclaim behind `ComputePool::free`.
    fn reclaim(&self) {
        let slot = self.slot();
        let refs = slot.refcnt.load(Ordering::Acquire);
        if refs != 0 {
            lifetime_violation(&format!("reclaiming with {} live references", refs), self);
        }
        if !self.is_complete() {
            lifetime_violation("reclaiming an incomplete computation", self);
        }
        if slot
            .flags
            .compare_exchange(LIVE, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            lifetime_violation("reclaiming a queued or dead computation", self);
        }
        self.retire(slot);
    }

    fn retire(&self, slot: &ComputeSlot) {
        let compute = {
            let mut guard = slot.compute.lock();
            slot.generation.fetch_add(1, Ordering::AcqRel);
            guard.take()
        };
        drop(compute);
        self.pool.reclaims.fetch_add(1, Ordering::Relaxed);
        if self.pool.free.push(self.index).is_err() {
            kerror!("pool {}: free list overflow on slot {}", self.pool.name, self.index);
        }
    }
}

impl PartialEq for ComputeRef {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.pool, &other.pool)
            && self.index == other.index
            && self.generation == other.generation
    }
}

impl Eq for ComputeRef {}

impl fmt::Debug for ComputeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeRef")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Vertex-level computation shape used by graph algorithms.
///
/// `run` is called once on activation and lists the ranges the vertex
/// needs; `run_on_page` is called with each range and may ask for more.
pub trait ComputeVertex<P>: Send {
    fn run(&mut self, prog: &P, want: &mut Vec<Extent>);

    fn run_on_page(&mut self, prog: &P, page: &dyn PageByteArray, want: &mut Vec<Extent>);

    fn io_failed(&mut self, _prog: &P, _extent: Extent, _errno: i32) {}
}

/// Adapts a `ComputeVertex` to the `UserCompute` contract.
pub struct VertexCompute<V, P> {
    vertex: V,
    prog: Arc<P>,
    want: Vec<Extent>,
    started: bool,
    outstanding: usize,
}

impl<V, P> VertexCompute<V, P> {
    pub fn new(vertex: V, prog: Arc<P>) -> Self {
        VertexCompute {
            vertex,
            prog,
            want: Vec::new(),
            started: false,
            outstanding: 0,
        }
    }

    pub fn vertex(&self) -> &V {
        &self.vertex
    }

    /// Requests issued but not yet run
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }
}

impl<V, P> UserCompute for VertexCompute<V, P>
where
    V: ComputeVertex<P>,
    P: Send + Sync,
{
    fn run(&mut self, page: &dyn PageByteArray) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.vertex.run_on_page(&self.prog, page, &mut self.want);
    }

    fn has_requests(&self) -> bool {
        !self.started || !self.want.is_empty()
    }

    fn fetch_requests(&mut self, ctx: &IoContext, out: &mut FifoQueue<Request>, max: usize) -> usize {
        if !self.started {
            self.started = true;
            self.vertex.run(&self.prog, &mut self.want);
        }
        let n = max.min(out.remaining()).min(self.want.len());
        for ext in self.want.drain(..n) {
            let pushed = out
                .push_back(Request::new(ctx.file_id, ext.offset, ext.size, Access::Read))
                .is_ok();
            debug_assert!(pushed);
        }
        self.outstanding += n;
        n
    }

    fn has_completed(&self) -> bool {
        self.started && self.want.is_empty() && self.outstanding == 0
    }

    fn io_failed(&mut self, extent: Extent, errno: i32) {
        self.outstanding = self.outstanding.saturating_sub(1);
        self.vertex.io_failed(&self.prog, extent, errno);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::FileId;
    use crate::page::BufferByteArray;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    /// Completes after `need` runs; counts its own drops.
    struct Countdown {
        need: usize,
        seen: usize,
        dropped: Arc<AtomicUsize>,
    }

    impl Drop for Countdown {
        fn drop(&mut self) {
            self.dropped.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl UserCompute for Countdown {
        fn run(&mut self, _page: &dyn PageByteArray) {
            self.seen += 1;
        }
        fn has_requests(&self) -> bool {
            false
        }
        fn fetch_requests(&mut self, _: &IoContext, _: &mut FifoQueue<Request>, _: usize) -> usize {
            0
        }
        fn has_completed(&self) -> bool {
            self.seen >= self.need
        }
    }

    fn countdown(pool: &Arc<ComputePool>, need: usize) -> (ComputeRef, Arc<AtomicUsize>) {
        let dropped = Arc::new(AtomicUsize::new(0));
        let c = Countdown { need, seen: 0, dropped: Arc::clone(&dropped) };
        (pool.alloc(Box::new(c)).unwrap(), dropped)
    }

    fn empty_page() -> BufferByteArray<'static> {
        BufferByteArray::new(0, &[])
    }

    #[test]
    fn test_state_machine() {
        let pool = ComputePool::new("t", 4);
        let (c, dropped) = countdown(&pool, 1);
        assert_eq!(c.state(), ComputeState::Active);

        c.inc_ref();
        assert!(c.try_mark_queued());
        assert_eq!(c.state(), ComputeState::Queued);
        c.clear_queued();

        c.with_compute(|u| u.run(&empty_page()));
        assert_eq!(c.state(), ComputeState::Complete);
        assert!(c.release());
        assert_eq!(c.state(), ComputeState::Reclaimed);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert_eq!(pool.num_live(), 0);
    }

    #[test]
    fn test_mark_queued_is_idempotent() {
        let pool = ComputePool::new("t", 2);
        let (c, _) = countdown(&pool, 1);
        let mut redrive = FifoQueue::new(0, 4, false);
        for _ in 0..2 {
            if c.try_mark_queued() {
                redrive.push_back(c.clone()).unwrap();
            }
        }
        assert_eq!(redrive.len(), 1);
        assert_eq!(redrive.pop_front(), Some(c.clone()));
        c.clear_queued();
        assert!(c.try_mark_queued());
    }

    #[test]
    fn test_release_while_incomplete_keeps_slot() {
        let pool = ComputePool::new("t", 2);
        let (c, dropped) = countdown(&pool, 2);
        c.inc_ref();
        c.with_compute(|u| u.run(&empty_page()));
        assert!(!c.release());
        assert_eq!(c.state(), ComputeState::Active);
        c.inc_ref();
        c.with_compute(|u| u.run(&empty_page()));
        assert!(c.release());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_holders_reclaim_exactly_once() {
        const THREADS: usize = 8;
        const PER_THREAD: usize = 500;
        let pool = ComputePool::new("t", 1);
        let (c, dropped) = countdown(&pool, THREADS * PER_THREAD);

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let c = c.clone();
                thread::spawn(move || {
                    let mut reclaimed = 0;
                    for _ in 0..PER_THREAD {
                        c.inc_ref();
                        c.with_compute(|u| u.run(&empty_page()));
                        if c.release() {
                            reclaimed += 1;
                        }
                    }
                    reclaimed
                })
            })
            .collect();
        let reclaimed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

        assert_eq!(reclaimed, 1);
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        let stats = pool.stats();
        assert_eq!(stats.incs, (THREADS * PER_THREAD) as u64);
        assert_eq!(stats.incs, stats.decs);
        assert_eq!(stats.reclaims, 1);
        assert_eq!(c.state(), ComputeState::Reclaimed);
    }

    #[test]
    fn test_pool_exhaustion_and_slot_reuse() {
        let pool = ComputePool::new("t", 1);
        let (a, _) = countdown(&pool, 0);
        let dropped = Arc::new(AtomicUsize::new(0));
        let again = pool.alloc(Box::new(Countdown { need: 0, seen: 0, dropped }));
        assert_eq!(again.err(), Some(IoError::PoolExhausted));

        pool.free(&a);
        let (b, _) = countdown(&pool, 0);
        assert_eq!(b.index(), a.index());
        assert_ne!(a, b);
        assert_eq!(a.state(), ComputeState::Reclaimed);
        assert_eq!(b.state(), ComputeState::Complete);
    }

    #[test]
    #[should_panic(expected = "lifetime violation")]
    fn test_free_with_live_reference_panics() {
        let pool = ComputePool::new("t", 1);
        let (c, _) = countdown(&pool, 0);
        c.inc_ref();
        pool.free(&c);
    }

    #[test]
    #[should_panic(expected = "lifetime violation")]
    fn test_free_incomplete_panics() {
        let pool = ComputePool::new("t", 1);
        let (c, _) = countdown(&pool, 3);
        pool.free(&c);
    }

    #[test]
    #[should_panic(expected = "lifetime violation")]
    fn test_double_free_panics() {
        let pool = ComputePool::new("t", 1);
        let (c, _) = countdown(&pool, 0);
        pool.free(&c);
        pool.free(&c);
    }

    #[test]
    #[should_panic(expected = "lifetime violation")]
    fn test_release_underflow_panics() {
        let pool = ComputePool::new("t", 1);
        let (c, _) = countdown(&pool, 1);
        c.release();
    }

    struct TwoRows;

    impl ComputeVertex<u64> for TwoRows {
        fn run(&mut self, base: &u64, want: &mut Vec<Extent>) {
            want.push(Extent::new(*base, 8));
            want.push(Extent::new(*base + 8, 8));
        }
        fn run_on_page(&mut self, _: &u64, _: &dyn PageByteArray, _: &mut Vec<Extent>) {}
    }

    #[test]
    fn test_vertex_adapter_stamps_requests() {
        let pool = ComputePool::new("t", 1);
        let c = pool
            .alloc(Box::new(VertexCompute::new(TwoRows, Arc::new(64u64))))
            .unwrap();
        let ctx = IoContext { file_id: FileId(7), node_id: 0 };
        let mut out = FifoQueue::new(0, 8, false);

        assert!(c.has_requests());
        assert_eq!(c.fetch_into(&ctx, &mut out, 1), 1);
        assert!(c.has_requests());
        assert_eq!(c.fetch_into(&ctx, &mut out, 8), 1);
        assert!(!c.has_requests());

        let reqs: Vec<_> = out.drain().collect();
        assert_eq!(reqs[0].offset(), 64);
        assert_eq!(reqs[1].offset(), 72);
        assert!(reqs.iter().all(|r| r.file_id() == FileId(7) && r.compute() == Some(&c)));

        assert!(!c.is_complete());
        c.with_compute(|u| u.run(&empty_page()));
        c.with_compute(|u| u.io_failed(Extent::new(72, 8), 5));
        assert!(c.is_complete());
        pool.free(&c);
    }
}
