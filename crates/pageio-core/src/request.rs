//! I/O request descriptor
//!
//! A `Request` names a byte range of one file, a direction, and the
//! scatter/gather list the bytes move through. Requests issued by a
//! pending computation carry its `ComputeRef`; the computation is resumed
//! with the bytes once the request completes.
//!
//! The fragment list keeps the first `INLINE_FRAGMENTS` entries inside
//! the request itself:
//!
//! ```text
//!   Inline { [f0 f1 f2 f3], len }      common case, no allocation
//!        │ 5th fragment
//!        ▼
//!   Heap { Vec (cap 16) }               first overflow
//!        │ 17th fragment
//!        ▼
//!   Heap { Vec (cap 32) }               doubling afterwards
//! ```
//!
//! Moving a request out (`take` / `assign`) leaves the source as an empty
//! inline-backed request that can be reused.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::compute::ComputeRef;
use crate::constants::{INLINE_FRAGMENTS, MIN_HEAP_FRAGMENTS};
use crate::io::{CompletionSink, FileId, IoStatus};
use crate::page::Extent;

/// Direction of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Access {
    #[default]
    Read,
    Write,
}

/// Queue a request is routed to on its disk thread
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Priority {
    #[default]
    Normal,
    /// Prefetch-style work; may be dropped when the normal queue is busy
    Low,
}

/// One scatter/gather buffer.
///
/// The memory behind a fragment is owned elsewhere and must outlive the
/// request it is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fragment {
    base: *mut u8,
    len: usize,
}

// Safety: a fragment is an address range; whoever builds the request
// guarantees exclusive use of that range until completion.
unsafe impl Send for Fragment {}
unsafe impl Sync for Fragment {}

impl Fragment {
    const EMPTY: Fragment = Fragment {
        base: ptr::null_mut(),
        len: 0,
    };

    /// # Safety
    ///
    /// `base..base + len` must stay valid, and unused by anyone else,
    /// until the request carrying this fragment has completed. Engines
    /// and the in-memory path write into it through the raw pointer.
    #[inline]
    pub unsafe fn new(base: *mut u8, len: usize) -> Self {
        Fragment { base, len }
    }

    /// # Safety
    ///
    /// Same contract as `new`: the borrow of `buf` ends here, but the
    /// memory must outlive the request.
    ///
    /// ```compile_fail
    /// let mut buf = [0u8; 4];
    /// let _ = pageio_core::Fragment::from_slice(&mut buf);
    /// ```
    #[inline]
    pub unsafe fn from_slice(buf: &mut [u8]) -> Self {
        Fragment {
            base: buf.as_mut_ptr(),
            len: buf.len(),
        }
    }

    #[inline]
    pub fn base(&self) -> *mut u8 {
        self.base
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    ///
    /// The range must still be live and not written concurrently.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        std::slice::from_raw_parts(self.base, self.len)
    }

    /// # Safety
    ///
    /// The range must still be live and not aliased.
    #[inline]
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        std::slice::from_raw_parts_mut(self.base, self.len)
    }
}

enum FragmentVec {
    Inline {
        frags: [Fragment; INLINE_FRAGMENTS],
        len: usize,
    },
    Heap {
        frags: Vec<Fragment>,
        cap: usize,
    },
}

impl Default for FragmentVec {
    fn default() -> Self {
        FragmentVec::Inline {
            frags: [Fragment::EMPTY; INLINE_FRAGMENTS],
            len: 0,
        }
    }
}

impl FragmentVec {
    fn as_slice(&self) -> &[Fragment] {
        match self {
            FragmentVec::Inline { frags, len } => &frags[..*len],
            FragmentVec::Heap { frags, .. } => frags,
        }
    }

    fn capacity(&self) -> usize {
        match self {
            FragmentVec::Inline { .. } => INLINE_FRAGMENTS,
            FragmentVec::Heap { cap, .. } => *cap,
        }
    }

    fn is_inline(&self) -> bool {
        matches!(self, FragmentVec::Inline { .. })
    }

    fn grown_capacity(&self) -> usize {
        match self {
            FragmentVec::Inline { .. } => MIN_HEAP_FRAGMENTS,
            FragmentVec::Heap { cap, .. } => *cap * 2,
        }
    }

    fn push(&mut self, frag: Fragment) {
        match self {
            FragmentVec::Inline { frags, len } if *len < INLINE_FRAGMENTS => {
                frags[*len] = frag;
                *len += 1;
            }
            FragmentVec::Heap { frags, cap } if frags.len() < *cap => frags.push(frag),
            _ => {
                let cap = self.grown_capacity();
                let mut frags = Vec::with_capacity(cap);
                frags.extend_from_slice(self.as_slice());
                frags.push(frag);
                *self = FragmentVec::Heap { frags, cap };
            }
        }
    }

    fn push_front(&mut self, frag: Fragment) {
        match self {
            FragmentVec::Inline { frags, len } if *len < INLINE_FRAGMENTS => {
                frags.copy_within(0..*len, 1);
                frags[0] = frag;
                *len += 1;
            }
            FragmentVec::Heap { frags, cap } if frags.len() < *cap => frags.insert(0, frag),
            _ => {
                // New array is laid out with the slot for `frag` already open
                let cap = self.grown_capacity();
                let mut frags = Vec::with_capacity(cap);
                frags.push(frag);
                frags.extend_from_slice(self.as_slice());
                *self = FragmentVec::Heap { frags, cap };
            }
        }
    }
}

/// Descriptor of one I/O operation.
#[derive(Default)]
pub struct Request {
    file_id: FileId,
    offset: u64,
    size: usize,
    access: Access,
    priority: Priority,
    fragments: FragmentVec,
    /// Holders of this request inside an engine
    refcnt: AtomicU32,
    compute: Option<ComputeRef>,
    sink: Option<Arc<dyn CompletionSink>>,
    scratch: Option<Vec<u8>>,
    status: IoStatus,
    completed: usize,
    tag: u64,
    next: Option<Box<Request>>,
}

impl Request {
    /// Request without buffers. The I/O path supplies the memory, which
    /// is how computation requests are issued.
    pub fn new(file_id: FileId, offset: u64, size: usize, access: Access) -> Self {
        Request {
            file_id,
            offset,
            size,
            access,
            ..Default::default()
        }
    }

    /// Single-buffer request covering `buf.len()` bytes.
    pub fn with_buffer(file_id: FileId, offset: u64, buf: Fragment, access: Access) -> Self {
        let mut req = Request::new(file_id, offset, buf.len(), access);
        req.append_fragment(buf);
        req
    }

    /// Scatter/gather request; its size is the sum of the fragments.
    pub fn with_fragments(file_id: FileId, offset: u64, frags: &[Fragment], access: Access) -> Self {
        let mut req = Request::new(file_id, offset, 0, access);
        for frag in frags {
            req.append_fragment(*frag);
        }
        req.size = req.fragment_bytes();
        req
    }

    #[inline]
    pub fn file_id(&self) -> FileId {
        self.file_id
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn extent(&self) -> Extent {
        Extent::new(self.offset, self.size)
    }

    #[inline]
    pub fn access(&self) -> Access {
        self.access
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    /// Add a buffer after the existing ones.
    ///
    /// # Panics
    ///
    /// On a zero-length fragment.
    pub fn append_fragment(&mut self, frag: Fragment) {
        assert!(!frag.is_empty(), "zero-sized fragment");
        self.fragments.push(frag);
    }

    /// Add a buffer before the existing ones; indices stay contiguous.
    ///
    /// # Panics
    ///
    /// On a zero-length fragment.
    pub fn prepend_fragment(&mut self, frag: Fragment) {
        assert!(!frag.is_empty(), "zero-sized fragment");
        self.fragments.push_front(frag);
    }

    #[inline]
    pub fn fragments(&self) -> &[Fragment] {
        self.fragments.as_slice()
    }

    #[inline]
    pub fn num_fragments(&self) -> usize {
        self.fragments.as_slice().len()
    }

    #[inline]
    pub fn fragment_capacity(&self) -> usize {
        self.fragments.capacity()
    }

    /// True while the fragments live in the request's own array.
    #[inline]
    pub fn is_inline(&self) -> bool {
        self.fragments.is_inline()
    }

    pub fn fragment_bytes(&self) -> usize {
        self.fragments().iter().map(Fragment::len).sum()
    }

    /// Move `other` into `self`, leaving `other` empty and inline-backed.
    ///
    /// Heap fragment arrays change owner without copying.
    pub fn assign(&mut self, other: &mut Request) {
        *self = std::mem::take(other);
    }

    /// Move the request out, leaving an empty one behind.
    #[inline]
    pub fn take(&mut self) -> Request {
        std::mem::take(self)
    }

    #[inline]
    pub fn compute(&self) -> Option<&ComputeRef> {
        self.compute.as_ref()
    }

    pub fn set_compute(&mut self, compute: Option<ComputeRef>) {
        self.compute = compute;
    }

    pub fn take_compute(&mut self) -> Option<ComputeRef> {
        self.compute.take()
    }

    #[inline]
    pub fn sink(&self) -> Option<&Arc<dyn CompletionSink>> {
        self.sink.as_ref()
    }

    pub fn set_sink(&mut self, sink: Arc<dyn CompletionSink>) {
        self.sink = Some(sink);
    }

    pub fn take_sink(&mut self) -> Option<Arc<dyn CompletionSink>> {
        self.sink.take()
    }

    /// Give a buffer-less request an owned buffer of `size()` bytes.
    ///
    /// No-op if the request already has fragments or is empty.
    pub fn attach_scratch(&mut self) {
        if self.num_fragments() > 0 || self.size == 0 {
            return;
        }
        let mut buf = vec![0u8; self.size];
        // Safety: the Vec's heap block does not move with the Vec, and
        // the request owns it for as long as the fragment exists
        let frag = unsafe { Fragment::from_slice(&mut buf) };
        self.scratch = Some(buf);
        self.append_fragment(frag);
    }

    pub fn scratch(&self) -> Option<&[u8]> {
        self.scratch.as_deref()
    }

    #[inline]
    pub fn status(&self) -> IoStatus {
        self.status
    }

    pub fn set_status(&mut self, status: IoStatus) {
        if let IoStatus::Done(n) = status {
            self.completed = n;
        }
        self.status = status;
    }

    /// Bytes transferred so far; less than `size()` after a short read.
    #[inline]
    pub fn completed_bytes(&self) -> usize {
        self.completed
    }

    #[inline]
    pub fn is_partial(&self) -> bool {
        self.status == IoStatus::Done(self.completed) && self.completed < self.size
    }

    /// Caller-defined label carried through completion
    #[inline]
    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn set_tag(&mut self, tag: u64) {
        self.tag = tag;
    }

    #[inline]
    pub fn inc_ref(&self) {
        self.refcnt.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the remaining count.
    #[inline]
    pub fn dec_ref(&self) -> u32 {
        let prev = self.refcnt.fetch_sub(1, Ordering::AcqRel);
        assert!(prev > 0, "request reference count underflow");
        prev - 1
    }

    #[inline]
    pub fn ref_count(&self) -> u32 {
        self.refcnt.load(Ordering::Acquire)
    }

    /// Link `next` after this request, replacing any existing tail.
    pub fn set_next(&mut self, next: Request) {
        self.next = Some(Box::new(next));
    }

    pub fn take_next(&mut self) -> Option<Request> {
        self.next.take().map(|b| *b)
    }

    /// Number of requests in the chain starting here
    pub fn chain_len(&self) -> usize {
        let mut n = 1;
        let mut cur = self.next.as_deref();
        while let Some(r) = cur {
            n += 1;
            cur = r.next.as_deref();
        }
        n
    }

    /// Build a chain from `reqs`, preserving order.
    pub fn chain(reqs: Vec<Request>) -> Option<Request> {
        let mut head: Option<Request> = None;
        for mut req in reqs.into_iter().rev() {
            if let Some(h) = head.take() {
                req.set_next(h);
            }
            head = Some(req);
        }
        head
    }

    /// Break a chain back into a list, preserving order.
    pub fn unchain(head: Request) -> Vec<Request> {
        let mut out = Vec::with_capacity(head.chain_len());
        let mut cur = Some(head);
        while let Some(mut req) = cur {
            cur = req.take_next();
            out.push(req);
        }
        out
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("file_id", &self.file_id)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("access", &self.access)
            .field("priority", &self.priority)
            .field("fragments", &self.num_fragments())
            .field("compute", &self.compute.is_some())
            .field("status", &self.status)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frag_at(buf: &mut [u8], i: usize) -> Fragment {
        unsafe { Fragment::from_slice(&mut buf[i..i + 1]) }
    }

    #[test]
    fn test_overflow_reallocates_once_and_assign_resets_source() {
        let mut buf = vec![0u8; 64];
        let frags: Vec<_> = (0..=INLINE_FRAGMENTS).map(|i| frag_at(&mut buf, i)).collect();

        let mut req = Request::new(FileId(1), 0, INLINE_FRAGMENTS + 1, Access::Read);
        for frag in &frags[..INLINE_FRAGMENTS] {
            req.append_fragment(*frag);
        }
        assert!(req.is_inline());
        assert_eq!(req.fragment_capacity(), INLINE_FRAGMENTS);

        req.append_fragment(frags[INLINE_FRAGMENTS]);
        assert!(!req.is_inline());
        assert_eq!(req.fragment_capacity(), MIN_HEAP_FRAGMENTS);
        assert_eq!(req.fragments(), &frags[..]);

        let mut other = Request::default();
        other.assign(&mut req);
        assert_eq!(other.fragments(), &frags[..]);
        assert_eq!(other.size(), INLINE_FRAGMENTS + 1);
        assert_eq!(req.num_fragments(), 0);
        assert!(req.is_inline());
        assert_eq!(req.fragment_capacity(), INLINE_FRAGMENTS);
    }

    #[test]
    fn test_heap_growth_doubles() {
        let mut buf = vec![0u8; 64];
        let mut req = Request::default();
        for i in 0..MIN_HEAP_FRAGMENTS {
            req.append_fragment(frag_at(&mut buf, i));
        }
        assert_eq!(req.fragment_capacity(), MIN_HEAP_FRAGMENTS);
        req.append_fragment(frag_at(&mut buf, MIN_HEAP_FRAGMENTS));
        assert_eq!(req.fragment_capacity(), MIN_HEAP_FRAGMENTS * 2);
        assert_eq!(req.num_fragments(), MIN_HEAP_FRAGMENTS + 1);
    }

    #[test]
    fn test_prepend_keeps_order() {
        let mut buf = vec![0u8; 64];
        let mut req = Request::default();
        // inline shift, then the overflow path
        for i in (0..=INLINE_FRAGMENTS).rev() {
            req.prepend_fragment(frag_at(&mut buf, i));
        }
        assert!(!req.is_inline());
        let bases: Vec<_> = req.fragments().iter().map(|f| f.base()).collect();
        let want: Vec<_> = (0..=INLINE_FRAGMENTS).map(|i| frag_at(&mut buf, i).base()).collect();
        assert_eq!(bases, want);

        req.prepend_fragment(frag_at(&mut buf, 40));
        assert_eq!(req.fragments()[0].base(), frag_at(&mut buf, 40).base());
        assert_eq!(req.fragments()[1].base(), want[0]);
    }

    #[test]
    #[should_panic(expected = "zero-sized fragment")]
    fn test_zero_fragment_rejected() {
        let mut buf = vec![0u8; 4];
        let mut req = Request::default();
        req.append_fragment(unsafe { Fragment::from_slice(&mut buf[..0]) });
    }

    #[test]
    fn test_with_fragments_sums_size() {
        let mut a = vec![0u8; 10];
        let mut b = vec![0u8; 22];
        let req = Request::with_fragments(
            FileId(0),
            4096,
            &[unsafe { Fragment::from_slice(&mut a) }, unsafe { Fragment::from_slice(&mut b) }],
            Access::Write,
        );
        assert_eq!(req.size(), 32);
        assert_eq!(req.extent().end(), 4096 + 32);
    }

    #[test]
    fn test_fragment_writes_land_in_caller_buffer() {
        let mut buf = vec![0u8; 16];
        let req = Request::with_buffer(FileId(1), 0, unsafe { Fragment::from_slice(&mut buf[4..12]) }, Access::Read);
        assert_eq!(req.size(), 8);
        let moved = req;
        for frag in moved.fragments() {
            // Safety: `buf` outlives `moved` and is not touched meanwhile
            unsafe { frag.as_mut_slice() }.fill(0xab);
        }
        drop(moved);
        assert_eq!(&buf[..4], &[0; 4]);
        assert_eq!(&buf[4..12], &[0xab; 8]);
        assert_eq!(&buf[12..], &[0; 4]);
    }

    #[test]
    fn test_scratch_survives_moves() {
        let mut req = Request::new(FileId(2), 0, 8, Access::Read);
        req.attach_scratch();
        assert_eq!(req.num_fragments(), 1);
        let moved = req.take();
        let frag = moved.fragments()[0];
        unsafe { frag.as_mut_slice().copy_from_slice(b"abcdefgh") };
        assert_eq!(moved.scratch(), Some(&b"abcdefgh"[..]));
    }

    #[test]
    fn test_status_tracks_partial() {
        let mut req = Request::new(FileId(0), 0, 100, Access::Read);
        req.set_status(IoStatus::Done(60));
        assert_eq!(req.completed_bytes(), 60);
        assert!(req.is_partial());
        req.set_status(IoStatus::Done(100));
        assert!(!req.is_partial());
    }

    #[test]
    fn test_chain_round_trip_order() {
        let reqs: Vec<_> = (0..5u64)
            .map(|i| {
                let mut r = Request::new(FileId(0), i * 4096, 4096, Access::Read);
                r.set_tag(i);
                r
            })
            .collect();
        let head = Request::chain(reqs).unwrap();
        assert_eq!(head.chain_len(), 5);
        let tags: Vec<_> = Request::unchain(head).iter().map(Request::tag).collect();
        assert_eq!(tags, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_request_refcount() {
        let req = Request::default();
        req.inc_ref();
        req.inc_ref();
        assert_eq!(req.dec_ref(), 1);
        assert_eq!(req.dec_ref(), 0);
        assert_eq!(req.ref_count(), 0);
    }
}
