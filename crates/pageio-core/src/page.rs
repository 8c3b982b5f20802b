//! Pages and byte-array views
//!
//! A computation is resumed with a `PageByteArray`: a read-only view of
//! exactly the bytes it asked for. The in-memory path builds the view
//! over its pinned pages, the disk path over the request's own buffer.
//! Both look the same to the computation.

use std::ptr::NonNull;

use crate::constants::PAGE_SIZE;

/// Page number, i.e. byte offset / `PAGE_SIZE`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct PageId(pub u64);

impl PageId {
    #[inline]
    pub fn of_offset(offset: u64) -> Self {
        PageId(offset / PAGE_SIZE as u64)
    }

    #[inline]
    pub fn offset(self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }
}

/// Byte range `[offset, offset + size)` of a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Extent {
    pub offset: u64,
    pub size: usize,
}

impl Extent {
    #[inline]
    pub fn new(offset: u64, size: usize) -> Self {
        Extent { offset, size }
    }

    #[inline]
    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    #[inline]
    pub fn first_page(&self) -> PageId {
        PageId::of_offset(self.offset)
    }

    /// Pages touched by the range; 0 for an empty range.
    pub fn num_pages(&self) -> usize {
        if self.size == 0 {
            return 0;
        }
        let in_page = (self.offset % PAGE_SIZE as u64) as usize;
        (in_page + self.size).div_ceil(PAGE_SIZE)
    }

    /// The part of this range below `limit`.
    pub fn clamp_to(&self, limit: u64) -> Extent {
        if self.offset >= limit {
            return Extent::new(self.offset, 0);
        }
        Extent::new(self.offset, (limit - self.offset).min(self.size as u64) as usize)
    }
}

/// One resident page.
pub struct Page {
    id: PageId,
    data: NonNull<u8>,
}

// Safety: pages are read-only once published
unsafe impl Send for Page {}
unsafe impl Sync for Page {}

impl Page {
    /// # Safety
    ///
    /// `data` must stay valid and unmodified for `PAGE_SIZE` bytes for
    /// as long as the page exists.
    pub unsafe fn from_raw(id: PageId, data: NonNull<u8>) -> Self {
        Page { id, data }
    }

    #[inline]
    pub fn id(&self) -> PageId {
        self.id
    }

    #[inline]
    pub fn offset(&self) -> u64 {
        self.id.offset()
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: guaranteed by `from_raw`
        unsafe { std::slice::from_raw_parts(self.data.as_ptr(), PAGE_SIZE) }
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page").field("id", &self.id).finish()
    }
}

/// Read-only view of a requested byte range, split into chunks.
///
/// # Implementors
///
/// - `PagesByteArray` - in-memory image, one chunk per page touched
/// - `BufferByteArray` - contiguous buffer filled by the disk path
pub trait PageByteArray {
    /// File offset of the first byte
    fn offset(&self) -> u64;

    fn size(&self) -> usize;

    fn num_chunks(&self) -> usize;

    /// Bytes of chunk `idx`, in file order.
    fn chunk(&self, idx: usize) -> &[u8];

    fn offset_in_first_page(&self) -> usize {
        (self.offset() % PAGE_SIZE as u64) as usize
    }

    fn extent(&self) -> Extent {
        Extent::new(self.offset(), self.size())
    }

    /// Copy view bytes `[rel, rel + dst.len())` into `dst`; returns the
    /// count, which is short at the end of the view.
    fn copy_range(&self, rel: usize, dst: &mut [u8]) -> usize {
        let end = (rel + dst.len()).min(self.size());
        if rel >= end {
            return 0;
        }
        let mut pos = 0;
        for i in 0..self.num_chunks() {
            let c = self.chunk(i);
            let (c_start, c_end) = (pos, pos + c.len());
            if c_end > rel && c_start < end {
                let s = rel.max(c_start);
                let e = end.min(c_end);
                dst[s - rel..e - rel].copy_from_slice(&c[s - c_start..e - c_start]);
            }
            pos = c_end;
            if pos >= end {
                break;
            }
        }
        end - rel
    }

    fn copy_to(&self, dst: &mut [u8]) -> usize {
        self.copy_range(0, dst)
    }

    /// Like `copy_range` but addressed by file offset. Offsets before
    /// the view copy nothing.
    fn read_at(&self, offset: u64, dst: &mut [u8]) -> usize {
        match offset.checked_sub(self.offset()) {
            Some(rel) if rel < self.size() as u64 => self.copy_range(rel as usize, dst),
            _ => 0,
        }
    }
}

/// View over consecutive resident pages.
pub struct PagesByteArray<'a> {
    pages: &'a [Page],
    extent: Extent,
}

impl<'a> PagesByteArray<'a> {
    /// `pages[0]` must hold `extent.offset`.
    ///
    /// # Panics
    ///
    /// If `pages` is too short for the extent or starts at another page.
    pub fn new(pages: &'a [Page], extent: Extent) -> Self {
        assert!(pages.len() >= extent.num_pages(), "view needs {} pages", extent.num_pages());
        if let Some(first) = pages.first() {
            assert_eq!(first.id(), extent.first_page());
        }
        PagesByteArray { pages, extent }
    }
}

impl PageByteArray for PagesByteArray<'_> {
    fn offset(&self) -> u64 {
        self.extent.offset
    }

    fn size(&self) -> usize {
        self.extent.size
    }

    fn num_chunks(&self) -> usize {
        self.extent.num_pages()
    }

    fn chunk(&self, idx: usize) -> &[u8] {
        let in_page = self.offset_in_first_page();
        let (start, before) = if idx == 0 {
            (in_page, 0)
        } else {
            (0, PAGE_SIZE - in_page + (idx - 1) * PAGE_SIZE)
        };
        let len = (PAGE_SIZE - start).min(self.extent.size - before);
        &self.pages[idx].as_slice()[start..start + len]
    }
}

/// View over one contiguous buffer.
pub struct BufferByteArray<'a> {
    offset: u64,
    data: &'a [u8],
}

impl<'a> BufferByteArray<'a> {
    pub fn new(offset: u64, data: &'a [u8]) -> Self {
        BufferByteArray { offset, data }
    }
}

impl PageByteArray for BufferByteArray<'_> {
    fn offset(&self) -> u64 {
        self.offset
    }

    fn size(&self) -> usize {
        self.data.len()
    }

    fn num_chunks(&self) -> usize {
        usize::from(!self.data.is_empty())
    }

    fn chunk(&self, idx: usize) -> &[u8] {
        assert_eq!(idx, 0, "buffer view has one chunk");
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pages_over(buf: &mut [u8]) -> Vec<Page> {
        buf.chunks_exact_mut(PAGE_SIZE)
            .enumerate()
            .map(|(i, p)| unsafe {
                Page::from_raw(PageId(i as u64), NonNull::new(p.as_mut_ptr()).unwrap())
            })
            .collect()
    }

    #[test]
    fn test_extent_pages() {
        assert_eq!(Extent::new(0, 0).num_pages(), 0);
        assert_eq!(Extent::new(0, PAGE_SIZE).num_pages(), 1);
        assert_eq!(Extent::new(PAGE_SIZE as u64 - 1, 2).num_pages(), 2);
        assert_eq!(Extent::new(10, 3 * PAGE_SIZE).num_pages(), 4);
        assert_eq!(Extent::new(100, 50).clamp_to(120), Extent::new(100, 20));
        assert_eq!(Extent::new(100, 50).clamp_to(90).size, 0);
    }

    #[test]
    fn test_view_across_pages() {
        let mut buf: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i % 251) as u8).collect();
        let expect = buf.clone();
        let pages = pages_over(&mut buf);

        let start = PAGE_SIZE - 8;
        let ext = Extent::new(start as u64, PAGE_SIZE + 16);
        let view = PagesByteArray::new(&pages[0..], ext);
        assert_eq!(view.num_chunks(), 3);
        assert_eq!(view.offset_in_first_page(), PAGE_SIZE - 8);
        assert_eq!(view.chunk(0).len(), 8);
        assert_eq!(view.chunk(1).len(), PAGE_SIZE);
        assert_eq!(view.chunk(2).len(), 8);

        let mut out = vec![0u8; ext.size];
        assert_eq!(view.copy_to(&mut out), ext.size);
        assert_eq!(&out[..], &expect[start..start + ext.size]);

        let mut mid = [0u8; 20];
        assert_eq!(view.copy_range(4, &mut mid), 20);
        assert_eq!(&mid[..], &expect[start + 4..start + 24]);

        let mut tail = [0u8; 32];
        assert_eq!(view.copy_range(ext.size - 5, &mut tail), 5);

        let mut at = [0u8; 4];
        assert_eq!(view.read_at(PAGE_SIZE as u64, &mut at), 4);
        assert_eq!(&at[..], &expect[PAGE_SIZE..PAGE_SIZE + 4]);
        assert_eq!(view.read_at(0, &mut at), 0);
    }

    #[test]
    fn test_view_starting_mid_image() {
        let mut buf: Vec<u8> = (0..3 * PAGE_SIZE).map(|i| (i / PAGE_SIZE) as u8).collect();
        let pages = pages_over(&mut buf);
        let ext = Extent::new(2 * PAGE_SIZE as u64 + 5, 10);
        let view = PagesByteArray::new(&pages[2..], ext);
        assert_eq!(view.chunk(0), &[2u8; 10][..]);
    }

    #[test]
    fn test_buffer_view() {
        let data = b"0123456789";
        let view = BufferByteArray::new(4100, data);
        assert_eq!(view.offset_in_first_page(), 4);
        assert_eq!(view.num_chunks(), 1);
        let mut out = [0u8; 4];
        view.copy_range(3, &mut out);
        assert_eq!(&out, b"3456");
        assert_eq!(BufferByteArray::new(0, &[]).num_chunks(), 0);
    }
}
