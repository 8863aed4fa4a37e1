//! Extent allocator: hands out contiguous `PageSpan`s, classifies
//! allocations as `Metadata` or `FileData`, and defers reuse of freed
//! data pages until the commit that recorded their freeing is durable.
//! All state lives behind one mutex (`parking_lot::Mutex`).

use std::collections::BTreeMap;

use parking_lot::Mutex;

use crate::ids::{PageId, PageSpan};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentOwner {
    Metadata,
    FileData,
}

struct AllocatorState {
    metadata_free: BTreeMap<u64, PageSpan>,
    data_free: BTreeMap<u64, PageSpan>,
    staged_data: Vec<PageSpan>,
    metadata_tail: u64,
    data_tail: u64,
}

impl AllocatorState {
    fn new() -> Self {
        Self {
            metadata_free: BTreeMap::new(),
            data_free: BTreeMap::new(),
            staged_data: Vec::new(),
            metadata_tail: 2,
            data_tail: 2,
        }
    }

    fn total_pages(&self) -> u64 {
        self.metadata_tail.max(self.data_tail)
    }
}

pub struct Allocator {
    state: Mutex<AllocatorState>,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(AllocatorState::new()),
        }
    }

    /// Reserve a span for `owner`. Metadata requests are first-fit from
    /// the metadata free list, then first-fit from `data_free` (released
    /// data pages are reusable for metadata once durably freed); failing
    /// both (or for any `FileData` request), the span is carved from
    /// growth at the top of the corresponding region. Returns the span
    /// and the new high-water page (the caller must ensure the backing
    /// container reaches `high_water * pageSize` bytes before using the
    /// span).
    pub fn reserve(&self, owner: ExtentOwner, pages: u32) -> (PageSpan, PageId) {
        assert!(pages >= 1);
        let mut state = self.state.lock();
        match owner {
            ExtentOwner::Metadata => {
                if let Some(span) = take_first_fit(&mut state.metadata_free, pages) {
                    let high_water = state.total_pages();
                    return (span, PageId(high_water));
                }
                if let Some(span) = take_first_fit(&mut state.data_free, pages) {
                    let high_water = state.total_pages();
                    return (span, PageId(high_water));
                }
                let start = state.metadata_tail.max(state.data_tail).max(2);
                let span = PageSpan::new(PageId(start), pages);
                state.metadata_tail = start + pages as u64;
                let high_water = state.total_pages();
                (span, PageId(high_water))
            }
            ExtentOwner::FileData => {
                let start = state.data_tail.max(2);
                let span = PageSpan::new(PageId(start), pages);
                state.data_tail = start + pages as u64;
                let high_water = state.total_pages();
                (span, PageId(high_water))
            }
        }
    }

    /// Free a span. Metadata frees go straight into the free list
    /// (coalesced with abutting neighbors); data frees are staged and
    /// stay ineligible for reuse until `release_staged_data` is called.
    pub fn free(&self, owner: ExtentOwner, span: PageSpan) {
        let mut state = self.state.lock();
        match owner {
            ExtentOwner::Metadata => insert_coalesced(&mut state.metadata_free, span),
            ExtentOwner::FileData => state.staged_data.push(span),
        }
    }

    /// Publish every span staged since the last call into `data_free`.
    /// Must only be called by the metadata persistence layer immediately
    /// after a superblock commit durably records the frees: pages freed
    /// from file data are never handed back out until the commit that
    /// recorded their freeing is itself durable.
    pub fn release_staged_data(&self) {
        let mut state = self.state.lock();
        let staged = std::mem::take(&mut state.staged_data);
        for span in staged {
            insert_coalesced(&mut state.data_free, span);
        }
    }

    pub fn staged_count(&self) -> usize {
        self.state.lock().staged_data.len()
    }

    pub fn total_pages(&self) -> u64 {
        self.state.lock().total_pages()
    }

    pub fn metadata_tail(&self) -> u64 {
        self.state.lock().metadata_tail
    }

    pub fn data_tail(&self) -> u64 {
        self.state.lock().data_tail
    }

    /// Remove `span` from both free lists and advance `metadata_tail`
    /// past it. Used while rehydrating persistence spans at mount time,
    /// before the free lists are otherwise populated.
    pub fn mark_metadata_range(&self, span: PageSpan) {
        let mut state = self.state.lock();
        remove_overlap(&mut state.metadata_free, span);
        remove_overlap(&mut state.data_free, span);
        state.metadata_tail = state.metadata_tail.max(span.end().0);
    }

    /// Rebuild free lists from the set of pages currently owned by some
    /// file or metadata table. Gaps between used spans, starting from
    /// page 2, become `dataFree` ranges; `dataTail`/`metadataTail`
    /// become the maximum observed end.
    pub fn rebuild(&self, mut used: Vec<PageSpan>) {
        used.sort_by_key(|s| s.start.0);
        let mut state = self.state.lock();
        state.metadata_free.clear();
        state.data_free.clear();
        state.staged_data.clear();

        let mut cursor: u64 = 2;
        let mut max_end: u64 = 2;
        for span in &used {
            if span.start.0 > cursor {
                let gap = PageSpan::new(PageId(cursor), (span.start.0 - cursor) as u32);
                insert_coalesced(&mut state.data_free, gap);
            }
            cursor = cursor.max(span.end().0);
            max_end = max_end.max(span.end().0);
        }
        state.metadata_tail = max_end;
        state.data_tail = max_end;
    }
}

fn take_first_fit(free: &mut BTreeMap<u64, PageSpan>, pages: u32) -> Option<PageSpan> {
    let key = free
        .iter()
        .find(|(_, span)| span.length >= pages)
        .map(|(k, _)| *k)?;
    let span = free.remove(&key).unwrap();
    if span.length > pages {
        let remainder = PageSpan::new(PageId(span.start.0 + pages as u64), span.length - pages);
        free.insert(remainder.start.0, remainder);
    }
    Some(PageSpan::new(span.start, pages))
}

fn insert_coalesced(free: &mut BTreeMap<u64, PageSpan>, span: PageSpan) {
    let mut merged = span;

    // merge with a left neighbor whose end touches merged.start
    if let Some((&left_key, &left_span)) = free.range(..merged.start.0).next_back() {
        if left_span.end() == merged.start {
            free.remove(&left_key);
            merged = PageSpan::new(left_span.start, left_span.length + merged.length);
        }
    }
    // merge with a right neighbor whose start touches merged.end
    if let Some((&right_key, &right_span)) = free.range(merged.end().0..).next() {
        if merged.end() == right_span.start {
            free.remove(&right_key);
            merged = PageSpan::new(merged.start, merged.length + right_span.length);
        }
    }
    free.insert(merged.start.0, merged);
}

fn remove_overlap(free: &mut BTreeMap<u64, PageSpan>, span: PageSpan) {
    let overlapping: Vec<u64> = free
        .iter()
        .filter(|(_, s)| s.overlaps(&span))
        .map(|(k, _)| *k)
        .collect();
    for key in overlapping {
        free.remove(&key);
    }
}

/// RAII reservation handle giving transactional semantics to a pending
/// allocation. If `commit()` is not called before the handle drops, the
/// span is freed back automatically.
pub struct Reservation<'a> {
    allocator: &'a Allocator,
    owner: ExtentOwner,
    span: Option<PageSpan>,
}

impl<'a> Reservation<'a> {
    pub fn new(allocator: &'a Allocator, owner: ExtentOwner, span: PageSpan) -> Self {
        Self {
            allocator,
            owner,
            span: Some(span),
        }
    }

    pub fn span(&self) -> PageSpan {
        self.span.expect("reservation already committed")
    }

    /// Finalize the reservation: the span is now owned by the caller and
    /// will not be freed on drop.
    pub fn commit(mut self) -> PageSpan {
        self.span.take().expect("reservation already committed")
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if let Some(span) = self.span.take() {
            self.allocator.free(self.owner, span);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_reserve_reuses_freed_span() {
        let alloc = Allocator::new();
        let (span_a, _) = alloc.reserve(ExtentOwner::Metadata, 4);
        alloc.free(ExtentOwner::Metadata, span_a);
        let (span_b, _) = alloc.reserve(ExtentOwner::Metadata, 2);
        assert_eq!(span_b.start, span_a.start);
    }

    #[test]
    fn data_never_reuses_until_released() {
        let alloc = Allocator::new();
        let (span_a, _) = alloc.reserve(ExtentOwner::FileData, 4);
        alloc.free(ExtentOwner::FileData, span_a);
        let (span_b, _) = alloc.reserve(ExtentOwner::FileData, 4);
        assert!(span_b.start.0 >= span_a.end().0);
        assert_eq!(alloc.staged_count(), 1);
        alloc.release_staged_data();
        assert_eq!(alloc.staged_count(), 0);
    }

    #[test]
    fn reservation_drop_frees_span() {
        let alloc = Allocator::new();
        let (span, _) = alloc.reserve(ExtentOwner::Metadata, 3);
        {
            let _r = Reservation::new(&alloc, ExtentOwner::Metadata, span);
        }
        let (span2, _) = alloc.reserve(ExtentOwner::Metadata, 3);
        assert_eq!(span2.start, span.start);
    }

    #[test]
    fn reservation_commit_keeps_span_allocated() {
        let alloc = Allocator::new();
        let (span, _) = alloc.reserve(ExtentOwner::Metadata, 3);
        let r = Reservation::new(&alloc, ExtentOwner::Metadata, span);
        let committed = r.commit();
        assert_eq!(committed, span);
        let (span2, _) = alloc.reserve(ExtentOwner::Metadata, 3);
        assert!(span2.start.0 >= span.end().0);
    }

    #[test]
    fn rebuild_finds_gaps_as_data_free() {
        let alloc = Allocator::new();
        let used = vec![PageSpan::new(PageId(2), 2), PageSpan::new(PageId(6), 2)];
        alloc.rebuild(used);
        assert_eq!(alloc.total_pages(), 8);
        // new data allocations still grow past the tail; the gap itself is
        // exercised by `metadata_reuses_data_free_gap` below.
        let (span, _) = alloc.reserve(ExtentOwner::FileData, 1);
        assert_eq!(span.start.0, 8);
    }

    #[test]
    fn metadata_reuses_data_free_gap() {
        let alloc = Allocator::new();
        let used = vec![PageSpan::new(PageId(2), 2), PageSpan::new(PageId(6), 2)];
        alloc.rebuild(used);
        // the gap [4,6) sits in data_free; a metadata reservation that fits
        // must be satisfied from it rather than growing metadata_tail.
        let (span, _) = alloc.reserve(ExtentOwner::Metadata, 2);
        assert_eq!(span.start.0, 4);
        assert_eq!(span.length, 2);
    }

    #[test]
    fn coalesces_adjacent_frees() {
        let alloc = Allocator::new();
        let (a, _) = alloc.reserve(ExtentOwner::Metadata, 2);
        let (b, _) = alloc.reserve(ExtentOwner::Metadata, 2);
        assert!(a.is_contiguous_with(&b));
        alloc.free(ExtentOwner::Metadata, a);
        alloc.free(ExtentOwner::Metadata, b);
        let (merged, _) = alloc.reserve(ExtentOwner::Metadata, 4);
        assert_eq!(merged.start, a.start);
    }
}
