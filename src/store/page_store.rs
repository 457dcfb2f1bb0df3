//! # Page Store
//!
//! The store owns an ordered deque of [`Page`]s, oldest at the front, and a
//! *current* page servicing allocations at the back. `malloc` bumps into the
//! current page and opens a new page on overflow; releases are tracked per
//! page, and a page whose last buffer is discarded becomes a reclamation
//! candidate.
//!
//! ## Retention Policy
//!
//! Reclamation balances two independent budgets: `keep_size` (aggregate
//! bytes) and `keep_count` (number of pages). An empty page is retained only
//! while keeping it stays within **both** budgets; otherwise cleanup evicts
//! from the front until the store is back under budget or the front page is
//! not reclaimable (live buffers, or the current page with allocations).
//!
//! A page that empties is reset on the spot: retained empties carry a fresh
//! cursor, so they absorb future overflow at full capacity without reopening
//! a file.
//!
//! ## Asynchronous Deletion
//!
//! Evicting a page tears down its mapping and file handle synchronously,
//! then hands the path to a detached worker thread for the `unlink`. Unlink
//! failures are logged and ignored; nothing waits on the worker. Evictions
//! are rare relative to allocations, so the workers need no queue or
//! back-pressure.
//!
//! ## Concurrency Contract
//!
//! The store performs no internal locking. All operations run under the
//! enclosing cache coordinator's lock, which serializes allocation; the only
//! concurrency the store creates is the fire-and-forget unlink worker, which
//! owns nothing but the evicted file's path.

use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use eyre::Result;
use tracing::{info, warn};

use crate::config::{ParamUpdate, Params};

use super::header::{BUFFER_HEADER_SIZE, SEQNO_ILL, SEQNO_NONE};
use super::mmap::MapFactory;
use super::page::{Page, Realloc};

/// Page file name prefix inside the cache directory; the suffix is the
/// store's creation counter, zero-padded.
pub const PAGE_FILE_PREFIX: &str = "wscache.page.";

/// Identifies one allocated buffer: the owning page's id plus the payload
/// offset inside it. The safe rendering of a raw pointer into the mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    page: u64,
    offset: usize,
}

impl BufferHandle {
    pub fn page_id(&self) -> u64 {
        self.page
    }

    /// Payload offset within the owning page.
    pub fn offset(&self) -> usize {
        self.offset
    }
}

pub struct PageStore {
    dir: PathBuf,
    keep_size: usize,
    page_size: usize,
    keep_count: usize,
    count: u64,
    pages: VecDeque<Page>,
    current: Option<u64>,
    total_size: usize,
    debug: u32,
    factory: Arc<dyn MapFactory>,
}

impl PageStore {
    /// Debug bit assigned to the page store in the cache-wide debug mask.
    pub const DEBUG: u32 = 4;

    pub fn new(
        dir: impl Into<PathBuf>,
        page_size: usize,
        keep_size: usize,
        keep_count: usize,
        debug: u32,
        factory: Arc<dyn MapFactory>,
    ) -> Self {
        Self {
            dir: dir.into(),
            keep_size,
            page_size,
            keep_count,
            count: 0,
            pages: VecDeque::new(),
            current: None,
            total_size: 0,
            debug: debug & Self::DEBUG,
            factory,
        }
    }

    /// Builds a store from the resolved cache parameters.
    pub fn open(params: &Params, factory: Arc<dyn MapFactory>) -> Self {
        Self::new(
            params.dir(),
            params.page_size(),
            params.keep_pages_size(),
            params.keep_pages_count(),
            params.debug(),
            factory,
        )
    }

    /// Allocates `size` bytes (header included) from the current page,
    /// opening a new page on overflow.
    ///
    /// Only page creation can fail; the store is unchanged in that case.
    pub fn malloc(&mut self, size: usize) -> Result<BufferHandle> {
        if self.current.is_some() {
            // INVARIANT: current always refers to the back page
            if let Some(page) = self.pages.back_mut() {
                if let Some(offset) = page.malloc(size) {
                    return Ok(BufferHandle {
                        page: page.id(),
                        offset,
                    });
                }
            }
        }

        self.malloc_new(size)
    }

    fn malloc_new(&mut self, size: usize) -> Result<BufferHandle> {
        let page_size = self.page_size.max(size + BUFFER_HEADER_SIZE);
        let path = self.page_file_path(self.count);
        let page = Page::create(&path, page_size, self.count, self.debug, self.factory.as_ref())?;

        self.count += 1;
        self.total_size += page.size();
        self.current = Some(page.id());
        self.pages.push_back(page);

        // INVARIANT: the page was just pushed
        let page = self.pages.back_mut().unwrap();
        match page.malloc(size) {
            Some(offset) => Ok(BufferHandle {
                page: page.id(),
                offset,
            }),
            None => unreachable!(
                "fresh page of {} bytes failed to fit a {} byte buffer",
                page_size, size
            ),
        }
    }

    /// Resizes a buffer, relocating it to a fresh allocation (possibly in a
    /// new page) when the owning page cannot satisfy the request in place.
    pub fn realloc(&mut self, handle: BufferHandle, new_size: usize) -> Result<BufferHandle> {
        let ix = self.page_ix(handle.page);

        match self.pages[ix].realloc(handle.offset, new_size) {
            Realloc::InPlace => Ok(handle),
            Realloc::Moved(offset) => Ok(BufferHandle {
                page: handle.page,
                offset,
            }),
            Realloc::NoSpace => {
                let data = self.pages[ix].payload(handle.offset).to_vec();

                let new_handle = self.malloc(new_size)?;
                self.buffer_mut(new_handle)[..data.len()].copy_from_slice(&data);

                let ix = self.page_ix(handle.page);
                let page = &mut self.pages[ix];
                page.free(handle.offset);
                page.set_seqno(handle.offset, SEQNO_ILL);
                if page.discard(handle.offset) == 0 {
                    self.page_emptied(ix);
                }

                Ok(new_handle)
            }
        }
    }

    /// Marks the buffer released. A buffer that was never ordered (seqno
    /// still unassigned) has no consumer left and is discarded on the spot.
    pub fn free(&mut self, handle: BufferHandle) {
        let ix = self.page_ix(handle.page);
        let page = &mut self.pages[ix];

        page.free(handle.offset);

        if page.seqno(handle.offset) == SEQNO_NONE {
            page.set_seqno(handle.offset, SEQNO_ILL);
            if page.discard(handle.offset) == 0 {
                self.page_emptied(ix);
            }
        }
    }

    /// Drops a released buffer from its page's live count and reclaims the
    /// page once it empties. Discarding a non-released buffer is a
    /// programmer error and panics.
    pub fn discard(&mut self, handle: BufferHandle) {
        let ix = self.page_ix(handle.page);
        let page = &mut self.pages[ix];

        assert!(
            page.is_released(handle.offset),
            "discard of non-released buffer {:?}",
            handle
        );

        page.set_seqno(handle.offset, SEQNO_ILL);
        if page.discard(handle.offset) == 0 {
            self.page_emptied(ix);
        }
    }

    /// Assigns the global ordering number to a buffer.
    pub fn set_seqno(&mut self, handle: BufferHandle, seqno: i64) {
        let ix = self.page_ix(handle.page);
        self.pages[ix].set_seqno(handle.offset, seqno);
    }

    pub fn seqno(&self, handle: BufferHandle) -> i64 {
        let ix = self.page_ix(handle.page);
        self.pages[ix].seqno(handle.offset)
    }

    pub fn buffer(&self, handle: BufferHandle) -> &[u8] {
        let ix = self.page_ix(handle.page);
        self.pages[ix].payload(handle.offset)
    }

    pub fn buffer_mut(&mut self, handle: BufferHandle) -> &mut [u8] {
        let ix = self.page_ix(handle.page);
        self.pages[ix].payload_mut(handle.offset)
    }

    pub fn set_page_size(&mut self, size: usize) {
        self.page_size = size;
        self.cleanup();
    }

    pub fn set_keep_size(&mut self, size: usize) {
        self.keep_size = size;
        self.cleanup();
    }

    pub fn set_keep_count(&mut self, count: usize) {
        self.keep_count = count;
        self.cleanup();
    }

    pub fn set_debug(&mut self, debug: u32) {
        self.debug = debug & Self::DEBUG;
        for page in &mut self.pages {
            page.set_debug(self.debug);
        }
    }

    /// Applies a runtime parameter update under the coordinator's lock.
    pub fn apply(&mut self, update: ParamUpdate) {
        match update {
            ParamUpdate::PageSize(size) => self.set_page_size(size),
            ParamUpdate::KeepPagesSize(size) => self.set_keep_size(size),
            ParamUpdate::KeepPagesCount(count) => self.set_keep_count(count),
            ParamUpdate::Debug(debug) => self.set_debug(debug),
        }
    }

    /// Startup/recovery rejuvenation: evicts every empty page regardless of
    /// the retention budgets, stopping at the first page that still has live
    /// buffers.
    pub fn reset(&mut self) {
        while self.pages.front().is_some_and(|page| page.used() == 0) {
            // INVARIANT: front checked above
            let page = self.pages.pop_front().unwrap();
            self.evict(page);
        }
    }

    /// A page just dropped to zero live buffers: rejuvenate it so a retained
    /// empty absorbs future allocations at full capacity, then let the
    /// retention budgets decide whether it stays at all.
    fn page_emptied(&mut self, ix: usize) {
        self.pages[ix].reset();
        self.cleanup();
    }

    fn over_budget(&self) -> bool {
        self.total_size > self.keep_size || self.pages.len() > self.keep_count
    }

    /// Evicts reclaimable front pages until the retention budgets are met.
    fn cleanup(&mut self) {
        while !self.pages.is_empty() && self.over_budget() && self.delete_page() {}
    }

    /// Attempts to evict the front (oldest) page. Refuses when the page has
    /// live buffers, or when it is the current page and something has been
    /// allocated against it since it became current.
    fn delete_page(&mut self) -> bool {
        let Some(front) = self.pages.front() else {
            return false;
        };

        if front.used() > 0 {
            return false;
        }

        if self.current == Some(front.id()) && front.has_allocations() {
            return false;
        }

        // INVARIANT: front existence checked above
        let page = self.pages.pop_front().unwrap();
        self.evict(page);
        true
    }

    fn evict(&mut self, page: Page) {
        self.total_size -= page.size();
        if self.current == Some(page.id()) {
            self.current = None;
        }

        info!("deleting page '{}'", page.path().display());

        page.drop_fs_cache();

        let path = page.path().to_path_buf();
        // The mapping and descriptor go down with the page; the worker owns
        // only the path.
        drop(page);

        thread::spawn(move || {
            if let Err(err) = std::fs::remove_file(&path) {
                warn!("failed to unlink page '{}': {}", path.display(), err);
            }
        });
    }

    fn page_file_path(&self, count: u64) -> PathBuf {
        self.dir.join(format!("{}{:06}", PAGE_FILE_PREFIX, count))
    }

    fn page_ix(&self, id: u64) -> usize {
        self.pages
            .iter()
            .position(|page| page.id() == id)
            .unwrap_or_else(|| panic!("buffer handle references unknown page {}", id))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /* for unit tests and metrics */

    /// Pages created over the store's lifetime.
    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn total_pages(&self) -> usize {
        self.pages.len()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn allocated_pool_size(&self) -> usize {
        self.pages.iter().map(Page::allocated_pool_size).sum()
    }

    pub fn pages(&self) -> impl Iterator<Item = &Page> {
        self.pages.iter()
    }
}

impl fmt::Display for PageStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page store: pages: {}, total size: {}",
            self.pages.len(),
            self.total_size
        )?;
        for page in &self.pages {
            write!(f, "\n{}", page)?;
        }
        Ok(())
    }
}

impl Drop for PageStore {
    fn drop(&mut self) {
        self.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::mmap::PlainMapFactory;
    use tempfile::TempDir;

    fn new_store(page_size: usize, keep_size: usize, keep_count: usize) -> (TempDir, PageStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = PageStore::new(
            dir.path(),
            page_size,
            keep_size,
            keep_count,
            0,
            Arc::new(PlainMapFactory),
        );
        (dir, store)
    }

    fn discard(store: &mut PageStore, handle: BufferHandle) {
        store.free(handle);
        store.discard(handle);
    }

    #[test]
    fn malloc_routes_to_current_page() {
        let (_dir, mut store) = new_store(4096, 0, 0);

        let h1 = store.malloc(100).unwrap();
        let h2 = store.malloc(200).unwrap();

        assert_eq!(h1.page_id(), h2.page_id());
        assert_eq!(store.total_pages(), 1);
        assert_eq!(store.count(), 1);
    }

    #[test]
    fn page_files_are_numbered_from_the_creation_counter() {
        let (dir, mut store) = new_store(256, usize::MAX, 64);

        store.malloc(200).unwrap();
        store.malloc(200).unwrap();

        assert!(dir.path().join("wscache.page.000000").exists());
        assert!(dir.path().join("wscache.page.000001").exists());
    }

    #[test]
    fn overflow_opens_a_page_sized_for_the_request() {
        let (_dir, mut store) = new_store(256, 0, 0);

        store.malloc(200).unwrap();
        let big = store.malloc(1000).unwrap();

        assert_eq!(store.total_pages(), 2);
        // The second page had to grow beyond the configured page size.
        let page = store.pages().find(|p| p.id() == big.page_id()).unwrap();
        assert_eq!(page.size(), 1000 + BUFFER_HEADER_SIZE);
    }

    #[test]
    fn total_size_matches_page_sizes() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        store.malloc(200).unwrap();
        store.malloc(200).unwrap();
        store.malloc(200).unwrap();

        assert_eq!(
            store.total_size(),
            store.pages().map(|p| p.size()).sum::<usize>()
        );
    }

    #[test]
    fn handles_back_reference_their_page() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        let h1 = store.malloc(200).unwrap();
        let h2 = store.malloc(200).unwrap();

        assert!(store.pages().any(|p| p.id() == h1.page_id()));
        assert!(store.pages().any(|p| p.id() == h2.page_id()));
        assert_ne!(h1.page_id(), h2.page_id());
    }

    #[test]
    fn payload_roundtrips_through_the_mapping() {
        let (_dir, mut store) = new_store(4096, 0, 0);

        let h = store.malloc(100).unwrap();
        store.buffer_mut(h).copy_from_slice(&[0x42; 100 - BUFFER_HEADER_SIZE]);

        assert_eq!(store.buffer(h).len(), 100 - BUFFER_HEADER_SIZE);
        assert!(store.buffer(h).iter().all(|&b| b == 0x42));
    }

    #[test]
    fn page_creation_failure_leaves_the_store_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no_such_subdir");
        let mut store = PageStore::new(&missing, 4096, 0, 0, 0, Arc::new(PlainMapFactory));

        assert!(store.malloc(100).is_err());
        assert_eq!(store.total_pages(), 0);
        assert_eq!(store.total_size(), 0);
        assert_eq!(store.count(), 0);

        // Nothing was half-created: the store works once the directory does.
        std::fs::create_dir(&missing).unwrap();
        let h = store.malloc(100).unwrap();
        assert_eq!(h.page_id(), 0);
        assert_eq!(store.total_pages(), 1);
    }

    #[test]
    fn free_of_unassigned_buffer_discards_immediately() {
        let (_dir, mut store) = new_store(4096, 0, 0);

        let h = store.malloc(100).unwrap();
        store.free(h);

        // Never ordered, so the page emptied and was evicted right away.
        assert_eq!(store.total_pages(), 0);
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn free_of_ordered_buffer_waits_for_discard() {
        let (_dir, mut store) = new_store(4096, 0, 0);

        let h = store.malloc(100).unwrap();
        store.set_seqno(h, 17);
        store.free(h);

        assert_eq!(store.total_pages(), 1);

        store.discard(h);
        assert_eq!(store.total_pages(), 0);
    }

    #[test]
    fn realloc_spills_to_a_new_page_and_preserves_payload() {
        let (_dir, mut store) = new_store(256, 0, 0);

        let h = store.malloc(200).unwrap();
        store.buffer_mut(h).fill(0x7c);
        store.malloc(32).unwrap(); // pin the page so it survives the spill

        let moved = store.realloc(h, 600).unwrap();
        assert_ne!(moved.page_id(), h.page_id());
        assert!(store.buffer(moved)[..200 - BUFFER_HEADER_SIZE]
            .iter()
            .all(|&b| b == 0x7c));
        assert_eq!(store.total_pages(), 2);
    }

    #[test]
    fn realloc_spill_of_last_buffer_reclaims_the_old_page() {
        let (_dir, mut store) = new_store(256, 0, 0);

        let h = store.malloc(200).unwrap();
        let moved = store.realloc(h, 600).unwrap();

        assert_ne!(moved.page_id(), h.page_id());
        // The old page emptied when the spilled buffer was discarded.
        assert_eq!(store.total_pages(), 1);
    }

    #[test]
    fn cleanup_stops_at_a_live_front_page() {
        let (_dir, mut store) = new_store(256, 0, 0);

        let pinned = store.malloc(200).unwrap();
        store.set_seqno(pinned, 1);
        let second = store.malloc(200).unwrap();
        store.set_seqno(second, 2);
        store.free(second);
        store.discard(second);

        // The empty page is behind a live one; eviction is front-only.
        assert_eq!(store.total_pages(), 2);
    }

    #[test]
    fn retained_empty_absorbs_allocations_at_full_capacity() {
        let (_dir, mut store) = new_store(4096, usize::MAX, 1);

        let h = store.malloc(3000).unwrap();
        store.set_seqno(h, 1);
        store.free(h);
        store.discard(h);

        // Within budget: the emptied page is kept, rejuvenated.
        assert_eq!(store.total_pages(), 1);

        let h2 = store.malloc(3000).unwrap();
        assert_eq!(h2.page_id(), h.page_id());
        assert_eq!(h2.offset(), h.offset());
    }

    #[test]
    fn shrinking_keep_count_evicts_retained_empties() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        let mut handles = Vec::new();
        for seqno in 1..=3 {
            let h = store.malloc(200).unwrap();
            store.set_seqno(h, seqno);
            handles.push(h);
        }
        for h in handles {
            store.free(h);
            store.discard(h);
        }
        assert_eq!(store.total_pages(), 3);

        store.set_keep_count(1);
        assert_eq!(store.total_pages(), 1);
    }

    #[test]
    fn shrinking_keep_size_evicts_retained_empties() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        let h1 = store.malloc(200).unwrap();
        store.set_seqno(h1, 1);
        let h2 = store.malloc(200).unwrap();
        store.set_seqno(h2, 2);
        discard(&mut store, h1);
        discard(&mut store, h2);
        assert_eq!(store.total_pages(), 2);

        store.set_keep_size(0);
        assert_eq!(store.total_pages(), 0);
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn reset_clears_retained_pages() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        let h1 = store.malloc(200).unwrap();
        store.set_seqno(h1, 1);
        let h2 = store.malloc(200).unwrap();
        store.set_seqno(h2, 2);
        discard(&mut store, h1);
        discard(&mut store, h2);
        assert_eq!(store.total_pages(), 2);

        store.reset();
        assert_eq!(store.total_pages(), 0);
        assert_eq!(store.total_size(), 0);
    }

    #[test]
    fn reset_stops_at_a_page_with_live_buffers() {
        let (_dir, mut store) = new_store(256, 0, 0);

        let live = store.malloc(200).unwrap();
        store.set_seqno(live, 1);
        store.malloc(200).unwrap();

        store.reset();
        assert_eq!(store.total_pages(), 2);
        let _ = live;
    }

    #[test]
    #[should_panic(expected = "discard of non-released buffer")]
    fn discard_without_free_panics() {
        let (_dir, mut store) = new_store(4096, 0, 0);
        let h = store.malloc(100).unwrap();
        store.discard(h);
    }

    #[test]
    fn store_dump_lists_pages() {
        let (_dir, mut store) = new_store(256, usize::MAX, 64);

        store.malloc(200).unwrap();
        store.malloc(200).unwrap();

        let dump = format!("{}", store);
        assert!(dump.contains("pages: 2"));
        assert!(dump.contains("wscache.page.000000"));
        assert!(dump.contains("wscache.page.000001"));
    }
}
