//! # Paged Overflow Storage
//!
//! This module implements the on-disk half of the write-set cache: a
//! sequence of memory-mapped page files absorbing the buffers that no longer
//! fit the in-memory ring buffer.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────┐
//! │        cache coordinator (external)       │
//! ├───────────────────────────────────────────┤
//! │                PageStore                  │
//! │   deque of pages, retention, eviction     │
//! ├─────────────┬─────────────┬───────────────┤
//! │   Page      │   Page      │  Page (curr)  │
//! │  bump alloc │  bump alloc │  bump alloc   │
//! ├─────────────┴─────────────┴───────────────┤
//! │      PageMap / MapFactory (mmap seam)     │
//! └───────────────────────────────────────────┘
//! ```
//!
//! Each page is an append-only bump allocator over one mapped file; the
//! store routes allocations to the newest page, opens a new page on
//! overflow, and reclaims whole pages once every buffer in them has been
//! discarded, subject to the `keep_size`/`keep_count` retention budgets.
//!
//! ## Buffer Identity
//!
//! Buffers are addressed by [`BufferHandle`] — owning page id plus payload
//! offset — and carry a fixed [`BufferHeader`] in-band before the payload.
//! The header format is shared with the peer in-memory allocators of the
//! enclosing cache; this crate always tags buffers [`STORE_PAGE`].
//!
//! ## Module Organization
//!
//! - `header`: the in-band buffer header and its flag/seqno constants
//! - `mmap`: the `PageMap` view and `MapFactory` creation seam
//! - `page`: a single page file (bump allocation, realloc, reset, dump)
//! - `page_store`: the page deque, retention policy and async deletion

mod header;
mod mmap;
mod page;
mod page_store;

pub use header::{
    BufferHeader, BUFFER_HEADER_SIZE, FLAG_RELEASED, FLAG_SKIPPED, MAX_ALLOC_SIZE, SEQNO_ILL,
    SEQNO_NONE, STORE_MEM, STORE_PAGE, STORE_RB,
};
pub use mmap::{MapFactory, PageMap, PlainMapFactory};
pub use page::{Page, Realloc};
pub use page_store::{BufferHandle, PageStore, PAGE_FILE_PREFIX};
