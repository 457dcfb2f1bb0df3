//! # wscache - Paged Overflow Store for a Replication Write-Set Cache
//!
//! A synchronous multi-master replication engine retains recently committed
//! write-sets so lagging peers can catch up without a full state transfer.
//! When the engine's in-memory ring buffer fills, overflow write-sets spill
//! to disk; this crate is the subsystem managing that spill: a deque of
//! memory-mapped page files, each an append-only bump allocator of
//! header-prefixed buffers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use wscache::config::Params;
//! use wscache::store::{PageStore, PlainMapFactory};
//!
//! let params = Params::new("/var/lib/engine")
//!     .with_page_size(1 << 20)
//!     .with_keep_pages_count(1);
//! let mut store = PageStore::open(&params, Arc::new(PlainMapFactory));
//!
//! let handle = store.malloc(write_set.len() + wscache::store::BUFFER_HEADER_SIZE)?;
//! store.buffer_mut(handle).copy_from_slice(&write_set);
//! store.set_seqno(handle, seqno);
//! // ... replication consumes the buffer ...
//! store.free(handle);
//! store.discard(handle);
//! ```
//!
//! ## Lifecycle
//!
//! A buffer is bump-allocated from the *current* page, ordered with a global
//! seqno, eventually released, and finally discarded. Pages never reclaim
//! individual buffers; a page whose live-buffer count reaches zero is
//! rejuvenated and either retained (within the `keep_pages_size` /
//! `keep_pages_count` budgets) or evicted, with the file unlinked on a
//! detached worker thread.
//!
//! ## Concurrency
//!
//! The store does no internal locking: the enclosing cache coordinator
//! serializes all calls under its own lock. The store must stay cheap under
//! that lock; the only blocking work is file creation/mapping on page
//! overflow.
//!
//! ## Module Overview
//!
//! - [`store`]: pages, the page store, headers, the mapping seam
//! - [`config`]: resolved parameters and runtime mutation with typed errors

pub mod config;
pub mod store;

pub use config::{ParamError, ParamUpdate, Params};
pub use store::{BufferHandle, MapFactory, PageMap, PageStore, PlainMapFactory};
