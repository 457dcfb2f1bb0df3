//! # Page Mappings
//!
//! A page owns exactly one memory mapping over its backing file. The mapping
//! is produced by a [`MapFactory`], the seam behind which the enclosing
//! engine may install transparent encryption: the page store only ever sees
//! the [`PageMap`] byte view and never interprets the on-disk representation.
//!
//! ## Safety Model
//!
//! A `PageMap` is never remapped or resized: the backing file is truncated to
//! its final size before the mapping is created, and the mapping lives as
//! long as the owning page. All access goes through `bytes()`/`bytes_mut()`,
//! so the borrow checker ties every slice to the page that produced it.
//!
//! ## Kernel Cache Pressure
//!
//! Page files are written once and read rarely (only when a lagging peer
//! requests old write-sets), so the store periodically advises the kernel to
//! drop their cached pages. `dont_need` is strictly advisory: failures are
//! logged and ignored.

use std::fs::File;

use eyre::{Result, WrapErr};
use memmap2::MmapMut;

/// Byte-level view over one page file.
pub trait PageMap: Send {
    fn bytes(&self) -> &[u8];
    fn bytes_mut(&mut self) -> &mut [u8];
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Advise the kernel to drop cached pages backing this mapping.
    fn dont_need(&self);
}

/// Creates the mapping for a newly truncated page file.
///
/// The engine installs an encrypting factory here when the cache is
/// configured with encryption; the plain factory is the default.
pub trait MapFactory: Send + Sync {
    fn create(&self, file: &File, len: usize) -> Result<Box<dyn PageMap>>;
}

/// Unencrypted mapping over the raw file contents. Only ever handed out as
/// a `Box<dyn PageMap>` by [`PlainMapFactory`].
pub(crate) struct PlainMap {
    mmap: MmapMut,
}

impl PageMap for PlainMap {
    fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    fn len(&self) -> usize {
        self.mmap.len()
    }

    fn dont_need(&self) {
        #[cfg(unix)]
        {
            // SAFETY: madvise with MADV_DONTNEED on a shared file mapping only
            // drops the kernel's cached copies. This is safe because:
            // 1. The pointer and length describe exactly this mapping
            // 2. The mapping is file-backed, so dropped pages reload from disk
            // 3. The call is advisory and does not invalidate the mapping
            let err = unsafe {
                libc::madvise(
                    self.mmap.as_ptr() as *mut libc::c_void,
                    self.mmap.len(),
                    libc::MADV_DONTNEED,
                )
            };
            if err != 0 {
                tracing::warn!(
                    "failed to advise MADV_DONTNEED on page mapping: {}",
                    std::io::Error::last_os_error()
                );
            }
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct PlainMapFactory;

impl MapFactory for PlainMapFactory {
    fn create(&self, file: &File, len: usize) -> Result<Box<dyn PageMap>> {
        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The page file was just created and truncated by this process
        // 2. Page files are private to the cache and not shared with others
        // 3. The mapping lifetime is tied to the owning Page, which also owns
        //    the file handle
        let mmap = unsafe { MmapMut::map_mut(file).wrap_err("failed to memory-map page file")? };

        debug_assert_eq!(mmap.len(), len);

        Ok(Box::new(PlainMap { mmap }))
    }
}
