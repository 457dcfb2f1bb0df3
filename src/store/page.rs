//! # Page Files
//!
//! A `Page` is one memory-mapped file functioning as an append-only bump
//! allocator of variable-sized buffers. Write-sets that overflow the
//! in-memory ring buffer land here; the page never reuses freed space, it is
//! reclaimed whole once its last buffer has been discarded.
//!
//! ## Page Layout
//!
//! ```text
//! +--------------------------+
//! | BufferHeader (24 bytes)  |  <- offset 0
//! | payload                  |
//! +--------------------------+
//! | BufferHeader             |
//! | payload                  |
//! +--------------------------+
//! | zeroed sentinel header   |  <- bump cursor (`next`)
//! +--------------------------+
//! | free space               |
//! +--------------------------+
//! ```
//!
//! Buffers are laid out back to back in allocation order. The zeroed header
//! at the cursor lets a walker hop through the page by `size` and stop
//! safely; it is replanted after every cursor move that leaves room for it.
//!
//! ## Live-Buffer Counting
//!
//! `used` counts buffers that have not reached the terminal released +
//! `SEQNO_ILL` state. Freeing a buffer only marks its header; the bytes are
//! recovered when the whole page is reclaimed, which requires `used == 0`.
//! The count therefore doubles as a reference count proving that no header
//! back-references into the page remain.
//!
//! ## Fatal Conditions
//!
//! Resetting a page that still has live buffers, discarding a buffer that
//! was never released, and allocation sizes outside the representable range
//! are programmer errors. They panic with a diagnostic rather than returning
//! an error.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};
use tracing::{debug, info};
use zerocopy::IntoBytes;

use super::header::{BufferHeader, BUFFER_HEADER_SIZE, MAX_ALLOC_SIZE, SEQNO_ILL};
use super::mmap::{MapFactory, PageMap};

/// Outcome of an in-page reallocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Realloc {
    /// The buffer kept its offset (tail resized in place, or an interior
    /// buffer that cannot move).
    InPlace,
    /// The buffer moved to a new payload offset within the same page.
    Moved(usize),
    /// The page cannot satisfy the request; the caller must allocate
    /// elsewhere and copy.
    NoSpace,
}

pub struct Page {
    path: PathBuf,
    file: File,
    map: Box<dyn PageMap>,
    id: u64,
    next: usize,
    space: usize,
    size: usize,
    used: usize,
    min_space: usize,
    debug: u32,
}

fn assert_alloc_size(size: usize) {
    assert!(
        (BUFFER_HEADER_SIZE..=MAX_ALLOC_SIZE).contains(&size),
        "allocation size {} outside [{}, {}]",
        size,
        BUFFER_HEADER_SIZE,
        MAX_ALLOC_SIZE
    );
}

impl Page {
    /// Creates the backing file, truncates it to `size` bytes, maps it and
    /// plants the initial sentinel.
    pub fn create(
        path: &Path,
        size: usize,
        id: u64,
        debug: u32,
        factory: &dyn MapFactory,
    ) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create page file '{}'", path.display()))?;

        file.set_len(size as u64)
            .wrap_err_with(|| format!("failed to size page file '{}' to {} bytes", path.display(), size))?;

        let mut map = factory.create(&file, size)?;
        let size = map.len();

        BufferHeader::clear(map.bytes_mut(), 0);

        info!("created page '{}' of size {} bytes", path.display(), size);

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            id,
            next: 0,
            space: size,
            size,
            used: 0,
            min_space: size,
            debug,
        })
    }

    /// Bump-allocates `size` bytes (header included). Returns the payload
    /// offset, or `None` when the page cannot fit the buffer.
    pub fn malloc(&mut self, size: usize) -> Option<usize> {
        assert_alloc_size(size);

        if size <= self.space {
            let offset = self.next;
            let header = BufferHeader::new_in_page(size as u32, self.id);
            self.map.bytes_mut()[offset..offset + BUFFER_HEADER_SIZE]
                .copy_from_slice(header.as_bytes());

            self.space -= size;
            self.next += size;
            self.used += 1;

            if self.min_space > self.space {
                self.min_space = self.space;
            }

            if self.space >= BUFFER_HEADER_SIZE {
                BufferHeader::clear(self.map.bytes_mut(), self.next);
            }

            debug_assert!(self.next <= self.size);

            if self.debug != 0 {
                debug!(
                    "page '{}' allocd off: {}, size: {}",
                    self.path.display(),
                    offset,
                    size
                );
            }

            Some(offset + BUFFER_HEADER_SIZE)
        } else {
            debug!(
                "failed to allocate {} bytes, space left: {} bytes, total allocated: {}",
                size, self.space, self.next
            );
            None
        }
    }

    /// Resizes the buffer whose payload starts at `payload`.
    ///
    /// The tail buffer can shrink freely and grow into the remaining space.
    /// An interior buffer can only grow by relocation within the page; for
    /// non-growing requests it is locked in place.
    pub fn realloc(&mut self, payload: usize, new_size: usize) -> Realloc {
        assert_alloc_size(new_size);

        let header_offset = payload - BUFFER_HEADER_SIZE;
        let old_size = self.header_at(header_offset).size() as usize;

        if header_offset + old_size == self.next {
            // Tail buffer: shrink and extend move the cursor itself.
            let diff = new_size as isize - old_size as isize;

            if diff < 0 || (diff as usize) < self.space {
                self.header_at_mut(header_offset).set_size(new_size as u32);
                self.space = (self.space as isize - diff) as usize;
                self.next = (self.next as isize + diff) as usize;

                if self.min_space > self.space {
                    self.min_space = self.space;
                }

                if self.space >= BUFFER_HEADER_SIZE {
                    BufferHeader::clear(self.map.bytes_mut(), self.next);
                }

                debug_assert!(self.next <= self.size);

                Realloc::InPlace
            } else {
                Realloc::NoSpace
            }
        } else if new_size > old_size {
            match self.malloc(new_size) {
                Some(new_payload) => {
                    let payload_len = old_size - BUFFER_HEADER_SIZE;
                    self.map
                        .bytes_mut()
                        .copy_within(payload..payload + payload_len, new_payload);

                    // The old header is abandoned in place; it stops counting
                    // once the caller discards it, so drop it from `used` now.
                    debug_assert!(self.used > 0);
                    self.used -= 1;

                    Realloc::Moved(new_payload)
                }
                None => Realloc::NoSpace,
            }
        } else {
            // Interior buffers cannot shrink, the buffer is locked in place.
            Realloc::InPlace
        }
    }

    /// Marks the buffer released. Space is recovered only by whole-page
    /// reclamation; `used` drops in [`Page::discard`].
    pub fn free(&mut self, payload: usize) {
        let header = self.header_at_mut(payload - BUFFER_HEADER_SIZE);
        debug_assert!(!header.is_released());
        header.mark_released();
    }

    /// Drops a released, `SEQNO_ILL` buffer from the live count. Returns the
    /// remaining count so the store can trigger cleanup at zero.
    pub fn discard(&mut self, payload: usize) -> usize {
        let header = self.header_at(payload - BUFFER_HEADER_SIZE);

        assert!(
            header.is_released(),
            "discard of non-released buffer at offset {} in page '{}'",
            payload,
            self.path.display()
        );
        assert_eq!(
            header.seqno(),
            SEQNO_ILL,
            "discard of buffer with live seqno at offset {} in page '{}'",
            payload,
            self.path.display()
        );
        assert!(
            self.used > 0,
            "discard on empty page '{}'",
            self.path.display()
        );

        self.used -= 1;
        self.used
    }

    pub fn seqno(&self, payload: usize) -> i64 {
        self.header_at(payload - BUFFER_HEADER_SIZE).seqno()
    }

    pub fn set_seqno(&mut self, payload: usize, seqno: i64) {
        self.header_at_mut(payload - BUFFER_HEADER_SIZE)
            .set_seqno(seqno);
    }

    pub fn is_released(&self, payload: usize) -> bool {
        self.header_at(payload - BUFFER_HEADER_SIZE).is_released()
    }

    /// Payload bytes of the buffer starting at `payload`.
    pub fn payload(&self, payload: usize) -> &[u8] {
        let len = self.header_at(payload - BUFFER_HEADER_SIZE).size() as usize - BUFFER_HEADER_SIZE;
        &self.map.bytes()[payload..payload + len]
    }

    pub fn payload_mut(&mut self, payload: usize) -> &mut [u8] {
        let len = self.header_at(payload - BUFFER_HEADER_SIZE).size() as usize - BUFFER_HEADER_SIZE;
        &mut self.map.bytes_mut()[payload..payload + len]
    }

    /// Rejuvenates an empty page: full space, cursor back at the base,
    /// sentinel replanted.
    ///
    /// Calling this with live buffers is a programmer error and panics.
    pub fn reset(&mut self) {
        assert!(
            self.used == 0,
            "attempt to reset page '{}' used by {} buffers",
            self.path.display(),
            self.used
        );

        self.space = self.size;
        self.next = 0;
        BufferHeader::clear(self.map.bytes_mut(), 0);
    }

    /// Advises the kernel to drop cached pages backing this file, both
    /// through the mapping and through the file descriptor.
    pub fn drop_fs_cache(&self) {
        self.map.dont_need();

        #[cfg(target_os = "linux")]
        {
            use std::os::unix::io::AsRawFd;

            // SAFETY: posix_fadvise is advisory and cannot invalidate any
            // memory. This is safe because:
            // 1. The descriptor is owned by this page and open for its lifetime
            // 2. The range covers exactly the file this page created
            let err = unsafe {
                libc::posix_fadvise(
                    self.file.as_raw_fd(),
                    0,
                    self.size as libc::off_t,
                    libc::POSIX_FADV_DONTNEED,
                )
            };
            if err != 0 {
                tracing::warn!(
                    "failed to set POSIX_FADV_DONTNEED on '{}': {}",
                    self.path.display(),
                    std::io::Error::from_raw_os_error(err)
                );
            }
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn space(&self) -> usize {
        self.space
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn next_offset(&self) -> usize {
        self.next
    }

    /// Whether anything has been allocated since creation or the last reset.
    pub fn has_allocations(&self) -> bool {
        self.next > 0
    }

    /// Deepest fill of the page so far, for pool sizing metrics.
    pub fn allocated_pool_size(&self) -> usize {
        self.size - self.min_space
    }

    pub fn set_debug(&mut self, debug: u32) {
        self.debug = debug;
    }

    fn header_at(&self, offset: usize) -> &BufferHeader {
        BufferHeader::read(self.map.bytes(), offset)
    }

    fn header_at_mut(&mut self, offset: usize) -> &mut BufferHeader {
        BufferHeader::read_mut(self.map.bytes_mut(), offset)
    }
}

impl fmt::Display for Page {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page file: {}, size: {}, used: {}",
            self.path.display(),
            self.size,
            self.used
        )?;

        if self.used > 0 && self.debug > 0 {
            let mut was_released = true;
            let mut offset = 0;

            while offset != self.next {
                let header = self.header_at(offset);
                if header.is_sentinel() {
                    break;
                }
                let next_offset = offset + header.size() as usize;

                if !header.is_released() {
                    write!(
                        f,
                        "\noff: {}, size: {}, seqno: {}, flags: {:#06x}",
                        offset,
                        header.size(),
                        header.seqno(),
                        header.flags()
                    )?;
                    was_released = false;
                } else {
                    if !was_released && next_offset != self.next {
                        write!(f, "\n...")?;
                    }
                    was_released = true;
                }

                offset = next_offset;
            }
        }

        Ok(())
    }
}
