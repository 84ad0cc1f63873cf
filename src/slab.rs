//! Raw memory slabs backing the off-heap allocator.
//!
//! A slab is one contiguous anonymous mapping obtained at allocator startup
//! and carved into chunks on demand. Two backing strategies:
//!
//! 1. **Anonymous pages** (`Slab::allocate`): plain `mmap(MAP_ANONYMOUS)`.
//!
//! 2. **Huge pages** (`Slab::allocate_hugepages`): `mmap(MAP_HUGETLB)`.
//!    Much cheaper TLB behavior for large regions but requires
//!    pre-configured huge pages:
//!    ```bash
//!    # Reserve huge pages (size from /proc/meminfo, typically 2MB)
//!    sudo sh -c 'echo 8192 > /proc/sys/vm/nr_hugepages'
//!    ```
//!
//! # Safety
//!
//! The memory returned is:
//! - Valid for the lifetime of the `Slab` struct
//! - Automatically unmapped on drop
//!
//! Callers never touch slab memory directly; all reads and writes go
//! through chunk handles handed out by the allocator.

use std::io;
use std::ptr::NonNull;
use std::sync::OnceLock;

use tracing::warn;

use crate::error::{OffHeapError, Result};

/// Cached huge page size from /proc/meminfo
static HUGE_PAGE_SIZE: OnceLock<Option<usize>> = OnceLock::new();

fn get_huge_page_size() -> Option<usize> {
    *HUGE_PAGE_SIZE.get_or_init(read_hugepage_size_from_proc)
}

/// Parse Hugepagesize from /proc/meminfo (in kB, convert to bytes)
fn read_hugepage_size_from_proc() -> Option<usize> {
    let content = std::fs::read_to_string("/proc/meminfo").ok()?;
    for line in content.lines() {
        // Format: "Hugepagesize:       2048 kB"
        if line.starts_with("Hugepagesize:") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() == 3 && parts[2] == "kB" {
                let kb: usize = parts[1].parse().ok()?;
                return Some(kb * 1024);
            }
        }
    }
    None
}

/// Get the system's default huge page size in bytes.
///
/// Reads from `/proc/meminfo` on first call, then caches the result.
/// Returns `None` if the system doesn't support huge pages or
/// `/proc/meminfo` is unavailable.
pub fn huge_page_size() -> Option<usize> {
    get_huge_page_size()
}

/// Backing strategy for a slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabBacking {
    /// Regular anonymous pages
    Anonymous,
    /// Huge pages (size from /proc/meminfo, requires system configuration)
    HugePages,
}

/// One contiguous raw memory region owned by the allocator.
///
/// Immutable once created; unmapped when dropped.
pub struct Slab {
    ptr: NonNull<u8>,
    size: usize,
    backing: SlabBacking,
}

impl std::fmt::Debug for Slab {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Slab")
            .field("ptr", &format!("{:p}", self.ptr.as_ptr()))
            .field("size", &self.size)
            .field("backing", &self.backing)
            .finish()
    }
}

// SAFETY: Slab owns an anonymous mapping that is:
// - Fixed for the lifetime of this struct
// - Only ever read/written through chunk handles whose lifecycle the
//   allocator serializes
unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    /// Map a slab with regular anonymous pages.
    ///
    /// # Errors
    ///
    /// Returns an error if `size` is zero or mmap fails.
    pub fn allocate(size: usize) -> Result<Self> {
        Self::allocate_internal(size, SlabBacking::Anonymous)
    }

    /// Map a slab backed by huge pages.
    ///
    /// `size` is rounded up to the system huge page size.
    ///
    /// # Errors
    ///
    /// Returns `MmapFailed` if huge pages are not configured or
    /// insufficient, `HugePageSizeUnavailable` if the page size cannot be
    /// determined.
    pub fn allocate_hugepages(size: usize) -> Result<Self> {
        Self::allocate_internal(size, SlabBacking::HugePages)
    }

    fn allocate_internal(size: usize, backing: SlabBacking) -> Result<Self> {
        if size == 0 {
            return Err(OffHeapError::ZeroSizeSlab);
        }

        let (flags, aligned) = match backing {
            SlabBacking::Anonymous => (libc::MAP_PRIVATE | libc::MAP_ANONYMOUS, size),
            SlabBacking::HugePages => {
                let huge_page_size =
                    get_huge_page_size().ok_or(OffHeapError::HugePageSizeUnavailable)?;
                let aligned = (size + huge_page_size - 1) & !(huge_page_size - 1);
                (
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
                    aligned,
                )
            }
        };

        // SAFETY: mmap with MAP_ANONYMOUS creates a new anonymous mapping.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                aligned,
                libc::PROT_READ | libc::PROT_WRITE,
                flags,
                -1,
                0,
            )
        };

        if ptr == libc::MAP_FAILED {
            return Err(OffHeapError::MmapFailed(io::Error::last_os_error()));
        }

        // SAFETY: mapping succeeded and returned a non-null pointer
        let ptr = NonNull::new(ptr as *mut u8).expect("mmap returned null");

        Ok(Self {
            ptr,
            size: aligned,
            backing,
        })
    }

    /// Base address of the slab.
    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub(crate) fn base(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Size of the mapping in bytes.
    ///
    /// This is the aligned size, which may be larger than the requested
    /// size for huge-page slabs.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Backing strategy used for this slab.
    #[inline]
    pub fn backing(&self) -> SlabBacking {
        self.backing
    }
}

impl Drop for Slab {
    fn drop(&mut self) {
        // SAFETY: ptr was allocated by mmap with the same size
        unsafe {
            if libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size) == -1 {
                let err = io::Error::last_os_error();
                warn!(size = self.size, "munmap failed: {}", err);
            }
        }
    }
}
