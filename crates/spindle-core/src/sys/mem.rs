//! Stack mappings.
//!
//! Threads whose caller did not supply a stack get one mapped here: a guard
//! region at the low end protected against all access, with the usable stack
//! above it. The mapping is torn down explicitly by whichever thread retires
//! the owning record, never by drop, because unmapping a stack out from under
//! a live thread is fatal.

use crate::error::{Error, Result};

use std::ptr;

/// One anonymous mapping holding a guard region and a thread stack.
#[derive(Debug)]
pub struct Mapping {
    base: usize,
    total: usize,
    guard: usize,
}

// The raw base travels between the creating and retiring threads inside a
// thread record; all hand-offs are ordered by the record's lifecycle word.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

impl Mapping {
    /// Lowest usable stack address, just above the guard region.
    #[must_use]
    pub fn stack_base(&self) -> *mut u8 {
        (self.base + self.guard) as *mut u8
    }

    /// Bytes of usable stack.
    #[must_use]
    pub fn stack_size(&self) -> usize {
        self.total - self.guard
    }

    /// Release the mapping.
    ///
    /// # Safety
    ///
    /// No thread may still be running on the contained stack.
    pub unsafe fn unmap(self) {
        // SAFETY: per the caller contract the region is dead, and base/total
        // describe exactly the range mmap returned.
        unsafe {
            libc::munmap(self.base as *mut libc::c_void, self.total);
        }
    }
}

/// Map `total` bytes with the low `guard` bytes protected.
///
/// Both sizes must already be page aligned.
pub fn map_stack(total: usize, guard: usize) -> Result<Mapping> {
    // SAFETY: anonymous private mapping with no address hint; the kernel
    // validates the length.
    let base = unsafe {
        libc::mmap(
            ptr::null_mut(),
            total,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
            -1,
            0,
        )
    };
    if base == libc::MAP_FAILED {
        return Err(Error::OutOfMemory);
    }
    if guard > 0 {
        // SAFETY: the guard range lies inside the mapping just created.
        let rc = unsafe { libc::mprotect(base, guard, libc::PROT_NONE) };
        if rc != 0 {
            // SAFETY: nothing runs on this stack yet.
            unsafe {
                libc::munmap(base, total);
            }
            return Err(Error::OutOfMemory);
        }
    }
    Ok(Mapping { base: base as usize, total, guard })
}

/// Round `size` up to the next multiple of `align`, a power of two.
#[must_use]
pub const fn align_up(size: usize, align: usize) -> usize {
    (size + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::host::page_size;

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(1, 4096), 4096);
        assert_eq!(align_up(4096, 4096), 4096);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(align_up(0, 16), 0);
    }

    #[test]
    fn mapped_stack_is_writable_above_guard() {
        let page = page_size();
        let mapping = map_stack(page * 8, page).unwrap();
        assert_eq!(mapping.stack_size(), page * 7);
        // SAFETY: stack_base points at the first writable byte.
        unsafe {
            mapping.stack_base().write(0xA5);
            assert_eq!(mapping.stack_base().read(), 0xA5);
            mapping.unmap();
        }
    }
}
