//! OS memory operations. All heap sections are demand-zero anonymous
//! mappings; the nursery additionally requires its mapping to be aligned to
//! its own (power of two) size so that the in-nursery test is mask-and-compare.

use std::io::{Error, Result};

use crate::util::conversions;
use crate::util::Address;

/// Set a range of memory to 0.
pub fn zero(start: Address, len: usize) {
    set(start, 0, len);
}

/// Set a range of memory to the given value. Similar to memset.
pub fn set(start: Address, val: u8, len: usize) {
    unsafe {
        std::ptr::write_bytes(start.to_mut_ptr::<u8>(), val, len);
    }
}

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Demand-zero mmap of `size` bytes (page aligned up), readable and
        /// writable, at an address of the kernel's choosing.
        pub fn dzmmap(size: usize) -> Result<Address> {
            let size = conversions::raw_align_up(size, crate::util::constants::BYTES_IN_PAGE);
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            Ok(Address::from_mut_ptr(ptr))
        }

        /// Reserve `size` bytes without committing them (PROT_NONE). Used by
        /// the major backends to carve a contiguous region that grows by
        /// `commit`.
        pub fn mmap_reserve(size: usize) -> Result<Address> {
            let size = conversions::raw_align_up(size, crate::util::constants::BYTES_IN_PAGE);
            let ptr = unsafe {
                libc::mmap(
                    std::ptr::null_mut(),
                    size,
                    libc::PROT_NONE,
                    libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                    -1,
                    0,
                )
            };
            if ptr == libc::MAP_FAILED {
                return Err(Error::last_os_error());
            }
            Ok(Address::from_mut_ptr(ptr))
        }

        /// Commit a previously reserved range (make it readable/writable).
        pub fn commit(start: Address, size: usize) -> Result<()> {
            debug_assert!(conversions::is_page_aligned(start));
            let res = unsafe {
                libc::mprotect(
                    start.to_mut_ptr(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                )
            };
            if res != 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }

        /// Return a committed range to the OS without unmapping it.
        pub fn dontneed(start: Address, size: usize) {
            unsafe {
                libc::madvise(start.to_mut_ptr(), size, libc::MADV_DONTNEED);
            }
        }

        /// Unmap a memory region.
        pub fn munmap(start: Address, size: usize) -> Result<()> {
            let res = unsafe { libc::munmap(start.to_mut_ptr(), size) };
            if res != 0 {
                return Err(Error::last_os_error());
            }
            Ok(())
        }

        /// Demand-zero mmap of `size` bytes aligned to `align`. Maps
        /// `size + align`, trims the misaligned head and tail.
        pub fn dzmmap_aligned(size: usize, align: usize) -> Result<Address> {
            debug_assert!(align.is_power_of_two());
            debug_assert!(conversions::is_page_aligned(Address::from_usize(align)));
            let over = size + align;
            let raw = dzmmap(over)?;
            let start = raw.align_up(align);
            let head = start - raw;
            if head > 0 {
                munmap(raw, head)?;
            }
            let tail = align - head;
            if tail > 0 {
                munmap(start + size, tail)?;
            }
            Ok(start)
        }
    } else {
        compile_error!("gengc only supports unix-like platforms");
    }
}

/// Whether the given OS error indicates memory exhaustion.
pub fn is_mmap_oom(error: &Error) -> bool {
    matches!(error.raw_os_error(), Some(libc::ENOMEM))
}

/// Total physical memory, for default heap sizing.
pub fn get_system_total_memory() -> u64 {
    use sysinfo::{MemoryRefreshKind, RefreshKind, System};
    let sys = System::new_with_specifics(
        RefreshKind::nothing().with_memory(MemoryRefreshKind::nothing().with_ram()),
    );
    sys.total_memory()
}
