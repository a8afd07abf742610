//! Low-level abstraction for reserving, protecting, and releasing the
//! page-aligned blocks of virtual memory that back the allocator's blocks.
//!
//! The default build reserves a single anonymous mapping per block and
//! transitions it in place from `READ|WRITE` to `READ|EXECUTE` via
//! `region::protect`. Under the `selinux-fix` feature, some SELinux and
//! grsecurity policies refuse that in-place transition on a mapping that
//! was ever writable, so we instead keep two mappings of the same
//! physical pages: one `READ|WRITE` view used for writing, and one
//! `READ|EXECUTE` view whose pointer is handed back to the caller. The
//! pages are never simultaneously writable and executable *through the
//! same address*, which is enough to satisfy those policies.

use crate::page::page_size;
use log::trace;
use std::io;

#[cfg(not(feature = "selinux-fix"))]
mod imp {
    use super::page_size;
    use std::io;
    use std::ptr;

    /// A page-aligned anonymous mapping, reserved and committed as
    /// `READ|WRITE` up front so that later writes into it never fault.
    pub(super) struct Mapping {
        ptr: *mut u8,
        len: usize,
    }

    impl Mapping {
        pub(super) fn with_size(size: usize) -> io::Result<Self> {
            debug_assert_eq!(size % page_size(), 0);
            assert!(size > 0, "blocks are never zero-sized");

            #[cfg(unix)]
            let ptr = unsafe {
                let ptr = libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_PRIVATE | libc::MAP_ANON,
                    -1,
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                ptr as *mut u8
            };

            #[cfg(windows)]
            let ptr = unsafe {
                use windows_sys::Win32::System::Memory::{
                    VirtualAlloc, MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE,
                };
                let ptr = VirtualAlloc(ptr::null_mut(), size, MEM_RESERVE | MEM_COMMIT, PAGE_READWRITE);
                if ptr.is_null() {
                    return Err(io::Error::last_os_error());
                }
                ptr as *mut u8
            };

            Ok(Self { ptr, len: size })
        }

        pub(super) fn write_ptr(&self) -> *mut u8 {
            self.ptr
        }

        pub(super) fn exec_ptr(&self) -> *const u8 {
            self.ptr
        }

        pub(super) fn len(&self) -> usize {
            self.len
        }

        pub(super) fn make_executable(&self, start: usize, len: usize) -> io::Result<()> {
            if len == 0 {
                return Ok(());
            }
            debug_assert_eq!(start % page_size(), 0);
            debug_assert_eq!(len % page_size(), 0);
            assert!(start + len <= self.len);
            unsafe {
                region::protect(self.ptr.add(start), len, region::Protection::ReadExecute)
            }
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
        }
    }

    impl Drop for Mapping {
        #[cfg(unix)]
        fn drop(&mut self) {
            if self.len != 0 {
                let r = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
                assert_eq!(r, 0, "munmap failed: {}", io::Error::last_os_error());
            }
        }

        #[cfg(windows)]
        fn drop(&mut self) {
            if self.len != 0 {
                use windows_sys::Win32::System::Memory::{VirtualFree, MEM_RELEASE};
                let r = unsafe { VirtualFree(self.ptr as _, 0, MEM_RELEASE) };
                assert_ne!(r, 0, "VirtualFree failed: {}", io::Error::last_os_error());
            }
        }
    }
}

/// The `selinux-fix` mapping strategy: a writable and an executable view
/// of the same anonymous-file-backed pages. The writable view is a
/// `memmap2::MmapMut` (the crate this feature is named for); the
/// executable view is a second, independent mapping of the same file
/// opened `READ|EXEC`, since distinct virtual addresses for the two
/// permissions is the entire point of the workaround. Linux-only, since
/// the policies this works around (SELinux, grsecurity) are Linux
/// concepts.
#[cfg(feature = "selinux-fix")]
mod imp {
    use super::page_size;
    use memmap2::MmapMut;
    use std::fs::File;
    use std::io;
    use std::os::unix::io::{AsRawFd, FromRawFd};
    use std::ptr;

    fn anon_file(size: usize) -> io::Result<File> {
        let fd = unsafe { libc::memfd_create(b"jit-alloc-block\0".as_ptr() as *const _, 0) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        let file = unsafe { File::from_raw_fd(fd) };
        file.set_len(size as u64)?;
        Ok(file)
    }

    pub(super) struct Mapping {
        write: MmapMut,
        exec_ptr: *mut u8,
        len: usize,
    }

    impl Mapping {
        pub(super) fn with_size(size: usize) -> io::Result<Self> {
            debug_assert_eq!(size % page_size(), 0);
            assert!(size > 0, "blocks are never zero-sized");
            let file = anon_file(size)?;
            let write = unsafe { MmapMut::map_mut(&file)? };

            let exec_ptr = unsafe {
                let ptr = libc::mmap(
                    ptr::null_mut(),
                    size,
                    libc::PROT_READ | libc::PROT_EXEC,
                    libc::MAP_SHARED,
                    file.as_raw_fd(),
                    0,
                );
                if ptr == libc::MAP_FAILED {
                    return Err(io::Error::last_os_error());
                }
                ptr as *mut u8
            };

            Ok(Self {
                write,
                exec_ptr,
                len: size,
            })
        }

        pub(super) fn write_ptr(&self) -> *mut u8 {
            self.write.as_ptr() as *mut u8
        }

        pub(super) fn exec_ptr(&self) -> *const u8 {
            self.exec_ptr
        }

        pub(super) fn len(&self) -> usize {
            self.len
        }

        /// No-op: both views are established at mapping time, so there is
        /// no in-place transition to perform. The range is already
        /// readable and executable through `exec_ptr`.
        pub(super) fn make_executable(&self, _start: usize, _len: usize) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for Mapping {
        fn drop(&mut self) {
            let r = unsafe { libc::munmap(self.exec_ptr as *mut libc::c_void, self.len) };
            assert_eq!(r, 0, "munmap of executable view failed: {}", io::Error::last_os_error());
        }
    }
}

/// A page-aligned block of virtual memory owned by the allocator's block
/// pool. Exposes a writable pointer for laying out data/code and an
/// executable pointer for the addresses handed back to callers; under the
/// default build these are the same address, under `selinux-fix` they are
/// distinct views of the same pages.
pub(crate) struct Mmap {
    inner: imp::Mapping,
}

impl Mmap {
    /// Reserve and commit `size` bytes of zero-filled, page-aligned
    /// memory. `size` must already be a multiple of the host page size.
    pub(crate) fn with_size(size: usize) -> io::Result<Self> {
        let inner = imp::Mapping::with_size(size)?;
        trace!("reserved block of {} bytes", size);
        Ok(Self { inner })
    }

    /// Pointer used to write data/code into the block.
    pub(crate) fn write_ptr(&self) -> *mut u8 {
        self.inner.write_ptr()
    }

    /// Pointer through which the written bytes are executable. Equal to
    /// [`Mmap::write_ptr`] unless the `selinux-fix` feature is enabled.
    pub(crate) fn exec_ptr(&self) -> *const u8 {
        self.inner.exec_ptr()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Make `[start, start + len)` executable. `start` and `len` must be
    /// page-size multiples and describe a range within this mapping.
    pub(crate) fn make_executable(&self, start: usize, len: usize) -> io::Result<()> {
        self.inner.make_executable(start, len)
    }
}
