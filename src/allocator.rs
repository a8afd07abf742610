//! The code allocator: a block pool and a bump cursor over its active
//! block.

use crate::error::JitAllocError;
use crate::icache::flush_icache;
use crate::mmap::Mmap;
use crate::page::{page_size, round_up_16, round_up_to_page_size};
use crate::unwind::{UnwindHandle, UnwindRegistry, MAX_UNWIND_DATA_SIZE};
use log::{debug, trace, warn};

/// Construction parameters for a [`JitAlloc`].
#[derive(Debug, Clone, Copy)]
pub struct JitAllocConfig {
    /// Bytes reserved per block. Must exceed [`MAX_UNWIND_DATA_SIZE`].
    pub block_size: usize,
    /// Hard cap on `blocks_reserved * block_size`. Must be at least
    /// `block_size`.
    pub max_total_size: usize,
}

impl JitAllocConfig {
    /// Validate `block_size` and `max_total_size` against each other and
    /// against [`MAX_UNWIND_DATA_SIZE`], rejecting a configuration that
    /// could never successfully allocate anything.
    pub fn new(block_size: usize, max_total_size: usize) -> Result<Self, JitAllocError> {
        if block_size <= MAX_UNWIND_DATA_SIZE {
            return Err(JitAllocError::InvalidConfig(
                "block_size must exceed MAX_UNWIND_DATA_SIZE",
            ));
        }
        if block_size % page_size() != 0 {
            return Err(JitAllocError::InvalidConfig(
                "block_size must be a multiple of the host page size",
            ));
        }
        if max_total_size < block_size {
            return Err(JitAllocError::InvalidConfig(
                "max_total_size must be at least block_size",
            ));
        }
        Ok(Self {
            block_size,
            max_total_size,
        })
    }
}

/// The pointers and size returned by a successful [`JitAlloc::allocate`].
#[derive(Debug, Clone, Copy)]
pub struct Allocation {
    /// First byte owned by this allocation: the start of the (possibly
    /// empty) left-padding that brings `code` to a 16-byte alignment,
    /// immediately after the block's unwind prelude if this call happened
    /// to reserve a fresh block. `data`, if any, sits at
    /// `base + (round_up(data.len(), 16) - data.len())`.
    pub base: *const u8,
    /// `round_up(data.len(), 16) + code.len()`.
    pub total_bytes: usize,
    /// 16-byte-aligned start of the executable region.
    pub code: *const u8,
}

struct Block {
    mmap: Mmap,
    /// Rounded-up size of the unwind prelude reserved at this block's low
    /// bytes; zero when no registry is configured.
    unwind_info_size: usize,
}

/// An executable code allocator: reserves page-aligned blocks of virtual
/// memory, bump-allocates `(data, code)` pairs within the active block,
/// and transitions freshly written ranges from `READ|WRITE` to
/// `READ|EXECUTE` before handing pointers back to the caller.
///
/// Not `Sync`: the W↔X transition is page-global, so concurrent
/// publication requires external serialization (a mutex per instance, or
/// one allocator per thread). See the crate-level docs.
pub struct JitAlloc {
    config: JitAllocConfig,
    registry: Option<Box<dyn UnwindRegistry>>,
    blocks: Vec<Block>,
    unwind_handles: Vec<UnwindHandle>,
    /// Byte offset of the bump cursor within the active (last) block.
    block_pos: usize,
    /// Always `config.block_size` once a block has been reserved; zero
    /// before the first allocation.
    block_end: usize,
}

impl JitAlloc {
    /// Create an allocator with no unwind registry configured.
    pub fn new(config: JitAllocConfig) -> Self {
        Self {
            config,
            registry: None,
            blocks: Vec::new(),
            unwind_handles: Vec::new(),
            block_pos: 0,
            block_end: 0,
        }
    }

    /// Create an allocator that invokes `registry` for every freshly
    /// reserved block.
    pub fn with_unwind_registry(config: JitAllocConfig, registry: Box<dyn UnwindRegistry>) -> Self {
        Self {
            config,
            registry: Some(registry),
            blocks: Vec::new(),
            unwind_handles: Vec::new(),
            block_pos: 0,
            block_end: 0,
        }
    }

    /// Total bytes reserved across all blocks so far.
    pub fn reserved_bytes(&self) -> usize {
        self.blocks.len() * self.config.block_size
    }

    /// Publish `code` (and optional read-only `data`) into executable
    /// memory, returning pointers into the block that owns them.
    ///
    /// Either buffer may be empty, but see the crate docs for the
    /// semantics of an empty `code` alongside non-empty `data`.
    pub fn allocate(&mut self, data: &[u8], code: &[u8]) -> Result<Allocation, JitAllocError> {
        let aligned_data_size = round_up_16(data.len());
        let total_size = aligned_data_size + code.len();
        let max_allocation = self.config.block_size - MAX_UNWIND_DATA_SIZE;

        if total_size > max_allocation {
            return Err(JitAllocError::OversizeRequest {
                requested: total_size,
                max: max_allocation,
            });
        }

        if self.blocks.is_empty() || total_size > self.block_end - self.block_pos {
            self.add_block()?;
            debug_assert!(total_size <= self.block_end - self.block_pos);
        }

        let block_index = self.blocks.len() - 1;
        let block_pos_before = self.block_pos;
        let unwind_info_size = if block_pos_before == 0 {
            self.blocks[block_index].unwind_info_size
        } else {
            0
        };

        let data_offset = unwind_info_size + aligned_data_size - data.len();
        let code_offset = unwind_info_size + aligned_data_size;

        let block = &self.blocks[block_index];
        unsafe {
            let base = block.mmap.write_ptr().add(block_pos_before);
            if !data.is_empty() {
                std::ptr::copy_nonoverlapping(data.as_ptr(), base.add(data_offset), data.len());
            }
            if !code.is_empty() {
                std::ptr::copy_nonoverlapping(code.as_ptr(), base.add(code_offset), code.len());
            }
        }

        let published_len = round_up_to_page_size(unwind_info_size + total_size, page_size());
        block
            .mmap
            .make_executable(block_pos_before, published_len)
            .expect("protection transition to READ|EXECUTE must not fail");
        let code_exec_addr = unsafe { block.mmap.exec_ptr().add(block_pos_before + code_offset) };
        let base_exec_addr =
            unsafe { block.mmap.exec_ptr().add(block_pos_before + unwind_info_size) };
        flush_icache(code_exec_addr, code.len());

        self.block_pos += published_len;
        debug_assert_eq!(self.block_pos % page_size(), 0);
        debug_assert!(self.block_pos <= self.block_end);

        trace!(
            "published {} bytes ({} data, {} code) at {:p}",
            total_size,
            data.len(),
            code.len(),
            base_exec_addr
        );

        Ok(Allocation {
            base: base_exec_addr,
            total_bytes: total_size,
            code: code_exec_addr,
        })
    }

    fn add_block(&mut self) -> Result<(), JitAllocError> {
        if (self.blocks.len() + 1) * self.config.block_size > self.config.max_total_size {
            return Err(JitAllocError::CapacityExhausted {
                max: self.config.max_total_size,
            });
        }

        let mmap = match Mmap::with_size(self.config.block_size) {
            Ok(mmap) => mmap,
            Err(e) => {
                warn!("failed to reserve a new block: {}", e);
                return Err(JitAllocError::Io(e));
            }
        };

        let unwind_info_size = if let Some(registry) = &self.registry {
            let registered =
                unsafe { registry.register(mmap.write_ptr(), self.config.block_size) };
            match registered {
                Some((handle, written)) => {
                    let rounded = round_up_16(written);
                    assert!(
                        rounded <= MAX_UNWIND_DATA_SIZE,
                        "unwind registry wrote {} bytes, more than MAX_UNWIND_DATA_SIZE",
                        written
                    );
                    self.unwind_handles.push(handle);
                    rounded
                }
                None => {
                    debug!("unwind registry rejected a newly reserved block");
                    // `mmap` is dropped here, releasing the block; cursor
                    // state is untouched since we haven't pushed anything.
                    return Err(JitAllocError::UnwindHookFailed);
                }
            }
        } else {
            0
        };

        debug!(
            "reserved block {} of {} bytes ({} byte unwind prelude)",
            self.blocks.len(),
            self.config.block_size,
            unwind_info_size
        );

        self.blocks.push(Block {
            mmap,
            unwind_info_size,
        });
        self.block_pos = 0;
        self.block_end = self.config.block_size;
        Ok(())
    }
}

impl Drop for JitAlloc {
    fn drop(&mut self) {
        // Unwind handles are torn down before their owning blocks are
        // unreserved below, matching the ordering the OS unwinder
        // registration requires (deregister before the address can be
        // reused).
        if let Some(registry) = &self.registry {
            for handle in self.unwind_handles.drain(..) {
                registry.unregister(handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const PAGE: usize = 4096;

    fn config(block_size: usize, max_total_size: usize) -> JitAllocConfig {
        JitAllocConfig::new(block_size, max_total_size).unwrap()
    }

    #[test]
    fn s1_code_only_allocation_advances_a_whole_page() {
        drop(env_logger::try_init());
        let mut alloc = JitAlloc::new(config(4 * PAGE, 16 * PAGE));
        let code = vec![0x90u8; 17];
        let a = alloc.allocate(&[], &code).unwrap();
        assert_eq!(a.code as usize % 16, 0);
        assert_eq!(a.total_bytes, 17);
        assert_eq!(alloc.block_pos, PAGE);
    }

    #[test]
    fn s2_second_allocation_shares_the_block() {
        let mut alloc = JitAlloc::new(config(4 * PAGE, 16 * PAGE));
        let a1 = alloc.allocate(&[], &[0x90u8; 17]).unwrap();

        let data = [0xAAu8; 3];
        let code = [0xC3u8];
        let a2 = alloc.allocate(&data, &code).unwrap();

        // `base` is the start of the newly reserved span, not the data
        // pointer: the 3 data bytes sit 13 bytes into it (16 - 3), and
        // code starts at the full 16-byte mark.
        assert_eq!(a2.base as usize, a1.base as usize + PAGE);
        assert_eq!(a2.code as usize, a1.base as usize + PAGE + 16);
    }

    #[test]
    fn s3_oversize_request_is_rejected_without_side_effects() {
        let mut alloc = JitAlloc::new(config(4 * PAGE, 16 * PAGE));
        let code = vec![0u8; 4 * PAGE - MAX_UNWIND_DATA_SIZE + 1];
        let err = alloc.allocate(&[], &code).unwrap_err();
        assert!(matches!(err, JitAllocError::OversizeRequest { .. }));
        assert_eq!(alloc.blocks.len(), 0);
        assert_eq!(alloc.block_pos, 0);
    }

    #[test]
    fn s4_cap_is_enforced_on_the_fifth_block() {
        // A code size of exactly `block_size - MAX_UNWIND_DATA_SIZE`
        // rounds up to fill a whole block, forcing a fresh reservation
        // every call; the cap allows only 4.
        let block_size = 2 * PAGE;
        let mut alloc = JitAlloc::new(config(block_size, 4 * block_size));
        let code = vec![0u8; block_size - MAX_UNWIND_DATA_SIZE];
        for _ in 0..4 {
            alloc.allocate(&[], &code).unwrap();
        }
        let err = alloc.allocate(&[], &code).unwrap_err();
        assert!(matches!(err, JitAllocError::CapacityExhausted { .. }));
        assert_eq!(alloc.blocks.len(), 4);
    }

    struct FixedSizeRegistry {
        write_len: usize,
        registered: Arc<AtomicUsize>,
        unregistered: Arc<AtomicUsize>,
    }

    impl UnwindRegistry for FixedSizeRegistry {
        unsafe fn register(&self, _block_base: *mut u8, _block_size: usize) -> Option<(UnwindHandle, usize)> {
            self.registered.fetch_add(1, Ordering::SeqCst);
            Some((UnwindHandle::new(()), self.write_len))
        }

        fn unregister(&self, _handle: UnwindHandle) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn s5_prelude_is_reserved_and_destroy_runs_once_per_block() {
        let registered = Arc::new(AtomicUsize::new(0));
        let unregistered = Arc::new(AtomicUsize::new(0));
        let registry = FixedSizeRegistry {
            write_len: 40,
            registered: registered.clone(),
            unregistered: unregistered.clone(),
        };
        let mut alloc = JitAlloc::with_unwind_registry(config(4 * PAGE, 16 * PAGE), Box::new(registry));

        // Each call's code is just under two pages, so the first two
        // calls exactly fill block 1 (one page of slack absorbs the 48
        // byte rounded-up prelude) and the third forces block 2.
        let code = vec![0u8; 2 * PAGE - 200];
        let a1 = alloc.allocate(&[], &code).unwrap();
        // Rounded-up 40 -> 48, so the first allocation's base is offset
        // past the prelude, not at the block's raw start.
        assert_eq!(a1.base as usize % 16, 0);

        alloc.allocate(&[], &code).unwrap();
        // forces a second block
        alloc.allocate(&[], &code).unwrap();

        assert_eq!(alloc.blocks.len(), 2);
        assert_eq!(registered.load(Ordering::SeqCst), 2);

        drop(alloc);
        assert_eq!(unregistered.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn s6_registry_rejection_leaves_prior_block_intact() {
        struct RejectSecond {
            calls: AtomicUsize,
        }
        impl UnwindRegistry for RejectSecond {
            unsafe fn register(&self, _block_base: *mut u8, _block_size: usize) -> Option<(UnwindHandle, usize)> {
                let n = self.calls.fetch_add(1, Ordering::SeqCst);
                if n == 0 {
                    Some((UnwindHandle::new(()), 16))
                } else {
                    None
                }
            }
            fn unregister(&self, _handle: UnwindHandle) {}
        }

        let mut alloc = JitAlloc::with_unwind_registry(
            config(4 * PAGE, 16 * PAGE),
            Box::new(RejectSecond {
                calls: AtomicUsize::new(0),
            }),
        );

        let first = alloc.allocate(&[], &vec![0u8; PAGE]).unwrap();
        // Too big to share the remainder of block 1 (one page already
        // spent there, plus its prelude), but within the single-block
        // limit, so this forces a fresh (rejected) block rather than an
        // OversizeRequest.
        let err = alloc.allocate(&[], &vec![0u8; 3 * PAGE + 512]).unwrap_err();
        assert!(matches!(err, JitAllocError::UnwindHookFailed));
        assert_eq!(alloc.blocks.len(), 1);

        // The earlier pointer is still valid and executable.
        unsafe {
            assert_eq!(*first.code, 0);
        }
    }

    #[test]
    fn allocations_never_overlap() {
        let mut alloc = JitAlloc::new(config(4 * PAGE, 64 * PAGE));
        let mut seen = HashSet::new();
        for i in 0..20 {
            let code = vec![i as u8; 100 + i];
            let a = alloc.allocate(&[], &code).unwrap();
            assert!(seen.insert(a.code as usize));
        }
    }

    #[test]
    fn content_fidelity() {
        let mut alloc = JitAlloc::new(config(4 * PAGE, 16 * PAGE));
        let data = [1u8, 2, 3, 4, 5];
        let code = [0xC3u8, 0x90, 0xCC];
        let a = alloc.allocate(&data, &code).unwrap();
        unsafe {
            let code_slice = std::slice::from_raw_parts(a.code, code.len());
            assert_eq!(code_slice, &code);
            let data_start = (a.base as usize + round_up_16(data.len()) - data.len()) as *const u8;
            let data_slice = std::slice::from_raw_parts(data_start, data.len());
            assert_eq!(data_slice, &data);
        }
    }

    #[test]
    fn empty_code_nonempty_data_is_legal() {
        let mut alloc = JitAlloc::new(config(4 * PAGE, 16 * PAGE));
        let data = [7u8; 5];
        let a = alloc.allocate(&data, &[]).unwrap();
        assert_eq!(a.total_bytes, 16);
        // `code` still points somewhere valid even though it is
        // zero-length.
        assert!(!a.code.is_null());
    }

    #[test]
    fn config_rejects_undersized_block() {
        assert!(JitAllocConfig::new(MAX_UNWIND_DATA_SIZE, 16 * PAGE).is_err());
    }

    #[test]
    fn config_rejects_cap_below_block_size() {
        assert!(JitAllocConfig::new(4 * PAGE, PAGE).is_err());
    }
}
