//! An executable code allocator for just-in-time compilers.
//!
//! `JitAlloc` reserves virtual memory in large fixed-size blocks,
//! bump-allocates `(data, code)` pairs within the active block, transitions
//! freshly filled page ranges from `READ|WRITE` to `READ|EXECUTE`, flushes
//! the instruction cache over the published code, and optionally invokes a
//! client-provided [`UnwindRegistry`] so that an OS stack unwinder (SEH on
//! Windows, DWARF/`.eh_frame` on POSIX) can traverse JITed frames.
//!
//! Relocation, code patching, per-function deallocation, garbage collection
//! of dead code, profile-guided layout, and cross-block jump thunks are out
//! of scope: code published through this allocator lives until the whole
//! `JitAlloc` is dropped. Callers that need eviction should layer a
//! higher-level region manager on top rather than reach into the bump
//! cursor.
//!
//! The allocator assumes exclusive access to `&mut self`; concurrent
//! publication from multiple threads must be serialized externally (a
//! mutex per instance, or one allocator per thread), since the W↔X
//! transition is page-global.
//!
//! ```
//! use jit_alloc::{JitAlloc, JitAllocConfig};
//!
//! let config = JitAllocConfig::new(64 * 1024, 16 * 1024 * 1024).unwrap();
//! let mut alloc = JitAlloc::new(config);
//! let code = [0xc3u8]; // `ret`
//! let allocation = alloc.allocate(&[], &code).unwrap();
//! assert_eq!(allocation.total_bytes, code.len());
//! ```

mod allocator;
mod error;
mod icache;
mod mmap;
mod page;
mod unwind;

pub use allocator::{Allocation, JitAlloc, JitAllocConfig};
pub use error::JitAllocError;
pub use unwind::{UnwindHandle, UnwindRegistry, MAX_UNWIND_DATA_SIZE};
