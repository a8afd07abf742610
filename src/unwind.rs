//! The optional per-block unwind-metadata hook.
//!
//! Unwind encoding is platform- and ABI-specific (x64 Windows expects a
//! `RUNTIME_FUNCTION` plus `UNWIND_INFO`, System V expects `.eh_frame` FDE
//! registration), so the allocator never embeds either. Instead a client
//! supplies a [`UnwindRegistry`] capability: one call to synthesize and
//! write the metadata when a block is reserved, and one to tear it down
//! when the allocator is dropped.

use std::any::Any;
use std::fmt;

/// Upper bound, in bytes, on the unwind prelude a single block may carry.
/// `block_size` must exceed this, and a registered prelude's rounded size
/// must not.
pub const MAX_UNWIND_DATA_SIZE: usize = 256;

/// An opaque handle produced by [`UnwindRegistry::register`] and threaded
/// back untouched to [`UnwindRegistry::unregister`] at teardown.
pub struct UnwindHandle(Box<dyn Any + Send>);

impl UnwindHandle {
    /// Wrap an arbitrary registry-owned value as an opaque handle.
    pub fn new(inner: impl Any + Send) -> Self {
        UnwindHandle(Box::new(inner))
    }

    /// Recover the concrete type a registry previously wrapped.
    pub fn downcast<T: Any>(self) -> Result<Box<T>, UnwindHandle> {
        match self.0.downcast::<T>() {
            Ok(inner) => Ok(inner),
            Err(inner) => Err(UnwindHandle(inner)),
        }
    }
}

impl fmt::Debug for UnwindHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnwindHandle").finish_non_exhaustive()
    }
}

/// Client capability for synthesizing and tearing down platform-specific
/// stack-unwinding metadata for each freshly reserved block.
pub trait UnwindRegistry: Send + Sync {
    /// Called once immediately after a block is reserved, before any data
    /// or code is written into it. May write up to [`MAX_UNWIND_DATA_SIZE`]
    /// bytes of unwind metadata starting at `block_base`, and must report
    /// exactly how many bytes it wrote.
    ///
    /// Returning `None` rejects the new block; the allocator releases it
    /// immediately and the triggering `allocate` call observes failure.
    ///
    /// # Safety
    ///
    /// `block_base` is valid for `block_size` writable bytes for the
    /// duration of this call, and for at least `MAX_UNWIND_DATA_SIZE`
    /// bytes for the lifetime of the block thereafter (the allocator
    /// never writes data or code into that prefix).
    unsafe fn register(&self, block_base: *mut u8, block_size: usize) -> Option<(UnwindHandle, usize)>;

    /// Called once per handle produced by [`UnwindRegistry::register`],
    /// during allocator teardown, before the underlying block is
    /// unreserved.
    fn unregister(&self, handle: UnwindHandle);
}
