//! Error taxonomy for allocator construction and allocation.

use thiserror::Error;

/// Errors returned by [`crate::JitAllocConfig::new`] and
/// [`crate::JitAlloc::allocate`].
///
/// All four of the abstract failure conditions this allocator
/// distinguishes internally surface identically to a caller checking only
/// "did it work": a single `Err`. The allocator never retries, never
/// partially publishes a request, and leaves its cursor untouched on any
/// of these. Protection-change and cache-flush failures are not part of
/// this enum; they indicate an inconsistent W/X state and are treated as
/// fatal invariant violations (an assertion panic), not caller-recoverable
/// errors.
#[derive(Debug, Error)]
pub enum JitAllocError {
    /// `round_up(dataSize, 16) + codeSize` exceeds `block_size -
    /// MAX_UNWIND_DATA_SIZE`; this request can never fit in any block
    /// this allocator will ever reserve.
    #[error(
        "requested allocation of {requested} bytes exceeds the {max} bytes \
         a single block can hold"
    )]
    OversizeRequest {
        /// `round_up(data.len(), 16) + code.len()`.
        requested: usize,
        /// `block_size - MAX_UNWIND_DATA_SIZE`, the largest a request may be.
        max: usize,
    },

    /// Reserving another block would push `blocks.len() * block_size`
    /// past the configured `max_total_size`.
    #[error("reserving another block would exceed the configured maximum of {max} bytes")]
    CapacityExhausted {
        /// The configured `max_total_size`.
        max: usize,
    },

    /// The configured [`crate::UnwindRegistry`] rejected a newly reserved
    /// block by returning `None` from `register`.
    #[error("unwind registry rejected the newly reserved block")]
    UnwindHookFailed,

    /// `block_size` or `max_total_size` failed constructor-time
    /// validation.
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(&'static str),

    /// A platform virtual-memory primitive (reserve, unreserve) failed.
    #[error("platform memory operation failed: {0}")]
    Io(#[from] std::io::Error),
}
