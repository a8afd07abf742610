//! Architecture-specific instruction-cache coherence.
//!
//! After code bytes are copied into a page and the page is transitioned
//! to `READ|EXECUTE`, the instruction fetcher on this core (and, on
//! architectures with incoherent split caches, other cores) must be told
//! the bytes changed before a branch target lands inside them.

/// Ensure the instruction fetcher observes the bytes just written to
/// `[ptr, ptr + len)` as executable code. `len` may be zero, in which
/// case this is a no-op.
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
pub(crate) fn flush_icache(_ptr: *const u8, _len: usize) {
    // x86/x86_64 keep the I-cache coherent with the D-cache for
    // self-modifying code; a serializing operation is all that's
    // required to make the write visible to this core's fetcher.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}

#[cfg(target_arch = "aarch64")]
pub(crate) fn flush_icache(ptr: *const u8, len: usize) {
    if len == 0 {
        return;
    }

    // Cache-line clean/invalidate sequence: the I-cache is not coherent
    // with the D-cache on aarch64, so each touched line must be cleaned
    // to the point of unification before the I-cache's copy is
    // invalidated.
    const CACHE_LINE: usize = 64;
    let start = (ptr as usize) & !(CACHE_LINE - 1);
    let end = ptr as usize + len;

    unsafe {
        let mut addr = start;
        while addr < end {
            std::arch::asm!("dc cvau, {0}", in(reg) addr, options(nostack, preserves_flags));
            addr += CACHE_LINE;
        }
        std::arch::asm!("dsb ish", options(nostack, preserves_flags));

        let mut addr = start;
        while addr < end {
            std::arch::asm!("ic ivau, {0}", in(reg) addr, options(nostack, preserves_flags));
            addr += CACHE_LINE;
        }
        std::arch::asm!("dsb ish", options(nostack, preserves_flags));
        std::arch::asm!("isb", options(nostack, preserves_flags));
    }
}

#[cfg(not(any(target_arch = "x86", target_arch = "x86_64", target_arch = "aarch64")))]
pub(crate) fn flush_icache(_ptr: *const u8, _len: usize) {
    // No known split-cache erratum on this target; fall back to a full
    // fence rather than assuming coherence.
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
}
