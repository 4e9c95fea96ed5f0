//! Access to the PKRU register image inside a signal-delivered context.
//!
//! The kernel saves user protection-key state in the xsave area reachable
//! through `ucontext_t::uc_mcontext.fpregs`. The PKRU component's byte
//! offset inside that area is CPU-model specific and discovered through
//! `CPUID.(EAX=0DH, ECX=9)`; we read it once and cache it so the fault
//! handler itself never executes CPUID.

use std::sync::OnceLock;

/// Rights value granting read and write access to a key's pages.
pub const PKEY_ENABLE_ACCESS: u32 = 0x0;
/// Rights value revoking all access to a key's pages.
pub const PKEY_DISABLE_ACCESS: u32 = 0x1;
/// Rights value revoking writes to a key's pages.
pub const PKEY_DISABLE_WRITE: u32 = 0x2;

/// xsave component number of the PKRU state.
const XSTATE_PKRU_BIT: u32 = 9;
/// CPUID leaf enumerating xsave component layout.
const XSTATE_CPUID_LEAF: u32 = 0xd;

static PKRU_XSTATE_OFFSET: OnceLock<usize> = OnceLock::new();

/// Byte offset of the PKRU word inside the xsave area, or 0 when the CPU
/// does not report a PKRU component.
pub fn pkru_xstate_offset() -> usize {
    *PKRU_XSTATE_OFFSET.get_or_init(|| {
        let leaf = unsafe { core::arch::x86_64::__cpuid_count(XSTATE_CPUID_LEAF, XSTATE_PKRU_BIT) };
        if leaf.eax == 0 {
            log::warn!("CPUID reports no PKRU xsave component; faults cannot be recovered");
            return 0;
        }
        leaf.ebx as usize
    })
}

/// Forces the CPUID query now so later callers only perform a load.
pub(crate) fn prime_xstate_offset() {
    let _ = pkru_xstate_offset();
}

/// Locates the PKRU word saved in `uctx`.
///
/// Returns `None` when the context carries no floating-point state or the
/// CPU reports no PKRU component.
///
/// # Safety
/// `uctx` must point to a live `ucontext_t` delivered to a signal handler.
pub unsafe fn pkru_ptr(uctx: *mut libc::ucontext_t) -> Option<*mut u32> {
    let fpregs = (*uctx).uc_mcontext.fpregs;
    if fpregs.is_null() {
        return None;
    }
    let offset = pkru_xstate_offset();
    if offset == 0 {
        return None;
    }
    Some((fpregs as *mut u8).add(offset) as *mut u32)
}

/// The two rights bits for `key` in a PKRU value.
pub fn key_rights(pkru: u32, key: u32) -> u32 {
    debug_assert!(key < 16);
    (pkru >> (2 * key)) & 0b11
}

/// `pkru` with the rights bits for `key` replaced by `rights`.
pub fn with_key_rights(pkru: u32, key: u32, rights: u32) -> u32 {
    debug_assert!(key < 16);
    debug_assert!(rights <= 0b11);
    let mask = 0b11 << (2 * key);
    (pkru & !mask) | (rights << (2 * key))
}
