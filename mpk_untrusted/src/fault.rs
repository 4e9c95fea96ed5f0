//! Protection-key fault recovery.
//!
//! `SIGSEGV` with `SEGV_PKUERR` means the target touched memory whose key
//! its thread is not allowed to access. The handler records the allocation
//! site, then lets the faulting instruction complete: it grants the key in
//! the thread's saved PKRU image, arms the x86 trap flag, and the paired
//! `SIGTRAP` handler revokes the grant one instruction later. Faults that
//! are not protection-key violations chain to whatever handler the process
//! had installed before ours.

use libc::{c_int, c_void, siginfo_t};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::sync::OnceLock;

#[cfg(not(feature = "page-disable"))]
use crate::handler::PendingKey;
use crate::{handler::SiteHandler, pkru, Error};

/// `EFLAGS` trap-flag bit; while set, the CPU raises `SIGTRAP` after each
/// instruction.
const TRAP_FLAG: i64 = 0x100;

const PAGE_SIZE: usize = 4096;

/// `SEGV_PKUERR` si_code, per the kernel's `asm-generic/siginfo.h`; the
/// `libc` crate does not expose this constant.
const SEGV_PKUERR: c_int = 4;

/// The `SIGSEGV` disposition that was active before ours, kept for chaining
/// faults we do not own.
static PREV_SIGSEGV: OnceLock<SigAction> = OnceLock::new();

/// Kernel `siginfo_t` layout for `SEGV_PKUERR`, down to the `si_pkey`
/// member that the `libc` crate does not expose:
///
/// ```c
/// struct {
///     int   si_signo, si_errno, si_code;       /* + 4 bytes padding   */
///     void *si_addr;
///     union {
///         short si_addr_lsb;
///         struct { char pad[8]; void *lower, *upper; } addr_bnd;
///         struct { char pad[8]; __u32 pkey; } addr_pkey;
///     };
/// };
/// ```
#[repr(C)]
struct PkuSigInfo {
    si_signo: c_int,
    si_errno: c_int,
    si_code: c_int,
    _pad: c_int,
    si_addr: *mut c_void,
    _addr_bnd_pad: [u8; 8],
    si_pkey: u32,
}

/// # Safety
/// `info` must come from a `SIGSEGV` delivery with `si_code == SEGV_PKUERR`;
/// for any other code the union holds different members.
unsafe fn si_pkey(info: *const siginfo_t) -> u32 {
    (*info.cast::<PkuSigInfo>()).si_pkey
}

/// Writes a static diagnostic without touching the allocator or `log`.
fn report(msg: &str) {
    unsafe {
        libc::write(libc::STDERR_FILENO, msg.as_ptr().cast(), msg.len());
    }
}

/// Installs the `SIGSEGV`/`SIGTRAP`/`SIGTERM` handlers and the exit-time
/// flush. Called once, from the first hook invocation.
pub(crate) fn install() -> Result<(), Error> {
    pkru::prime_xstate_offset();

    let seg = SigAction::new(
        SigHandler::SigAction(seg_handler),
        SaFlags::SA_SIGINFO,
        SigSet::empty(),
    );
    let prev = unsafe { sigaction(Signal::SIGSEGV, &seg) }?;
    let _ = PREV_SIGSEGV.set(prev);

    #[cfg(not(feature = "page-disable"))]
    {
        let step = SigAction::new(
            SigHandler::SigAction(step_handler),
            SaFlags::SA_SIGINFO,
            SigSet::empty(),
        );
        unsafe { sigaction(Signal::SIGTRAP, &step) }?;
    }

    let term = SigAction::new(
        SigHandler::Handler(crate::export::term_handler),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &term) }?;

    unsafe {
        libc::atexit(crate::export::flush_at_exit);
    }

    log::debug!("fault handlers installed");
    Ok(())
}

/// Forwards a fault we do not own to the previously installed disposition.
unsafe fn chain_previous(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    let Some(prev) = PREV_SIGSEGV.get() else {
        // No record of a previous action; fall back to the default one.
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
        return;
    };
    match prev.handler() {
        SigHandler::SigDfl | SigHandler::SigIgn => {
            // Restore the old disposition before re-raising so the kernel
            // applies it instead of re-entering us.
            let _ = sigaction(Signal::SIGSEGV, prev);
            libc::raise(sig);
        }
        SigHandler::SigAction(handler) => handler(sig, info, ctx),
        SigHandler::Handler(handler) => handler(sig),
    }
}

extern "C" fn seg_handler(sig: c_int, info: *mut siginfo_t, ctx: *mut c_void) {
    unsafe {
        if (*info).si_code != SEGV_PKUERR {
            chain_previous(sig, info, ctx);
            return;
        }

        let addr = (*info).si_addr() as usize;
        let key = si_pkey(info);
        SiteHandler::get().fault(addr, key);

        recover(info, ctx, key);
    }
}

/// Lets the faulting instruction make progress.
#[cfg(feature = "page-disable")]
unsafe fn recover(info: *mut siginfo_t, _ctx: *mut c_void, _key: u32) {
    disable_page(info);
}

/// Lets the faulting instruction make progress.
#[cfg(not(feature = "page-disable"))]
unsafe fn recover(info: *mut siginfo_t, ctx: *mut c_void, key: u32) {
    let uctx = ctx.cast::<libc::ucontext_t>();
    match pkru::pkru_ptr(uctx) {
        Some(pkru_word) => {
            let pkru_value = *pkru_word;
            SiteHandler::get().pending().store(
                libc::gettid(),
                PendingKey {
                    key,
                    rights: pkru::key_rights(pkru_value, key),
                },
            );
            *pkru_word = pkru::with_key_rights(pkru_value, key, pkru::PKEY_ENABLE_ACCESS);
            (*uctx).uc_mcontext.gregs[libc::REG_EFL as usize] |= TRAP_FLAG;
        }
        None => {
            // Without a PKRU image the grant cannot be written and the
            // instruction would fault forever; unprotect the page instead.
            report("mpk_untrusted: no PKRU state in context, disabling page\n");
            disable_page(info);
        }
    }
}

/// One-shot recovery: strip the key from the enclosing page for the rest of
/// the run.
unsafe fn disable_page(info: *mut siginfo_t) {
    let page = (*info).si_addr() as usize & !(PAGE_SIZE - 1);
    let rc = libc::syscall(
        libc::SYS_pkey_mprotect,
        page,
        PAGE_SIZE,
        libc::PROT_READ | libc::PROT_WRITE,
        0usize,
    );
    if rc != 0 {
        report("mpk_untrusted: pkey_mprotect failed during page recovery\n");
    }
}

#[cfg(not(feature = "page-disable"))]
extern "C" fn step_handler(_sig: c_int, _info: *mut siginfo_t, ctx: *mut c_void) {
    unsafe {
        let uctx = ctx.cast::<libc::ucontext_t>();
        if let Some(pending) = SiteHandler::get().pending().take(libc::gettid()) {
            if let Some(pkru_word) = pkru::pkru_ptr(uctx) {
                *pkru_word = pkru::with_key_rights(*pkru_word, pending.key, pending.rights);
            }
        }
        (*uctx).uc_mcontext.gregs[libc::REG_EFL as usize] &= !TRAP_FLAG;
    }
}

#[cfg(test)]
mod tests {
    use core::mem::{offset_of, size_of};

    use super::PkuSigInfo;

    #[test]
    fn overlay_matches_kernel_layout() {
        assert_eq!(offset_of!(PkuSigInfo, si_code), 8);
        assert_eq!(offset_of!(PkuSigInfo, si_addr), 16);
        assert_eq!(offset_of!(PkuSigInfo, si_pkey), 32);
        assert!(size_of::<PkuSigInfo>() <= size_of::<libc::siginfo_t>());
    }

    #[test]
    fn si_pkey_reads_the_union_slot() {
        let mut info: libc::siginfo_t = unsafe { core::mem::zeroed() };
        unsafe {
            (&mut info as *mut libc::siginfo_t)
                .cast::<u8>()
                .add(32)
                .cast::<u32>()
                .write(5);
            assert_eq!(super::si_pkey(&info), 5);
        }
    }
}
