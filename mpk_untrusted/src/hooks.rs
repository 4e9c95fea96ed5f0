//! The C ABI the instrumented target calls into.
//!
//! The pre-instrumentation pass plants a call to one of these symbols next
//! to every allocator call it finds; the post-instrumentation pass fills in
//! the identifier and name arguments. The name strings live in storage that
//! outlives the process, which is what lets sites hold `&'static str`.
//!
//! The hooks never fail and never unwind across the FFI boundary. They run
//! in normal (non-signal) context and may allocate; this runtime itself is
//! not instrumented, so its own allocations never re-enter the hooks.

use core::ffi::{c_char, CStr};

use crate::handler::SiteHandler;

/// Borrows a hook-provided name for the rest of the process's lifetime.
/// Null and non-UTF-8 names degrade to `""`.
unsafe fn static_name(ptr: *const c_char) -> &'static str {
    if ptr.is_null() {
        return "";
    }
    CStr::from_ptr(ptr).to_str().unwrap_or("")
}

/// Called immediately after a successful allocator call.
#[export_name = "allocHook"]
pub extern "C" fn alloc_hook(
    ptr: *mut u8,
    size: i64,
    id: i64,
    bb_name: *const c_char,
    func_name: *const c_char,
) {
    if ptr.is_null() || size <= 0 {
        return;
    }
    #[cfg(feature = "stats")]
    crate::handler::stats::bump(&crate::handler::stats::ALLOC_HOOK_CALLS);
    let (bb_name, func_name) = unsafe { (static_name(bb_name), static_name(func_name)) };
    SiteHandler::get().alloc(ptr as usize, size, id, bb_name, func_name);
}

/// Called immediately after a successful `realloc`.
#[export_name = "reallocHook"]
pub extern "C" fn realloc_hook(
    new_ptr: *mut u8,
    new_size: i64,
    old_ptr: *mut u8,
    _old_size: i64,
    id: i64,
    bb_name: *const c_char,
    func_name: *const c_char,
) {
    if new_ptr.is_null() || new_size <= 0 {
        return;
    }
    #[cfg(feature = "stats")]
    crate::handler::stats::bump(&crate::handler::stats::REALLOC_HOOK_CALLS);
    let (bb_name, func_name) = unsafe { (static_name(bb_name), static_name(func_name)) };
    SiteHandler::get().realloc(new_ptr as usize, new_size, old_ptr as usize, id, bb_name, func_name);
}

/// Called around a free of `ptr`.
#[export_name = "deallocHook"]
pub extern "C" fn dealloc_hook(ptr: *mut u8, _size: i64, _id: i64) {
    #[cfg(feature = "stats")]
    crate::handler::stats::bump(&crate::handler::stats::DEALLOC_HOOK_CALLS);
    SiteHandler::get().dealloc(ptr as usize);
}

#[cfg(test)]
mod tests {
    use std::ffi::CString;

    use super::{alloc_hook, dealloc_hook, realloc_hook};
    use crate::handler::SiteHandler;

    /// Hook names must outlive the process; tests leak theirs to honor that.
    fn leaked(name: &str) -> *const core::ffi::c_char {
        let owned = CString::new(name).unwrap();
        Box::leak(owned.into_boxed_c_str()).as_ptr()
    }

    #[test]
    fn hooks_drive_the_global_handler() {
        let bb = leaked("block0");
        let func = leaked("hook_smoke");
        let storage = Box::leak(Box::new([0u8; 64]));
        let ptr = storage.as_mut_ptr();

        alloc_hook(ptr, 64, 11, bb, func);
        let site = SiteHandler::get().sites().lookup(ptr as usize + 8);
        assert_eq!(site.id(), 11);
        assert_eq!(site.func_name(), "hook_smoke");

        dealloc_hook(ptr, 64, 11);
        assert!(!SiteHandler::get().sites().lookup(ptr as usize).is_valid());
    }

    #[test]
    fn realloc_hook_relinks_the_pointer() {
        let bb = leaked("block1");
        let func = leaked("hook_realloc_smoke");
        let old = Box::leak(Box::new([0u8; 32])).as_mut_ptr();
        let new = Box::leak(Box::new([0u8; 64])).as_mut_ptr();

        alloc_hook(old, 32, 1, bb, func);
        realloc_hook(new, 64, old, 32, 2, bb, func);

        let handler = SiteHandler::get();
        assert!(!handler.sites().lookup(old as usize).is_valid());
        let site = handler.sites().lookup(new as usize);
        assert_eq!(site.id(), 2);
        assert!(site.is_realloc());
        assert_eq!(site.assoc().count(), 1);

        dealloc_hook(new, 64, 2);
    }

    #[test]
    fn null_and_invalid_arguments_are_ignored() {
        let bb = leaked("block2");
        let func = leaked("hook_null_smoke");

        alloc_hook(core::ptr::null_mut(), 64, 1, bb, func);
        let storage = Box::leak(Box::new([0u8; 16]));
        alloc_hook(storage.as_mut_ptr(), 0, 1, bb, func);
        assert!(!SiteHandler::get().sites().lookup(storage.as_ptr() as usize).is_valid());

        // Null name pointers degrade to empty names rather than faulting.
        alloc_hook(storage.as_mut_ptr(), 16, 1, core::ptr::null(), core::ptr::null());
        let site = SiteHandler::get().sites().lookup(storage.as_ptr() as usize);
        assert_eq!(site.func_name(), "");
        dealloc_hook(storage.as_mut_ptr(), 16, 1);
    }
}
