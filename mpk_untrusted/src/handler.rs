//! The process-wide facade wiring the tracking state together.

use std::{
    collections::BTreeSet,
    sync::{Arc, Once, OnceLock},
};

use hashbrown::HashMap;

use crate::{
    map::AllocMap,
    site::{AllocSite, AssocSet},
    sync::SpinMutex,
};

/// Sites observed to fault, each stamped with the key it faulted on.
pub struct FaultSet {
    inner: SpinMutex<BTreeSet<AllocSite>>,
}

impl FaultSet {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(BTreeSet::new()),
        }
    }

    pub fn insert(&self, site: AllocSite) {
        self.inner.lock().insert(site);
    }

    pub fn snapshot(&self) -> BTreeSet<AllocSite> {
        self.inner.lock().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }
}

impl Default for FaultSet {
    fn default() -> Self {
        Self::new()
    }
}

/// The key whose access a thread was temporarily granted, and the rights to
/// restore once its faulting instruction has retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingKey {
    pub key: u32,
    pub rights: u32,
}

/// Threads at most one fault-recovery episode deep, so inserts and removals
/// pair up: a thread has an entry exactly while it is single-stepping.
pub struct PendingKeyMap {
    inner: SpinMutex<HashMap<i32, PendingKey>>,
}

/// Inserts below this many concurrently-stepping threads reuse the map's
/// initial allocation, keeping the fault path free of allocator calls.
const PENDING_CAPACITY: usize = 512;

impl PendingKeyMap {
    pub fn new() -> Self {
        Self {
            inner: SpinMutex::new(HashMap::with_capacity(PENDING_CAPACITY)),
        }
    }

    pub fn store(&self, tid: i32, pending: PendingKey) {
        self.inner.lock().insert(tid, pending);
    }

    pub fn take(&self, tid: i32) -> Option<PendingKey> {
        self.inner.lock().remove(&tid)
    }

    pub fn contains(&self, tid: i32) -> bool {
        self.inner.lock().contains_key(&tid)
    }
}

impl Default for PendingKeyMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "stats")]
pub mod stats {
    //! Hook-call counters exported alongside the fault profile.
    use core::sync::atomic::{AtomicU64, Ordering};

    pub static ALLOC_HOOK_CALLS: AtomicU64 = AtomicU64::new(0);
    pub static REALLOC_HOOK_CALLS: AtomicU64 = AtomicU64::new(0);
    pub static DEALLOC_HOOK_CALLS: AtomicU64 = AtomicU64::new(0);

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

static HANDLER: OnceLock<SiteHandler> = OnceLock::new();
static INSTALL: Once = Once::new();

/// Owner of the allocation map, fault set and pending-key map.
///
/// Lives behind a run-once gate and is never dropped; background threads may
/// still be calling hooks when the process begins to exit, and an immortal
/// handler sidesteps any teardown ordering with them. Each sub-component
/// locks independently; no operation holds two locks at once.
pub struct SiteHandler {
    sites: AllocMap,
    faults: FaultSet,
    pending: PendingKeyMap,
}

impl SiteHandler {
    fn new() -> Self {
        Self {
            sites: AllocMap::new(),
            faults: FaultSet::new(),
            pending: PendingKeyMap::new(),
        }
    }

    /// The process-wide handler, created on first touch.
    ///
    /// The first caller also installs the fault handlers and the exit flush.
    /// Installation is deferred to first hook call rather than a constructor
    /// because the Rust startup code registers its own `SIGSEGV` handler and
    /// would displace ours if we raced it.
    pub fn get() -> &'static SiteHandler {
        let handler = HANDLER.get_or_init(SiteHandler::new);
        INSTALL.call_once(|| {
            if let Err(err) = crate::fault::install() {
                log::error!("failed to install fault handlers: {err}");
            }
        });
        handler
    }

    pub fn sites(&self) -> &AllocMap {
        &self.sites
    }

    pub fn pending(&self) -> &PendingKeyMap {
        &self.pending
    }

    /// Records a fresh allocation.
    pub fn alloc(&self, addr: usize, size: i64, id: i64, bb_name: &'static str, func_name: &'static str) {
        self.sites.insert(addr, AllocSite::new(addr, size, id, bb_name, func_name));
        log::debug!("alloc site {addr:#x} id={id} bb={bb_name} func={func_name}");
    }

    /// Replaces the mapping for a reallocated pointer, threading the old
    /// site into the new site's ancestry.
    ///
    /// An unknown old pointer breaks the chain: the new site starts with no
    /// ancestry and the break is logged.
    pub fn realloc(
        &self,
        new_addr: usize,
        new_size: i64,
        old_addr: usize,
        id: i64,
        bb_name: &'static str,
        func_name: &'static str,
    ) {
        let old = self.sites.lookup(old_addr);
        if !old.is_valid() {
            self.sites
                .insert(new_addr, AllocSite::new(new_addr, new_size, id, bb_name, func_name));
            log::warn!(
                "realloc site {new_addr:#x} id={id} broke its chain: old pointer {old_addr:#x} is untracked"
            );
            return;
        }

        let mut assoc: AssocSet = old.assoc().cloned().collect();
        assoc.insert(old);
        self.sites.remove(old_addr);
        self.sites.insert(
            new_addr,
            AllocSite::new_realloc(new_addr, new_size, id, bb_name, func_name, Arc::new(assoc)),
        );
        log::debug!("realloc site {old_addr:#x} -> {new_addr:#x} id={id} func={func_name}");
    }

    pub fn dealloc(&self, addr: usize) {
        self.sites.remove(addr);
    }

    /// Marks the site containing `addr` (and its whole realloc ancestry) as
    /// having faulted on `pkey`. Unknown addresses are ignored; the caller
    /// still runs the recovery so the target can make progress.
    pub fn fault(&self, addr: usize, pkey: u32) {
        let site = self.sites.lookup(addr);
        if !site.is_valid() {
            return;
        }
        for ancestor in site.assoc() {
            self.faults.insert(ancestor.with_pkey(pkey));
        }
        self.faults.insert(site.with_pkey(pkey));
    }

    /// A point-in-time copy of the faulting sites.
    pub fn faulting_allocs(&self) -> BTreeSet<AllocSite> {
        self.faults.snapshot()
    }
}
