//! Live-pointer to allocation-site mapping.

use std::collections::BTreeMap;

use crate::{site::AllocSite, sync::SpinMutex};

/// Ordered map from an allocation's base address to its site metadata.
///
/// Lookups accept any address inside an allocation, not just the base; the
/// fault handler queries with whatever address the faulting instruction
/// touched.
pub struct AllocMap {
    inner: SpinMutex<BTreeMap<usize, AllocSite>>,
}

impl AllocMap {
    pub const fn new() -> Self {
        Self {
            inner: SpinMutex::new(BTreeMap::new()),
        }
    }

    /// Records `site` under `addr`, replacing any stale entry.
    pub fn insert(&self, addr: usize, site: AllocSite) {
        self.inner.lock().insert(addr, site);
    }

    pub fn remove(&self, addr: usize) {
        self.inner.lock().remove(&addr);
    }

    /// Finds the site whose byte range contains `addr`.
    ///
    /// An exact base-address hit wins; otherwise the greatest entry below
    /// `addr` is the only candidate that can contain it. Returns the error
    /// site on a miss.
    pub fn lookup(&self, addr: usize) -> AllocSite {
        let map = self.inner.lock();
        if map.is_empty() {
            log::debug!("site lookup on empty map, returning error site");
            return AllocSite::error();
        }
        if let Some((_, site)) = map.range(..=addr).next_back() {
            if site.addr() == addr || site.contains(addr) {
                return site.clone();
            }
        }
        log::debug!("no allocation contains {addr:#x}, returning error site");
        AllocSite::error()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }
}

impl Default for AllocMap {
    fn default() -> Self {
        Self::new()
    }
}
