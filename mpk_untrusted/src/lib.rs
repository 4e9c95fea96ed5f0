//! Allocation-site tracking runtime for MPK compartment discovery.
//!
//! Linked into an instrumented target, this runtime keeps a live map from
//! heap pointers to the static allocation sites that produced them. When a
//! thread trips a protection-key fault (`SIGSEGV` with `SEGV_PKUERR`), the
//! fault handler identifies the allocation it touched, adds the site to the
//! fault set, and transparently single-steps the faulting instruction so
//! the target keeps running. At process exit the accumulated fault set is
//! serialized to a uniquely named JSON profile, which the offline
//! `mpk_untrusted_patch` pass consumes to move those sites onto the
//! untrusted allocator in the next build.
//!
//! The runtime is a discovery tool, not a sandbox: it never blocks an
//! access, and it makes no attempt to protect its own state from the
//! target.
//!
//! x86-64 Linux only: recovery manipulates the PKRU image and the trap flag
//! inside the saved machine context.
//!
//! Hook-path and fault-path diagnostics go through the [`log`] facade; the
//! runtime installs no logger itself, and production runs should leave it
//! that way since the fault path may log from signal context.

use thiserror::Error;

pub mod export;
pub mod fault;
pub mod handler;
pub mod hooks;
pub mod map;
pub mod pkru;
pub mod site;
pub mod sync;

pub use export::{flush, FaultRecord, RESULTS_DIR};
pub use handler::{FaultSet, PendingKey, PendingKeyMap, SiteHandler};
pub use map::AllocMap;
pub use site::{AllocSite, AssocSet};

/// Errors surfaced by the runtime's non-handler paths.
#[derive(Error, Debug)]
pub enum Error {
    /// Filesystem trouble while exporting the fault set.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    /// The fault set could not be serialized.
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    /// A signal disposition could not be installed.
    #[error("signal setup failed: {0}")]
    Signal(#[from] nix::Error),
    /// Every candidate profile name in the directory was already taken.
    #[error("could not pick an unused profile name in {0}")]
    NameExhausted(String),
}
