//! Post-instrumentation patching for MPK compartment discovery.
//!
//! The pre-instrumentation pass plants `allocHook` / `reallocHook` /
//! `deallocHook` calls next to the allocator calls of the target. This
//! crate runs after the inliner and does the other half of the feedback
//! loop:
//!
//! 1. walk the module in a deterministic order and assign every hook call
//!    its `(function, id)` identity, writing the identifier, block name and
//!    function name into the call's arguments;
//! 2. load the fault profiles earlier runs of the `mpk_untrusted` runtime
//!    exported, and redirect the allocator calls they name to their
//!    `__rust_untrusted_*` twins.
//!
//! Determinism is the contract that makes step 2 sound: the profile was
//! recorded against identifiers a previous compilation assigned, so the
//! traversal must hand identical identifiers to identical IR every time.

use thiserror::Error;

pub mod ir;
pub mod pass;
pub mod profile;

pub use ir::{Block, FnFlags, Function, Inst, Module, Op, Operand};
pub use pass::{PatchOptions, PatchPass, PatchStats};
pub use profile::{FaultMap, FaultingSite};

#[derive(Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid pass option: {0}")]
    InvalidOption(String),
    #[error("profile path does not exist: {0}")]
    ProfileNotFound(String),
}
