//! Identifier assignment and fault-driven rewriting.
//!
//! Runs after the inliner, so the hook-call layout it walks is the layout
//! the shipped binary executes. Identifiers are assigned by a traversal
//! that depends only on the module: defined functions by descending name,
//! blocks in reverse post-order, instructions in block order. Two runs over
//! identical IR therefore hand the same `(function, id)` pair to the same
//! hook call, which is what lets a profile recorded against one build drive
//! rewriting in the next.

use std::path::PathBuf;

use crate::{
    ir::{Module, Op, Operand},
    profile::{self, FaultMap},
    Error,
};

/// Hook planted after plain allocations.
pub const ALLOC_HOOK: &str = "allocHook";
/// Hook planted after reallocations.
pub const REALLOC_HOOK: &str = "reallocHook";
/// Hook planted around frees.
pub const DEALLOC_HOOK: &str = "deallocHook";

/// Allocator symbols with an untrusted twin.
const ALLOC_REPLACEMENTS: &[(&str, &str)] = &[
    ("__rust_alloc", "__rust_untrusted_alloc"),
    ("__rust_alloc_zeroed", "__rust_untrusted_alloc_zeroed"),
];

const OPT_PROFILE_PATH: &str = "mpk-test-profile-path";
const OPT_REMOVE_HOOKS: &str = "mpk-test-remove-hooks";
const OPT_VERBOSE: &str = "mpk-verbose-patching";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Alloc,
    Realloc,
    Dealloc,
}

impl HookKind {
    fn of(callee: &str) -> Option<Self> {
        match callee {
            ALLOC_HOOK => Some(Self::Alloc),
            REALLOC_HOOK => Some(Self::Realloc),
            DEALLOC_HOOK => Some(Self::Dealloc),
            _ => None,
        }
    }

    /// Argument index of the identifier slot. Dealloc hooks are counted but
    /// never numbered, so they do not consume an identifier.
    fn id_index(self) -> Option<usize> {
        match self {
            Self::Alloc => Some(2),
            Self::Realloc => Some(4),
            Self::Dealloc => None,
        }
    }
}

/// Pass options, accepted as `key=value` strings (a leading `-` is fine).
#[derive(Debug, Clone)]
pub struct PatchOptions {
    /// A profile file, or a directory scanned for `*.json`.
    pub profile_path: Option<PathBuf>,
    /// Erase the hook calls and the hook functions once ids are assigned.
    pub remove_hooks: bool,
    /// Log each rewritten allocator call.
    pub verbose: bool,
}

impl Default for PatchOptions {
    fn default() -> Self {
        Self {
            profile_path: None,
            remove_hooks: false,
            verbose: true,
        }
    }
}

impl PatchOptions {
    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, Error> {
        let mut options = Self::default();
        for arg in args {
            let arg = arg.as_ref().trim_start_matches('-');
            let (key, value) = arg
                .split_once('=')
                .ok_or_else(|| Error::InvalidOption(arg.to_owned()))?;
            match key {
                OPT_PROFILE_PATH => options.profile_path = Some(PathBuf::from(value)),
                OPT_REMOVE_HOOKS => options.remove_hooks = parse_bool(value)?,
                OPT_VERBOSE => options.verbose = parse_bool(value)?,
                _ => return Err(Error::InvalidOption(arg.to_owned())),
            }
        }
        Ok(options)
    }
}

fn parse_bool(value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        other => Err(Error::InvalidOption(format!("not a boolean: {other}"))),
    }
}

/// What a pass run did, for logging and assertions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PatchStats {
    pub hooks_seen: u64,
    pub alloc_hooks: u64,
    pub realloc_hooks: u64,
    pub dealloc_hooks: u64,
    pub rewritten: u64,
}

impl PatchStats {
    fn count(&mut self, kind: HookKind) {
        self.hooks_seen += 1;
        match kind {
            HookKind::Alloc => self.alloc_hooks += 1,
            HookKind::Realloc => self.realloc_hooks += 1,
            HookKind::Dealloc => self.dealloc_hooks += 1,
        }
    }
}

pub struct PatchPass {
    options: PatchOptions,
}

impl PatchPass {
    pub fn new(options: PatchOptions) -> Self {
        Self { options }
    }

    /// Assigns identifiers, rewrites faulting allocator calls, and applies
    /// the configured cleanups. A module with no hook functions at all is
    /// left untouched.
    pub fn run(&self, module: &mut Module) -> Result<PatchStats, Error> {
        let hooks_present = [ALLOC_HOOK, REALLOC_HOOK, DEALLOC_HOOK]
            .iter()
            .any(|hook| module.has_function(hook));
        if !hooks_present {
            log::debug!("module carries no instrumentation hooks, skipping");
            return Ok(PatchStats::default());
        }

        let fault_map = match &self.options.profile_path {
            Some(path) => profile::load_fault_map(path)?,
            None => FaultMap::new(),
        };

        let mut stats = PatchStats::default();
        let mut hook_calls = Vec::new();
        let mut rewrites = Vec::new();

        let mut order: Vec<usize> = (0..module.functions.len())
            .filter(|&index| !module.functions[index].is_declaration())
            .collect();
        order.sort_by(|&a, &b| module.functions[b].name.cmp(&module.functions[a].name));

        for index in order {
            self.assign_ids_in_function(
                module,
                index,
                &fault_map,
                &mut stats,
                &mut hook_calls,
                &mut rewrites,
            );
        }

        for &(fi, bi, ii) in &rewrites {
            self.rewrite_allocator_call(module, fi, bi, ii, &mut stats);
        }

        if self.options.remove_hooks {
            remove_hooks(module, hook_calls);
        }

        relax_allocator_inlining(module);

        Ok(stats)
    }

    /// Walks one function in RPO, numbering hook calls and collecting the
    /// allocator calls whose `(function, id)` shows up in the fault map.
    fn assign_ids_in_function(
        &self,
        module: &mut Module,
        fi: usize,
        fault_map: &FaultMap,
        stats: &mut PatchStats,
        hook_calls: &mut Vec<(usize, usize, usize)>,
        rewrites: &mut Vec<(usize, usize, usize)>,
    ) {
        let func_name = module.functions[fi].name.clone();
        let func_faults = fault_map.get(&func_name);
        let rpo = module.functions[fi].reverse_post_order();
        let defs = module.functions[fi].value_defs();
        let mut next_id: i64 = 0;

        for bi in rpo {
            for ii in 0..module.functions[fi].blocks[bi].insts.len() {
                let (callee, first_arg) = match &module.functions[fi].blocks[bi].insts[ii].op {
                    Op::Call { callee, args } => (callee.clone(), args.first().cloned()),
                    _ => continue,
                };
                let Some(kind) = HookKind::of(&callee) else {
                    continue;
                };
                stats.count(kind);
                hook_calls.push((fi, bi, ii));

                let Some(index) = kind.id_index() else {
                    continue;
                };
                let id = next_id;
                next_id += 1;
                let bb_name = module.functions[fi].block_name(bi);

                {
                    let Op::Call { args, .. } = &mut module.functions[fi].blocks[bi].insts[ii].op
                    else {
                        continue;
                    };
                    if args.len() <= index + 2 {
                        log::warn!("hook call in {func_name} is missing its metadata arguments");
                        continue;
                    }
                    args[index] = Operand::Imm(id);
                    args[index + 1] = Operand::Str(bb_name.clone());
                    args[index + 2] = Operand::Str(func_name.clone());
                }

                let Some(func_faults) = func_faults else {
                    continue;
                };
                let Some(record) = func_faults.get(&(id as u64)) else {
                    continue;
                };
                match first_arg {
                    Some(Operand::Value(value)) => match defs.get(&value) {
                        Some(&(db, di))
                            if matches!(
                                module.functions[fi].blocks[db].insts[di].op,
                                Op::Call { .. }
                            ) =>
                        {
                            if record.bb_name != bb_name {
                                log::error!(
                                    "faulting site ({id}, {func_name}) recorded in block \
                                     {} but found in {bb_name}",
                                    record.bb_name
                                );
                            }
                            rewrites.push((fi, db, di));
                        }
                        _ => log::warn!(
                            "hook call ({id}, {func_name}) does not guard a call instruction"
                        ),
                    },
                    _ => log::warn!(
                        "hook call ({id}, {func_name}) has no allocator-result operand"
                    ),
                }
            }
        }
    }

    /// Redirects one allocator call to its untrusted twin, declaring the
    /// twin when the module lacks it. Callees without a twin are left
    /// alone.
    fn rewrite_allocator_call(
        &self,
        module: &mut Module,
        fi: usize,
        bi: usize,
        ii: usize,
        stats: &mut PatchStats,
    ) {
        let current = match &module.functions[fi].blocks[bi].insts[ii].op {
            Op::Call { callee, .. } => callee.clone(),
            _ => return,
        };
        let Some(replacement) = ALLOC_REPLACEMENTS
            .iter()
            .find(|(from, _)| *from == current)
            .map(|&(_, to)| to)
        else {
            log::debug!("allocator {current} has no untrusted replacement, leaving call alone");
            return;
        };

        if !module.has_function(replacement) {
            log::warn!("declaring missing replacement symbol {replacement}");
            module.declare_function(replacement);
        }
        if self.options.verbose {
            log::info!(
                "patching allocator call {current} -> {replacement} in {}",
                module.functions[fi].name
            );
        }
        if let Op::Call { callee, .. } = &mut module.functions[fi].blocks[bi].insts[ii].op {
            *callee = replacement.to_owned();
        }
        stats.rewritten += 1;
    }
}

/// Erases every collected hook call, then the hook functions themselves.
fn remove_hooks(module: &mut Module, mut hook_calls: Vec<(usize, usize, usize)>) {
    hook_calls.sort_unstable();
    for &(fi, bi, ii) in hook_calls.iter().rev() {
        module.functions[fi].blocks[bi].insts.remove(ii);
    }
    for hook in [ALLOC_HOOK, REALLOC_HOOK, DEALLOC_HOOK] {
        module.remove_function(hook);
    }
}

/// Allocator shims were kept out of line so the pre-instrumentation pass
/// could see them; with ids assigned they may inline again.
fn relax_allocator_inlining(module: &mut Module) {
    for function in &mut module.functions {
        if function.flags.allocator {
            function.flags.never_inline = false;
            function.flags.always_inline = true;
        }
    }
}
