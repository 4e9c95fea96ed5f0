//! Command-line front end for the post-instrumentation pass.
//!
//! ```text
//! mpk_untrusted_patch <module.json> [-o patched.json] [pass options]
//! ```
//!
//! Pass options are `key=value` strings:
//! `mpk-test-profile-path=<path|dir>`, `mpk-test-remove-hooks=<bool>`,
//! `mpk-verbose-patching=<bool>`. Without `-o` the patched module goes to
//! stdout.

use std::{fs, path::PathBuf, process::ExitCode};

use mpk_untrusted_patch::{Error, Module, PatchOptions, PatchPass};

fn main() -> ExitCode {
    env_logger::init();
    match run(std::env::args().skip(1).collect()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("mpk_untrusted_patch: {err}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Vec<String>) -> Result<(), Error> {
    let mut input: Option<PathBuf> = None;
    let mut output: Option<PathBuf> = None;
    let mut pass_args: Vec<String> = Vec::new();

    let mut iter = args.into_iter();
    while let Some(arg) = iter.next() {
        if arg == "-o" {
            let path = iter
                .next()
                .ok_or_else(|| Error::InvalidOption("-o needs a path".into()))?;
            output = Some(PathBuf::from(path));
        } else if arg.contains('=') {
            pass_args.push(arg);
        } else if input.is_none() {
            input = Some(PathBuf::from(arg));
        } else {
            return Err(Error::InvalidOption(format!("unexpected argument: {arg}")));
        }
    }

    let input = input.ok_or_else(|| {
        Error::InvalidOption("usage: mpk_untrusted_patch <module.json> [-o out.json] [key=value ...]".into())
    })?;
    let options = PatchOptions::from_args(&pass_args)?;

    let mut module: Module = serde_json::from_str(&fs::read_to_string(&input)?)?;
    let stats = PatchPass::new(options).run(&mut module)?;
    log::info!(
        "assigned ids to {} hooks ({} alloc, {} realloc, {} dealloc), rewrote {} allocator calls",
        stats.hooks_seen,
        stats.alloc_hooks,
        stats.realloc_hooks,
        stats.dealloc_hooks,
        stats.rewritten
    );

    let mut rendered = serde_json::to_string_pretty(&module)?;
    rendered.push('\n');
    match output {
        Some(path) => fs::write(path, rendered)?,
        None => print!("{rendered}"),
    }
    Ok(())
}
