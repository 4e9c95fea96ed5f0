//! Writing the fault set to disk when the process ends.
//!
//! Both normal exit (`atexit`) and `SIGTERM` funnel into [`flush`], which
//! runs at most once. Each run of the target appends one uniquely named
//! profile file to the results directory, so repeated runs accumulate
//! evidence instead of overwriting it.

use std::{
    collections::BTreeSet,
    fs::{self, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicBool, Ordering},
};

use libc::c_int;
use rand::Rng;
use serde::Serialize;

use crate::{handler::SiteHandler, site::AllocSite, Error};

/// Directory the fault profiles land in, relative to the working directory.
pub const RESULTS_DIR: &str = "TestResults";

const FILE_STEM: &str = "faulting-allocs";
const NAME_ATTEMPTS: u32 = 128;

static FLUSHED: AtomicBool = AtomicBool::new(false);

/// On-disk form of one faulting allocation site.
#[derive(Debug, Serialize)]
pub struct FaultRecord {
    pub id: i64,
    pub pkey: u32,
    #[serde(rename = "bbName")]
    pub bb_name: String,
    #[serde(rename = "funcName")]
    pub func_name: String,
    #[serde(rename = "isRealloc")]
    pub is_realloc: bool,
}

impl From<&AllocSite> for FaultRecord {
    fn from(site: &AllocSite) -> Self {
        Self {
            id: site.id(),
            pkey: site.pkey(),
            bb_name: site.bb_name().to_owned(),
            func_name: site.func_name().to_owned(),
            is_realloc: site.is_realloc(),
        }
    }
}

/// Serializes the fault set once; later calls return immediately.
///
/// Returns `false` when the results directory cannot be created or the
/// profile cannot be written; discovery data is best-effort and failure here
/// never takes the process down.
pub fn flush() -> bool {
    if FLUSHED.swap(true, Ordering::SeqCst) {
        return true;
    }

    let dir = Path::new(RESULTS_DIR);
    if let Err(err) = fs::create_dir_all(dir) {
        log::error!("cannot create results directory {}: {err}", dir.display());
        return false;
    }

    let faults = SiteHandler::get().faulting_allocs();
    if faults.is_empty() {
        log::info!("no faulting allocations to export");
        return true;
    }

    match write_unique_profile(dir, &faults) {
        Ok(path) => {
            log::info!("wrote {} faulting allocations to {}", faults.len(), path.display());
            #[cfg(feature = "stats")]
            write_stats(dir);
            true
        }
        Err(err) => {
            log::error!("failed to export faulting allocations: {err}");
            false
        }
    }
}

/// Creates `faulting-allocs-<pid>-<16 hex>.json` in `dir` and writes the
/// snapshot into it as a JSON array.
///
/// The random component is retried when the name is taken; `create_new`
/// closes the race against a concurrent writer picking the same name.
pub fn write_unique_profile(dir: &Path, faults: &BTreeSet<AllocSite>) -> Result<PathBuf, Error> {
    let pid = process::id();
    let mut rng = rand::thread_rng();
    for _ in 0..NAME_ATTEMPTS {
        let path = dir.join(format!("{FILE_STEM}-{pid}-{:016x}.json", rng.gen::<u64>()));
        let file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err.into()),
        };
        let records: Vec<FaultRecord> = faults.iter().map(FaultRecord::from).collect();
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, &records)?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        return Ok(path);
    }
    Err(Error::NameExhausted(dir.display().to_string()))
}

#[cfg(feature = "stats")]
fn write_stats(dir: &Path) {
    use core::sync::atomic::Ordering;

    use crate::handler::stats;

    let pid = process::id();
    let mut rng = rand::thread_rng();
    let path = dir.join(format!("runtime-stats-{pid}-{:016x}.stat", rng.gen::<u64>()));
    let body = format!(
        "allocHook calls: {}\nreallocHook calls: {}\ndeallocHook calls: {}\n",
        stats::ALLOC_HOOK_CALLS.load(Ordering::Relaxed),
        stats::REALLOC_HOOK_CALLS.load(Ordering::Relaxed),
        stats::DEALLOC_HOOK_CALLS.load(Ordering::Relaxed),
    );
    if let Err(err) = fs::write(&path, body) {
        log::error!("failed to write runtime stats: {err}");
    }
}

/// `atexit` trampoline into [`flush`].
pub(crate) extern "C" fn flush_at_exit() {
    let _ = flush();
}

/// `SIGTERM` disposition: export, then die of `SIGTERM` the normal way.
pub(crate) extern "C" fn term_handler(sig: c_int) {
    unsafe {
        if sig != libc::SIGTERM {
            libc::signal(sig, libc::SIG_DFL);
            libc::raise(sig);
            return;
        }
        let _ = flush();
        libc::signal(libc::SIGTERM, libc::SIG_DFL);
        libc::raise(libc::SIGTERM);
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::BTreeSet, fs};

    use super::write_unique_profile;
    use crate::site::AllocSite;

    fn scratch_dir(tag: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("mpk-export-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn profile_file_name_and_shape() {
        let dir = scratch_dir("shape");
        let mut faults = BTreeSet::new();
        faults.insert(AllocSite::new(0x1000, 64, 5, "block3", "foo").with_pkey(2));

        let path = write_unique_profile(&dir, &faults).unwrap();
        let name = path.file_name().unwrap().to_str().unwrap();
        let pid = std::process::id().to_string();
        assert!(name.starts_with(&format!("faulting-allocs-{pid}-")));
        assert!(name.ends_with(".json"));
        // stem + pid + 16 hex chars of entropy
        let entropy = name
            .trim_start_matches(&format!("faulting-allocs-{pid}-"))
            .trim_end_matches(".json");
        assert_eq!(entropy.len(), 16);
        assert!(entropy.chars().all(|c| c.is_ascii_hexdigit()));

        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let entries = parsed.as_array().unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["id"], 5);
        assert_eq!(entries[0]["pkey"], 2);
        assert_eq!(entries[0]["bbName"], "block3");
        assert_eq!(entries[0]["funcName"], "foo");
        assert_eq!(entries[0]["isRealloc"], false);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn repeated_writes_pick_distinct_names() {
        let dir = scratch_dir("distinct");
        let mut faults = BTreeSet::new();
        faults.insert(AllocSite::new(0x1000, 64, 1, "block0", "foo").with_pkey(1));

        let first = write_unique_profile(&dir, &faults).unwrap();
        let second = write_unique_profile(&dir, &faults).unwrap();
        assert_ne!(first, second);
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 2);

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn records_follow_site_ordering() {
        let dir = scratch_dir("order");
        let mut faults = BTreeSet::new();
        faults.insert(AllocSite::new(0x3000, 8, 9, "block0", "zap").with_pkey(1));
        faults.insert(AllocSite::new(0x1000, 8, 2, "block0", "foo").with_pkey(1));
        faults.insert(AllocSite::new(0x2000, 8, 2, "block0", "bar").with_pkey(1));

        let path = write_unique_profile(&dir, &faults).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let ids: Vec<(i64, String)> = parsed
            .as_array()
            .unwrap()
            .iter()
            .map(|entry| {
                (
                    entry["id"].as_i64().unwrap(),
                    entry["funcName"].as_str().unwrap().to_owned(),
                )
            })
            .collect();
        assert_eq!(
            ids,
            vec![(2, "bar".into()), (2, "foo".into()), (9, "zap".into())]
        );

        fs::remove_dir_all(&dir).unwrap();
    }
}
