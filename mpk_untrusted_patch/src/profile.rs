//! Loading faulting-allocation profiles recorded by the runtime.

use std::{
    fs,
    path::{Path, PathBuf},
};

use hashbrown::HashMap;
use serde::{Deserialize, Deserializer, Serialize};

use crate::Error;

/// One faulting allocation site, as recorded on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultingSite {
    pub id: i64,
    pub pkey: i64,
    #[serde(rename = "bbName")]
    pub bb_name: String,
    #[serde(rename = "funcName")]
    pub func_name: String,
    /// Older profiles encode this flag as an integer.
    #[serde(rename = "isRealloc", default, deserialize_with = "bool_or_int")]
    pub is_realloc: bool,
}

fn bool_or_int<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Flag {
        Bool(bool),
        Int(i64),
    }
    Ok(match Flag::deserialize(deserializer)? {
        Flag::Bool(value) => value,
        Flag::Int(value) => value != 0,
    })
}

impl FaultingSite {
    /// A usable record carries a non-negative id and key and both names.
    pub fn is_well_formed(&self) -> bool {
        self.id >= 0 && self.pkey >= 0 && !self.bb_name.is_empty() && !self.func_name.is_empty()
    }
}

/// Faulting sites grouped for the rewrite: function name, then identifier.
pub type FaultMap = HashMap<String, HashMap<u64, FaultingSite>>;

/// The profile files `path` refers to: the file itself, or every `*.json`
/// directly inside it when it is a directory. Paths come back sorted so the
/// merge order is stable.
pub fn collect_profile_paths(path: &Path) -> Result<Vec<PathBuf>, Error> {
    if !path.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in fs::read_dir(path)? {
        let candidate = entry?.path();
        let is_json = candidate
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
        if candidate.is_file() && is_json {
            files.push(candidate);
        }
    }
    files.sort();
    Ok(files)
}

/// Loads every profile under `path` into a [`FaultMap`].
///
/// A file that cannot be read or parsed, and an entry that is malformed,
/// are skipped with a warning; only a `path` that names nothing at all is
/// an error. The first record wins when two files repeat a
/// `(function, id)` pair.
pub fn load_fault_map(path: &Path) -> Result<FaultMap, Error> {
    if !path.exists() {
        return Err(Error::ProfileNotFound(path.display().to_string()));
    }

    let mut fault_map = FaultMap::new();
    for file in collect_profile_paths(path)? {
        let body = match fs::read_to_string(&file) {
            Ok(body) => body,
            Err(err) => {
                log::warn!("skipping unreadable profile {}: {err}", file.display());
                continue;
            }
        };
        let entries: Vec<serde_json::Value> = match serde_json::from_str(&body) {
            Ok(entries) => entries,
            Err(err) => {
                log::warn!("skipping malformed profile {}: {err}", file.display());
                continue;
            }
        };
        for entry in entries {
            let site = match serde_json::from_value::<FaultingSite>(entry.clone()) {
                Ok(site) => site,
                Err(err) => {
                    log::warn!("skipping malformed profile entry {entry}: {err}");
                    continue;
                }
            };
            if !site.is_well_formed() {
                log::warn!(
                    "skipping profile entry with id={} pkey={} bbName={:?} funcName={:?}",
                    site.id,
                    site.pkey,
                    site.bb_name,
                    site.func_name
                );
                continue;
            }
            fault_map
                .entry(site.func_name.clone())
                .or_default()
                .entry(site.id as u64)
                .or_insert(site);
        }
    }
    Ok(fault_map)
}
