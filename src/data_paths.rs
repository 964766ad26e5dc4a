//! Purpose: Default directory resolution for the `stageload` CLI.
//! Exports: `default_data_dir`, `default_store_dir`.
//! Role: Keep CLI defaults in one place.
//! Invariants: Default writable directory remains `~/.stageload/data`.
//! Invariants: Default artifact store is `./assets` relative to the working directory.

use std::path::PathBuf;

pub(crate) fn default_data_dir() -> PathBuf {
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".stageload").join("data")
}

pub(crate) fn default_store_dir() -> PathBuf {
    PathBuf::from("assets")
}
