//! Default locations.
//!
//! `CONDUIT_DATA_DIR` and `--data-dir` override the data directory through
//! the orchestrator settings; these are only the fallbacks.

use std::path::PathBuf;

const APP: &str = "conduit";

/// `~/.config/conduit` on Linux, the platform equivalent elsewhere.
pub fn config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP))
}

/// Server configs, state snapshots and in-flight OAuth state live here.
pub fn data_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|p| p.join(APP))
}

pub fn settings_file() -> Option<PathBuf> {
    config_dir().map(|p| p.join("conduit.json"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locations_are_namespaced() {
        if let Some(file) = settings_file() {
            assert!(file.ends_with("conduit/conduit.json"));
        }
        if let Some(dir) = data_dir() {
            assert!(dir.ends_with(APP));
        }
    }
}
