use daqrun_core::ControlClient;
use std::path::{Path, PathBuf};

/// Default location of the babiconjson control binary
pub const DEFAULT_BABICONJSON: &str = "/usr/babirl/babicon/babiconjson";

/// Expand `~` and `$VAR` in a path given on the command line. Unknown
/// variables leave the path as written.
pub fn expand_path(raw: &str) -> PathBuf {
    match shellexpand::full(raw) {
        Ok(expanded) => PathBuf::from(expanded.into_owned()),
        Err(_) => PathBuf::from(shellexpand::tilde(raw).into_owned()),
    }
}

/// Client for the control binary on `host`
pub fn control_client(host: &str, binary: &Path) -> ControlClient {
    ControlClient::new(host, binary)
}
