use std::env;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

pub const DEFAULT_BINARY: &str = "llama-server";

const HOMEBREW_BIN: &str = "/opt/homebrew/bin";

/// Resolves the server executable against a search path.
///
/// The search path is computed once per launch and handed to the child too,
/// so the binary that was found is the one the child environment sees.
#[derive(Debug, Clone)]
pub struct BinaryLocator {
    search_path: OsString,
}

impl BinaryLocator {
    /// Uses the current `PATH`, with the Homebrew prefix prepended on macOS
    /// when `ensure_homebrew_path` is set.
    pub fn from_env(ensure_homebrew_path: bool) -> Self {
        let current = env::var_os("PATH").unwrap_or_default();
        let search_path = if ensure_homebrew_path && env::consts::OS == "macos" {
            prepend(HOMEBREW_BIN, &current)
        } else {
            current
        };
        Self { search_path }
    }

    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: search_path.into(),
        }
    }

    pub fn search_path(&self) -> &OsString {
        &self.search_path
    }

    /// Finds `name` on the search path. Names containing a path separator are
    /// taken as-is and only checked for existence.
    pub fn locate(&self, name: &str) -> Result<PathBuf> {
        let candidate = Path::new(name);
        if candidate.components().count() > 1 {
            if is_executable(candidate) {
                return Ok(candidate.to_path_buf());
            }
            return Err(Error::launch(
                format!("'{}' does not exist or is not executable", name),
                "(not started)",
            ));
        }

        env::split_paths(&self.search_path)
            .map(|dir| dir.join(name))
            .find(|path| is_executable(path))
            .ok_or_else(|| {
                Error::launch(
                    format!("'{}' not found in PATH. Install it or add it to PATH.", name),
                    "(not started)",
                )
            })
    }
}

fn prepend(dir: &str, path: &OsString) -> OsString {
    let mut dirs = vec![PathBuf::from(dir)];
    dirs.extend(env::split_paths(path));
    // Only fails on a separator inside a directory name, which split_paths never yields.
    env::join_paths(dirs).unwrap_or_else(|_| path.clone())
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}
