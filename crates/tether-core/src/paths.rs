//! Default on-disk locations.

use std::path::PathBuf;

/// Variables consulted for the home directory, in order.
const HOME_VARS: [&str; 2] = ["HOME", "USERPROFILE"];

/// The user's home directory, from `HOME` or (on Windows) `USERPROFILE`.
pub fn home_dir() -> Option<PathBuf> {
    home_from(|key| std::env::var(key).ok())
}

fn home_from(lookup: impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    HOME_VARS
        .iter()
        .filter_map(|key| lookup(*key))
        .find(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// `~/.tether/workspaces`, or `None` when no home directory is set.
pub fn default_workspace_root() -> Option<PathBuf> {
    home_dir().map(workspace_root_under)
}

fn workspace_root_under(home: PathBuf) -> PathBuf {
    home.join(".tether").join("workspaces")
}

// ============================================================================
// TESTS
// ============================================================================
