//! Targets and the workspace root they resolve against.
//!
//! A [`Target`] is a repository working directory identified by an
//! `(owner, name)` pair. It always resolves to `<root>/<owner>/<name>`.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TargetError {
    #[error("{field} cannot be empty")]
    Empty { field: &'static str },

    #[error("Invalid {field}: {value}")]
    Invalid { field: &'static str, value: String },
}

/// A repository working directory, keyed by owner and name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Target {
    owner: String,
    name: String,
}

impl Target {
    /// Create a target, validating both components.
    ///
    /// Each component must be a single normal path component made of ASCII
    /// letters, digits, `.`, `_` or `-`.
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Result<Self, TargetError> {
        let owner = owner.into();
        let name = name.into();
        validate_component("owner", &owner)?;
        validate_component("repo", &name)?;
        Ok(Self { owner, name })
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable identifier, e.g. `acme/widgets`.
    pub fn id(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn validate_component(field: &'static str, value: &str) -> Result<(), TargetError> {
    if value.is_empty() {
        return Err(TargetError::Empty { field });
    }

    let allowed = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));

    let mut components = Path::new(value).components();
    let single_normal = matches!(components.next(), Some(Component::Normal(_)))
        && components.next().is_none();

    if allowed && single_normal && value != "." && value != ".." {
        Ok(())
    } else {
        Err(TargetError::Invalid {
            field,
            value: value.to_string(),
        })
    }
}

/// Root directory holding every target's working copy.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a target to its working directory. Pure; no I/O.
    pub fn resolve(&self, target: &Target) -> PathBuf {
        self.root.join(&target.owner).join(&target.name)
    }

    /// Whether the target has a checked-out working copy.
    pub fn is_cloned(&self, target: &Target) -> bool {
        crate::git::is_git_repo(&self.resolve(target))
    }
}

// ============================================================================
// TESTS
// ============================================================================
