//! The VCS backend abstraction.
//!
//! A [`Backend`] knows how to open a clone directory into a [`Repository`]
//! handle and how to perform the network clone that creates such a
//! directory. The store never looks inside a handle; it only caches and
//! shares it. [`Backends`] is the registry of installed backends, injectable
//! so tests can drive the store with mocks.
pub mod git;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::{fmt, io};

use serde::{Deserialize, Serialize};
use url::Url;

/// Supported version-control systems.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vcs {
    Git,
    #[serde(rename = "hg")]
    Mercurial,
}

impl fmt::Display for Vcs {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Git => write!(f, "git"),
            Self::Mercurial => write!(f, "hg"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown vcs type {0:?}")]
pub struct UnknownVcs(pub String);

impl FromStr for Vcs {
    type Err = UnknownVcs;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "git" => Ok(Self::Git),
            "hg" | "mercurial" => Ok(Self::Mercurial),
            other => Err(UnknownVcs(other.to_owned())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("no known vcs claims the directory {0:?}")]
pub struct DetectError(pub PathBuf);

/// Determine which VCS owns a clone directory by inspecting its layout.
///
/// Fails when the directory exists but no backend claims it, e.g. after
/// corruption or manual tampering.
pub fn detect(dir: &Path) -> Result<Vcs, DetectError> {
    let bare_git =
        dir.join("HEAD").is_file() && dir.join("objects").is_dir() && dir.join("refs").is_dir();
    if bare_git || dir.join(".git").is_dir() {
        return Ok(Vcs::Git);
    }
    if dir.join(".hg").is_dir() {
        return Ok(Vcs::Mercurial);
    }
    Err(DetectError(dir.to_path_buf()))
}

/// A branch and the commit it points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Branch {
    pub name: String,
    pub head: String,
}

/// A tag and the commit it points to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tag {
    pub name: String,
    pub commit: String,
}

/// Commit author or committer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Signature {
    pub name: String,
    pub email: String,
    /// Seconds since the epoch.
    pub time: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Commit {
    pub id: String,
    pub author: Signature,
    pub committer: Signature,
    pub message: String,
    pub parents: Vec<String>,
}

/// Paging for commit log traversal.
#[derive(Debug, Clone, Copy)]
pub struct CommitsOptions {
    pub skip: usize,
    pub limit: usize,
}

impl Default for CommitsOptions {
    fn default() -> Self {
        Self { skip: 0, limit: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    Dir,
    File,
    Symlink,
}

/// A file, directory or symlink in a repository tree. Directories carry
/// their (sorted) child entries, files their contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contents: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entries: Option<Vec<TreeEntry>>,
}

/// Errors reading from an opened repository.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// The revision, reference or path does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// Git backend error.
    #[error(transparent)]
    Git(#[from] git2::Error),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl RepoError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Errors from the clone executor. A failed clone leaves the target
/// directory untouched.
#[derive(Debug, thiserror::Error)]
pub enum CloneError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    #[error("`{command}` exited with code {code:?}: {stderr}")]
    CommandFailed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("unsupported transport option {0:?}")]
    UnsupportedOption(String),
}

/// Options passed through to the clone executor, e.g. `depth`. Keys a
/// backend does not understand are rejected, not ignored.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportOptions(HashMap<String, String>);

impl TransportOptions {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }
}

/// An opened repository: an opaque capability object bound to one clone
/// directory. Handles are shared between concurrent callers, so every
/// operation takes `&self` and implementations synchronize internally.
pub trait Repository: Send + Sync {
    fn vcs(&self) -> Vcs;

    /// The clone directory this handle is bound to.
    fn path(&self) -> &Path;

    /// Resolve a revision specification to a full commit id.
    fn resolve(&self, rev: &str) -> Result<String, RepoError>;

    fn branches(&self) -> Result<Vec<Branch>, RepoError>;

    fn tags(&self) -> Result<Vec<Tag>, RepoError>;

    fn commit(&self, rev: &str) -> Result<Commit, RepoError>;

    /// Commits reachable from `head`, newest first.
    fn commits(&self, head: &str, opts: CommitsOptions) -> Result<Vec<Commit>, RepoError>;

    /// The tree entry at `path` under the given revision; the empty path is
    /// the root tree.
    fn entry(&self, rev: &str, path: &str) -> Result<TreeEntry, RepoError>;
}

/// A per-VCS factory and clone executor.
pub trait Backend: Send + Sync {
    /// Open an existing clone directory.
    fn open(&self, dir: &Path) -> Result<Arc<dyn Repository>, RepoError>;

    /// Clone `remote` into `dir`, which exists and is empty. Slow: this is
    /// the network operation the store serializes per clone directory.
    fn clone_remote(
        &self,
        remote: &Url,
        dir: &Path,
        options: &TransportOptions,
    ) -> Result<(), CloneError>;
}

/// Registry of installed backends.
#[derive(Clone)]
pub struct Backends {
    inner: HashMap<Vcs, Arc<dyn Backend>>,
}

impl Default for Backends {
    fn default() -> Self {
        let mut backends = Self::empty();
        backends.register(Vcs::Git, Arc::new(git::GitBackend));
        backends
    }
}

impl Backends {
    pub fn empty() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn register(&mut self, vcs: Vcs, backend: Arc<dyn Backend>) {
        self.inner.insert(vcs, backend);
    }

    pub fn get(&self, vcs: Vcs) -> Option<Arc<dyn Backend>> {
        self.inner.get(&vcs).cloned()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[test]
    fn test_vcs_roundtrip() {
        assert_eq!("git".parse::<Vcs>().unwrap(), Vcs::Git);
        assert_eq!("hg".parse::<Vcs>().unwrap(), Vcs::Mercurial);
        assert_eq!(Vcs::Git.to_string(), "git");
        assert_eq!(Vcs::Mercurial.to_string(), "hg");
        assert!("svn".parse::<Vcs>().is_err());
    }

    #[test]
    fn test_detect_bare_git() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("HEAD"), "ref: refs/heads/master\n").unwrap();
        fs::create_dir(tmp.path().join("objects")).unwrap();
        fs::create_dir(tmp.path().join("refs")).unwrap();

        assert_eq!(detect(tmp.path()).unwrap(), Vcs::Git);
    }

    #[test]
    fn test_detect_work_tree() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join(".git")).unwrap();

        assert_eq!(detect(tmp.path()).unwrap(), Vcs::Git);
    }

    #[test]
    fn test_detect_mercurial() {
        let tmp = tempfile::tempdir().unwrap();
        fs::create_dir(tmp.path().join(".hg")).unwrap();

        assert_eq!(detect(tmp.path()).unwrap(), Vcs::Mercurial);
    }

    #[test]
    fn test_detect_unrecognized() {
        let tmp = tempfile::tempdir().unwrap();

        assert!(detect(tmp.path()).is_err());
    }
}
