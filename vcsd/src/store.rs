//! The repository store.
//!
//! Maps remote repositories to local clone directories, clones them on
//! first access, and shares opened handles between concurrent callers.
//! Guarantees:
//!
//!   * at most one handle exists per clone directory at any time; all
//!     concurrent holders share it, and it is released when the last holder
//!     drops its [`Opened`] guard;
//!   * of N concurrent [`Store::clone_remote`] calls for the same remote,
//!     exactly one runs the clone executor; the others wait and then open
//!     the result;
//!   * a clone either completes fully or leaves no trace: it runs in a
//!     temporary sibling directory that is renamed into place as the final,
//!     atomic step, so readers see either nothing or a complete repository.
use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;
use std::{fs, io};

use url::Url;

use crate::backend::{
    self, Backend, Backends, CloneError, RepoError, Repository, TransportOptions, Vcs,
};
use crate::paths::{self, EncodeError};

/// Store configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory under which cloned repositories are stored.
    pub storage_dir: PathBuf,
}

impl Config {
    pub fn new(storage_dir: PathBuf) -> Self {
        Self { storage_dir }
    }

    /// The local directory the repository is (or would be) cloned to.
    pub fn clone_dir(&self, vcs: Vcs, remote: &Url) -> Result<PathBuf, EncodeError> {
        Ok(self.storage_dir.join(paths::encode(vcs, remote)?))
    }
}

/// What to clone and how.
#[derive(Debug, Clone)]
pub struct CloneSpec {
    pub vcs: Vcs,
    pub remote: Url,
    pub options: TransportOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No repository has been cloned to this directory. Recoverable: the
    /// caller may clone.
    #[error("no repository at {0:?}")]
    NotFound(PathBuf),

    /// The clone path exists but is not a directory.
    #[error("clone path {0:?} is not a directory")]
    NotADirectory(PathBuf),

    /// The remote URL cannot be encoded as a clone directory.
    #[error(transparent)]
    Encode(#[from] EncodeError),

    /// The directory exists but no backend claims it.
    #[error(transparent)]
    Detect(#[from] backend::DetectError),

    /// The directory's VCS was detected but no backend is registered for it.
    #[error("no backend registered for {0}")]
    UnsupportedVcs(Vcs),

    /// Opening the repository failed.
    #[error(transparent)]
    Repo(#[from] RepoError),

    /// The clone executor failed; the target directory was left untouched.
    #[error("clone failed: {0}")]
    Clone(#[from] CloneError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The repository store. Cheap to clone; all clones share state.
///
/// Constructed once at startup and passed by reference to all request
/// handlers; lives for the process lifetime.
#[derive(Clone)]
pub struct Store {
    shared: Arc<Shared>,
}

struct Shared {
    config: Config,
    backends: Backends,
    inner: Mutex<Inner>,
}

/// The mutable maps, guarded by one structural mutex that is only ever held
/// for in-memory operations, never across I/O.
#[derive(Default)]
struct Inner {
    /// Live handles, keyed by clone directory. An entry exists iff its
    /// refcount in `users` is present and positive.
    repos: HashMap<PathBuf, Arc<dyn Repository>>,
    /// Number of current holders per clone directory.
    users: HashMap<PathBuf, usize>,
    /// Per-directory clone locks. Created lazily, retained for the process
    /// lifetime; the key space is bounded by the distinct repositories ever
    /// accessed.
    locks: HashMap<PathBuf, Arc<Mutex<()>>>,
}

/// A shared repository handle, accounted for by the store. Dropping the
/// guard releases the holder's reference; the handle itself is freed when
/// the last holder is gone.
pub struct Opened {
    repo: Arc<dyn Repository>,
    dir: PathBuf,
    store: Store,
}

impl std::fmt::Debug for Opened {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Opened")
            .field("dir", &self.dir)
            .finish_non_exhaustive()
    }
}

impl Opened {
    /// The clone directory the handle is bound to.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The underlying shared handle.
    pub fn handle(&self) -> &Arc<dyn Repository> {
        &self.repo
    }
}

impl Deref for Opened {
    type Target = dyn Repository;

    fn deref(&self) -> &Self::Target {
        self.repo.as_ref()
    }
}

impl Drop for Opened {
    fn drop(&mut self) {
        self.store.release(&self.dir);
    }
}

impl Store {
    /// Create a store with the default backends.
    pub fn new(config: Config) -> Self {
        Self::with_backends(config, Backends::default())
    }

    pub fn with_backends(config: Config, backends: Backends) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                backends,
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// Open an already-cloned repository. Returns [`Error::NotFound`] when
    /// no clone exists, so the caller can decide to clone instead.
    pub fn open(&self, vcs: Vcs, remote: &Url) -> Result<Opened, Error> {
        let dir = self.shared.config.clone_dir(vcs, remote)?;
        self.open_dir(&dir)
    }

    /// Clone a repository if no clone exists locally, otherwise open it.
    ///
    /// Clone attempts for the same directory are serialized by a
    /// per-directory lock; callers for distinct repositories never block
    /// each other, and the structural lock is never held while cloning.
    pub fn clone_remote(&self, spec: &CloneSpec) -> Result<Opened, Error> {
        let dir = self.shared.config.clone_dir(spec.vcs, &spec.remote)?;

        // Common case: the clone already exists. No locking needed.
        match self.open_dir(&dir) {
            Err(e) if e.is_not_found() => {}
            result => return result,
        }

        let lock = self.dir_lock(&dir);
        let _guard = lock.lock().expect("lock isn't poisoned");

        // Another caller may have finished the clone while we waited.
        match self.open_dir(&dir) {
            Err(e) if e.is_not_found() => {}
            result => {
                log::debug!(
                    "clone {}: repository appeared while waiting for the clone lock",
                    spec.remote
                );
                return result;
            }
        }

        let backend = self
            .shared
            .backends
            .get(spec.vcs)
            .ok_or(Error::UnsupportedVcs(spec.vcs))?;

        log::info!("cloning {} ({}) to {:?}..", spec.remote, spec.vcs, dir);
        let start = Instant::now();

        let parent = dir.parent().unwrap_or(&self.shared.config.storage_dir);
        fs::create_dir_all(parent)?;

        // Clone into a temporary sibling directory; if the executor fails,
        // the directory removes itself and the target is left untouched.
        let base = dir.file_name().unwrap_or_default().to_string_lossy();
        let tmp = tempfile::Builder::new()
            .prefix(&format!("_tmp_{base}-"))
            .tempdir_in(parent)?;

        backend.clone_remote(&spec.remote, tmp.path(), &spec.options)?;

        // The commit point: a same-volume rename makes the finished clone
        // visible atomically. Readers see either nothing or a complete
        // repository, never a partial one.
        let tmp = tmp.into_path();
        if let Err(e) = fs::rename(&tmp, &dir) {
            let _ = fs::remove_dir_all(&tmp);
            return Err(e.into());
        }

        log::info!(
            "cloned {} to {:?} in {:?}",
            spec.remote,
            dir,
            start.elapsed()
        );

        self.open_dir(&dir)
    }

    fn open_dir(&self, dir: &Path) -> Result<Opened, Error> {
        // Fast path: another holder already has this repository open.
        {
            let mut inner = self.lock_inner();
            if let Some(repo) = inner.repos.get(dir).cloned() {
                *inner
                    .users
                    .get_mut(dir)
                    .expect("every cached handle has a refcount") += 1;
                return Ok(self.opened(dir, repo));
            }
        }

        // Stat, detect and open without holding the structural lock, so
        // other store operations don't serialize on disk latency.
        let meta = fs::metadata(dir).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                Error::NotFound(dir.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        if !meta.is_dir() {
            return Err(Error::NotADirectory(dir.to_path_buf()));
        }

        let vcs = backend::detect(dir)?;
        let backend = self
            .shared
            .backends
            .get(vcs)
            .ok_or(Error::UnsupportedVcs(vcs))?;
        let repo = backend.open(dir)?;

        // Re-check under the structural lock: another opener may have raced
        // us. Exactly one handle wins; ours is discarded if we lost.
        let mut inner = self.lock_inner();
        *inner.users.entry(dir.to_path_buf()).or_insert(0) += 1;
        let repo = match inner.repos.get(dir) {
            Some(winner) => winner.clone(),
            None => {
                inner.repos.insert(dir.to_path_buf(), repo.clone());
                repo
            }
        };
        Ok(self.opened(dir, repo))
    }

    /// Release one holder's reference; evicts the handle when the count
    /// reaches zero. Called from [`Opened`]'s `Drop`, which keeps open and
    /// release balanced by construction.
    fn release(&self, dir: &Path) {
        let mut inner = self.lock_inner();
        let users = inner
            .users
            .get_mut(dir)
            .expect("release of a directory that was never opened");
        *users -= 1;
        if *users == 0 {
            inner.users.remove(dir);
            inner.repos.remove(dir);
        }
    }

    fn dir_lock(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut inner = self.lock_inner();
        inner.locks.entry(dir.to_path_buf()).or_default().clone()
    }

    fn opened(&self, dir: &Path, repo: Arc<dyn Repository>) -> Opened {
        Opened {
            repo,
            dir: dir.to_path_buf(),
            store: self.clone(),
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        self.shared.inner.lock().expect("lock isn't poisoned")
    }

    #[cfg(test)]
    fn refcount(&self, dir: &Path) -> Option<usize> {
        self.lock_inner().users.get(dir).copied()
    }

    #[cfg(test)]
    fn is_cached(&self, dir: &Path) -> bool {
        self.lock_inner().repos.contains_key(dir)
    }
}
