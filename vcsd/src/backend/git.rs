//! The git backend.
//!
//! Repositories are read with `git2`; cloning shells out to the `git`
//! binary, which owns the network transport, credentials and protocol
//! negotiation.
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use url::Url;

use super::{
    Backend, Branch, CloneError, Commit, CommitsOptions, EntryKind, RepoError, Repository,
    Signature, Tag, TransportOptions, TreeEntry, Vcs,
};

pub struct GitBackend;

impl Backend for GitBackend {
    fn open(&self, dir: &Path) -> Result<Arc<dyn Repository>, RepoError> {
        let repo = git2::Repository::open(dir)?;

        Ok(Arc::new(GitRepository {
            path: dir.to_path_buf(),
            inner: Mutex::new(repo),
        }))
    }

    fn clone_remote(
        &self,
        remote: &Url,
        dir: &Path,
        options: &TransportOptions,
    ) -> Result<(), CloneError> {
        for key in options.keys() {
            if key != "depth" {
                return Err(CloneError::UnsupportedOption(key.to_owned()));
            }
        }

        let mut cmd = Command::new("git");
        cmd.arg("clone");
        match options.get("depth") {
            // `--depth` is incompatible with `--mirror`.
            Some(depth) => {
                cmd.args(["--bare", "--depth", depth]);
            }
            None => {
                cmd.arg("--mirror");
            }
        }
        cmd.arg(remote.as_str())
            .arg(dir)
            .env("GIT_TERMINAL_PROMPT", "0");

        log::debug!("running {cmd:?}");

        let output = cmd.output()?;
        if !output.status.success() {
            return Err(CloneError::CommandFailed {
                command: "git clone".to_owned(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_owned(),
            });
        }
        Ok(())
    }
}

/// A git repository handle. `git2::Repository` is not `Sync`, so all access
/// goes through an internal lock; the store shares one handle between all
/// concurrent holders.
pub struct GitRepository {
    path: PathBuf,
    inner: Mutex<git2::Repository>,
}

impl Repository for GitRepository {
    fn vcs(&self) -> Vcs {
        Vcs::Git
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn resolve(&self, rev: &str) -> Result<String, RepoError> {
        let repo = self.lock();
        let commit = lookup_commit(&repo, rev)?;

        Ok(commit.id().to_string())
    }

    fn branches(&self) -> Result<Vec<Branch>, RepoError> {
        let repo = self.lock();
        let mut branches = Vec::new();

        for branch in repo.branches(Some(git2::BranchType::Local))? {
            let (branch, _) = branch?;
            let Some(name) = branch.name()? else {
                continue;
            };
            let Some(head) = branch.get().target() else {
                continue;
            };
            branches.push(Branch {
                name: name.to_owned(),
                head: head.to_string(),
            });
        }
        branches.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(branches)
    }

    fn tags(&self) -> Result<Vec<Tag>, RepoError> {
        let repo = self.lock();
        let mut tags = Vec::new();

        for reference in repo.references_glob("refs/tags/*")? {
            let reference = reference?;
            let Some(name) = reference.shorthand() else {
                continue;
            };
            let commit = reference.peel_to_commit()?;
            tags.push(Tag {
                name: name.to_owned(),
                commit: commit.id().to_string(),
            });
        }
        tags.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(tags)
    }

    fn commit(&self, rev: &str) -> Result<Commit, RepoError> {
        let repo = self.lock();
        let commit = lookup_commit(&repo, rev)?;

        Ok(convert_commit(&commit))
    }

    fn commits(&self, head: &str, opts: CommitsOptions) -> Result<Vec<Commit>, RepoError> {
        let repo = self.lock();
        let start = lookup_commit(&repo, head)?.id();

        let mut walk = repo.revwalk()?;
        walk.push(start)?;

        let mut commits = Vec::new();
        for oid in walk.skip(opts.skip).take(opts.limit) {
            let commit = repo.find_commit(oid?)?;
            commits.push(convert_commit(&commit));
        }
        Ok(commits)
    }

    fn entry(&self, rev: &str, path: &str) -> Result<TreeEntry, RepoError> {
        let repo = self.lock();
        let commit = lookup_commit(&repo, rev)?;
        let tree = commit.tree()?;

        if path.is_empty() {
            return dir_entry(&repo, "", &tree);
        }

        let entry = tree
            .get_path(Path::new(path))
            .map_err(|e| not_found(e, path))?;
        let name = entry.name().unwrap_or_default().to_owned();

        match entry.kind() {
            Some(git2::ObjectType::Tree) => {
                let subtree = repo.find_tree(entry.id())?;
                dir_entry(&repo, &name, &subtree)
            }
            Some(git2::ObjectType::Blob) => {
                let blob = repo.find_blob(entry.id())?;
                Ok(file_entry(&name, entry.filemode(), &blob))
            }
            _ => Err(RepoError::NotFound(path.to_owned())),
        }
    }
}

impl GitRepository {
    fn lock(&self) -> std::sync::MutexGuard<'_, git2::Repository> {
        self.inner.lock().expect("lock isn't poisoned")
    }
}

fn lookup_commit<'r>(
    repo: &'r git2::Repository,
    rev: &str,
) -> Result<git2::Commit<'r>, RepoError> {
    let object = repo.revparse_single(rev).map_err(|e| not_found(e, rev))?;
    let commit = object.peel_to_commit().map_err(|e| not_found(e, rev))?;

    Ok(commit)
}

fn not_found(err: git2::Error, what: &str) -> RepoError {
    if err.code() == git2::ErrorCode::NotFound {
        RepoError::NotFound(what.to_owned())
    } else {
        RepoError::Git(err)
    }
}

fn convert_commit(commit: &git2::Commit) -> Commit {
    Commit {
        id: commit.id().to_string(),
        author: convert_signature(&commit.author()),
        committer: convert_signature(&commit.committer()),
        message: String::from_utf8_lossy(commit.message_bytes()).into_owned(),
        parents: commit.parent_ids().map(|id| id.to_string()).collect(),
    }
}

fn convert_signature(sig: &git2::Signature) -> Signature {
    Signature {
        name: String::from_utf8_lossy(sig.name_bytes()).into_owned(),
        email: String::from_utf8_lossy(sig.email_bytes()).into_owned(),
        time: sig.when().seconds(),
    }
}

const MODE_SYMLINK: i32 = 0o120000;

fn kind_of(filemode: i32) -> EntryKind {
    if filemode == MODE_SYMLINK {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

/// One level of a directory listing: child directories carry no nested
/// entries and child files no contents.
fn dir_entry(
    repo: &git2::Repository,
    name: &str,
    tree: &git2::Tree,
) -> Result<TreeEntry, RepoError> {
    let mut entries = Vec::with_capacity(tree.len());

    for entry in tree.iter() {
        let name = entry.name().unwrap_or_default().to_owned();
        match entry.kind() {
            Some(git2::ObjectType::Tree) => entries.push(TreeEntry {
                name,
                kind: EntryKind::Dir,
                size: 0,
                contents: None,
                entries: None,
            }),
            Some(git2::ObjectType::Blob) => {
                let blob = repo.find_blob(entry.id())?;
                entries.push(TreeEntry {
                    name,
                    kind: kind_of(entry.filemode()),
                    size: blob.content().len(),
                    contents: None,
                    entries: None,
                });
            }
            // Submodules and the like are not served.
            _ => continue,
        }
    }
    entries.sort_by(|a, b| {
        let dirs_first = (b.kind == EntryKind::Dir).cmp(&(a.kind == EntryKind::Dir));
        dirs_first.then_with(|| a.name.cmp(&b.name))
    });

    Ok(TreeEntry {
        name: name.to_owned(),
        kind: EntryKind::Dir,
        size: 0,
        contents: None,
        entries: Some(entries),
    })
}

fn file_entry(name: &str, filemode: i32, blob: &git2::Blob) -> TreeEntry {
    TreeEntry {
        name: name.to_owned(),
        kind: kind_of(filemode),
        size: blob.content().len(),
        contents: Some(String::from_utf8_lossy(blob.content()).into_owned()),
        entries: None,
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    /// Author a repository with two commits on `master`, a `dev` branch at
    /// the first commit and a `v1.0.0` tag at the second.
    fn fixture(dir: &Path) -> (git2::Oid, git2::Oid) {
        let repo = git2::Repository::init(dir).unwrap();

        let readme = repo.blob(b"Hello World!\n").unwrap();
        let mut root = repo.treebuilder(None).unwrap();
        root.insert("README", readme, 0o100644).unwrap();
        let tree = root.write().unwrap();
        let first = commit(&repo, tree, "Initial commit\n", &[]);

        let hello = repo.blob(b"Hello from dir1!\n").unwrap();
        let mut sub = repo.treebuilder(None).unwrap();
        sub.insert("hello.txt", hello, 0o100644).unwrap();
        let sub = sub.write().unwrap();

        let mut root = repo.treebuilder(None).unwrap();
        root.insert("README", readme, 0o100644).unwrap();
        root.insert("dir1", sub, 0o040000).unwrap();
        let tree = root.write().unwrap();

        let parent = repo.find_commit(first).unwrap();
        let second = commit(&repo, tree, "Add dir1\n", &[&parent]);

        repo.reference("refs/heads/dev", first, false, "").unwrap();
        repo.reference("refs/tags/v1.0.0", second, false, "").unwrap();
        repo.set_head("refs/heads/master").unwrap();

        (first, second)
    }

    fn commit(
        repo: &git2::Repository,
        tree: git2::Oid,
        message: &str,
        parents: &[&git2::Commit],
    ) -> git2::Oid {
        let tree = repo.find_tree(tree).unwrap();
        let time = git2::Time::new(1673001014, 0);
        let sig = git2::Signature::new("Alice Liddell", "alice@example.com", &time).unwrap();

        repo.commit(Some("refs/heads/master"), &sig, &sig, message, &tree, parents)
            .unwrap()
    }

    fn open(dir: &Path) -> Arc<dyn Repository> {
        GitBackend.open(dir).unwrap()
    }

    #[test]
    fn test_resolve() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = fixture(tmp.path());
        let repo = open(tmp.path());

        assert_eq!(repo.resolve("master").unwrap(), second.to_string());
        assert_eq!(repo.resolve("dev").unwrap(), first.to_string());
        assert!(repo.resolve("does-not-exist").unwrap_err().is_not_found());
    }

    #[test]
    fn test_branches() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = fixture(tmp.path());
        let repo = open(tmp.path());

        assert_eq!(
            repo.branches().unwrap(),
            vec![
                Branch {
                    name: "dev".to_owned(),
                    head: first.to_string()
                },
                Branch {
                    name: "master".to_owned(),
                    head: second.to_string()
                },
            ]
        );
    }

    #[test]
    fn test_tags() {
        let tmp = tempfile::tempdir().unwrap();
        let (_, second) = fixture(tmp.path());
        let repo = open(tmp.path());

        assert_eq!(
            repo.tags().unwrap(),
            vec![Tag {
                name: "v1.0.0".to_owned(),
                commit: second.to_string()
            }]
        );
    }

    #[test]
    fn test_commits_paging() {
        let tmp = tempfile::tempdir().unwrap();
        let (first, second) = fixture(tmp.path());
        let repo = open(tmp.path());

        let all = repo.commits("master", CommitsOptions::default()).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, second.to_string());
        assert_eq!(all[0].message, "Add dir1\n");
        assert_eq!(all[0].parents, vec![first.to_string()]);
        assert_eq!(all[0].author.name, "Alice Liddell");

        let page = repo
            .commits("master", CommitsOptions { skip: 1, limit: 1 })
            .unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, first.to_string());
    }

    #[test]
    fn test_root_listing_sorts_dirs_first() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let repo = open(tmp.path());

        let root = repo.entry("master", "").unwrap();
        let entries = root.entries.unwrap();
        let names = entries.iter().map(|e| e.name.as_str()).collect::<Vec<_>>();

        assert_eq!(names, vec!["dir1", "README"]);
        assert_eq!(entries[0].kind, EntryKind::Dir);
        assert_eq!(entries[1].kind, EntryKind::File);
        assert_eq!(entries[1].contents, None);
    }

    #[test]
    fn test_file_entry_carries_contents() {
        let tmp = tempfile::tempdir().unwrap();
        fixture(tmp.path());
        let repo = open(tmp.path());

        let file = repo.entry("master", "dir1/hello.txt").unwrap();
        assert_eq!(file.kind, EntryKind::File);
        assert_eq!(file.size, 17);
        assert_eq!(file.contents.as_deref(), Some("Hello from dir1!\n"));

        assert!(repo.entry("master", "nope").unwrap_err().is_not_found());
    }
}
