//! Compute the on-disk location of repositories.
//!
//! A repository's identity is the pair of its VCS type and its remote URL.
//! [`encode`] maps that pair to a relative filesystem path, deterministically
//! and without collisions between distinct remotes. The mapping is never
//! stored anywhere: it is recomputed from the identity on every access.
use std::path::PathBuf;

use url::Url;

use crate::backend::Vcs;

#[derive(Debug, thiserror::Error)]
pub enum EncodeError {
    /// Remote URLs must name a host; `file://` and the like are not
    /// repository identities.
    #[error("remote url {0} has no host")]
    MissingHost(Url),
}

/// Encode a repository identity as a relative path:
/// `<vcs>/<host[:port]>/<path segments…>`, with every segment escaped so it
/// is safe as a single path component on the local filesystem.
///
/// Pure and deterministic; two URLs naming the same canonical remote always
/// encode to the same path. Credentials in the URL do not participate, so
/// the same remote accessed with different credentials shares one clone.
pub fn encode(vcs: Vcs, remote: &Url) -> Result<PathBuf, EncodeError> {
    let host = remote
        .host_str()
        .ok_or_else(|| EncodeError::MissingHost(remote.clone()))?;

    let mut authority = host.to_owned();
    if let Some(port) = remote.port() {
        authority.push_str(&format!(":{port}"));
    }

    let mut path = PathBuf::from(vcs.to_string());
    path.push(escape(&authority));

    for segment in remote.path_segments().into_iter().flatten() {
        if segment.is_empty() {
            continue;
        }
        path.push(escape(segment));
    }
    Ok(path)
}

/// Escape a URL segment into a filesystem-safe path component. Bytes outside
/// `[A-Za-z0-9._-]` become `%XX`; since `%` itself is escaped, the mapping is
/// injective. Segments consisting only of dots are escaped entirely, so the
/// output can never contain a `.` or `..` component.
fn escape(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for byte in segment.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' => {
                out.push(byte as char);
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    if !out.is_empty() && out.bytes().all(|b| b == b'.') {
        out = out.replace('.', "%2E");
    }
    out
}
