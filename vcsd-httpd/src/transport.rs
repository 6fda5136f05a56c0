//! Git smart-HTTP transport (fetch only).
//!
//! Serves the `git-upload-pack` side of the smart protocol straight from a
//! clone directory by shelling out to the `git` binary. Pushes are not
//! served: these clones are mirrors of their remotes.
use std::io::prelude::*;
use std::process::{Command, Stdio};
use std::{io, str};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use flate2::read::GzDecoder;
use serde::Deserialize;
use url::Url;

use vcsd::backend::Vcs;
use vcsd::store::Store;

use crate::error::Error;

const UPLOAD_PACK: &str = "git-upload-pack";

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/repos/git/:remote/info/refs", get(info_refs_handler))
        .route("/repos/git/:remote/git-upload-pack", post(upload_pack_handler))
        .with_state(store)
}

#[derive(Deserialize)]
struct ServiceQuery {
    service: Option<String>,
}

/// Ref advertisement for a fetch.
/// `GET /repos/git/:remote/info/refs?service=git-upload-pack`
async fn info_refs_handler(
    State(store): State<Store>,
    Path(remote): Path<String>,
    Query(query): Query<ServiceQuery>,
) -> impl IntoResponse {
    match query.service.as_deref() {
        Some(UPLOAD_PACK) => {}
        // Reject push requests.
        Some("git-receive-pack") => return Err(Error::ServiceUnavailable("git-receive-pack")),
        _ => return Err(Error::NotFound),
    }

    let remote = Url::parse(&remote)?;
    let repo = store.open(Vcs::Git, &remote)?;

    let output = Command::new("git")
        .args(["upload-pack", "--stateless-rpc", "--advertise-refs", "."])
        .current_dir(repo.path())
        .output()?;
    if !output.status.success() {
        tracing::error!("git upload-pack: exited with code {}", output.status);
        return Err(Error::Backend);
    }

    // The smart protocol requires a service announcement packet before the
    // advertised refs.
    let mut body = pkt_line(&format!("# service={UPLOAD_PACK}\n"));
    body.extend_from_slice(b"0000");
    body.extend_from_slice(&output.stdout);

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-git-upload-pack-advertisement"),
    );
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("no-cache"));

    Ok::<_, Error>((StatusCode::OK, headers, body))
}

/// The pack negotiation and transfer for a fetch.
/// `POST /repos/git/:remote/git-upload-pack`
async fn upload_pack_handler(
    State(store): State<Store>,
    Path(remote): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let remote = Url::parse(&remote)?;
    let repo = store.open(Vcs::Git, &remote)?;

    // Whether the request body is compressed.
    let gzip = matches!(
        headers.get(header::CONTENT_ENCODING).map(|h| h.to_str()),
        Some(Ok("gzip"))
    );

    let mut child = Command::new("git")
        .args(["upload-pack", "--stateless-rpc", "."])
        .current_dir(repo.path())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    {
        // This is safe because we captured the child's stdin.
        let mut stdin = child.stdin.take().unwrap();

        if gzip {
            let mut decoder = GzDecoder::new(&body[..]);
            io::copy(&mut decoder, &mut stdin)?;
        } else {
            stdin.write_all(&body)?;
        }
    }

    let output = child.wait_with_output()?;
    if !output.status.success() {
        tracing::error!("git upload-pack: exited with code {}", output.status);

        if let Ok(stderr) = str::from_utf8(&output.stderr) {
            tracing::error!("git upload-pack: stderr: {}", stderr.trim_end());
        }
        return Err(Error::Backend);
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-git-upload-pack-result"),
    );

    Ok::<_, Error>((StatusCode::OK, headers, output.stdout))
}

/// Frame a string as a git protocol pkt-line.
fn pkt_line(line: &str) -> Vec<u8> {
    format!("{:04x}{line}", line.len() + 4).into_bytes()
}

#[cfg(test)]
mod routes {
    use axum::http::StatusCode;
    use pretty_assertions::assert_eq;

    use crate::test::{self, get, REMOTE};

    #[test]
    fn test_pkt_line() {
        assert_eq!(
            super::pkt_line("# service=git-upload-pack\n"),
            b"001e# service=git-upload-pack\n"
        );
    }

    #[tokio::test]
    async fn test_info_refs_advertisement() {
        let tmp = tempfile::tempdir().unwrap();
        let app = super::router(test::seed(tmp.path()));

        let response = get(
            &app,
            format!(
                "/repos/git/{}/info/refs?service=git-upload-pack",
                test::encoded(REMOTE)
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = response.body().await;
        assert!(body.starts_with(b"001e# service=git-upload-pack\n0000"));
        assert!(body.windows(17).any(|w| w == b"refs/heads/master"));
    }

    #[tokio::test]
    async fn test_push_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let app = super::router(test::seed(tmp.path()));

        let response = get(
            &app,
            format!(
                "/repos/git/{}/info/refs?service=git-receive-pack",
                test::encoded(REMOTE)
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_info_refs_for_unknown_repo_returns_404() {
        let tmp = tempfile::tempdir().unwrap();
        let app = super::router(test::seed(tmp.path()));

        let response = get(
            &app,
            format!(
                "/repos/git/{}/info/refs?service=git-upload-pack",
                test::encoded("https://example.com/unknown.git")
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
