use std::path::Path;

use axum::body::Body;
use axum::http::{Method, Request};
use axum::Router;
use tower::ServiceExt;

use vcsd::backend::Vcs;
use vcsd::store::{Config, Store};

/// The remote URL every seeded repository pretends to be cloned from.
pub const REMOTE: &str = "https://example.com/hello-world.git";

/// Percent-encode a remote URL so it fits in a single path segment.
pub fn encoded(remote: &str) -> String {
    let mut out = String::new();
    for byte in remote.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

/// Create a store over `dir` with a bare repository for [`REMOTE`] already
/// in place, as if it had been cloned.
pub fn seed(dir: &Path) -> Store {
    let store = Store::new(Config::new(dir.to_path_buf()));
    let dir = store
        .config()
        .clone_dir(Vcs::Git, &REMOTE.parse().unwrap())
        .unwrap();

    std::fs::create_dir_all(&dir).unwrap();
    let repo = git2::Repository::init_bare(dir).unwrap();
    let blob = repo.blob(b"Hello World!\n").unwrap();
    let tree = {
        let mut builder = repo.treebuilder(None).unwrap();
        builder.insert("README", blob, 0o100644).unwrap();

        let oid = builder.write().unwrap();
        repo.find_tree(oid).unwrap()
    };
    let sig = git2::Signature::new(
        "Alice Liddell",
        "alice@example.com",
        &git2::Time::new(1673001014, 0),
    )
    .unwrap();
    repo.commit(
        Some("refs/heads/master"),
        &sig,
        &sig,
        "Initial commit\n",
        &tree,
        &[],
    )
    .unwrap();
    repo.set_head("refs/heads/master").unwrap();

    store
}

/// The seeded repository's head commit id.
pub fn head(store: &Store) -> String {
    let repo = store.open(Vcs::Git, &REMOTE.parse().unwrap()).unwrap();
    repo.resolve("master").unwrap()
}

pub async fn get(app: &Router, path: impl ToString) -> Response {
    Response(
        app.clone()
            .oneshot(request(path, Method::GET, None))
            .await
            .unwrap(),
    )
}

pub async fn post(app: &Router, path: impl ToString, body: Option<Body>) -> Response {
    Response(
        app.clone()
            .oneshot(request(path, Method::POST, body))
            .await
            .unwrap(),
    )
}

fn request(path: impl ToString, method: Method, body: Option<Body>) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(path.to_string())
        .header("Content-Type", "application/json")
        .body(body.unwrap_or_else(Body::empty))
        .unwrap()
}

pub struct Response(axum::response::Response);

impl Response {
    pub fn status(&self) -> axum::http::StatusCode {
        self.0.status()
    }

    pub async fn json(self) -> serde_json::Value {
        let body = self.body().await;
        serde_json::from_slice(&body).unwrap()
    }

    pub async fn body(self) -> axum::body::Bytes {
        axum::body::to_bytes(self.0.into_body(), usize::MAX)
            .await
            .unwrap()
    }
}
