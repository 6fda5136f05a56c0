use axum::extract::{Path, Query, State};
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use vcsd::backend::{CommitsOptions, TransportOptions, Vcs};
use vcsd::store::{CloneSpec, Opened, Store};

use crate::error::Error;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Commit data keyed by a branch or abbreviated revision may move.
const CACHE_SHORT: &str = "public, max-age=60, must-revalidate";
/// Commit data keyed by its full id never changes.
const CACHE_LONG: &str = "public, max-age=86400, immutable";

pub fn router(store: Store) -> Router {
    Router::new()
        .route("/", get(root_handler))
        .route("/repos/:vcs/:remote", get(repo_handler).post(clone_handler))
        .route("/repos/:vcs/:remote/branches", get(branches_handler))
        .route("/repos/:vcs/:remote/tags", get(tags_handler))
        .route("/repos/:vcs/:remote/commits", get(commits_handler))
        .route("/repos/:vcs/:remote/commits/:rev", get(commit_handler))
        .route("/repos/:vcs/:remote/tree/:rev/", get(tree_root_handler))
        .route("/repos/:vcs/:remote/tree/:rev/*path", get(tree_handler))
        .with_state(store)
}

/// Service info.
/// `GET /`
async fn root_handler() -> impl IntoResponse {
    let response = json!({
        "service": "vcsd",
        "version": VERSION,
        "links": [
            { "href": "/repos/:vcs/:remote", "rel": "repository", "type": "GET" },
        ]
    });

    Json(response)
}

/// Parse the `:vcs` and `:remote` path segments. The remote URL arrives
/// percent-encoded as a single segment; axum decodes it.
fn parse_repo(vcs: &str, remote: &str) -> Result<(Vcs, Url), Error> {
    let vcs = vcs.parse::<Vcs>()?;
    let remote = Url::parse(remote)?;

    Ok((vcs, remote))
}

fn repo_info(vcs: Vcs, remote: &Url, repo: &Opened) -> serde_json::Value {
    json!({
        "vcs": vcs,
        "remote": remote,
        "path": repo.dir(),
    })
}

/// Repository info.
/// `GET /repos/:vcs/:remote`
async fn repo_handler(
    State(store): State<Store>,
    Path((vcs, remote)): Path<(String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;

    Ok::<_, Error>(Json(repo_info(vcs, &remote, &repo)))
}

/// Clone a repository, or open it if a clone already exists.
/// `POST /repos/:vcs/:remote`
async fn clone_handler(
    State(store): State<Store>,
    Path((vcs, remote)): Path<(String, String)>,
    options: Option<Json<TransportOptions>>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let spec = CloneSpec {
        vcs,
        remote: remote.clone(),
        options: options.map(|Json(o)| o).unwrap_or_default(),
    };

    // A clone can take minutes; keep it off the async workers.
    let repo = tokio::task::spawn_blocking(move || store.clone_remote(&spec)).await??;

    Ok::<_, Error>(Json(repo_info(vcs, &remote, &repo)))
}

/// List local branches.
/// `GET /repos/:vcs/:remote/branches`
async fn branches_handler(
    State(store): State<Store>,
    Path((vcs, remote)): Path<(String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;
    let branches = repo.branches()?;

    Ok::<_, Error>(Json(branches))
}

/// List tags.
/// `GET /repos/:vcs/:remote/tags`
async fn tags_handler(
    State(store): State<Store>,
    Path((vcs, remote)): Path<(String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;
    let tags = repo.tags()?;

    Ok::<_, Error>(Json(tags))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitsQuery {
    head: Option<String>,
    page: Option<usize>,
    per_page: Option<usize>,
}

/// The commit log reachable from `head`, paged.
/// `GET /repos/:vcs/:remote/commits?head=<rev>&page=&perPage=`
async fn commits_handler(
    State(store): State<Store>,
    Path((vcs, remote)): Path<(String, String)>,
    Query(qs): Query<CommitsQuery>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let head = qs.head.unwrap_or_else(|| String::from("HEAD"));
    let per_page = qs.per_page.unwrap_or(30);
    let opts = CommitsOptions {
        skip: qs.page.unwrap_or(0) * per_page,
        limit: per_page,
    };

    let repo = store.open(vcs, &remote)?;
    let commits = repo.commits(&head, opts)?;

    Ok::<_, Error>(Json(commits))
}

/// A single commit.
/// `GET /repos/:vcs/:remote/commits/:rev`
async fn commit_handler(
    State(store): State<Store>,
    Path((vcs, remote, rev)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;
    let commit = repo.commit(&rev)?;

    // Responses for a full commit id are immutable and can be cached hard.
    let cache = if rev == commit.id { CACHE_LONG } else { CACHE_SHORT };

    Ok::<_, Error>(([(header::CACHE_CONTROL, cache)], Json(commit)))
}

/// The root tree at a revision.
/// `GET /repos/:vcs/:remote/tree/:rev/`
async fn tree_root_handler(
    State(store): State<Store>,
    Path((vcs, remote, rev)): Path<(String, String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;
    let entry = repo.entry(&rev, "")?;

    Ok::<_, Error>(Json(entry))
}

/// A tree entry (directory listing or file contents) at a revision.
/// `GET /repos/:vcs/:remote/tree/:rev/*path`
async fn tree_handler(
    State(store): State<Store>,
    Path((vcs, remote, rev, path)): Path<(String, String, String, String)>,
) -> impl IntoResponse {
    let (vcs, remote) = parse_repo(&vcs, &remote)?;
    let repo = store.open(vcs, &remote)?;
    let entry = repo.entry(&rev, &path)?;

    Ok::<_, Error>(Json(entry))
}
