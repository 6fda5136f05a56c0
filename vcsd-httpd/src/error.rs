use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

use vcsd::backend::{RepoError, UnknownVcs};
use vcsd::store;

/// Errors relating to the HTTP frontend.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The repository, revision or path was not found.
    #[error("not found")]
    NotFound,

    /// Unknown VCS type in the request path.
    #[error(transparent)]
    Vcs(#[from] UnknownVcs),

    /// The remote is not a valid URL.
    #[error("invalid remote url: {0}")]
    RemoteUrl(#[from] url::ParseError),

    /// The requested git service is not served here.
    #[error("service '{0}' not available")]
    ServiceUnavailable(&'static str),

    /// Store error.
    #[error(transparent)]
    Store(store::Error),

    /// Repository read error.
    #[error(transparent)]
    Repo(RepoError),

    /// Git transport error.
    #[error("backend error")]
    Backend,

    /// A blocking task failed to complete.
    #[error(transparent)]
    Join(#[from] tokio::task::JoinError),

    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else {
            Self::Store(err)
        }
    }
}

impl From<RepoError> for Error {
    fn from(err: RepoError) -> Self {
        if err.is_not_found() {
            Self::NotFound
        } else {
            Self::Repo(err)
        }
    }
}

impl Error {
    pub fn status(&self) -> StatusCode {
        match self {
            Error::NotFound => StatusCode::NOT_FOUND,
            Error::Vcs(_) | Error::RemoteUrl(_) => StatusCode::BAD_REQUEST,
            Error::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            tracing::error!("Error: {:?}", &self);
        }

        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16()
        }));

        (status, body).into_response()
    }
}
