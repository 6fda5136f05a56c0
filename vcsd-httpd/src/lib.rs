pub mod error;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use std::{fs, str};

use anyhow::Context as _;
use axum::body::Body;
use axum::http::header::CONTENT_TYPE;
use axum::http::{Method, Request, Response};
use axum::Router;
use tower_http::cors::{self, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::Span;

use vcsd::store::{Config, Store};

mod api;
#[cfg(test)]
mod test;
mod transport;

#[derive(Debug, Clone)]
pub struct Options {
    pub listen: SocketAddr,
    pub storage_dir: PathBuf,
}

/// Run the Server.
pub async fn run(options: Options) -> anyhow::Result<()> {
    let git_version = Command::new("git")
        .arg("version")
        .output()
        .context("'git' command must be available")?
        .stdout;

    tracing::info!("{}", str::from_utf8(&git_version)?.trim());

    fs::create_dir_all(&options.storage_dir).with_context(|| {
        format!(
            "failed to create storage directory {:?}",
            options.storage_dir
        )
    })?;
    tracing::info!("storing repositories under {:?}", options.storage_dir);

    let store = Store::new(Config::new(options.storage_dir));
    let app = router(store)
        .layer(
            CorsLayer::new()
                .max_age(Duration::from_secs(86400))
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers([CONTENT_TYPE]),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|request: &Request<Body>| {
                    tracing::info_span!("request", method = %request.method(), uri = %request.uri())
                })
                .on_response(
                    |response: &Response<Body>, latency: Duration, _span: &Span| {
                        tracing::info!("{} {:?}", response.status(), latency);
                    },
                ),
        );

    tracing::info!("listening on http://{}", options.listen);

    let listener = tokio::net::TcpListener::bind(options.listen).await?;
    axum::serve(listener, app).await.map_err(anyhow::Error::from)
}

/// Create a router consisting of other sub-routers.
fn router(store: Store) -> Router {
    Router::new()
        .merge(api::router(store.clone()))
        .merge(transport::router(store))
}

pub mod logger {
    use tracing::dispatcher::Dispatch;

    pub fn init() -> Result<(), tracing::subscriber::SetGlobalDefaultError> {
        tracing::dispatcher::set_global_default(Dispatch::new(subscriber()))
    }

    #[cfg(feature = "logfmt")]
    pub fn subscriber() -> impl tracing::Subscriber {
        use tracing_subscriber::layer::SubscriberExt as _;
        use tracing_subscriber::EnvFilter;

        tracing_subscriber::Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(tracing_logfmt::layer())
    }

    #[cfg(not(feature = "logfmt"))]
    pub fn subscriber() -> impl tracing::Subscriber {
        tracing_subscriber::FmtSubscriber::builder()
            .with_target(false)
            .finish()
    }
}
