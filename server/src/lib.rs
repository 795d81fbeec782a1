use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{extract::DefaultBodyLimit, routing::get, routing::post, Router};
use kernel::{AssetStatus, ErrorBody, StoredAsset, UploadReceipt};
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::{
    classify::ServerErrorsFailureClass, limit::RequestBodyLimitLayer, trace::TraceLayer,
};
use tracing::Span;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;

pub mod addresser;
pub mod cache;
pub mod config;
pub mod disk;
pub mod domain;
pub mod error;
mod handlers;
pub mod reply;
pub mod sqlite;
pub mod transaction;
pub mod uploader;
pub mod writer;

use crate::cache::ListingCache;
use crate::config::StorageConfig;
use crate::domain::Storage;
use crate::error::UploadResult;
use crate::sqlite::{Mode, Sqlite};
use crate::uploader::Uploader;

const DB_FILE: &str = "egistore.db";
const CONFIG_FILE: &str = "egistore.toml";
const CURRENT_DIR: &str = "./";
const DEFAULT_PORT: u16 = 5000;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::upload_asset,
        handlers::get_asset,
        handlers::get_container_assets,
    ),
    components(schemas(UploadReceipt, StoredAsset, AssetStatus, ErrorBody)),
    tags(
        (name = "assets", description = "Asset upload and lookup"),
        (name = "containers", description = "Container listings")
    )
)]
pub struct ApiDoc;

/// State shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    db: Arc<PathBuf>,
    uploader: Arc<Uploader>,
    cache: Arc<ListingCache>,
}

impl AppState {
    pub fn new(db: PathBuf, config: &StorageConfig) -> UploadResult<Self> {
        let cache = Arc::new(ListingCache::new());
        let uploader = Uploader::from_config(db.clone(), config, cache.clone())?;
        Ok(Self::with_uploader(db, uploader, cache))
    }

    /// State around an uploader built elsewhere. The uploader is expected to invalidate
    /// `cache`.
    #[must_use]
    pub fn with_uploader(db: PathBuf, uploader: Uploader, cache: Arc<ListingCache>) -> Self {
        Self {
            db: Arc::new(db),
            uploader: Arc::new(uploader),
            cache,
        }
    }
}

/// Where the server keeps its data and how it is reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub db_file: String,
    pub port: u16,
    /// Storage config file, `egistore.toml` in the data dir when not set
    pub config: Option<PathBuf>,
}

impl Settings {
    /// Reads `EGISTORE_DATA_DIR`, `EGISTORE_DATA_FILE`, `EGISTORE_PORT` and `EGISTORE_CONFIG`.
    pub fn from_env() -> anyhow::Result<Self> {
        let dir = env::var("EGISTORE_DATA_DIR").unwrap_or_else(|_| String::from(CURRENT_DIR));
        let db_file = env::var("EGISTORE_DATA_FILE").unwrap_or_else(|_| String::from(DB_FILE));
        let port = match env::var("EGISTORE_PORT") {
            Ok(p) => p.parse()?,
            Err(_) => DEFAULT_PORT,
        };
        let config = env::var("EGISTORE_CONFIG").ok().map(PathBuf::from);
        Ok(Self::new(PathBuf::from(dir), db_file, port, config))
    }

    #[must_use]
    pub fn new(data_dir: PathBuf, db_file: String, port: u16, config: Option<PathBuf>) -> Self {
        Self {
            data_dir,
            db_file,
            port,
            config,
        }
    }

    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config
            .clone()
            .unwrap_or_else(|| self.data_dir.join(CONFIG_FILE))
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join(&self.db_file)
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "egistore=debug,server=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Start init
    let db = settings.db_path();
    Sqlite::open(&db, Mode::ReadWrite)?.new_database()?;
    let config = StorageConfig::load(&settings.config_path(), &settings.data_dir)?;
    let state = AppState::new(db, &config)?;

    let listener = TcpListener::bind(("0.0.0.0", settings.port)).await?;
    tracing::debug!("listening on {}", listener.local_addr()?);

    axum::serve(listener, create_routes(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

pub fn create_routes(state: AppState) -> Router {
    let body_limit = usize::try_from(state.uploader.max_bytes()).unwrap_or(usize::MAX);
    Router::new()
        .route(
            "/api/assets/:owner_id/:container_id/:file_name",
            post(handlers::upload_asset),
        )
        .route("/api/assets/:id", get(handlers::get_asset))
        .route(
            "/api/containers/:container_id",
            get(handlers::get_container_assets),
        )
        .route("/api-docs/openapi.json", get(handlers::openapi))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http().on_failure(
                    |error: ServerErrorsFailureClass, _latency: Duration, _span: &Span| {
                        tracing::error!("Server error: {error}");
                    },
                ))
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(body_limit))
                .into_inner(),
        )
        .with_state(state)
}

pub async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    tracing::info!("signal received, starting graceful shutdown");
}
