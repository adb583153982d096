use std::sync::Arc;

use axum::{
    Router,
    http::{HeaderValue, Method, header},
};
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info};

use crate::{
    config::Config,
    create_app,
    identity::InstanceId,
    room::RoomDirectory,
    stats::StatsHandle,
    store::{BlobStore, FsBlobStore, FsKvStore, KvStore, MemoryBlobStore, MemoryKvStore, StoreError},
    ws::Keepalive,
};

/// Shared handles passed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub rooms: Arc<RoomDirectory>,
    pub stats: StatsHandle,
    pub blobs: Arc<dyn BlobStore>,
    pub keepalive: Keepalive,
}

pub struct App {
    config: Config,
    state: AppState,
}

impl App {
    /// Opens the configured stores (filesystem under `DATA_DIR`, otherwise
    /// in memory) and starts the stats actor.
    pub async fn new(config: Config) -> Result<Self, StoreError> {
        let (blobs, kv): (Arc<dyn BlobStore>, Arc<dyn KvStore>) = match &config.data_dir {
            Some(dir) => {
                info!(data_dir = %dir.display(), "Using filesystem stores");
                let blobs = FsBlobStore::open(dir.join("blobs")).await?;
                let kv = FsKvStore::open(dir.join("kv"), &InstanceId::global_stats()).await?;
                (Arc::new(blobs), Arc::new(kv))
            }
            None => {
                info!("Using in-memory stores");
                (Arc::new(MemoryBlobStore::new()), Arc::new(MemoryKvStore::new()))
            }
        };
        Self::with_stores(config, blobs, kv).await
    }

    pub async fn with_stores(
        config: Config,
        blobs: Arc<dyn BlobStore>,
        kv: Arc<dyn KvStore>,
    ) -> Result<Self, StoreError> {
        let stats = StatsHandle::spawn(kv, config.stats_settings()).await?;
        let rooms = Arc::new(RoomDirectory::new(
            Arc::clone(&blobs),
            stats.clone(),
            config.room_settings(),
        ));
        let state = AppState {
            rooms,
            stats,
            blobs,
            keepalive: Keepalive {
                interval: config.ws_ping_interval,
                timeout: config.ws_ping_timeout,
            },
        };
        Ok(Self { config, state })
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn router(&self) -> Router {
        create_app(self.state.clone(), &self.config)
    }

    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(self.config.server_addr).await?;
        self.serve(listener).await?;
        Ok(())
    }

    pub async fn serve(&self, listener: TcpListener) -> std::io::Result<()> {
        info!("Server running on http://{}", listener.local_addr()?);
        match axum::serve(listener, self.router()).await {
            Ok(()) => {
                info!("Server shut down gracefully");
                Ok(())
            }
            Err(e) => {
                error!("Server error: {}", e);
                Err(e)
            }
        }
    }
}

/// An empty allow-list admits any origin, without credentials.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!(%origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    if origins.is_empty() {
        cors.allow_origin(Any)
    } else {
        cors.allow_origin(AllowOrigin::list(origins))
            .allow_credentials(true)
    }
}
