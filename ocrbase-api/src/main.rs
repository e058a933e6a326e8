//! Assembles the Submission API + Realtime Gateway behind the shared
//! `AppState`, mirroring how `ocrbase-worker`'s `main.rs`
//! wires its own collaborators and a metrics router side by side.
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use envconfig::Envconfig;
use eyre::{Result, WrapErr};
use sqlx::postgres::PgPoolOptions;

use ocrbase_api::auth::StaticAuthService;
use ocrbase_api::config::Config;
use ocrbase_api::handlers::app::add_routes;
use ocrbase_api::state::AppState;
use ocrbase_common::blob::{BlobStore, ObjectStoreBlobStore};
use ocrbase_common::bus::EventBus;
use ocrbase_common::metrics::setup_metrics_router;
use ocrbase_common::queue::PgQueue;
use ocrbase_common::schema::PgSchemaRegistry;
use ocrbase_common::store::PgJobStore;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().wrap_err("failed to load configuration from env")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .wrap_err("failed to connect to postgres")?;

    let blob: Arc<dyn BlobStore> = match config.blob_backend.as_str() {
        "memory" => Arc::new(ObjectStoreBlobStore::in_memory()),
        "local" => {
            let root = object_store::local::LocalFileSystem::new_with_prefix(&config.blob_local_root)
                .wrap_err("failed to initialize local blob backend")?;
            Arc::new(ObjectStoreBlobStore::new(
                Arc::new(root),
                config.blob_public_base_url.clone(),
            ))
        }
        other => eyre::bail!("unknown BLOB_BACKEND {other:?}, expected \"memory\" or \"local\""),
    };

    let state = AppState {
        store: Arc::new(PgJobStore::new(pool.clone())),
        blob,
        bus: EventBus::new(),
        queue: Arc::new(PgQueue::new(pool.clone(), config.queue_name.as_str())),
        schemas: Arc::new(PgSchemaRegistry::new(pool.clone())),
        auth: Arc::new(StaticAuthService),
        pg_pool: pool,
        max_body_bytes: config.max_body_bytes,
        presign_ttl_secs: config.presign_ttl_secs,
        default_max_attempts: config.default_max_attempts,
        sse_keepalive: config.sse_keepalive.0,
    };

    let app = add_routes(Router::new(), state);
    let app = app.merge(setup_metrics_router());

    let listener = tokio::net::TcpListener::bind(config.bind())
        .await
        .wrap_err("failed to bind listener")?;
    axum::serve(listener, app).await.wrap_err("ocrbase-api http server exited with an error")
}
