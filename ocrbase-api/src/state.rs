use std::sync::Arc;

use sqlx::PgPool;

use ocrbase_common::blob::BlobStore;
use ocrbase_common::bus::EventBus;
use ocrbase_common::queue::Queue;
use ocrbase_common::schema::SchemaRegistry;
use ocrbase_common::store::JobStore;

use crate::auth::AuthService;

/// Shared application state, cloned into every handler via axum's `State`
/// extractor. Every field is an `Arc`/`PgPool` (itself a connection pool
/// handle), so cloning is cheap — the same registry-ownership pattern
/// `agent_sync::app::AppState` follows.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn JobStore>,
    pub blob: Arc<dyn BlobStore>,
    pub bus: Arc<EventBus>,
    pub queue: Arc<dyn Queue>,
    pub schemas: Arc<dyn SchemaRegistry>,
    pub auth: Arc<dyn AuthService>,
    pub pg_pool: PgPool,
    pub max_body_bytes: usize,
    pub presign_ttl_secs: i64,
    pub default_max_attempts: i32,
    pub sse_keepalive: std::time::Duration,
}
