//! Drive the Job state machine by polling the Queue and running attempts
//! against the OCR and LLM collaborators.
use std::future::ready;
use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use envconfig::Envconfig;
use sqlx::postgres::PgPoolOptions;

use health::HealthRegistry;
use ocrbase_common::blob::{BlobStore, ObjectStoreBlobStore};
use ocrbase_common::bus::EventBus;
use ocrbase_common::collaborators::{HttpLlmCollaborator, HttpOcrCollaborator};
use ocrbase_common::metrics::{serve, setup_metrics_router};
use ocrbase_common::queue::PgQueue;
use ocrbase_common::schema::PgSchemaRegistry;
use ocrbase_common::store::PgJobStore;
use ocrbase_worker::config::Config;
use ocrbase_worker::error::WorkerError;
use ocrbase_worker::worker::{JobProcessor, JobWorker};

#[tokio::main]
async fn main() -> Result<(), WorkerError> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env().expect("Invalid configuration:");

    let liveness = HealthRegistry::new("liveness");
    let worker_liveness = liveness
        .register("worker".to_string(), time::Duration::seconds(60))
        .await;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_pg_connections)
        .acquire_timeout(Duration::from_secs(10))
        .connect(&config.database_url)
        .await
        .expect("failed to connect to postgres");

    let store = Arc::new(PgJobStore::new(pool.clone()));
    let queue = Arc::new(PgQueue::new(pool.clone(), config.queue_name.as_str()));
    let schemas = Arc::new(PgSchemaRegistry::new(pool));
    let bus = EventBus::new();

    let blob: Arc<dyn BlobStore> = match config.blob_backend.as_str() {
        "memory" => Arc::new(ObjectStoreBlobStore::in_memory()),
        "local" => {
            let root = object_store::local::LocalFileSystem::new_with_prefix(&config.blob_local_root)
                .expect("failed to initialize local blob backend");
            Arc::new(ObjectStoreBlobStore::new(Arc::new(root), None))
        }
        other => panic!("unknown BLOB_BACKEND {other:?}, expected \"memory\" or \"local\""),
    };

    let processor = JobProcessor {
        store,
        blob,
        bus,
        ocr: Arc::new(HttpOcrCollaborator::new(
            config.ocr_endpoint.clone(),
            config.request_timeout.0,
        )),
        llm: Arc::new(HttpLlmCollaborator::new(
            config.llm_endpoint.clone(),
            config.llm_model.clone(),
            config.request_timeout.0,
        )),
        schemas,
        http: reqwest::Client::builder()
            .timeout(config.request_timeout.0)
            .build()
            .expect("failed to construct reqwest client"),
    };

    let worker = JobWorker::new(
        config.worker_name.clone(),
        queue,
        processor,
        config.poll_interval.0,
        config.attempt_deadline.0,
        config.max_concurrent_jobs,
        worker_liveness,
    );

    let router = Router::new()
        .route("/", get(index))
        .route("/_readiness", get(index))
        .route("/_liveness", get(move || ready(liveness.get_status())));
    let router = router.merge(setup_metrics_router());
    let bind = config.bind();
    tokio::task::spawn(async move {
        serve(router, &bind)
            .await
            .expect("failed to start serving metrics");
    });

    worker.run().await;

    Ok(())
}

pub async fn index() -> &'static str {
    "ocrbase worker"
}
