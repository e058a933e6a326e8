use axum::{middleware, routing, Router};
use tower_http::limit::RequestBodyLimitLayer;

use crate::auth::auth_middleware;
use crate::state::AppState;

use super::{jobs, realtime, submission};

/// Assembles the Submission API + Realtime Gateway routes: index/readiness/
/// liveness probes plus a body-size-limited group covering the pipeline's
/// six endpoints.
pub fn add_routes(router: Router, state: AppState) -> Router {
    let authenticated = Router::new()
        .route("/v1/parse", routing::post(submission::parse))
        .route("/v1/extract", routing::post(submission::extract))
        .route("/v1/uploads/presign", routing::post(submission::presign))
        .route(
            "/v1/uploads/:job_id/complete",
            routing::post(submission::complete),
        )
        .route("/v1/jobs/:id", routing::get(jobs::get_job))
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(RequestBodyLimitLayer::new(state.max_body_bytes));

    // The Realtime Gateway authenticates itself (it also accepts `api_key`
    // as a query parameter), so it sits outside the shared auth middleware.
    let realtime_routes = Router::new()
        .route("/v1/realtime", routing::get(realtime::sse))
        .route("/v1/realtime/ws", routing::get(realtime::ws));

    router
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(readiness))
        .route("/_liveness", routing::get(index))
        .merge(authenticated)
        .merge(realtime_routes)
        .with_state(state)
}

pub async fn index() -> &'static str {
    "ocrbase api"
}

async fn readiness(
    axum::extract::State(state): axum::extract::State<AppState>,
) -> Result<&'static str, axum::http::StatusCode> {
    sqlx::query("SELECT 1")
        .execute(&state.pg_pool)
        .await
        .map_err(|_| axum::http::StatusCode::SERVICE_UNAVAILABLE)?;
    Ok("ok")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use std::sync::Arc;
    use tower::ServiceExt;

    use crate::auth::StaticAuthService;
    use ocrbase_common::blob::ObjectStoreBlobStore;
    use ocrbase_common::bus::EventBus;

    #[sqlx::test(migrations = "../migrations")]
    async fn index_returns_ok(pool: sqlx::PgPool) {
        let state = AppState {
            store: Arc::new(ocrbase_common::store::PgJobStore::new(pool.clone())),
            blob: Arc::new(ObjectStoreBlobStore::in_memory()),
            bus: EventBus::new(),
            queue: Arc::new(ocrbase_common::queue::PgQueue::new(pool.clone(), "default")),
            schemas: Arc::new(ocrbase_common::schema::PgSchemaRegistry::new(pool.clone())),
            auth: Arc::new(StaticAuthService),
            pg_pool: pool,
            max_body_bytes: 1_000_000,
            presign_ttl_secs: 900,
            default_max_attempts: 3,
            sse_keepalive: std::time::Duration::from_secs(25),
        };

        let app = add_routes(Router::new(), state);
        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
    }
}
