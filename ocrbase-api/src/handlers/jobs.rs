//! `GET /v1/jobs/{id}`: a point-in-time snapshot of a job's Job Store row.

use axum::extract::{Path, State};
use axum::{Extension, Json};

use ocrbase_common::job::{Job, JobId};
use ocrbase_common::store::JobStore as _;

use crate::auth::AuthContext;
use crate::error::{ApiError, Result};
use crate::state::AppState;

pub async fn get_job(
    State(state): State<AppState>,
    Extension(auth): Extension<AuthContext>,
    Path(job_id): Path<JobId>,
) -> Result<Json<Job>> {
    let job = state.store.get(&job_id).await?;
    if job.tenant_id != auth.tenant_id {
        // Cross-tenant access reports 404, not 403: the Submission API never
        // confirms a job id exists to a caller outside its tenant.
        return Err(ApiError::NotFound(job_id.0));
    }
    Ok(Json(job))
}
