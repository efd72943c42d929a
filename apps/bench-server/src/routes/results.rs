use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::put;
use axum::{Json, Router};
use serde::Serialize;

use crate::api::{BenchmarkReport, CompletionReport};
use crate::error::map_db_error;
use crate::services::ingest::IngestError;
use crate::state::AppState;

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ResultsResponse {
    pub recorded_measurements: u64,
    pub recorded_profiles: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CompletionResponse {
    pub completed_trials: u64,
}

fn map_ingest_error(err: IngestError) -> (StatusCode, String) {
    match err {
        IngestError::InvalidTimestamp(_)
        | IngestError::MissingEndTime
        | IngestError::UnknownCriterion(_) => (StatusCode::BAD_REQUEST, err.to_string()),
        IngestError::Db(err) => map_db_error(err),
    }
}

pub(crate) async fn put_results(
    State(state): State<AppState>,
    Json(report): Json<BenchmarkReport>,
) -> Result<(StatusCode, Json<ResultsResponse>), (StatusCode, String)> {
    let (recorded_measurements, recorded_profiles) = state
        .ingest
        .record_all_data(&report, false)
        .await
        .map_err(map_ingest_error)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(ResultsResponse {
            recorded_measurements,
            recorded_profiles,
        }),
    ))
}

pub(crate) async fn put_completion(
    State(state): State<AppState>,
    Json(completion): Json<CompletionReport>,
) -> Result<Json<CompletionResponse>, (StatusCode, String)> {
    let completed_trials = state
        .ingest
        .record_completion(&completion)
        .await
        .map_err(map_ingest_error)?;
    if completed_trials == 0 {
        return Err((
            StatusCode::NOT_FOUND,
            format!(
                "No open trials for experiment '{}' in project '{}'",
                completion.experiment_name, completion.project_name
            ),
        ));
    }
    Ok(Json(CompletionResponse { completed_trials }))
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/results", put(put_results))
        .route("/completion", put(put_completion))
}
