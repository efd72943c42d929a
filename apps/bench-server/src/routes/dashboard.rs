use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde::Deserialize;

use crate::error::map_db_error;
use crate::services::ingest::meta::SourceRow;
use crate::services::queries::{
    self, ChangeRow, RevisionComparison, TableCount, TimelineDataRequest, TimelineResponse,
};
use crate::state::AppState;

pub(crate) async fn get_stats(
    State(state): State<AppState>,
) -> Result<Json<Vec<TableCount>>, (StatusCode, String)> {
    let counts = state
        .stats_cache
        .table_counts(&state.db)
        .await
        .map_err(map_db_error)?;
    Ok(Json(counts))
}

pub(crate) async fn get_changes(
    State(state): State<AppState>,
    Path(slug): Path<String>,
) -> Result<Json<Vec<ChangeRow>>, (StatusCode, String)> {
    let Some(project) = queries::project_by_slug(&state.db, &slug)
        .await
        .map_err(map_db_error)?
    else {
        return Err((StatusCode::NOT_FOUND, format!("Unknown project '{slug}'")));
    };
    let changes = queries::get_changes(&state.db, project.id)
        .await
        .map_err(map_db_error)?;
    Ok(Json(changes))
}

pub(crate) async fn get_compare(
    State(state): State<AppState>,
    Path((slug, base, change)): Path<(String, String, String)>,
) -> Result<Json<RevisionComparison>, (StatusCode, String)> {
    let comparison = queries::revisions_exist_in_project(&state.db, &slug, &base, &change)
        .await
        .map_err(map_db_error)?;
    match comparison {
        Some(comparison) => Ok(Json(comparison)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("No recorded trials for both {base} and {change} in '{slug}'"),
        )),
    }
}

/// Most recent commit on the project's base branch other than the one given;
/// the comparison view uses it when the client names only a change revision.
pub(crate) async fn get_baseline(
    State(state): State<AppState>,
    Path((slug, commit)): Path<(String, String)>,
) -> Result<Json<SourceRow>, (StatusCode, String)> {
    let Some(project) = queries::project_by_slug(&state.db, &slug)
        .await
        .map_err(map_db_error)?
    else {
        return Err((StatusCode::NOT_FOUND, format!("Unknown project '{slug}'")));
    };
    let baseline = queries::get_baseline_commit(&state.db, &project, &commit)
        .await
        .map_err(map_db_error)?;
    match baseline {
        Some(mut source) => {
            source.commit_message = queries::filter_commit_message(&source.commit_message);
            Ok(Json(source))
        }
        None => Err((
            StatusCode::NOT_FOUND,
            format!("No baseline data on the base branch of '{slug}'"),
        )),
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct BaseBranchRequest {
    pub base_branch: String,
}

pub(crate) async fn put_base_branch(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<BaseBranchRequest>,
) -> Result<StatusCode, (StatusCode, String)> {
    let updated = queries::set_project_base_branch(&state.db, &slug, &request.base_branch)
        .await
        .map_err(map_db_error)?;
    if updated == 0 {
        return Err((StatusCode::NOT_FOUND, format!("Unknown project '{slug}'")));
    }
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn post_timeline_data(
    State(state): State<AppState>,
    Path(slug): Path<String>,
    Json(request): Json<TimelineDataRequest>,
) -> Result<Json<TimelineResponse>, (StatusCode, String)> {
    let response = queries::get_timeline_data(&state.db, &slug, &request)
        .await
        .map_err(map_db_error)?;
    match response {
        Some(response) => Ok(Json(response)),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("Unknown project or revision for '{slug}'"),
        )),
    }
}

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_stats))
        .route("/projects/{slug}/changes", get(get_changes))
        .route("/projects/{slug}/compare/{base}/{change}", get(get_compare))
        .route("/projects/{slug}/baseline/{commit}", get(get_baseline))
        .route("/projects/{slug}/base-branch", put(put_base_branch))
        .route("/projects/{slug}/timeline-data", post(post_timeline_data))
}
