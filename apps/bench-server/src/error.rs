use axum::http::StatusCode;

/// Postgres unique_violation. The ingest path treats it as "another ingester
/// got there first" and recovers by re-fetching.
pub fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

/// Broken references or malformed values in benchmark data. The payload is
/// the client's to fix; retrying the same report will not help.
fn is_rejected_data(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db)
            if matches!(db.code().as_deref(), Some("23503") | Some("23502") | Some("22P02"))
    )
}

/// Maps a database failure that reached the response boundary. Conflicts and
/// rejected data are the client's problem; anything else is ours, and the
/// report stays retryable because ingestion is idempotent.
pub fn map_db_error(err: sqlx::Error) -> (StatusCode, String) {
    if matches!(err, sqlx::Error::RowNotFound) {
        tracing::warn!(error = %err, "lookup missed");
        return (StatusCode::NOT_FOUND, "No matching record".to_string());
    }
    if is_unique_violation(&err) {
        tracing::warn!(error = %err, "conflicting insert escaped the dedup path");
        return (StatusCode::CONFLICT, "Already recorded".to_string());
    }
    if is_rejected_data(&err) {
        tracing::warn!(error = %err, "benchmark data rejected by the store");
        return (
            StatusCode::BAD_REQUEST,
            "Benchmark data rejected".to_string(),
        );
    }

    tracing::error!(error = %err, "database failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        "Database failure; the report can be resubmitted".to_string(),
    )
}
