//! Read-side query surface: revision comparison, branch-baseline resolution,
//! timeline series, and the dashboard helpers (changes, table counts).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool, Postgres, QueryBuilder};

use crate::services::ingest::meta::{ProjectRow, SourceRow};
use crate::services::timeline::TOTAL_CRITERION;

/// Strips `Signed-off-by:` trailers, unescapes literal `\n` sequences, and
/// trims the result. Applied on the read side; the raw message stays in the
/// database.
pub fn filter_commit_message(message: &str) -> String {
    let stripped: Vec<&str> = message
        .lines()
        .map(|line| match line.find("Signed-off-by:") {
            Some(idx) => &line[..idx],
            None => line,
        })
        .collect();
    stripped.join("\n").replace("\\n", "\n").trim().to_string()
}

pub async fn project_by_slug(pool: &PgPool, slug: &str) -> Result<Option<ProjectRow>, sqlx::Error> {
    sqlx::query_as("SELECT id, name, slug, base_branch FROM project WHERE slug = $1")
        .bind(slug)
        .fetch_optional(pool)
        .await
}

/// Designates which branch supplies baseline data for the project.
pub async fn set_project_base_branch(
    pool: &PgPool,
    slug: &str,
    branch: &str,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query("UPDATE project SET base_branch = $2 WHERE slug = $1")
        .bind(slug)
        .bind(branch)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RevisionComparison {
    pub base: SourceRow,
    pub change: SourceRow,
}

/// Both commits must have recorded trials in the project; commit messages
/// come back filtered.
pub async fn revisions_exist_in_project(
    pool: &PgPool,
    slug: &str,
    base: &str,
    change: &str,
) -> Result<Option<RevisionComparison>, sqlx::Error> {
    let base_row = source_in_project(pool, slug, base).await?;
    let change_row = source_in_project(pool, slug, change).await?;
    match (base_row, change_row) {
        (Some(mut base), Some(mut change)) => {
            base.commit_message = filter_commit_message(&base.commit_message);
            change.commit_message = filter_commit_message(&change.commit_message);
            Ok(Some(RevisionComparison { base, change }))
        }
        _ => Ok(None),
    }
}

async fn source_in_project(
    pool: &PgPool,
    slug: &str,
    commit_id: &str,
) -> Result<Option<SourceRow>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT DISTINCT s.id, s.repo_url, s.branch_or_tag, s.commit_id, s.commit_message,
                        s.author_name, s.author_email, s.committer_name, s.committer_email
        FROM source s
        JOIN trial t ON t.source_id = s.id
        JOIN experiment e ON t.experiment_id = e.id
        JOIN project p ON e.project_id = p.id
        WHERE p.slug = $1 AND s.commit_id = $2
        "#,
    )
    .bind(slug)
    .bind(commit_id)
    .fetch_optional(pool)
    .await
}

/// Most recent source on the project's base branch other than the current
/// commit, by latest trial start time.
pub async fn get_baseline_commit(
    pool: &PgPool,
    project: &ProjectRow,
    current_commit: &str,
) -> Result<Option<SourceRow>, sqlx::Error> {
    let Some(base_branch) = project.base_branch.as_deref() else {
        return Ok(None);
    };
    sqlx::query_as(
        r#"
        SELECT s.id, s.repo_url, s.branch_or_tag, s.commit_id, s.commit_message,
               s.author_name, s.author_email, s.committer_name, s.committer_email
        FROM source s
        JOIN trial t ON t.source_id = s.id
        JOIN experiment e ON t.experiment_id = e.id
        WHERE e.project_id = $1
          AND s.branch_or_tag = $2
          AND s.commit_id <> $3
        ORDER BY t.start_time DESC
        LIMIT 1
        "#,
    )
    .bind(project.id)
    .bind(base_branch)
    .bind(current_commit)
    .fetch_optional(pool)
    .await
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineDataRequest {
    /// Commit id of the base revision.
    pub baseline: String,
    /// Commit id of the change revision, when comparing two branches.
    #[serde(default)]
    pub change: Option<String>,
    pub executor: String,
    pub suite: String,
    pub benchmark: String,
    #[serde(default)]
    pub var_value: Option<String>,
    #[serde(default)]
    pub cores: Option<String>,
    #[serde(default)]
    pub input_size: Option<String>,
    #[serde(default)]
    pub extra_args: Option<String>,
}

/// Columnar plot data: column 0 holds trial start timestamps (epoch
/// milliseconds); a baseline-only request carries three more columns
/// (bci95low, median, bci95up), a base+change request six.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineResponse {
    pub base_branch: String,
    pub change_branch: Option<String>,
    pub base_timestamp: Option<i64>,
    pub change_timestamp: Option<i64>,
    pub data: Vec<Vec<Option<f64>>>,
}

#[derive(Debug, Clone, FromRow)]
struct TimelineSeriesRow {
    start_time: DateTime<Utc>,
    branch_or_tag: String,
    commit_id: String,
    median: f64,
    bci95low: f64,
    bci95up: f64,
}

pub async fn get_timeline_data(
    pool: &PgPool,
    slug: &str,
    request: &TimelineDataRequest,
) -> Result<Option<TimelineResponse>, sqlx::Error> {
    let Some(project) = project_by_slug(pool, slug).await? else {
        return Ok(None);
    };
    let Some(base_source) = source_in_project(pool, slug, &request.baseline).await? else {
        return Ok(None);
    };
    let change_source = match request.change.as_deref() {
        Some(commit_id) => {
            let Some(source) = source_in_project(pool, slug, commit_id).await? else {
                return Ok(None);
            };
            Some(source)
        }
        None => None,
    };

    let base_branch = base_source.branch_or_tag.clone();
    let change_branch = change_source.map(|source| source.branch_or_tag);

    // The optional run filters are appended by position; every filter shape
    // is distinct SQL text and therefore a distinct cached plan.
    let mut qb = QueryBuilder::<Postgres>::new(
        r#"
        SELECT t.start_time, s.branch_or_tag, s.commit_id, tl.median, tl.bci95low, tl.bci95up
        FROM timeline tl
        JOIN trial t ON tl.trial_id = t.id
        JOIN source s ON t.source_id = s.id
        JOIN experiment e ON t.experiment_id = e.id
        JOIN run r ON tl.run_id = r.id
        JOIN benchmark b ON r.benchmark_id = b.id
        JOIN suite su ON r.suite_id = su.id
        JOIN executor x ON r.executor_id = x.id
        JOIN criterion c ON tl.criterion_id = c.id
        WHERE e.project_id = "#,
    );
    qb.push_bind(project.id);
    qb.push(" AND c.name = ").push_bind(TOTAL_CRITERION);
    qb.push(" AND b.name = ").push_bind(&request.benchmark);
    qb.push(" AND su.name = ").push_bind(&request.suite);
    qb.push(" AND x.name = ").push_bind(&request.executor);
    match change_branch.as_deref() {
        Some(branch) if branch != base_branch => {
            qb.push(" AND s.branch_or_tag IN (")
                .push_bind(&base_branch)
                .push(", ")
                .push_bind(branch)
                .push(")");
        }
        _ => {
            qb.push(" AND s.branch_or_tag = ").push_bind(&base_branch);
        }
    }
    if let Some(var_value) = &request.var_value {
        qb.push(" AND r.var_value = ").push_bind(var_value);
    }
    if let Some(cores) = &request.cores {
        qb.push(" AND r.cores = ").push_bind(cores);
    }
    if let Some(input_size) = &request.input_size {
        qb.push(" AND r.input_size = ").push_bind(input_size);
    }
    if let Some(extra_args) = &request.extra_args {
        qb.push(" AND r.extra_args = ").push_bind(extra_args);
    }
    qb.push(" ORDER BY t.start_time ASC");

    let rows: Vec<TimelineSeriesRow> = qb.build_query_as().fetch_all(pool).await?;
    Ok(Some(build_plot_data(
        &rows,
        &base_branch,
        change_branch.as_deref(),
        &request.baseline,
        request.change.as_deref(),
    )))
}

fn build_plot_data(
    rows: &[TimelineSeriesRow],
    base_branch: &str,
    change_branch: Option<&str>,
    baseline_commit: &str,
    change_commit: Option<&str>,
) -> TimelineResponse {
    let want_change = change_branch.is_some();
    let columns = if want_change { 7 } else { 4 };
    let mut data: Vec<Vec<Option<f64>>> = vec![Vec::with_capacity(rows.len()); columns];
    let mut base_timestamp = None;
    let mut change_timestamp = None;

    for row in rows {
        let timestamp = row.start_time.timestamp_millis();
        if row.commit_id == baseline_commit && base_timestamp.is_none() {
            base_timestamp = Some(timestamp);
        }
        if change_commit == Some(row.commit_id.as_str()) && change_timestamp.is_none() {
            change_timestamp = Some(timestamp);
        }

        data[0].push(Some(timestamp as f64));
        let base_values = if !want_change || row.branch_or_tag == base_branch {
            [Some(row.bci95low), Some(row.median), Some(row.bci95up)]
        } else {
            [None, None, None]
        };
        data[1].push(base_values[0]);
        data[2].push(base_values[1]);
        data[3].push(base_values[2]);
        if want_change {
            let change_values = if row.branch_or_tag != base_branch {
                [Some(row.bci95low), Some(row.median), Some(row.bci95up)]
            } else {
                [None, None, None]
            };
            data[4].push(change_values[0]);
            data[5].push(change_values[1]);
            data[6].push(change_values[2]);
        }
    }

    TimelineResponse {
        base_branch: base_branch.to_string(),
        change_branch: change_branch.map(|branch| branch.to_string()),
        base_timestamp,
        change_timestamp,
        data,
    }
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRow {
    pub commit_id: String,
    pub branch_or_tag: String,
    pub commit_message: String,
    pub start_time: DateTime<Utc>,
}

/// Distinct commits with recorded trials, most recent first.
pub async fn get_changes(pool: &PgPool, project_id: i32) -> Result<Vec<ChangeRow>, sqlx::Error> {
    let mut rows: Vec<ChangeRow> = sqlx::query_as(
        r#"
        SELECT s.commit_id, s.branch_or_tag, s.commit_message, MIN(t.start_time) AS start_time
        FROM source s
        JOIN trial t ON t.source_id = s.id
        JOIN experiment e ON t.experiment_id = e.id
        WHERE e.project_id = $1
        GROUP BY s.commit_id, s.branch_or_tag, s.commit_message
        ORDER BY start_time DESC
        "#,
    )
    .bind(project_id)
    .fetch_all(pool)
    .await?;
    for row in &mut rows {
        row.commit_message = filter_commit_message(&row.commit_message);
    }
    Ok(rows)
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableCount {
    pub table_name: String,
    pub row_count: i64,
}

pub async fn fetch_table_counts(pool: &PgPool) -> Result<Vec<TableCount>, sqlx::Error> {
    sqlx::query_as(
        r#"
        SELECT 'project' AS table_name, COUNT(*) AS row_count FROM project
        UNION ALL SELECT 'experiment', COUNT(*) FROM experiment
        UNION ALL SELECT 'source', COUNT(*) FROM source
        UNION ALL SELECT 'environment', COUNT(*) FROM environment
        UNION ALL SELECT 'unit', COUNT(*) FROM unit
        UNION ALL SELECT 'criterion', COUNT(*) FROM criterion
        UNION ALL SELECT 'executor', COUNT(*) FROM executor
        UNION ALL SELECT 'suite', COUNT(*) FROM suite
        UNION ALL SELECT 'benchmark', COUNT(*) FROM benchmark
        UNION ALL SELECT 'run', COUNT(*) FROM run
        UNION ALL SELECT 'trial', COUNT(*) FROM trial
        UNION ALL SELECT 'measurement', COUNT(*) FROM measurement
        UNION ALL SELECT 'profile_data', COUNT(*) FROM profile_data
        UNION ALL SELECT 'timeline', COUNT(*) FROM timeline
        UNION ALL SELECT 'timeline_calc_job', COUNT(*) FROM timeline_calc_job
        "#,
    )
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn commit_filter_strips_trailers_and_unescapes_newlines() {
        let raw = "Tune GC\\n\\nLess promotion.\nSigned-off-by: A <a@example.org>\n";
        assert_eq!(
            filter_commit_message(raw),
            "Tune GC\n\nLess promotion."
        );

        let mid_line = "Fix Signed-off-by: B <b@example.org>";
        assert_eq!(filter_commit_message(mid_line), "Fix");

        assert_eq!(filter_commit_message("  plain  "), "plain");
    }

    fn row(ts_secs: i64, branch: &str, commit: &str, median: f64) -> TimelineSeriesRow {
        TimelineSeriesRow {
            start_time: Utc.timestamp_opt(ts_secs, 0).single().unwrap(),
            branch_or_tag: branch.to_string(),
            commit_id: commit.to_string(),
            median,
            bci95low: median - 1.0,
            bci95up: median + 1.0,
        }
    }

    #[test]
    fn baseline_only_plot_has_four_columns() {
        let rows = vec![row(100, "main", "aaa", 10.0), row(200, "main", "bbb", 11.0)];
        let plot = build_plot_data(&rows, "main", None, "bbb", None);

        assert_eq!(plot.data.len(), 4);
        assert_eq!(plot.data[0].len(), 2);
        assert_eq!(plot.data[2], vec![Some(10.0), Some(11.0)]);
        assert_eq!(plot.base_timestamp, Some(200_000));
        assert_eq!(plot.change_timestamp, None);
    }

    #[test]
    fn base_and_change_plot_has_seven_columns_split_by_branch() {
        let rows = vec![
            row(100, "main", "aaa", 10.0),
            row(200, "feature", "ccc", 12.0),
            row(300, "main", "bbb", 11.0),
        ];
        let plot = build_plot_data(&rows, "main", Some("feature"), "aaa", Some("ccc"));

        assert_eq!(plot.data.len(), 7);
        assert_eq!(plot.data[2], vec![Some(10.0), None, Some(11.0)]);
        assert_eq!(plot.data[5], vec![None, Some(12.0), None]);
        assert_eq!(plot.base_timestamp, Some(100_000));
        assert_eq!(plot.change_timestamp, Some(200_000));
    }
}
