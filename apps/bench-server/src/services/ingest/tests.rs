use super::*;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::env;
use tokio_util::sync::CancellationToken;

use crate::api::{
    BenchmarkReport, BenchmarkSpec, CriterionSpec, DataPoint, EnvSpec, ExecutorSpec,
    MeasurementValue, RunGroup, RunSpec, SourceSpec, SuiteSpec,
};
use crate::db;
use crate::services::queries;
use crate::services::timeline::TimelineUpdater;
use crate::services::validity::StatsCache;

#[test]
fn dedup_oracle_covers_up_to_the_stored_iteration() {
    let mut by_invocation = HashMap::new();
    by_invocation.insert(1, 3);
    let mut by_criterion = HashMap::new();
    by_criterion.insert(7, by_invocation);
    let mut by_run = HashMap::new();
    by_run.insert(42, by_criterion);
    let available = AvailableMeasurements(by_run);

    assert!(available.covers(42, 7, 1, 1));
    assert!(available.covers(42, 7, 1, 3));
    assert!(!available.covers(42, 7, 1, 4));
    assert!(!available.covers(42, 7, 2, 1));
    assert!(!available.covers(42, 8, 1, 1));
    assert!(!available.covers(43, 7, 1, 1));
}

#[test]
fn timestamps_must_be_rfc3339() {
    assert!(parse_timestamp("2026-07-30T22:00:00Z").is_ok());
    assert!(parse_timestamp(" 2026-07-30T22:00:00+02:00 ").is_ok());
    assert!(matches!(
        parse_timestamp("yesterday"),
        Err(IngestError::InvalidTimestamp(_))
    ));
}

// The tests below run against a live Postgres. Gate them behind
// BENCH_INTEGRATION_TEST=1 and BENCH_TEST_DATABASE_URL so the default
// `cargo test` stays database-free; each test works in its own schema.

fn integration_database_url() -> Option<String> {
    if env::var("BENCH_INTEGRATION_TEST").ok().as_deref() != Some("1") {
        return None;
    }
    env::var("BENCH_TEST_DATABASE_URL").ok()
}

async fn setup_test_pool(database_url: &str, schema: &str) -> Result<PgPool> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {schema}"))
        .execute(&admin_pool)
        .await?;
    drop(admin_pool);

    let schema_name = schema.to_string();
    let pool = PgPoolOptions::new()
        .max_connections(5)
        .after_connect(move |conn, _meta| {
            let schema = schema_name.clone();
            Box::pin(async move {
                sqlx::query(&format!("SET search_path TO {schema}"))
                    .execute(conn)
                    .await?;
                Ok(())
            })
        })
        .connect(database_url)
        .await?;

    // Same bootstrap the server runs on startup, scoped to the test schema.
    db::ensure_schema(&pool).await?;
    Ok(pool)
}

async fn drop_test_schema(database_url: &str, schema: &str) -> Result<()> {
    let admin_pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(database_url)
        .await?;
    let _ = sqlx::query(&format!("DROP SCHEMA IF EXISTS {schema} CASCADE"))
        .execute(&admin_pool)
        .await;
    Ok(())
}

fn service(pool: &PgPool, timeline: Option<Arc<TimelineUpdater>>) -> IngestService {
    IngestService::new(
        pool.clone(),
        timeline,
        Arc::new(StatsCache::new(std::time::Duration::ZERO)),
    )
}

fn report(
    project: &str,
    experiment: &str,
    commit_id: &str,
    branch: &str,
    start_time: &str,
    runs: i32,
    iterations: i32,
) -> BenchmarkReport {
    let data = (0..runs)
        .map(|run| RunGroup {
            run: RunSpec {
                cmdline: format!("harness Bench{run} --iterations {iterations}"),
                benchmark: BenchmarkSpec {
                    name: format!("Bench{run}"),
                    desc: None,
                    suite: SuiteSpec {
                        name: "micro".to_string(),
                        desc: None,
                        executor: ExecutorSpec {
                            name: "som-ast".to_string(),
                            desc: None,
                        },
                    },
                },
                location: None,
                cores: Some("1".to_string()),
                var_value: None,
                input_size: None,
                extra_args: None,
                max_invocation_time: Some(600),
                min_iteration_time: Some(50),
                warmup: None,
            },
            points: (1..=iterations)
                .map(|iteration| DataPoint {
                    invocation: 1,
                    iteration,
                    measurements: vec![MeasurementValue {
                        criterion: 0,
                        value: 100.0 + f64::from(run * iterations + iteration),
                    }],
                })
                .collect(),
            profiles: Vec::new(),
        })
        .collect();

    BenchmarkReport {
        project_name: project.to_string(),
        experiment_name: experiment.to_string(),
        experiment_desc: None,
        start_time: start_time.to_string(),
        env: EnvSpec {
            host_name: "bench-1".to_string(),
            os_type: "Linux".to_string(),
            memory: 16_000_000_000,
            cpu: "Ryzen 9 7950X".to_string(),
            clock_speed: 4_500_000_000,
            user_name: "ci".to_string(),
            manual_run: false,
            denoise: String::new(),
        },
        source: SourceSpec {
            repo_url: "https://example.org/som.git".to_string(),
            branch_or_tag: branch.to_string(),
            commit_id: commit_id.to_string(),
            commit_msg: format!("commit {commit_id}"),
            author_name: "A".to_string(),
            author_email: "a@example.org".to_string(),
            committer_name: "A".to_string(),
            committer_email: "a@example.org".to_string(),
        },
        criteria: vec![CriterionSpec {
            index: 0,
            name: "total".to_string(),
            unit: "ms".to_string(),
        }],
        data,
    }
}

#[tokio::test]
async fn reingesting_the_same_report_records_nothing_new() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("bench_ingest_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let ingest = service(&pool, None);

    let payload = report("SOM", "nightly", "c0ffee01", "main", "2026-07-01T10:00:00Z", 1, 3);
    let recorded = ingest.record_all_data(&payload, false).await?;
    assert_eq!(recorded, (3, 0));

    for count in queries::fetch_table_counts(&pool).await? {
        let expected = match count.table_name.as_str() {
            "measurement" => 3,
            "profile_data" | "timeline" | "timeline_calc_job" => 0,
            _ => 1,
        };
        assert_eq!(count.row_count, expected, "{}", count.table_name);
    }

    let project = queries::project_by_slug(&pool, "SOM").await?.unwrap();
    let changes = queries::get_changes(&pool, project.id).await?;
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].commit_id, "c0ffee01");

    // Same payload again: the dedup oracle skips everything.
    let again = ingest.record_all_data(&payload, false).await?;
    assert_eq!(again, (0, 0));
    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurement")
        .fetch_one(&pool)
        .await?;
    assert_eq!(stored, 3);

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn timeline_converges_after_quiescence() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("bench_timeline_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    let timeline = TimelineUpdater::new(pool.clone(), 200);
    timeline.start(CancellationToken::new());
    let ingest = service(&pool, Some(timeline.clone()));

    let payload = report("SOM", "nightly", "c0ffee02", "main", "2026-07-01T10:00:00Z", 4, 6);
    let (measurements, _) = ingest.record_all_data(&payload, false).await?;
    assert_eq!(measurements, 24);

    timeline.await_quiescence().await;

    let rows: Vec<(i32, i32, i32, i32)> =
        sqlx::query_as("SELECT run_id, trial_id, criterion_id, num_samples FROM timeline")
            .fetch_all(&pool)
            .await?;
    assert_eq!(rows.len(), 4);
    for (run_id, trial_id, criterion_id, num_samples) in rows {
        let stored: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM measurement WHERE run_id = $1 AND trial_id = $2 AND criterion_id = $3",
        )
        .bind(run_id)
        .bind(trial_id)
        .bind(criterion_id)
        .fetch_one(&pool)
        .await?;
        assert_eq!(i64::from(num_samples), stored);
        assert_eq!(num_samples, 6);
    }

    let open_jobs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM timeline_calc_job")
        .fetch_one(&pool)
        .await?;
    assert_eq!(open_jobs, 0);

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn job_queue_drains_to_the_distinct_dirty_triples() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("bench_jobs_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    // No consumer started: submitted jobs stay queued, like a crashed process.
    let timeline = TimelineUpdater::new(pool.clone(), 100);
    let ingest = service(&pool, Some(timeline));

    let first = report("SOM", "nightly", "c0ffee03", "main", "2026-07-01T10:00:00Z", 2, 3);
    ingest.record_all_data(&first, false).await?;
    let second = report("SOM", "weekly", "c0ffee04", "main", "2026-07-02T10:00:00Z", 2, 3);
    ingest.record_all_data(&second, false).await?;

    // Two runs per payload and one trial each: four dirty triples in total.
    let drained: Vec<(i32, i32, i32)> = sqlx::query_as(
        "DELETE FROM timeline_calc_job RETURNING trial_id, run_id, criterion_id",
    )
    .fetch_all(&pool)
    .await?;
    assert_eq!(drained.len(), 4);

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn concurrent_ingests_of_one_report_store_it_once() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("bench_concurrent_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;

    // Two services with independent interning caches race the same payload
    // through the unique-violation recovery path.
    let first = service(&pool, None);
    let second = service(&pool, None);
    let payload = report("SOM", "nightly", "c0ffee05", "main", "2026-07-01T10:00:00Z", 1, 5);

    let (a, b) = tokio::join!(
        first.record_all_data(&payload, false),
        second.record_all_data(&payload, false)
    );
    let (recorded_a, _) = a?;
    let (recorded_b, _) = b?;
    assert_eq!(recorded_a + recorded_b, 5);

    let stored: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM measurement")
        .fetch_one(&pool)
        .await?;
    assert_eq!(stored, 5);
    let trials: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM trial")
        .fetch_one(&pool)
        .await?;
    assert_eq!(trials, 1);

    drop_test_schema(&database_url, &schema).await
}

#[tokio::test]
async fn baseline_commit_is_the_latest_on_the_designated_branch() -> Result<()> {
    let Some(database_url) = integration_database_url() else {
        return Ok(());
    };
    let schema = format!("bench_baseline_{}", std::process::id());
    let pool = setup_test_pool(&database_url, &schema).await?;
    let ingest = service(&pool, None);

    ingest
        .record_all_data(
            &report("SOM", "nightly", "aaa111", "main", "2026-07-01T08:00:00Z", 1, 1),
            false,
        )
        .await?;
    ingest
        .record_all_data(
            &report("SOM", "nightly", "aaa222", "main", "2026-07-02T08:00:00Z", 1, 1),
            false,
        )
        .await?;
    ingest
        .record_all_data(
            &report("SOM", "nightly", "bbb333", "feature", "2026-07-03T08:00:00Z", 1, 1),
            false,
        )
        .await?;

    assert_eq!(queries::set_project_base_branch(&pool, "SOM", "main").await?, 1);
    let project = queries::project_by_slug(&pool, "SOM").await?.unwrap();

    let baseline = queries::get_baseline_commit(&pool, &project, "bbb333")
        .await?
        .unwrap();
    assert_eq!(baseline.commit_id, "aaa222");
    assert_eq!(baseline.branch_or_tag, "main");

    let comparison = queries::revisions_exist_in_project(&pool, "SOM", "aaa222", "bbb333").await?;
    assert!(comparison.is_some());
    let missing = queries::revisions_exist_in_project(&pool, "SOM", "aaa222", "unknown").await?;
    assert!(missing.is_none());

    drop_test_schema(&database_url, &schema).await
}
