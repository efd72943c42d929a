//! Metadata interning: every entity is keyed by its natural key, cached in
//! memory for the process lifetime, and created at most once in the database.
//! Concurrent first-inserts are resolved by re-fetching on unique violation.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use crate::api::{EnvSpec, RunSpec, SourceSpec};
use crate::error::is_unique_violation;

use super::IngestService;

#[derive(Debug, Clone, FromRow)]
pub struct ProjectRow {
    pub id: i32,
    pub name: String,
    pub slug: String,
    pub base_branch: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExperimentRow {
    pub id: i32,
    pub name: String,
    pub project_id: i32,
}

#[derive(Debug, Clone, FromRow, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceRow {
    pub id: i32,
    pub repo_url: String,
    pub branch_or_tag: String,
    pub commit_id: String,
    pub commit_message: String,
    pub author_name: String,
    pub author_email: String,
    pub committer_name: String,
    pub committer_email: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct EnvironmentRow {
    pub id: i32,
    pub hostname: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct TrialRow {
    pub id: i32,
    pub start_time: DateTime<Utc>,
    pub experiment_id: i32,
    pub username: String,
    pub env_id: i32,
    pub source_id: i32,
    pub end_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ExecutorRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct SuiteRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct BenchmarkRow {
    pub id: i32,
    pub name: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct RunRow {
    pub id: i32,
    pub cmdline: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct CriterionRow {
    pub id: i32,
    pub name: String,
    pub unit: String,
}

/// URL slug: every character outside `[0-9A-Za-z-]` becomes `-`.
pub fn slug_from_name(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect()
}

/// Natural key → materialized row. Never expired during the process
/// lifetime; concurrent writers of the same key store equal rows, so last
/// writer wins.
pub(crate) struct InternCache<T> {
    entries: Mutex<HashMap<String, Arc<T>>>,
}

impl<T> InternCache<T> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<Arc<T>> {
        self.entries.lock().ok().and_then(|map| map.get(key).cloned())
    }

    pub(crate) fn put(&self, key: &str, value: T) -> Arc<T> {
        let value = Arc::new(value);
        if let Ok(mut map) = self.entries.lock() {
            map.insert(key.to_string(), Arc::clone(&value));
        }
        value
    }
}

pub(crate) struct MetadataCaches {
    pub(crate) environments: InternCache<EnvironmentRow>,
    pub(crate) projects: InternCache<ProjectRow>,
    pub(crate) experiments: InternCache<ExperimentRow>,
    pub(crate) sources: InternCache<SourceRow>,
    pub(crate) trials: InternCache<TrialRow>,
    pub(crate) executors: InternCache<ExecutorRow>,
    pub(crate) suites: InternCache<SuiteRow>,
    pub(crate) benchmarks: InternCache<BenchmarkRow>,
    pub(crate) runs: InternCache<RunRow>,
    pub(crate) criteria: InternCache<CriterionRow>,
}

impl MetadataCaches {
    pub(crate) fn new() -> Self {
        Self {
            environments: InternCache::new(),
            projects: InternCache::new(),
            experiments: InternCache::new(),
            sources: InternCache::new(),
            trials: InternCache::new(),
            executors: InternCache::new(),
            suites: InternCache::new(),
            benchmarks: InternCache::new(),
            runs: InternCache::new(),
            criteria: InternCache::new(),
        }
    }
}

/// fetch → insert → on unique violation fetch again. At-least-once insert
/// attempts, at-most-one stored row.
async fn fetch_or_insert<T, F, FFut, IFut>(
    fetch: F,
    insert: impl FnOnce() -> IFut,
) -> Result<T, sqlx::Error>
where
    F: Fn() -> FFut,
    FFut: Future<Output = Result<Option<T>, sqlx::Error>>,
    IFut: Future<Output = Result<T, sqlx::Error>>,
{
    if let Some(row) = fetch().await? {
        return Ok(row);
    }
    match insert().await {
        Ok(row) => Ok(row),
        Err(err) if is_unique_violation(&err) => match fetch().await? {
            Some(row) => Ok(row),
            None => Err(err),
        },
        Err(err) => Err(err),
    }
}

impl IngestService {
    pub(super) async fn intern_environment(
        &self,
        env: &EnvSpec,
    ) -> Result<Arc<EnvironmentRow>, sqlx::Error> {
        if let Some(row) = self.caches.environments.get(&env.host_name) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, EnvironmentRow>(
                    "SELECT id, hostname FROM environment WHERE hostname = $1",
                )
                .bind(&env.host_name)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, EnvironmentRow>(
                    r#"
                    INSERT INTO environment (hostname, os_type, memory, cpu, clock_speed)
                    VALUES ($1, $2, $3, $4, $5)
                    RETURNING id, hostname
                    "#,
                )
                .bind(&env.host_name)
                .bind(&env.os_type)
                .bind(env.memory)
                .bind(&env.cpu)
                .bind(env.clock_speed)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.environments.put(&env.host_name, row))
    }

    pub(super) async fn intern_project(&self, name: &str) -> Result<Arc<ProjectRow>, sqlx::Error> {
        if let Some(row) = self.caches.projects.get(name) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, ProjectRow>(
                    "SELECT id, name, slug, base_branch FROM project WHERE name = $1",
                )
                .bind(name)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, ProjectRow>(
                    r#"
                    INSERT INTO project (name, slug)
                    VALUES ($1, $2)
                    RETURNING id, name, slug, base_branch
                    "#,
                )
                .bind(name)
                .bind(slug_from_name(name))
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.projects.put(name, row))
    }

    pub(super) async fn intern_experiment(
        &self,
        project_id: i32,
        name: &str,
        description: Option<&str>,
    ) -> Result<Arc<ExperimentRow>, sqlx::Error> {
        let key = format!("{project_id}|{name}");
        if let Some(row) = self.caches.experiments.get(&key) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, ExperimentRow>(
                    "SELECT id, name, project_id FROM experiment WHERE project_id = $1 AND name = $2",
                )
                .bind(project_id)
                .bind(name)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, ExperimentRow>(
                    r#"
                    INSERT INTO experiment (name, project_id, description)
                    VALUES ($1, $2, $3)
                    RETURNING id, name, project_id
                    "#,
                )
                .bind(name)
                .bind(project_id)
                .bind(description)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.experiments.put(&key, row))
    }

    pub(super) async fn intern_source(
        &self,
        source: &SourceSpec,
    ) -> Result<Arc<SourceRow>, sqlx::Error> {
        if let Some(row) = self.caches.sources.get(&source.commit_id) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, SourceRow>(
                    r#"
                    SELECT id, repo_url, branch_or_tag, commit_id, commit_message,
                           author_name, author_email, committer_name, committer_email
                    FROM source
                    WHERE commit_id = $1
                    "#,
                )
                .bind(&source.commit_id)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, SourceRow>(
                    r#"
                    INSERT INTO source (repo_url, branch_or_tag, commit_id, commit_message,
                                        author_name, author_email, committer_name, committer_email)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                    RETURNING id, repo_url, branch_or_tag, commit_id, commit_message,
                              author_name, author_email, committer_name, committer_email
                    "#,
                )
                .bind(&source.repo_url)
                .bind(&source.branch_or_tag)
                .bind(&source.commit_id)
                .bind(&source.commit_msg)
                .bind(&source.author_name)
                .bind(&source.author_email)
                .bind(&source.committer_name)
                .bind(&source.committer_email)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.sources.put(&source.commit_id, row))
    }

    pub(super) async fn intern_trial(
        &self,
        env: &EnvSpec,
        start_time: DateTime<Utc>,
        experiment_id: i32,
        env_id: i32,
        source_id: i32,
    ) -> Result<Arc<TrialRow>, sqlx::Error> {
        let key = format!(
            "{}|{env_id}|{}|{experiment_id}",
            env.user_name,
            start_time.to_rfc3339()
        );
        if let Some(row) = self.caches.trials.get(&key) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, TrialRow>(
                    r#"
                    SELECT id, start_time, experiment_id, username, env_id, source_id, end_time
                    FROM trial
                    WHERE username = $1 AND env_id = $2 AND start_time = $3 AND experiment_id = $4
                    "#,
                )
                .bind(&env.user_name)
                .bind(env_id)
                .bind(start_time)
                .bind(experiment_id)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, TrialRow>(
                    r#"
                    INSERT INTO trial (manual_run, start_time, experiment_id, username,
                                       env_id, source_id, denoise)
                    VALUES ($1, $2, $3, $4, $5, $6, $7)
                    RETURNING id, start_time, experiment_id, username, env_id, source_id, end_time
                    "#,
                )
                .bind(env.manual_run)
                .bind(start_time)
                .bind(experiment_id)
                .bind(&env.user_name)
                .bind(env_id)
                .bind(source_id)
                .bind(&env.denoise)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.trials.put(&key, row))
    }

    pub(super) async fn intern_criterion(
        &self,
        name: &str,
        unit: &str,
    ) -> Result<Arc<CriterionRow>, sqlx::Error> {
        let key = format!("{name}|{unit}");
        if let Some(row) = self.caches.criteria.get(&key) {
            return Ok(row);
        }
        let pool = &self.pool;
        sqlx::query("INSERT INTO unit (name) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(unit)
            .execute(pool)
            .await?;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, CriterionRow>(
                    "SELECT id, name, unit FROM criterion WHERE name = $1 AND unit = $2",
                )
                .bind(name)
                .bind(unit)
                .fetch_optional(pool)
                .await
            },
            || async {
                sqlx::query_as::<_, CriterionRow>(
                    r#"
                    INSERT INTO criterion (name, unit)
                    VALUES ($1, $2)
                    RETURNING id, name, unit
                    "#,
                )
                .bind(name)
                .bind(unit)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.criteria.put(&key, row))
    }

    async fn intern_executor(&self, name: &str, desc: Option<&str>) -> Result<Arc<ExecutorRow>, sqlx::Error> {
        if let Some(row) = self.caches.executors.get(name) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, ExecutorRow>("SELECT id, name FROM executor WHERE name = $1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
            },
            || async {
                sqlx::query_as::<_, ExecutorRow>(
                    "INSERT INTO executor (name, description) VALUES ($1, $2) RETURNING id, name",
                )
                .bind(name)
                .bind(desc)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.executors.put(name, row))
    }

    async fn intern_suite(&self, name: &str, desc: Option<&str>) -> Result<Arc<SuiteRow>, sqlx::Error> {
        if let Some(row) = self.caches.suites.get(name) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, SuiteRow>("SELECT id, name FROM suite WHERE name = $1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
            },
            || async {
                sqlx::query_as::<_, SuiteRow>(
                    "INSERT INTO suite (name, description) VALUES ($1, $2) RETURNING id, name",
                )
                .bind(name)
                .bind(desc)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.suites.put(name, row))
    }

    async fn intern_benchmark(&self, name: &str, desc: Option<&str>) -> Result<Arc<BenchmarkRow>, sqlx::Error> {
        if let Some(row) = self.caches.benchmarks.get(name) {
            return Ok(row);
        }
        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, BenchmarkRow>("SELECT id, name FROM benchmark WHERE name = $1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
            },
            || async {
                sqlx::query_as::<_, BenchmarkRow>(
                    "INSERT INTO benchmark (name, description) VALUES ($1, $2) RETURNING id, name",
                )
                .bind(name)
                .bind(desc)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.benchmarks.put(name, row))
    }

    /// Interns a run and, leaves first, the executor, suite, and benchmark it
    /// refers to.
    pub(super) async fn intern_run(&self, spec: &RunSpec) -> Result<Arc<RunRow>, sqlx::Error> {
        if let Some(row) = self.caches.runs.get(&spec.cmdline) {
            return Ok(row);
        }
        let executor = self
            .intern_executor(
                &spec.benchmark.suite.executor.name,
                spec.benchmark.suite.executor.desc.as_deref(),
            )
            .await?;
        let suite = self
            .intern_suite(&spec.benchmark.suite.name, spec.benchmark.suite.desc.as_deref())
            .await?;
        let benchmark = self
            .intern_benchmark(&spec.benchmark.name, spec.benchmark.desc.as_deref())
            .await?;

        let pool = &self.pool;
        let row = fetch_or_insert(
            || async {
                sqlx::query_as::<_, RunRow>("SELECT id, cmdline FROM run WHERE cmdline = $1")
                    .bind(&spec.cmdline)
                    .fetch_optional(pool)
                    .await
            },
            || async {
                sqlx::query_as::<_, RunRow>(
                    r#"
                    INSERT INTO run (cmdline, benchmark_id, suite_id, executor_id, location,
                                     cores, var_value, input_size, extra_args,
                                     max_invocation_time, min_iteration_time, warmup)
                    VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
                    RETURNING id, cmdline
                    "#,
                )
                .bind(&spec.cmdline)
                .bind(benchmark.id)
                .bind(suite.id)
                .bind(executor.id)
                .bind(&spec.location)
                .bind(&spec.cores)
                .bind(&spec.var_value)
                .bind(&spec.input_size)
                .bind(&spec.extra_args)
                .bind(spec.max_invocation_time)
                .bind(spec.min_iteration_time)
                .bind(spec.warmup)
                .fetch_one(pool)
                .await
            },
        )
        .await?;
        Ok(self.caches.runs.put(&spec.cmdline, row))
    }
}
