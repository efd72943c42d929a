//! The ingestion pipeline: idempotent recording of a benchmark report.
//! Metadata is interned leaves-first, measurements stream through the batch
//! writer with a per-trial dedup oracle, and total-criterion values feed the
//! timeline updater.

pub mod meta;

mod batch;
#[cfg(test)]
mod tests;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::api::{BenchmarkReport, CompletionReport, ProfileEntry};
use crate::error::is_unique_violation;
use crate::services::timeline::{TimelineUpdater, TOTAL_CRITERION};
use crate::services::validity::StatsCache;

use batch::{MeasurementTuple, MeasurementWriter};
use meta::{CriterionRow, MetadataCaches};

#[derive(Debug)]
pub enum IngestError {
    InvalidTimestamp(String),
    MissingEndTime,
    UnknownCriterion(i32),
    Db(sqlx::Error),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidTimestamp(raw) => write!(f, "invalid ISO-8601 timestamp: {raw}"),
            Self::MissingEndTime => write!(f, "completion payload is missing endTime"),
            Self::UnknownCriterion(index) => {
                write!(f, "measurement references undeclared criterion index {index}")
            }
            Self::Db(err) => write!(f, "database error: {err}"),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err)
    }
}

/// run_id → criterion_id → invocation → highest stored iteration. One
/// aggregated query per trial; the dedup oracle for re-submitted payloads.
struct AvailableMeasurements(HashMap<i32, HashMap<i32, HashMap<i32, i32>>>);

impl AvailableMeasurements {
    fn covers(&self, run_id: i32, criterion_id: i32, invocation: i32, iteration: i32) -> bool {
        self.0
            .get(&run_id)
            .and_then(|by_criterion| by_criterion.get(&criterion_id))
            .and_then(|by_invocation| by_invocation.get(&invocation))
            .is_some_and(|max_iteration| *max_iteration >= iteration)
    }
}

pub struct IngestService {
    pool: PgPool,
    caches: MetadataCaches,
    timeline: Option<Arc<TimelineUpdater>>,
    stats_cache: Arc<StatsCache>,
}

impl IngestService {
    pub fn new(
        pool: PgPool,
        timeline: Option<Arc<TimelineUpdater>>,
        stats_cache: Arc<StatsCache>,
    ) -> Self {
        Self {
            pool,
            caches: MetadataCaches::new(),
            timeline,
            stats_cache,
        }
    }

    /// Records a full report. Returns `(recorded_measurements,
    /// recorded_profiles)`: rows actually stored, excluding duplicates
    /// skipped by the dedup oracle or the database. Safe to call again with
    /// the same payload; the second call records nothing.
    pub async fn record_all_data(
        &self,
        report: &BenchmarkReport,
        suppress_timeline: bool,
    ) -> Result<(u64, u64), IngestError> {
        self.stats_cache.invalidate().await;

        let start_time = parse_timestamp(&report.start_time)?;
        let environment = self.intern_environment(&report.env).await?;
        let project = self.intern_project(&report.project_name).await?;
        let experiment = self
            .intern_experiment(
                project.id,
                &report.experiment_name,
                report.experiment_desc.as_deref(),
            )
            .await?;
        let source = self.intern_source(&report.source).await?;
        let trial = self
            .intern_trial(&report.env, start_time, experiment.id, environment.id, source.id)
            .await?;

        let mut criteria: HashMap<i32, Arc<CriterionRow>> = HashMap::new();
        for spec in &report.criteria {
            let row = self.intern_criterion(&spec.name, &spec.unit).await?;
            criteria.insert(spec.index, row);
        }

        // The dedup oracle is one aggregated query over the whole trial, so a
        // single fetch serves every run group in the payload.
        let available = if report.data.iter().any(|group| !group.points.is_empty()) {
            Some(self.available_measurements(trial.id).await?)
        } else {
            None
        };
        let mut recorded_measurements = 0u64;
        let mut recorded_profiles = 0u64;

        for group in &report.data {
            let run = self.intern_run(&group.run).await?;
            let mut writer = MeasurementWriter::new(&self.pool);

            for point in &group.points {
                for measured in &point.measurements {
                    let Some(criterion) = criteria.get(&measured.criterion) else {
                        return Err(IngestError::UnknownCriterion(measured.criterion));
                    };
                    if available.as_ref().is_some_and(|oracle| {
                        oracle.covers(run.id, criterion.id, point.invocation, point.iteration)
                    }) {
                        continue;
                    }
                    writer
                        .push(MeasurementTuple {
                            run_id: run.id,
                            trial_id: trial.id,
                            criterion_id: criterion.id,
                            invocation: point.invocation,
                            iteration: point.iteration,
                            value: measured.value,
                        })
                        .await?;
                    if criterion.name == TOTAL_CRITERION {
                        if let Some(updater) = &self.timeline {
                            updater
                                .add_value(run.id, trial.id, criterion.id, measured.value)
                                .await;
                        }
                    }
                }
            }

            recorded_measurements += writer.finish().await?;

            for profile in &group.profiles {
                recorded_profiles += self.record_profile(run.id, trial.id, profile).await?;
            }
        }

        if recorded_measurements > 0 && !suppress_timeline {
            if let Some(updater) = &self.timeline {
                updater.submit_update_jobs().await?;
            }
        }

        tracing::debug!(
            project = %report.project_name,
            experiment = %report.experiment_name,
            trial_id = trial.id,
            recorded_measurements,
            recorded_profiles,
            "recorded benchmark report"
        );
        Ok((recorded_measurements, recorded_profiles))
    }

    /// Sets `end_time` on every still-open trial of the experiment. Returns
    /// the number of trials closed; zero means the experiment is unknown (or
    /// already fully closed), which the caller reports as a user error.
    pub async fn record_completion(&self, completion: &CompletionReport) -> Result<u64, IngestError> {
        let raw = completion.end_time.as_deref().ok_or(IngestError::MissingEndTime)?;
        let end_time = parse_timestamp(raw)?;
        let result = sqlx::query(
            r#"
            UPDATE trial
            SET end_time = $1
            FROM experiment e
            JOIN project p ON e.project_id = p.id
            WHERE trial.experiment_id = e.id
              AND p.name = $2
              AND e.name = $3
              AND trial.end_time IS NULL
            "#,
        )
        .bind(end_time)
        .bind(&completion.project_name)
        .bind(&completion.experiment_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn available_measurements(
        &self,
        trial_id: i32,
    ) -> Result<AvailableMeasurements, sqlx::Error> {
        let rows: Vec<(i32, i32, i32, Option<i32>)> = sqlx::query_as(
            r#"
            SELECT run_id, criterion_id, invocation, MAX(iteration)
            FROM measurement
            WHERE trial_id = $1
            GROUP BY run_id, criterion_id, invocation
            "#,
        )
        .bind(trial_id)
        .fetch_all(&self.pool)
        .await?;

        let mut map: HashMap<i32, HashMap<i32, HashMap<i32, i32>>> = HashMap::new();
        for (run_id, criterion_id, invocation, max_iteration) in rows {
            map.entry(run_id)
                .or_default()
                .entry(criterion_id)
                .or_default()
                .insert(invocation, max_iteration.unwrap_or(0));
        }
        Ok(AvailableMeasurements(map))
    }

    async fn record_profile(
        &self,
        run_id: i32,
        trial_id: i32,
        profile: &ProfileEntry,
    ) -> Result<u64, sqlx::Error> {
        let value = match &profile.data {
            serde_json::Value::String(text) => text.clone(),
            other => other.to_string(),
        };
        let result = sqlx::query(
            r#"
            INSERT INTO profile_data (run_id, trial_id, invocation, num_iterations, value)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(run_id)
        .bind(trial_id)
        .bind(profile.invocation)
        .bind(profile.num_iterations)
        .bind(&value)
        .execute(&self.pool)
        .await;
        match result {
            Ok(result) => Ok(result.rows_affected()),
            Err(err) if is_unique_violation(&err) => Ok(0),
            Err(err) => Err(err),
        }
    }
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, IngestError> {
    DateTime::parse_from_rfc3339(raw.trim())
        .map(|parsed| parsed.with_timezone(&Utc))
        .map_err(|_| IngestError::InvalidTimestamp(raw.to_string()))
}

