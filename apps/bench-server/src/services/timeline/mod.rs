//! Timeline updater: a multi-producer, single-consumer coalescing worker.
//! Producers append values per (trial, run, criterion); `submit_update_jobs`
//! persists the dirty keys into the durable `timeline_calc_job` queue and
//! wakes the consumer, which recomputes the summary statistics from the
//! authoritative measurement sample and upserts one timeline row per key.

use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::services::stats;

/// The distinguished criterion whose values drive timeline aggregation.
pub const TOTAL_CRITERION: &str = "total";

/// Pending values above this bound block producers until the consumer
/// catches up.
const MAX_PENDING_VALUES: usize = 100_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimelineKey {
    pub trial_id: i32,
    pub run_id: i32,
    pub criterion_id: i32,
}

pub struct TimelineUpdater {
    pool: PgPool,
    replicates: usize,
    pending: Mutex<HashMap<TimelineKey, Vec<f64>>>,
    capacity: Semaphore,
    work: Notify,
    idle_tx: watch::Sender<bool>,
    idle_rx: watch::Receiver<bool>,
    accepting: AtomicBool,
}

impl TimelineUpdater {
    pub fn new(pool: PgPool, replicates: usize) -> Arc<Self> {
        let (idle_tx, idle_rx) = watch::channel(true);
        Arc::new(Self {
            pool,
            replicates,
            pending: Mutex::new(HashMap::new()),
            capacity: Semaphore::new(MAX_PENDING_VALUES),
            work: Notify::new(),
            idle_tx,
            idle_rx,
            accepting: AtomicBool::new(true),
        })
    }

    /// Spawns the single consumer task.
    pub fn start(self: &Arc<Self>, cancel: CancellationToken) {
        let updater = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = updater.work.notified() => {}
                }
                updater.drain().await;
            }
        });
    }

    /// Appends a value for the key. Blocks when the pending backlog is at
    /// capacity; the permit is returned once the consumer has processed the
    /// value.
    pub async fn add_value(&self, run_id: i32, trial_id: i32, criterion_id: i32, value: f64) {
        if !self.accepting.load(Ordering::Acquire) {
            return;
        }
        let Ok(permit) = self.capacity.acquire().await else {
            return;
        };
        permit.forget();

        let key = TimelineKey {
            trial_id,
            run_id,
            criterion_id,
        };
        let mut pending = self.pending.lock().await;
        pending.entry(key).or_default().push(value);
    }

    /// Persists one durable job row per dirty key (idempotent on the key)
    /// and wakes the consumer. Duplicate submissions coalesce.
    pub async fn submit_update_jobs(&self) -> Result<(), sqlx::Error> {
        let keys: Vec<TimelineKey> = {
            let pending = self.pending.lock().await;
            pending.keys().copied().collect()
        };
        if keys.is_empty() {
            return Ok(());
        }

        for key in &keys {
            sqlx::query(
                r#"
                INSERT INTO timeline_calc_job (trial_id, run_id, criterion_id)
                VALUES ($1, $2, $3)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(key.trial_id)
            .bind(key.run_id)
            .bind(key.criterion_id)
            .execute(&self.pool)
            .await?;
        }

        let _ = self.idle_tx.send(false);
        self.work.notify_one();
        Ok(())
    }

    /// Re-enqueues every persisted job as a recompute-from-database pass.
    /// This is how a restart after a crash converges.
    pub async fn recover_pending_jobs(&self) -> Result<usize, sqlx::Error> {
        let rows: Vec<(i32, i32, i32)> =
            sqlx::query_as("SELECT trial_id, run_id, criterion_id FROM timeline_calc_job")
                .fetch_all(&self.pool)
                .await?;
        if rows.is_empty() {
            return Ok(0);
        }
        let recovered = rows.len();
        {
            let mut pending = self.pending.lock().await;
            for (trial_id, run_id, criterion_id) in rows {
                pending
                    .entry(TimelineKey {
                        trial_id,
                        run_id,
                        criterion_id,
                    })
                    .or_default();
            }
        }
        let _ = self.idle_tx.send(false);
        self.work.notify_one();
        Ok(recovered)
    }

    /// Completes once the queue has drained and no job is in flight.
    pub async fn await_quiescence(&self) {
        let mut rx = self.idle_rx.clone();
        let _ = rx.wait_for(|idle| *idle).await;
    }

    /// Stops accepting new values and waits for the submitted work to drain.
    pub async fn shutdown(&self) {
        self.accepting.store(false, Ordering::Release);
        self.await_quiescence().await;
    }

    async fn drain(&self) {
        loop {
            let batch = {
                let mut pending = self.pending.lock().await;
                std::mem::take(&mut *pending)
            };
            if batch.is_empty() {
                let _ = self.idle_tx.send(true);
                return;
            }

            let mut released = 0usize;
            for (key, values) in batch {
                released += values.len();
                if let Err(err) = self.recompute(key).await {
                    tracing::warn!(
                        error = %err,
                        trial_id = key.trial_id,
                        run_id = key.run_id,
                        criterion_id = key.criterion_id,
                        "timeline recomputation failed; leaving job row for a later pass"
                    );
                }
            }
            if released > 0 {
                self.capacity.add_permits(released);
            }
            // Producers may have enqueued while we were computing; loop until
            // the swap comes back empty.
        }
    }

    /// Recomputes the summary over the full measurement sample for the key,
    /// upserts the timeline row, and retires the durable job.
    async fn recompute(&self, key: TimelineKey) -> Result<(), sqlx::Error> {
        let rows: Vec<(f64,)> = sqlx::query_as(
            r#"
            SELECT value
            FROM measurement
            WHERE run_id = $1 AND trial_id = $2 AND criterion_id = $3
            ORDER BY invocation ASC, iteration ASC
            "#,
        )
        .bind(key.run_id)
        .bind(key.trial_id)
        .bind(key.criterion_id)
        .fetch_all(&self.pool)
        .await?;
        let sample: Vec<f64> = rows.into_iter().map(|(value,)| value).collect();

        if let Some(summary) = stats::summarize(&sample, self.replicates) {
            sqlx::query(
                r#"
                INSERT INTO timeline (run_id, trial_id, criterion_id, min_val, max_val, sd_val,
                                      mean, median, num_samples, bci95low, bci95up)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
                ON CONFLICT (run_id, trial_id, criterion_id) DO UPDATE SET
                    min_val = EXCLUDED.min_val,
                    max_val = EXCLUDED.max_val,
                    sd_val = EXCLUDED.sd_val,
                    mean = EXCLUDED.mean,
                    median = EXCLUDED.median,
                    num_samples = EXCLUDED.num_samples,
                    bci95low = EXCLUDED.bci95low,
                    bci95up = EXCLUDED.bci95up
                "#,
            )
            .bind(key.run_id)
            .bind(key.trial_id)
            .bind(key.criterion_id)
            .bind(summary.min)
            .bind(summary.max)
            .bind(summary.stddev)
            .bind(summary.mean)
            .bind(summary.median)
            .bind(summary.num_samples as i32)
            .bind(summary.bci95low)
            .bind(summary.bci95up)
            .execute(&self.pool)
            .await?;
        }

        sqlx::query(
            "DELETE FROM timeline_calc_job WHERE trial_id = $1 AND run_id = $2 AND criterion_id = $3",
        )
        .bind(key.trial_id)
        .bind(key.run_id)
        .bind(key.criterion_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn updater() -> Arc<TimelineUpdater> {
        // connect_lazy never touches the network until a query runs, and
        // these tests stay on the producer side.
        let pool = db::connect_lazy("postgresql://postgres@localhost/postgres").unwrap();
        TimelineUpdater::new(pool, 100)
    }

    #[tokio::test]
    async fn values_for_the_same_key_coalesce_in_submission_order() {
        let updater = updater();
        updater.add_value(4, 2, 9, 100.0).await;
        updater.add_value(4, 2, 9, 101.5).await;
        updater.add_value(5, 2, 9, 7.0).await;

        let pending = updater.pending.lock().await;
        assert_eq!(pending.len(), 2);
        let key = TimelineKey {
            trial_id: 2,
            run_id: 4,
            criterion_id: 9,
        };
        assert_eq!(pending.get(&key).unwrap(), &vec![100.0, 101.5]);
    }

    #[tokio::test]
    async fn quiescence_resolves_immediately_when_nothing_was_submitted() {
        let updater = updater();
        updater.add_value(1, 1, 1, 1.0).await;
        // Values without a submit do not make the updater busy.
        updater.await_quiescence().await;
    }

    #[tokio::test]
    async fn shutdown_stops_accepting_values() {
        let updater = updater();
        updater.shutdown().await;
        updater.add_value(1, 1, 1, 1.0).await;
        assert!(updater.pending.lock().await.is_empty());
    }

    #[tokio::test]
    async fn drain_signals_idle_once_the_map_is_empty() {
        let updater = updater();
        let _ = updater.idle_tx.send(false);
        updater.drain().await;
        assert!(*updater.idle_rx.borrow());
        updater.await_quiescence().await;
    }
}
