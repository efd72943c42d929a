//! Batched measurement inserts. Three fixed statement shapes (50 rows, 10
//! rows, 1 row) keep sqlx's per-connection statement cache down to three
//! prepared plans on the hot path.

use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::error::is_unique_violation;

pub(crate) const BATCH_SIZE: usize = 50;
const SMALL_BATCH_SIZE: usize = 10;

#[derive(Debug, Clone, Copy)]
pub(crate) struct MeasurementTuple {
    pub run_id: i32,
    pub trial_id: i32,
    pub criterion_id: i32,
    pub invocation: i32,
    pub iteration: i32,
    pub value: f64,
}

/// Accumulates tuples and flushes a full 50-row insert whenever the buffer
/// fills; `finish` drains the residue through the 10-row and single-row
/// shapes. Returns the number of rows actually stored (duplicates skipped by
/// the database are not counted).
pub(crate) struct MeasurementWriter<'a> {
    pool: &'a PgPool,
    buffer: Vec<MeasurementTuple>,
    recorded: u64,
}

impl<'a> MeasurementWriter<'a> {
    pub(crate) fn new(pool: &'a PgPool) -> Self {
        Self {
            pool,
            buffer: Vec::with_capacity(BATCH_SIZE),
            recorded: 0,
        }
    }

    pub(crate) async fn push(&mut self, tuple: MeasurementTuple) -> Result<(), sqlx::Error> {
        self.buffer.push(tuple);
        if self.buffer.len() == BATCH_SIZE {
            let batch: Vec<MeasurementTuple> = self.buffer.drain(..).collect();
            self.recorded += insert_batch(self.pool, &batch).await?;
        }
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> Result<u64, sqlx::Error> {
        while self.buffer.len() >= SMALL_BATCH_SIZE {
            let batch: Vec<MeasurementTuple> = self.buffer.drain(..SMALL_BATCH_SIZE).collect();
            self.recorded += insert_batch(self.pool, &batch).await?;
        }
        for tuple in std::mem::take(&mut self.buffer) {
            self.recorded += insert_one(self.pool, &tuple).await?;
        }
        Ok(self.recorded)
    }
}

async fn insert_batch(pool: &PgPool, batch: &[MeasurementTuple]) -> Result<u64, sqlx::Error> {
    match execute_multi_row(pool, batch).await {
        Ok(rows) => Ok(rows),
        Err(err) if is_unique_violation(&err) => {
            // A concurrent ingester raced us into the same key space. Retry
            // one tuple at a time so the non-conflicting rows still land.
            let mut recorded = 0;
            for tuple in batch {
                recorded += insert_one(pool, tuple).await?;
            }
            Ok(recorded)
        }
        Err(err) => Err(err),
    }
}

async fn execute_multi_row(pool: &PgPool, batch: &[MeasurementTuple]) -> Result<u64, sqlx::Error> {
    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO measurement (run_id, trial_id, criterion_id, invocation, iteration, value) ",
    );
    builder.push_values(batch.iter(), |mut b, tuple| {
        b.push_bind(tuple.run_id)
            .push_bind(tuple.trial_id)
            .push_bind(tuple.criterion_id)
            .push_bind(tuple.invocation)
            .push_bind(tuple.iteration)
            .push_bind(tuple.value);
    });
    builder.push(" ON CONFLICT DO NOTHING");
    Ok(builder.build().execute(pool).await?.rows_affected())
}

async fn insert_one(pool: &PgPool, tuple: &MeasurementTuple) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        r#"
        INSERT INTO measurement (run_id, trial_id, criterion_id, invocation, iteration, value)
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT DO NOTHING
        "#,
    )
    .bind(tuple.run_id)
    .bind(tuple.trial_id)
    .bind(tuple.criterion_id)
    .bind(tuple.invocation)
    .bind(tuple.iteration)
    .bind(tuple.value)
    .execute(pool)
    .await;
    match result {
        Ok(result) => Ok(result.rows_affected()),
        Err(err) if is_unique_violation(&err) => Ok(0),
        Err(err) => Err(err),
    }
}
