//! Timed cache-validity tokens. Readers hold a cheap handle and re-check
//! `is_valid`; writers invalidate after ingest, optionally with a delay so a
//! burst of ingests does not force a recomputation per request.

use sqlx::PgPool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::services::queries::{self, TableCount};

/// Immutable validity handle. Constructed valid; at most one pending
/// invalidation timer per token.
pub struct TimedValidity {
    delay: Duration,
    valid: AtomicBool,
    invalidation_pending: AtomicBool,
}

impl TimedValidity {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            valid: AtomicBool::new(true),
            invalidation_pending: AtomicBool::new(false),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.valid.load(Ordering::Acquire)
    }

    /// Schedules the invalidation of this token (immediately for a zero
    /// delay, via a one-shot timer otherwise) and returns the token the
    /// holder should keep: `self` while still valid, a fresh valid token
    /// once this one has expired.
    pub fn invalidate_and_new(self: &Arc<Self>) -> Arc<Self> {
        if self.is_valid()
            && self
                .invalidation_pending
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            if self.delay.is_zero() {
                self.valid.store(false, Ordering::Release);
            } else {
                let token = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(token.delay).await;
                    token.valid.store(false, Ordering::Release);
                });
            }
        }

        if self.is_valid() {
            Arc::clone(self)
        } else {
            Self::new(self.delay)
        }
    }
}

/// Per-table row counts for the data overview, cached behind a
/// [`TimedValidity`] token that the ingest pipeline invalidates.
pub struct StatsCache {
    inner: Mutex<StatsCacheInner>,
}

struct StatsCacheInner {
    validity: Arc<TimedValidity>,
    counts: Option<Vec<TableCount>>,
}

impl StatsCache {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: Mutex::new(StatsCacheInner {
                validity: TimedValidity::new(delay),
                counts: None,
            }),
        }
    }

    pub async fn invalidate(&self) {
        let mut inner = self.inner.lock().await;
        inner.validity = inner.validity.invalidate_and_new();
    }

    pub async fn table_counts(&self, pool: &PgPool) -> Result<Vec<TableCount>, sqlx::Error> {
        {
            let inner = self.inner.lock().await;
            if inner.validity.is_valid() {
                if let Some(counts) = &inner.counts {
                    return Ok(counts.clone());
                }
            }
        }

        let counts = queries::fetch_table_counts(pool).await?;
        let mut inner = self.inner.lock().await;
        if !inner.validity.is_valid() {
            inner.validity = inner.validity.invalidate_and_new();
        }
        inner.counts = Some(counts.clone());
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn zero_delay_invalidates_immediately_and_hands_out_a_fresh_token() {
        let token = TimedValidity::new(Duration::ZERO);
        assert!(token.is_valid());

        let next = token.invalidate_and_new();
        assert!(!token.is_valid());
        assert!(next.is_valid());
        assert!(!Arc::ptr_eq(&token, &next));
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_invalidation_keeps_the_token_valid_until_the_timer_fires() {
        let token = TimedValidity::new(Duration::from_millis(250));

        let same = token.invalidate_and_new();
        assert!(Arc::ptr_eq(&token, &same));
        assert!(token.is_valid());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!token.is_valid());

        let next = token.invalidate_and_new();
        assert!(!Arc::ptr_eq(&token, &next));
        assert!(next.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_invalidation_schedules_a_single_timer() {
        let token = TimedValidity::new(Duration::from_millis(100));

        let first = token.invalidate_and_new();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // A second request while the timer is pending must not re-arm it.
        let second = token.invalidate_and_new();
        assert!(Arc::ptr_eq(&first, &second));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(!token.is_valid());
    }
}
