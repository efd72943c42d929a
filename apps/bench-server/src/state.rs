use sqlx::PgPool;
use std::sync::Arc;

use crate::config::ServerConfig;
use crate::services::ingest::IngestService;
use crate::services::validity::StatsCache;

#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub db: PgPool,
    pub ingest: Arc<IngestService>,
    pub stats_cache: Arc<StatsCache>,
}
