use std::sync::Arc;
use std::time::Duration;

use crate::config::ServerConfig;
use crate::db;
use crate::services::ingest::IngestService;
use crate::services::validity::StatsCache;
use crate::state::AppState;

pub fn test_config() -> ServerConfig {
    ServerConfig {
        database_url: "postgresql://postgres@localhost/postgres".to_string(),
        timeline_enabled: false,
        bootstrap_replicates: 100,
        cache_invalidation_delay: Duration::ZERO,
    }
}

/// A state whose pool is lazy and never connected; fine for handlers that do
/// not reach the database.
pub fn test_state() -> AppState {
    let config = test_config();
    let pool = db::connect_lazy(&config.database_url).expect("connect_lazy");
    let stats_cache = Arc::new(StatsCache::new(config.cache_invalidation_delay));
    let ingest = Arc::new(IngestService::new(pool.clone(), None, stats_cache.clone()));

    AppState {
        config,
        db: pool,
        ingest,
        stats_cache,
    }
}
