//! Connection pool telemetry.
//!
//! Samples the storage pool on a fixed interval into gauges kept under the
//! `gorm_dbstats_` prefix existing dashboards already chart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Once;
use std::time::Duration;

use metrics::{describe_gauge, gauge, Label, Unit};
use sqlx::AnyPool;
use tokio::time::sleep;
use tracing::debug;

use crate::config::DbMetricsConfig;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 15;

pub const DBSTATS_MAX_OPEN_CONNECTIONS: &str = "gorm_dbstats_max_open_connections";
pub const DBSTATS_OPEN_CONNECTIONS: &str = "gorm_dbstats_open_connections";
pub const DBSTATS_IN_USE: &str = "gorm_dbstats_in_use";
pub const DBSTATS_IDLE: &str = "gorm_dbstats_idle";
pub const DBSTATS_WAIT_COUNT: &str = "gorm_dbstats_wait_count";
pub const DBSTATS_WAIT_DURATION: &str = "gorm_dbstats_wait_duration";
pub const DBSTATS_MAX_IDLE_CLOSED: &str = "gorm_dbstats_max_idle_closed";
pub const DBSTATS_MAX_LIFETIME_CLOSED: &str = "gorm_dbstats_max_lifetime_closed";
pub const DBSTATS_MAX_IDLETIME_CLOSED: &str = "gorm_dbstats_max_idletime_closed";

static REGISTER_METRICS: Once = Once::new();

fn register_metrics() {
    REGISTER_METRICS.call_once(|| {
        describe_gauge!(
            DBSTATS_MAX_OPEN_CONNECTIONS,
            Unit::Count,
            "Maximum number of open connections to the database."
        );
        describe_gauge!(
            DBSTATS_OPEN_CONNECTIONS,
            Unit::Count,
            "The number of established connections both in use and idle."
        );
        describe_gauge!(
            DBSTATS_IN_USE,
            Unit::Count,
            "The number of connections currently in use."
        );
        describe_gauge!(DBSTATS_IDLE, Unit::Count, "The number of idle connections.");
        describe_gauge!(
            DBSTATS_WAIT_COUNT,
            Unit::Count,
            "The total number of connections waited for."
        );
        describe_gauge!(
            DBSTATS_WAIT_DURATION,
            Unit::Seconds,
            "The total time blocked waiting for a new connection."
        );
        describe_gauge!(
            DBSTATS_MAX_IDLE_CLOSED,
            Unit::Count,
            "The total number of connections closed due to the idle connection limit."
        );
        describe_gauge!(
            DBSTATS_MAX_LIFETIME_CLOSED,
            Unit::Count,
            "The total number of connections closed due to the connection lifetime limit."
        );
        describe_gauge!(
            DBSTATS_MAX_IDLETIME_CLOSED,
            Unit::Count,
            "The total number of connections closed due to the idle time limit."
        );
    });
}

/// Periodic sampler of the pool gauges.
///
/// [`DbStatsSampler::start`] spawns the sampling task at most once per instance; the
/// task runs for the lifetime of the process, like the pool it observes.
#[derive(Debug)]
pub struct DbStatsSampler {
    pool: AnyPool,
    max_open_connections: u32,
    labels: Vec<Label>,
    refresh_interval: Duration,
    started: AtomicBool,
}

impl DbStatsSampler {
    pub fn new(pool: AnyPool, max_open_connections: u32, config: &DbMetricsConfig) -> Self {
        let mut labels: Vec<Label> = config
            .labels
            .iter()
            .map(|(key, value)| Label::new(key.clone(), value.clone()))
            .collect();
        if !config.db_name.is_empty() {
            labels.push(Label::new("db_name", config.db_name.clone()));
        }

        let secs = if config.refresh_interval_secs == 0 {
            DEFAULT_REFRESH_INTERVAL_SECS
        } else {
            config.refresh_interval_secs
        };

        Self {
            pool,
            max_open_connections,
            labels,
            refresh_interval: Duration::from_secs(secs),
            started: AtomicBool::new(false),
        }
    }

    /// Starts the sampling task. Returns false (and does nothing) when it already runs.
    pub fn start(&self) -> bool {
        if self.started.swap(true, Ordering::SeqCst) {
            return false;
        }
        register_metrics();

        let pool = self.pool.clone();
        let max_open = self.max_open_connections;
        let labels = self.labels.clone();
        let interval = self.refresh_interval;
        tokio::spawn(async move {
            debug!(interval = ?interval, "starting db stats sampler");
            loop {
                sleep(interval).await;
                sample(&pool, max_open, &labels);
            }
        });
        true
    }
}

fn sample(pool: &AnyPool, max_open_connections: u32, labels: &[Label]) {
    let open = pool.size() as f64;
    let idle = pool.num_idle() as f64;

    gauge!(DBSTATS_MAX_OPEN_CONNECTIONS, labels.to_vec()).set(max_open_connections as f64);
    gauge!(DBSTATS_OPEN_CONNECTIONS, labels.to_vec()).set(open);
    gauge!(DBSTATS_IN_USE, labels.to_vec()).set((open - idle).max(0.0));
    gauge!(DBSTATS_IDLE, labels.to_vec()).set(idle);

    // The pool does not surface wait or close counters; the gauges are still published
    // so the dashboard series stay present.
    gauge!(DBSTATS_WAIT_COUNT, labels.to_vec()).set(0.0);
    gauge!(DBSTATS_WAIT_DURATION, labels.to_vec()).set(0.0);
    gauge!(DBSTATS_MAX_IDLE_CLOSED, labels.to_vec()).set(0.0);
    gauge!(DBSTATS_MAX_LIFETIME_CLOSED, labels.to_vec()).set(0.0);
    gauge!(DBSTATS_MAX_IDLETIME_CLOSED, labels.to_vec()).set(0.0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::connect;

    #[tokio::test]
    async fn test_sampler_starts_at_most_once() {
        let config = StorageConfig {
            dsn: "sqlite::memory:".to_string(),
            max_open_connections: 1,
            min_idle_connections: 0,
            conn_max_lifetime_secs: 0,
        };
        let (pool, _backend) = connect(&config).await.unwrap();

        let sampler = DbStatsSampler::new(pool, 1, &DbMetricsConfig::default());
        assert!(sampler.start());
        assert!(!sampler.start());
    }

    #[tokio::test]
    async fn test_db_name_label_and_default_interval() {
        let config = StorageConfig {
            dsn: "sqlite::memory:".to_string(),
            max_open_connections: 1,
            min_idle_connections: 0,
            conn_max_lifetime_secs: 0,
        };
        let (pool, _backend) = connect(&config).await.unwrap();

        let mut metrics_config = DbMetricsConfig {
            db_name: "fleet".to_string(),
            ..Default::default()
        };
        metrics_config
            .labels
            .insert("instance".to_string(), "a".to_string());

        let sampler = DbStatsSampler::new(pool, 4, &metrics_config);
        assert!(sampler.labels.contains(&Label::new("db_name", "fleet")));
        assert!(sampler.labels.contains(&Label::new("instance", "a")));
        assert_eq!(sampler.refresh_interval, Duration::from_secs(15));
    }
}
