//! Test catalog lifecycle management
//!
//! Each test gets an isolated on-disk catalog with its own outbox, a recording
//! bus, and a publisher it drives explicitly.

use super::constants::DRAIN_TIMEOUT_MS;
use param_catalog_server::catalog_service::CatalogService;
use param_catalog_server::catalog_store::SqliteCatalogStore;
use param_catalog_server::change_events::{
    OutboxCounts, OutboxPublisher, OutboxStore, RecordingMessageBus,
};
use param_catalog_server::config::PublisherSettings;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::Notify;

/// Catalog instance backed by a temporary SQLite database.
///
/// When dropped, the temporary directory is removed.
pub struct TestCatalog {
    pub service: CatalogService,
    pub store: Arc<SqliteCatalogStore>,
    pub bus: Arc<RecordingMessageBus>,
    pub wakeup: Arc<Notify>,
    pub publisher: OutboxPublisher,
    pub db_path: PathBuf,

    // Keep the database alive until drop
    _temp_dir: TempDir,
}

impl TestCatalog {
    /// Settings with no backoff or park delay, so retries are due immediately.
    pub fn fast_settings() -> PublisherSettings {
        PublisherSettings {
            poll_interval_ms: 10,
            batch_size: 50,
            max_in_flight: 4,
            publish_timeout_ms: 500,
            max_retries: 3,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            park_duration_secs: 0,
            ..Default::default()
        }
    }

    pub fn new() -> Self {
        Self::with_settings(Self::fast_settings())
    }

    pub fn with_settings(settings: PublisherSettings) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let db_path = temp_dir.path().join("catalog.db");
        let store =
            Arc::new(SqliteCatalogStore::new(&db_path, 2).expect("Failed to open catalog store"));
        let bus = Arc::new(RecordingMessageBus::new());
        let wakeup = Arc::new(Notify::new());

        let service = CatalogService::new(store.clone(), wakeup.clone());
        let publisher =
            OutboxPublisher::new(store.clone(), bus.clone(), &settings, wakeup.clone());

        Self {
            service,
            store,
            bus,
            wakeup,
            publisher,
            db_path,
            _temp_dir: temp_dir,
        }
    }

    pub fn counts(&self) -> OutboxCounts {
        self.store.status_counts().expect("Failed to read outbox counts")
    }

    /// Run publisher rounds until no pending or parked event is left.
    pub async fn drain_until_idle(&self) -> OutboxCounts {
        let deadline = Instant::now() + Duration::from_millis(DRAIN_TIMEOUT_MS);
        loop {
            self.publisher
                .drain_round()
                .await
                .expect("Drain round failed");
            let counts = self.counts();
            if counts.pending == 0 && counts.parked == 0 {
                return counts;
            }
            assert!(
                Instant::now() < deadline,
                "Outbox did not drain in time: {:?}",
                counts
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Open a second store on the same database file.
    pub fn reopen_store(&self) -> SqliteCatalogStore {
        SqliteCatalogStore::new(&self.db_path, 1).expect("Failed to reopen catalog store")
    }
}
