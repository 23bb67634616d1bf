//! Integration tests for remote mirroring through the service object
//!
//! These exercise the full stack: migrated on-disk store, allocator,
//! reconciler and scheduler against an in-process remote store.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tally_store::sync::{RemoteValue, SchedulerSettings, SchedulerState};
use tally_store::{
    Config, LocalStore, MemoryRemoteStore, PlantingSubmission, RemoteDocument, RemoteStore, SyncError,
    SyncReconciler, SyncScheduler, TallyService,
};
use tempfile::TempDir;

fn service(temp_dir: &TempDir) -> TallyService {
    let config = Config {
        storage_dir: temp_dir.path().to_path_buf(),
        ..Default::default()
    };
    let service = TallyService::open(config).unwrap();
    service.prepare_store().unwrap();
    service
}

fn tree_doc(id: &str, planter: &str) -> RemoteDocument {
    RemoteDocument::new(id)
        .with("tree_tracking_number", "TRK-9")
        .with("planters_name", planter)
        .with("local_name", "Mango")
        .with("dbh_cm", 14.0)
        .with("height_m", 3.5)
}

fn text_at(store: &LocalStore, sql: &str) -> Option<String> {
    store.with_conn(|conn| conn.query_row(sql, [], |row| row.get(0))).unwrap()
}

fn count(store: &LocalStore, sql: &str) -> i64 {
    store.with_conn(|conn| conn.query_row(sql, [], |row| row.get(0))).unwrap()
}

/// Test a fresh store allocates, retries and mirrors in one flow
#[tokio::test]
async fn test_fresh_store_end_to_end() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);

    let allocator = service.allocator();
    assert_eq!(allocator.allocate("Jane Doe", "uuid-123").unwrap().as_str(), "JD001");
    assert_eq!(allocator.allocate("Jane Doe", "uuid-124").unwrap().as_str(), "JD002");
    assert_eq!(allocator.allocate("Jane Doe", "uuid-123").unwrap().as_str(), "JD001");

    let remote = Arc::new(MemoryRemoteStore::new());
    remote
        .put(
            "institutions",
            RemoteDocument::new("inst-1")
                .with("name", "Green School")
                .with("status", "approved"),
        )
        .await;
    remote
        .put(
            "institutions",
            RemoteDocument::new("inst-2")
                .with("name", "Pending College")
                .with("status", "pending"),
        )
        .await;
    remote
        .put(
            "users",
            RemoteDocument::new("u1")
                .with("email", "jane@example.org")
                .with("displayName", "Jane Doe"),
        )
        .await;
    remote.put("trees", tree_doc("doc-1", "Jane Doe").with("tree_id", "JD003")).await;

    let reports = service.sync_once(remote.clone()).await.unwrap();
    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.is_ok()));

    let store = service.store();
    assert_eq!(count(store, "SELECT COUNT(*) FROM institutions"), 1);
    // Join date falls back to the sync time
    assert!(text_at(store, "SELECT join_date FROM institutions WHERE id = 'inst-1'").is_some());
    assert_eq!(
        text_at(store, "SELECT display_name FROM users WHERE uid = 'u1'").as_deref(),
        Some("Jane Doe")
    );
    assert_eq!(
        text_at(store, "SELECT remote_doc_id FROM trees WHERE tree_id = 'JD003'").as_deref(),
        Some("doc-1")
    );
    assert!(text_at(store, "SELECT last_sync_time FROM trees WHERE tree_id = 'JD003'").is_some());
}

/// Test a changed remote field overwrites the local row instead of duplicating it
#[tokio::test]
async fn test_update_keeps_one_row() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let remote = Arc::new(MemoryRemoteStore::new());
    let reconciler = service.reconciler(remote.clone());
    let trees = tally_store::sync::mapping::trees().unwrap();

    remote.put("trees", tree_doc("doc-x", "Ann Bee").with("co2_kg", 1.0)).await;
    let first = reconciler.reconcile_collection(&trees).await.unwrap();
    assert_eq!(first.inserted, 1);

    remote.put("trees", tree_doc("doc-x", "Ann Bee").with("co2_kg", 2.0)).await;
    let second = reconciler.reconcile_collection(&trees).await.unwrap();
    assert_eq!((second.inserted, second.updated), (0, 1));

    let store = service.store();
    assert_eq!(count(store, "SELECT COUNT(*) FROM trees"), 1);
    let co2: f64 = store
        .with_conn(|conn| conn.query_row("SELECT co2_kg FROM trees WHERE tree_id = 'doc-x'", [], |row| row.get(0)))
        .unwrap();
    assert_eq!(co2, 2.0);
}

/// Test one malformed document out of ten is skipped and the rest land
#[tokio::test]
async fn test_malformed_document_is_skipped() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let remote = Arc::new(MemoryRemoteStore::new());

    for i in 1..=10 {
        let doc = if i == 5 {
            tree_doc(&format!("doc-{:02}", i), "Jane Doe").with("dbh_cm", "not a number")
        } else {
            tree_doc(&format!("doc-{:02}", i), "Jane Doe")
        };
        remote.put("trees", doc).await;
    }

    let trees = tally_store::sync::mapping::trees().unwrap();
    let counts = service.reconciler(remote.clone()).reconcile_collection(&trees).await.unwrap();
    assert_eq!(counts.inserted, 9);
    assert_eq!(counts.skipped, 1);
    assert_eq!(count(service.store(), "SELECT COUNT(*) FROM trees WHERE tree_id = 'doc-05'"), 0);
}

/// Test locally recorded trees survive a sync and keep empty provenance
#[tokio::test]
async fn test_local_rows_survive_sync() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);

    let recorder = service.planting_recorder(None);
    let planted = recorder
        .record(&PlantingSubmission {
            submission_key: "form-1".to_string(),
            planters_name: "Jane Doe".to_string(),
            dbh_cm: Some(10.0),
            height_m: Some(2.0),
            ..Default::default()
        })
        .unwrap();
    assert_eq!(planted.tree_id.as_str(), "JD001");

    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put("trees", tree_doc("doc-1", "Ann Bee")).await;
    service.sync_once(remote.clone()).await.unwrap();

    let store = service.store();
    assert_eq!(count(store, "SELECT COUNT(*) FROM trees"), 2);
    assert_eq!(text_at(store, "SELECT remote_doc_id FROM trees WHERE tree_id = 'JD001'"), None);
}

/// Remote store that panics on its first few fetches
struct FlakyRemote {
    inner: MemoryRemoteStore,
    panics_left: AtomicU32,
}

#[async_trait]
impl RemoteStore for FlakyRemote {
    async fn list_documents(&self, collection: &str) -> Result<Vec<RemoteDocument>, SyncError> {
        if self
            .panics_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            panic!("remote client bug");
        }
        self.inner.list_documents(collection).await
    }
}

/// Test a panicking pass is contained and the loop recovers on retry
#[tokio::test]
async fn test_scheduler_survives_panicking_remote() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);

    let inner = MemoryRemoteStore::new();
    inner
        .put(
            "users",
            RemoteDocument::new("u1").with("email", RemoteValue::String("a@b.org".to_string())),
        )
        .await;
    let remote: Arc<dyn RemoteStore> = Arc::new(FlakyRemote {
        inner,
        panics_left: AtomicU32::new(2),
    });

    let reconciler = SyncReconciler::new(service.store().clone(), remote, Duration::from_secs(5));
    let scheduler = SyncScheduler::new(
        reconciler,
        vec![tally_store::sync::mapping::users().unwrap()],
        SchedulerSettings {
            interval: Duration::from_secs(60),
            retry_delay: Duration::from_millis(20),
            shutdown_grace: Duration::from_secs(1),
            outage_alert_threshold: 2,
        },
    );

    assert!(scheduler.start().await);
    assert!(!scheduler.start().await);
    assert_eq!(scheduler.status().failed_passes, 1);

    let mut status = scheduler.subscribe();
    tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.consecutive_failures == 0 && s.passes >= 3))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(count(service.store(), "SELECT COUNT(*) FROM users"), 1);

    assert!(scheduler.stop().await);
    assert_eq!(scheduler.status().state, SchedulerState::Stopped);
    assert!(!scheduler.stop().await);
}

/// Test the service-built scheduler stops promptly while idle
#[tokio::test]
async fn test_service_scheduler_start_stop() {
    let temp_dir = TempDir::new().unwrap();
    let service = service(&temp_dir);
    let remote = Arc::new(MemoryRemoteStore::new());
    remote.put("trees", tree_doc("doc-1", "Ann Bee")).await;

    let scheduler = service.scheduler(remote.clone()).unwrap();
    assert!(scheduler.start().await);
    assert!(scheduler.is_running());

    // First pass runs before start returns
    let status = scheduler.status();
    assert_eq!(status.passes, 1);
    assert_eq!(status.last_pass.len(), 3);
    assert_eq!(count(service.store(), "SELECT COUNT(*) FROM trees"), 1);

    tokio::time::timeout(Duration::from_secs(2), scheduler.stop())
        .await
        .unwrap();
    assert!(!scheduler.is_running());
    assert_eq!(remote.fetch_count("trees").await, 1);
}
