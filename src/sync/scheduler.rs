//! Periodic sync driver
//!
//! `start()` runs one pass inline so callers see a warm cache, then spawns a
//! background task that repeats the pass every interval. A failed or panicked
//! pass shortens the next wait to the retry delay. `stop()` signals the task
//! and gives an in-flight pass a grace period before aborting it.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::mapping::CollectionMapping;
use super::reconciler::{SyncCounts, SyncReconciler};

/// Timing knobs for the sync loop
#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    pub retry_delay: Duration,
    pub shutdown_grace: Duration,
    /// Consecutive failed passes before the outage is reported
    pub outage_alert_threshold: u32,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            retry_delay: Duration::from_secs(60),
            shutdown_grace: Duration::from_secs(5),
            outage_alert_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

/// Outcome of one collection in the latest pass
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionSummary {
    pub collection: String,
    pub counts: Option<SyncCounts>,
    pub error: Option<String>,
}

/// Snapshot of scheduler progress
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub passes: u64,
    pub failed_passes: u64,
    pub consecutive_failures: u32,
    pub last_pass_at: Option<DateTime<Utc>>,
    pub last_pass: Vec<CollectionSummary>,
}

impl Default for SchedulerStatus {
    fn default() -> Self {
        Self {
            state: SchedulerState::Stopped,
            passes: 0,
            failed_passes: 0,
            consecutive_failures: 0,
            last_pass_at: None,
            last_pass: Vec::new(),
        }
    }
}

struct RunningTask {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// State shared between the scheduler handle and its task
struct Shared {
    reconciler: SyncReconciler,
    mappings: Vec<CollectionMapping>,
    settings: SchedulerSettings,
    status_tx: watch::Sender<SchedulerStatus>,
}

/// Drives [`SyncReconciler`] on a fixed interval
pub struct SyncScheduler {
    shared: Arc<Shared>,
    task: Mutex<Option<RunningTask>>,
}

impl SyncScheduler {
    pub fn new(reconciler: SyncReconciler, mappings: Vec<CollectionMapping>, settings: SchedulerSettings) -> Self {
        let (status_tx, _) = watch::channel(SchedulerStatus::default());
        Self {
            shared: Arc::new(Shared {
                reconciler,
                mappings,
                settings,
                status_tx,
            }),
            task: Mutex::new(None),
        }
    }

    /// Run the first pass and start the background loop.
    ///
    /// Returns `false` without doing anything when already running.
    pub async fn start(&self) -> bool {
        let mut task = self.task.lock().await;
        if task.is_some() {
            debug!("Sync scheduler already running");
            return false;
        }

        self.shared
            .status_tx
            .send_modify(|status| status.state = SchedulerState::Running);
        info!(
            collections = self.shared.mappings.len(),
            interval_secs = self.shared.settings.interval.as_secs(),
            "Starting sync scheduler"
        );

        let first_ok = self.shared.run_pass().await;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            shared.run_loop(first_ok, shutdown_rx).await;
        });

        *task = Some(RunningTask { shutdown_tx, handle });
        true
    }

    /// Signal the loop to exit and wait up to the grace period for it.
    ///
    /// Returns `false` when the scheduler was not running.
    pub async fn stop(&self) -> bool {
        let Some(RunningTask { shutdown_tx, mut handle }) = self.task.lock().await.take() else {
            return false;
        };

        // The receiver may already be gone if the task died
        let _ = shutdown_tx.send(true);

        match tokio::time::timeout(self.shared.settings.shutdown_grace, &mut handle).await {
            Ok(Ok(())) => info!("Sync scheduler stopped"),
            Ok(Err(e)) => warn!(error = %e, "Sync task ended abnormally"),
            Err(_) => {
                warn!(
                    grace_secs = self.shared.settings.shutdown_grace.as_secs(),
                    "Sync pass still running after grace period, aborting"
                );
                handle.abort();
            }
        }

        self.shared
            .status_tx
            .send_modify(|status| status.state = SchedulerState::Stopped);
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        self.shared.status_tx.borrow().clone()
    }

    /// Receiver that observes every status change
    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.shared.status_tx.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.shared.status_tx.borrow().state == SchedulerState::Running
    }
}

impl Shared {
    async fn run_loop(&self, mut last_ok: bool, mut shutdown: watch::Receiver<bool>) {
        loop {
            let wait = if last_ok {
                self.settings.interval
            } else {
                self.settings.retry_delay
            };

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                // Only ever set to true, or the sender is gone
                _ = shutdown.changed() => {
                    debug!("Sync loop received shutdown");
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            last_ok = self.run_pass().await;
        }
    }

    /// One pass over every collection. Returns whether all of them succeeded.
    async fn run_pass(&self) -> bool {
        let outcome = AssertUnwindSafe(self.reconciler.reconcile_all(&self.mappings))
            .catch_unwind()
            .await;

        let (ok, summaries) = match outcome {
            Ok(reports) => {
                let ok = reports.iter().all(|r| r.is_ok());
                let summaries = reports
                    .into_iter()
                    .map(|r| match r.result {
                        Ok(counts) => CollectionSummary {
                            collection: r.collection,
                            counts: Some(counts),
                            error: None,
                        },
                        Err(e) => CollectionSummary {
                            collection: r.collection,
                            counts: None,
                            error: Some(e.to_string()),
                        },
                    })
                    .collect();
                (ok, summaries)
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                error!(panic = %message, "Sync pass panicked");
                (false, Vec::new())
            }
        };

        let threshold = self.settings.outage_alert_threshold.max(1);
        self.status_tx.send_modify(|status| {
            status.passes += 1;
            status.last_pass_at = Some(Utc::now());
            status.last_pass = summaries;

            if ok {
                if status.consecutive_failures >= threshold {
                    info!(
                        failed_passes = status.consecutive_failures,
                        "Remote store reachable again"
                    );
                }
                status.consecutive_failures = 0;
            } else {
                status.failed_passes += 1;
                status.consecutive_failures += 1;
                if status.consecutive_failures == threshold {
                    error!(
                        consecutive_failures = status.consecutive_failures,
                        "Remote store unavailable"
                    );
                }
            }
        });

        if ok {
            debug!("Sync pass complete");
        } else {
            warn!(retry_secs = self.settings.retry_delay.as_secs(), "Sync pass had failures");
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{migration, tables, LocalStore};
    use crate::sync::mapping;
    use crate::sync::remote::{MemoryRemoteStore, RemoteDocument};

    fn settings() -> SchedulerSettings {
        SchedulerSettings {
            interval: Duration::from_millis(40),
            retry_delay: Duration::from_millis(10),
            shutdown_grace: Duration::from_millis(500),
            outage_alert_threshold: 2,
        }
    }

    fn scheduler(remote: Arc<MemoryRemoteStore>, settings: SchedulerSettings) -> SyncScheduler {
        let store = LocalStore::open_in_memory().unwrap();
        store
            .with_conn_mut(|conn| {
                for schema in tables::target_schemas()? {
                    migration::ensure_table(conn, &schema)?;
                }
                Ok::<_, crate::error::MigrationError>(())
            })
            .unwrap();
        let reconciler = SyncReconciler::new(Arc::new(store), remote, Duration::from_secs(1));
        SyncScheduler::new(reconciler, vec![mapping::users().unwrap()], settings)
    }

    #[tokio::test]
    async fn test_start_stop_state_machine() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.put("users", RemoteDocument::new("u1").with("email", "a@example.org")).await;
        let scheduler = scheduler(remote, settings());

        assert!(!scheduler.is_running());
        assert!(!scheduler.stop().await);

        assert!(scheduler.start().await);
        assert!(scheduler.is_running());
        // First pass already ran inline
        let status = scheduler.status();
        assert_eq!(status.passes, 1);
        assert_eq!(status.last_pass[0].counts.unwrap().inserted, 1);

        assert!(!scheduler.start().await);

        assert!(scheduler.stop().await);
        assert!(!scheduler.is_running());
        assert_eq!(scheduler.status().state, SchedulerState::Stopped);

        // Restartable
        assert!(scheduler.start().await);
        assert!(scheduler.stop().await);
    }

    #[tokio::test]
    async fn test_failed_pass_retries_sooner() {
        let remote = Arc::new(MemoryRemoteStore::new());
        remote.set_unavailable("users", Some("offline")).await;

        let scheduler = scheduler(
            remote.clone(),
            SchedulerSettings {
                interval: Duration::from_secs(3600),
                ..settings()
            },
        );
        scheduler.start().await;
        assert_eq!(scheduler.status().consecutive_failures, 1);

        // Only the retry delay separates passes while the remote is down
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(remote.fetch_count("users").await >= 3);
        assert!(scheduler.status().consecutive_failures >= 2);

        remote.set_unavailable("users", None).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = scheduler.status();
        assert_eq!(status.consecutive_failures, 0);
        let fetches = remote.fetch_count("users").await;

        // Back on the long interval
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(remote.fetch_count("users").await, fetches);

        scheduler.stop().await;
    }

    #[tokio::test]
    async fn test_stop_aborts_after_grace() {
        let remote = Arc::new(MemoryRemoteStore::new());
        let scheduler = scheduler(
            remote.clone(),
            SchedulerSettings {
                interval: Duration::from_millis(10),
                shutdown_grace: Duration::from_millis(50),
                ..settings()
            },
        );
        scheduler.start().await;

        // Next pass hangs on the remote
        remote.set_latency(Some(Duration::from_secs(30))).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        let started = std::time::Instant::now();
        assert!(scheduler.stop().await);
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!scheduler.is_running());
    }
}
