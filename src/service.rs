//! Service object wiring the store, allocator, recorder and sync together
//!
//! Everything hangs off one explicitly constructed [`TallyService`]; there is
//! no process-global state.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::allocator::SequenceAllocator;
use crate::config::Config;
use crate::db::migration::{self, MigrationOutcome};
use crate::db::{tables, LocalStore, TableSchema};
use crate::error::{MigrationError, StoreError};
use crate::monitoring::MonitoringRecorder;
use crate::planting::{BasicVolumeModel, CarbonModel, PlantingRecorder};
use crate::sync::{
    mapping, CollectionMapping, CollectionReport, FirestoreClient, RemoteStore, SchedulerSettings, SyncReconciler,
    SyncScheduler,
};

pub struct TallyService {
    config: Config,
    store: Arc<LocalStore>,
    allocator: Arc<SequenceAllocator>,
}

impl TallyService {
    /// Open the database under the configured storage directory
    pub fn open(config: Config) -> Result<Self, StoreError> {
        std::fs::create_dir_all(&config.storage_dir)?;
        let store = LocalStore::open(&config.database_path())?;
        Ok(Self::with_store(config, Arc::new(store)))
    }

    pub fn with_store(config: Config, store: Arc<LocalStore>) -> Self {
        let allocator = Arc::new(SequenceAllocator::new(
            store.clone(),
            config.id_suffix_width,
            config.allocation_retries,
        ));
        Self {
            config,
            store,
            allocator,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<SequenceAllocator> {
        &self.allocator
    }

    /// Bring every table up to its target schema.
    ///
    /// On a migration failure the schema is reinitialized and the migration
    /// retried once; a second failure is returned.
    pub fn prepare_store(&self) -> Result<Vec<(String, MigrationOutcome)>, StoreError> {
        let schemas = tables::target_schemas()?;

        match self.migrate_all(&schemas) {
            Ok(outcomes) => Ok(outcomes),
            Err(first) => {
                warn!(error = %first, "Migration failed, reinitializing schema and retrying");
                self.store
                    .with_conn_mut(|conn| migration::reinitialize(conn, &schemas))?;
                self.migrate_all(&schemas).map_err(|e| {
                    error!(error = %e, "Migration failed after reinitialize");
                    StoreError::from(e)
                })
            }
        }
    }

    fn migrate_all(&self, schemas: &[TableSchema]) -> Result<Vec<(String, MigrationOutcome)>, MigrationError> {
        self.store.with_conn_mut(|conn| {
            let mut outcomes = Vec::with_capacity(schemas.len());
            for schema in schemas {
                let outcome = migration::ensure_table(conn, schema)?;
                if outcome == MigrationOutcome::Created && schema.name == tables::SPECIES {
                    tables::seed_species(conn)?;
                }
                outcomes.push((schema.name.clone(), outcome));
            }
            Ok(outcomes)
        })
    }

    /// Recorder using `carbon`, or [`BasicVolumeModel`] when `None`
    pub fn planting_recorder(&self, carbon: Option<Arc<dyn CarbonModel>>) -> PlantingRecorder {
        PlantingRecorder::new(self.store.clone(), self.allocator.clone(), carbon_or_default(carbon))
    }

    /// Monitoring recorder using `carbon`, or [`BasicVolumeModel`] when `None`
    pub fn monitoring_recorder(&self, carbon: Option<Arc<dyn CarbonModel>>) -> MonitoringRecorder {
        MonitoringRecorder::new(self.store.clone(), carbon_or_default(carbon))
    }

    /// Mappings for the configured collections, in configured order
    pub fn mappings(&self) -> Result<Vec<CollectionMapping>, StoreError> {
        self.config
            .tracked_collections
            .iter()
            .map(|name| {
                mapping::for_collection(name)?
                    .ok_or_else(|| StoreError::Config(format!("No mapping for tracked collection {}", name)))
            })
            .collect()
    }

    /// Firestore client from config; `None` when no project is configured
    pub fn remote_from_config(&self) -> Result<Option<Arc<dyn RemoteStore>>, StoreError> {
        let Some(project_id) = self.config.firestore.project_id.as_deref() else {
            return Ok(None);
        };
        let client: Arc<dyn RemoteStore> = Arc::new(FirestoreClient::new(
            &self.config.firestore,
            project_id,
            self.config.fetch_timeout(),
        )?);
        Ok(Some(client))
    }

    pub fn reconciler(&self, remote: Arc<dyn RemoteStore>) -> SyncReconciler {
        SyncReconciler::new(self.store.clone(), remote, self.config.fetch_timeout())
    }

    pub fn scheduler(&self, remote: Arc<dyn RemoteStore>) -> Result<SyncScheduler, StoreError> {
        let settings = SchedulerSettings {
            interval: self.config.sync_interval(),
            retry_delay: self.config.retry_delay(),
            shutdown_grace: self.config.shutdown_grace(),
            outage_alert_threshold: self.config.outage_alert_threshold,
        };
        Ok(SyncScheduler::new(self.reconciler(remote), self.mappings()?, settings))
    }

    /// One reconciliation pass over every tracked collection
    pub async fn sync_once(&self, remote: Arc<dyn RemoteStore>) -> Result<Vec<CollectionReport>, StoreError> {
        let mappings = self.mappings()?;
        let reports = self.reconciler(remote).reconcile_all(&mappings).await;
        let failed = reports.iter().filter(|r| !r.is_ok()).count();
        info!(collections = reports.len(), failed, "Sync pass finished");
        Ok(reports)
    }
}

fn carbon_or_default(carbon: Option<Arc<dyn CarbonModel>>) -> Arc<dyn CarbonModel> {
    carbon.unwrap_or_else(|| Arc::new(BasicVolumeModel::default()))
}
