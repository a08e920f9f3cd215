//! Application state management

use std::sync::Arc;

use crate::config::Config;
use crate::error::Result;
use crate::upload::{
    AdmissionQueue, ChunkStore, DirectoryRelocator, FileRelocator, PersistedUploadRepository,
    ReconciliationSweeper, SweepTarget, UploadCategory, UploadManager,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    project: UploadManager,
    modul: UploadManager,
    repository: Arc<dyn PersistedUploadRepository>,
    sweeper: ReconciliationSweeper,
}

impl AppState {
    /// Create a new application state
    ///
    /// Opens one chunk store per category, reloading any uploads left on disk
    /// by a previous run. The sweeper is built but not started.
    pub async fn new(
        config: Config,
        repository: Arc<dyn PersistedUploadRepository>,
    ) -> Result<Self> {
        let relocator: Arc<dyn FileRelocator> =
            Arc::new(DirectoryRelocator::new(config.upload.final_dir.clone()));

        let project =
            Self::build_manager(&config, UploadCategory::Project, relocator.clone()).await?;
        let modul = Self::build_manager(&config, UploadCategory::Modul, relocator).await?;

        let target = |manager: &UploadManager| SweepTarget {
            repository: repository.clone(),
            store: manager.store().clone(),
            queue: Some(manager.queue().clone()),
        };

        let sweeper = ReconciliationSweeper::new(
            Some(target(&project)),
            Some(target(&modul)),
            config.cleanup.interval(),
            config.cleanup.idle_timeout(),
            config.cleanup.expiry(),
        );

        Ok(Self {
            inner: Arc::new(AppStateInner {
                config,
                project,
                modul,
                repository,
                sweeper,
            }),
        })
    }

    async fn build_manager(
        config: &Config,
        category: UploadCategory,
        relocator: Arc<dyn FileRelocator>,
    ) -> Result<UploadManager> {
        let limits = config.upload.limits(category);
        let store = ChunkStore::open(
            config.upload.temp_dir_for(category),
            config.upload.max_size(category),
        )
        .await?;

        tracing::info!(
            category = %category,
            path = %store.base_path().display(),
            max_size = store.max_size(),
            max_concurrent = limits.max_concurrent,
            "Upload pipeline ready"
        );

        Ok(UploadManager::new(
            category,
            config.upload.tus_version.clone(),
            store,
            AdmissionQueue::new(limits.max_concurrent),
            relocator,
        ))
    }

    /// Seed the admission queues with uploads that were in flight at shutdown
    ///
    /// Uploads that were already receiving chunks go first, then uploads that
    /// were created but not started, oldest first. IDs whose bytes are gone
    /// from the chunk store are skipped; the sweeper will eventually clean
    /// them up.
    pub async fn rehydrate(&self) -> Result<()> {
        let repository = &self.inner.repository;

        for category in UploadCategory::ALL {
            let manager = self.manager(category);
            let mut ids = repository.active_upload_ids(category).await?;
            ids.extend(repository.pending_upload_ids(category).await?);

            let mut present = Vec::with_capacity(ids.len());
            for id in ids {
                if manager.store().contains(&id).await {
                    present.push(id);
                } else {
                    tracing::warn!(
                        upload_id = %id,
                        category = %category,
                        "Upload record has no stored bytes"
                    );
                }
            }

            tracing::info!(
                category = %category,
                count = present.len(),
                "Admission queue rehydrated"
            );
            manager.queue().load_from_db(present);
        }

        Ok(())
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the upload manager for a category
    pub fn manager(&self, category: UploadCategory) -> &UploadManager {
        match category {
            UploadCategory::Project => &self.inner.project,
            UploadCategory::Modul => &self.inner.modul,
        }
    }

    /// Get the durable upload repository
    pub fn repository(&self) -> &Arc<dyn PersistedUploadRepository> {
        &self.inner.repository
    }

    /// Get the reconciliation sweeper
    pub fn sweeper(&self) -> &ReconciliationSweeper {
        &self.inner.sweeper
    }
}
