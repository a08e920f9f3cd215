//! Reconciliation Sweeper
//!
//! Upload state lives in three places that fail independently: durable status
//! in the repository, bytes in the chunk store and slots in the admission
//! queue. The sweeper periodically cross-references them and removes:
//! - expired uploads: created but never started within the expiry window
//! - abandoned uploads: started but idle longer than the idle timeout

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::chunk_store::ChunkStore;
use super::queue::AdmissionQueue;
use super::repository::{PersistedStatus, PersistedUploadRepository};
use super::types::{Removal, UploadCategory, UploadError, DEFAULT_CLEANUP_INTERVAL_SECS};

/// What the sweeper reconciles for one upload category
#[derive(Clone)]
pub struct SweepTarget {
    pub repository: Arc<dyn PersistedUploadRepository>,
    pub store: ChunkStore,

    /// Queue whose slots are released for swept uploads
    pub queue: Option<AdmissionQueue>,
}

/// Result of one cleanup pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub removed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum Pass {
    Expired,
    Abandoned,
}

impl Pass {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Abandoned => "abandoned",
        }
    }
}

struct RunningLoop {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

// ============================================================================
// Sweeper
// ============================================================================

#[derive(Clone)]
pub struct ReconciliationSweeper {
    inner: Arc<SweeperInner>,
}

struct SweeperInner {
    project: Option<SweepTarget>,
    modul: Option<SweepTarget>,
    interval: Duration,
    idle_timeout: Duration,
    expiry: Duration,
    running: Mutex<Option<RunningLoop>>,
}

impl ReconciliationSweeper {
    /// A target may be `None` for a category this deployment does not use
    pub fn new(
        project: Option<SweepTarget>,
        modul: Option<SweepTarget>,
        interval: Duration,
        idle_timeout: Duration,
        expiry: Duration,
    ) -> Self {
        // tokio::time::interval panics on a zero period
        let interval = if interval.is_zero() {
            tracing::warn!(
                "cleanup interval is 0, using default of {} seconds",
                DEFAULT_CLEANUP_INTERVAL_SECS
            );
            Duration::from_secs(DEFAULT_CLEANUP_INTERVAL_SECS)
        } else {
            interval
        };

        Self {
            inner: Arc::new(SweeperInner {
                project,
                modul,
                interval,
                idle_timeout,
                expiry,
                running: Mutex::new(None),
            }),
        }
    }

    fn target(&self, category: UploadCategory) -> Option<&SweepTarget> {
        match category {
            UploadCategory::Project => self.inner.project.as_ref(),
            UploadCategory::Modul => self.inner.modul.as_ref(),
        }
    }

    // ========================================================================
    // Background Loop
    // ========================================================================

    /// Start the periodic loop. Returns `false` if it was already running.
    pub fn start(&self) -> bool {
        let mut running = self.inner.running.lock();
        if running.as_ref().is_some_and(|r| !r.handle.is_finished()) {
            return false;
        }

        let token = CancellationToken::new();
        let child = token.clone();
        let sweeper = self.clone();
        let period = self.inner.interval;

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = ticker.tick() => sweeper.run_once().await,
                }
            }

            tracing::info!("Reconciliation sweeper stopped");
        });

        *running = Some(RunningLoop { token, handle });

        tracing::info!(interval_secs = period.as_secs(), "Reconciliation sweeper started");
        true
    }

    /// Cancel the loop. Returns `false` if it was not running.
    pub fn stop(&self) -> bool {
        match self.inner.running.lock().take() {
            Some(running) => {
                running.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .running
            .lock()
            .as_ref()
            .is_some_and(|r| !r.handle.is_finished())
    }

    /// Run every pass once. A failing pass is logged and does not stop the others.
    pub async fn run_once(&self) {
        for category in UploadCategory::ALL {
            for pass in [Pass::Expired, Pass::Abandoned] {
                match self.sweep(category, pass).await {
                    Ok(report) if report.examined > 0 => {
                        tracing::info!(
                            category = %category,
                            pass = pass.as_str(),
                            examined = report.examined,
                            removed = report.removed,
                            failed = report.failed,
                            "Cleanup pass finished"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(
                            category = %category,
                            pass = pass.as_str(),
                            error = %e,
                            "Cleanup pass failed"
                        );
                    }
                }
            }
        }
    }

    // ========================================================================
    // Cleanup Passes
    // ========================================================================

    pub async fn cleanup_expired_projects(&self) -> Result<SweepReport, UploadError> {
        self.sweep(UploadCategory::Project, Pass::Expired).await
    }

    pub async fn cleanup_abandoned_projects(&self) -> Result<SweepReport, UploadError> {
        self.sweep(UploadCategory::Project, Pass::Abandoned).await
    }

    pub async fn cleanup_expired_moduls(&self) -> Result<SweepReport, UploadError> {
        self.sweep(UploadCategory::Modul, Pass::Expired).await
    }

    pub async fn cleanup_abandoned_moduls(&self) -> Result<SweepReport, UploadError> {
        self.sweep(UploadCategory::Modul, Pass::Abandoned).await
    }

    /// Delete a single upload's artifacts from every configured store
    pub async fn cleanup_upload(&self, id: &str) -> Result<Removal, UploadError> {
        let mut removal = Removal::AlreadyAbsent;

        for target in [&self.inner.project, &self.inner.modul].into_iter().flatten() {
            if target.store.terminate(id).await?.was_deleted() {
                removal = Removal::Deleted;
            }
            if let Some(queue) = &target.queue {
                queue.finish_upload(id);
            }
        }

        Ok(removal)
    }

    async fn sweep(
        &self,
        category: UploadCategory,
        pass: Pass,
    ) -> Result<SweepReport, UploadError> {
        let Some(target) = self.target(category) else {
            return Ok(SweepReport::default());
        };

        let candidates = match pass {
            Pass::Expired => {
                let cutoff = Utc::now() - to_chrono(self.inner.expiry);
                target.repository.expired_candidates(category, cutoff).await?
            }
            Pass::Abandoned => {
                let cutoff = Utc::now() - to_chrono(self.inner.idle_timeout);
                target.repository.abandoned_candidates(category, cutoff).await?
            }
        };

        let mut report = SweepReport {
            examined: candidates.len(),
            ..SweepReport::default()
        };

        for id in candidates {
            if let Err(e) = target.store.terminate(&id).await {
                tracing::warn!(
                    upload_id = %id,
                    category = %category,
                    error = %e,
                    "Failed to delete upload artifacts"
                );
                report.failed += 1;
                continue;
            }

            if let Some(queue) = &target.queue {
                queue.finish_upload(&id);
            }

            let recorded = match pass {
                Pass::Expired => target.repository.delete(&id).await.map(|_| ()),
                Pass::Abandoned => {
                    target
                        .repository
                        .update_status(&id, PersistedStatus::Failed)
                        .await
                }
            };
            if let Err(e) = recorded {
                tracing::warn!(
                    upload_id = %id,
                    category = %category,
                    error = %e,
                    "Failed to record cleanup in repository"
                );
            }

            tracing::debug!(
                upload_id = %id,
                category = %category,
                pass = pass.as_str(),
                "Upload swept"
            );
            report.removed += 1;
        }

        Ok(report)
    }
}

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or_else(|_| chrono::Duration::days(365 * 100))
}

// ============================================================================
// Tests
// ============================================================================
