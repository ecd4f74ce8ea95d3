use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use anyhow::{Context, Result};
use log::debug;
use tokio::sync::{Mutex, RwLock};
use crate::job::{load_all_jobs, Job};

#[derive(Debug, Default)]
struct Snapshot {
    jobs: Arc<Vec<Job>>,
    loaded_at: Option<Instant>,
}

impl Snapshot {
    fn fresh(&self, ttl: Duration) -> bool {
        self.loaded_at.map_or(false, |at| at.elapsed() < ttl)
    }
}

/// Time-boxed listing of every persisted job.
///
/// Reads within the TTL return the previous snapshot even if job files changed.
/// Refreshes are serialized, so at most one directory scan runs at a time.
#[derive(Debug)]
pub struct JobCache {
    output_dir: PathBuf,
    ttl: Duration,
    snapshot: RwLock<Snapshot>,
    refresh: Mutex<()>,
}

impl JobCache {
    pub fn new(output_dir: PathBuf, ttl: Duration) -> Self {
        Self {
            output_dir,
            ttl,
            snapshot: RwLock::new(Snapshot::default()),
            refresh: Mutex::new(()),
        }
    }

    /// All known jobs; `force` rescans even within the TTL
    pub async fn get(&self, force: bool) -> Result<Arc<Vec<Job>>> {
        if !force {
            let snapshot = self.snapshot.read().await;
            if snapshot.fresh(self.ttl) {
                return Ok(Arc::clone(&snapshot.jobs));
            }
        }

        let _guard = self.refresh.lock().await;

        // Someone else may have refreshed while we waited for the lock
        if !force {
            let snapshot = self.snapshot.read().await;
            if snapshot.fresh(self.ttl) {
                return Ok(Arc::clone(&snapshot.jobs));
            }
        }

        let dir = self.output_dir.clone();
        let jobs = tokio::task::spawn_blocking(move || load_all_jobs(&dir))
            .await
            .context("Job listing task failed")??;
        debug!("Job cache refreshed: {} job(s)", jobs.len());

        let jobs = Arc::new(jobs);
        let mut snapshot = self.snapshot.write().await;
        snapshot.jobs = Arc::clone(&jobs);
        snapshot.loaded_at = Some(Instant::now());
        Ok(jobs)
    }
}
