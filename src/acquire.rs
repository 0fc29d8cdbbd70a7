use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use crate::domain::{File, Job};
use crate::error::KiraError;
use crate::fs_util;

#[async_trait]
pub trait Acquirer: Send + Sync {
    async fn acquire(&self, job: &Job, base_dir: &Utf8Path) -> Result<(), KiraError>;
}

pub async fn pending_files<'a>(
    job: &'a Job,
    base_dir: &Utf8Path,
) -> Result<(Utf8PathBuf, Vec<&'a File>), KiraError> {
    let work_dir = job.work_dir(base_dir);
    fs_util::ensure_dir(&work_dir).await?;
    let mut pending = Vec::new();
    for file in job.files_to_acquire() {
        let path = work_dir.join(file.name.as_str());
        if fs_util::file_exists(&path).await {
            debug!(manifest_id = %job.manifest_id, file = %file.name, "already present, skipping");
        } else {
            pending.push(file);
        }
    }
    Ok((work_dir, pending))
}

#[derive(Clone)]
pub struct AcquisitionRouter {
    object_store: Arc<dyn Acquirer>,
    bundle: Arc<dyn Acquirer>,
}

impl AcquisitionRouter {
    pub fn new(object_store: Arc<dyn Acquirer>, bundle: Arc<dyn Acquirer>) -> Self {
        Self {
            object_store,
            bundle,
        }
    }

    fn strategy_for(&self, job: &Job) -> &Arc<dyn Acquirer> {
        match job.bundle_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => &self.bundle,
            _ => &self.object_store,
        }
    }
}

#[async_trait]
impl Acquirer for AcquisitionRouter {
    async fn acquire(&self, job: &Job, base_dir: &Utf8Path) -> Result<(), KiraError> {
        self.strategy_for(job).acquire(job, base_dir).await
    }
}
