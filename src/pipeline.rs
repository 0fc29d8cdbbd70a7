use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use serde::Serialize;
use tracing::{Instrument, error, info, info_span};

use crate::acquire::Acquirer;
use crate::convert::Converter;
use crate::domain::{Job, ManifestId, UploadOutcome};
use crate::error::KiraError;
use crate::publish::Publisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStage {
    Received,
    Acquiring,
    Converting,
    Publishing,
    Completed,
}

impl fmt::Display for JobStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobStage::Received => "received",
            JobStage::Acquiring => "acquiring",
            JobStage::Converting => "converting",
            JobStage::Publishing => "publishing",
            JobStage::Completed => "completed",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub manifest_id: ManifestId,
    pub outcomes: Vec<UploadOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversion_exit_code: Option<i32>,
}

#[derive(Debug)]
pub struct JobFailure {
    pub manifest_id: ManifestId,
    pub stage: JobStage,
    pub error: KiraError,
}

impl fmt::Display for JobFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} failed while {}: {}",
            self.manifest_id, self.stage, self.error
        )
    }
}

impl std::error::Error for JobFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<JobReport, JobFailure>;
}

#[derive(Clone)]
pub struct Pipeline {
    base_dir: Utf8PathBuf,
    acquirer: Arc<dyn Acquirer>,
    converter: Arc<dyn Converter>,
    publisher: Publisher,
}

impl Pipeline {
    pub fn new(
        base_dir: Utf8PathBuf,
        acquirer: Arc<dyn Acquirer>,
        converter: Arc<dyn Converter>,
        publisher: Publisher,
    ) -> Self {
        Self {
            base_dir,
            acquirer,
            converter,
            publisher,
        }
    }

    pub async fn run(&self, job: &Job) -> Result<JobReport, JobFailure> {
        let span = info_span!("job", manifest_id = %job.manifest_id);
        self.run_stages(job).instrument(span).await
    }

    async fn run_stages(&self, job: &Job) -> Result<JobReport, JobFailure> {
        let fail = |stage: JobStage| {
            move |error: KiraError| {
                error!(%stage, class = ?error.class(), error = %error, "job failed");
                JobFailure {
                    manifest_id: job.manifest_id.clone(),
                    stage,
                    error,
                }
            }
        };
        let work_dir = job.work_dir(&self.base_dir);
        info!(stage = %JobStage::Received, files = job.files_to_acquire().len(), "job received");

        info!(stage = %JobStage::Acquiring, "acquiring files");
        self.acquirer
            .acquire(job, &self.base_dir)
            .await
            .map_err(fail(JobStage::Acquiring))?;

        let conversion_exit_code = if job.conversion.is_some() {
            info!(stage = %JobStage::Converting, "converting");
            let code = self
                .converter
                .convert(job, &work_dir)
                .await
                .map_err(fail(JobStage::Converting))?;
            Some(code)
        } else {
            None
        };

        info!(stage = %JobStage::Publishing, "publishing");
        let outcomes = self
            .publisher
            .publish(job, &work_dir)
            .await
            .map_err(fail(JobStage::Publishing))?;

        info!(stage = %JobStage::Completed, ?outcomes, "job completed");
        Ok(JobReport {
            manifest_id: job.manifest_id.clone(),
            outcomes,
            conversion_exit_code,
        })
    }
}

#[async_trait]
impl JobHandler for Pipeline {
    async fn handle(&self, job: &Job) -> Result<JobReport, JobFailure> {
        self.run(job).await
    }
}
