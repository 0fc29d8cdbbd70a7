use std::sync::Arc;

use camino::Utf8Path;
use serde::Serialize;
use tracing::{error, info};

use crate::domain::{ManifestId, Plan};
use crate::error::KiraError;
use crate::pipeline::{JobHandler, JobReport, JobStage};

pub struct PlanLoader;

impl PlanLoader {
    pub async fn load(path: &Utf8Path) -> Result<Plan, KiraError> {
        let content = match tokio::fs::read(path.as_std_path()).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Err(KiraError::MissingPlan(path.as_std_path().to_path_buf()));
            }
            Err(err) => return Err(KiraError::Filesystem(format!("read {path}: {err}"))),
        };
        Self::parse(&content)
    }

    pub fn parse(content: &[u8]) -> Result<Plan, KiraError> {
        serde_json::from_slice(content).map_err(|err| KiraError::PlanParse(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedJob {
    pub manifest_id: ManifestId,
    pub stage: JobStage,
    pub error: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchSummary {
    pub attempted: usize,
    pub completed: Vec<JobReport>,
    pub failed: Vec<FailedJob>,
}

#[derive(Clone)]
pub struct BatchRunner {
    handler: Arc<dyn JobHandler>,
}

impl BatchRunner {
    pub fn new(handler: Arc<dyn JobHandler>) -> Self {
        Self { handler }
    }

    pub async fn run(&self, plan: &Plan) -> BatchSummary {
        let mut summary = BatchSummary::default();
        info!(jobs = plan.jobs.len(), "starting batch");
        for job in &plan.jobs {
            summary.attempted += 1;
            match self.handler.handle(job).await {
                Ok(report) => summary.completed.push(report),
                Err(failure) => {
                    error!(
                        manifest_id = %failure.manifest_id,
                        stage = %failure.stage,
                        error = %failure.error,
                        "job failed, continuing with next job"
                    );
                    summary.failed.push(FailedJob {
                        manifest_id: failure.manifest_id,
                        stage: failure.stage,
                        error: failure.error.to_string(),
                    });
                }
            }
        }
        info!(
            attempted = summary.attempted,
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "finished"
        );
        summary
    }
}
