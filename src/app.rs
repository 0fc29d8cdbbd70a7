use std::sync::Arc;

use camino::Utf8Path;
use tracing::{info, warn};

use crate::acquire::AcquisitionRouter;
use crate::amqp::AmqpSession;
use crate::archive::UsiArchiveClient;
use crate::batch::{BatchRunner, BatchSummary, PlanLoader};
use crate::bundle::{BundleAcquirer, HcaCliBundleRepository};
use crate::config::ResolvedConfig;
use crate::consumer::QueueConsumer;
use crate::convert::Fastq2BamConverter;
use crate::error::KiraError;
use crate::object_store::{HttpObjectStore, RangedAcquirer};
use crate::pipeline::{JobHandler, Pipeline};
use crate::process::find_in_path;
use crate::publish::Publisher;
use crate::token::{BasicAuthTokenClient, Credentials, TokenCache};
use crate::tus::{HttpTusTransport, TusUploader};

const CONSUMER_TAG: &str = "kira-au";

pub struct App {
    config: ResolvedConfig,
    handler: Arc<dyn JobHandler>,
}

impl App {
    pub fn new(config: ResolvedConfig, handler: Arc<dyn JobHandler>) -> Self {
        Self { config, handler }
    }

    pub fn from_config(config: ResolvedConfig) -> Result<Self, KiraError> {
        let auth_url = config
            .auth
            .url
            .clone()
            .ok_or_else(|| KiraError::InvalidConfig("auth.url is required".to_string()))?;
        let token_client = BasicAuthTokenClient::new(
            auth_url,
            Credentials {
                username: config.auth.username.clone(),
                password: config.auth.password.clone(),
            },
        )?;
        let tokens = TokenCache::new(Arc::new(token_client), config.token);

        let ranged = RangedAcquirer::new(
            HttpObjectStore::new(&config.object_store.endpoint)?.with_credentials(
                config.object_store.region.clone(),
                config.object_store.credentials.clone(),
            ),
            config.object_store.range_size,
        );
        let bundle = BundleAcquirer::new(
            HcaCliBundleRepository::new(
                config.bundle.cli_path.clone(),
                config.bundle.replica.clone(),
            ),
            config.bundle.cache_dir.clone(),
        );
        let acquirer = AcquisitionRouter::new(Arc::new(ranged), Arc::new(bundle));

        if find_in_path(&config.conversion.tool_path.to_string_lossy()).is_none() {
            warn!(
                tool = %config.conversion.tool_path.display(),
                "fastq2bam not found, jobs with a conversion will fail"
            );
        }
        let converter = Fastq2BamConverter::new(
            config.conversion.tool_path.clone(),
            config.conversion.schema.clone(),
        );

        let uploader = TusUploader::new(
            HttpTusTransport::new()?,
            config.upload.chunk_size,
            &config.upload.retry_delays_ms,
        );
        let publisher = Publisher::new(
            tokens,
            Arc::new(UsiArchiveClient::new()?),
            Arc::new(uploader),
        );

        let pipeline = Pipeline::new(
            config.base_dir.clone(),
            Arc::new(acquirer),
            Arc::new(converter),
            publisher,
        );
        Ok(Self::new(config, Arc::new(pipeline)))
    }

    pub async fn run_batch(&self, plan_path: Option<&Utf8Path>) -> Result<BatchSummary, KiraError> {
        let plan_path = plan_path.unwrap_or(self.config.plan_path.as_path());
        info!(plan = %plan_path, base_dir = %self.config.base_dir, "loading upload plan");
        let plan = PlanLoader::load(plan_path).await?;
        Ok(BatchRunner::new(Arc::clone(&self.handler)).run(&plan).await)
    }

    pub async fn listen(&self) -> Result<(), KiraError> {
        let session = AmqpSession::connect(&self.config.amqp).await?;
        let deliveries = session.deliveries(CONSUMER_TAG).await?;
        let consumer = QueueConsumer::new(
            Arc::clone(&self.handler),
            usize::from(self.config.amqp.prefetch),
        );
        info!(queue = %self.config.amqp.queue, "listening for upload jobs");
        consumer.run(deliveries).await;
        session.close().await
    }
}
