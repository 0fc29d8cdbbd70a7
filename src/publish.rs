use std::sync::Arc;

use camino::Utf8Path;
use tracing::info;

use crate::archive::ArchiveClient;
use crate::domain::{FileName, Job, UploadOutcome};
use crate::error::KiraError;
use crate::token::TokenCache;
use crate::tus::{ResumableTransfer, TransferRequest};

#[derive(Clone)]
pub struct Publisher {
    tokens: TokenCache,
    archive: Arc<dyn ArchiveClient>,
    transfer: Arc<dyn ResumableTransfer>,
}

impl Publisher {
    pub fn new(
        tokens: TokenCache,
        archive: Arc<dyn ArchiveClient>,
        transfer: Arc<dyn ResumableTransfer>,
    ) -> Self {
        Self {
            tokens,
            archive,
            transfer,
        }
    }

    pub async fn publish(
        &self,
        job: &Job,
        work_dir: &Utf8Path,
    ) -> Result<Vec<UploadOutcome>, KiraError> {
        let submission_id = job.submission_id()?;
        let files = job.files_to_publish();
        futures::future::try_join_all(
            files
                .iter()
                .map(|file_name| self.publish_file(job, &submission_id, file_name, work_dir)),
        )
        .await
    }

    async fn publish_file(
        &self,
        job: &Job,
        submission_id: &str,
        file_name: &FileName,
        work_dir: &Utf8Path,
    ) -> Result<UploadOutcome, KiraError> {
        let token = self.token().await?;
        let uploaded = self
            .archive
            .is_file_uploaded(&job.archive_api_url, submission_id, file_name.as_str(), &token)
            .await?;
        if uploaded {
            info!(
                manifest_id = %job.manifest_id,
                submission_id,
                file = %file_name,
                "file already uploaded for submission"
            );
            return Ok(UploadOutcome::AlreadyUploaded);
        }

        let path = work_dir.join(file_name.as_str());
        let size = tokio::fs::metadata(path.as_std_path())
            .await
            .map_err(|err| KiraError::Filesystem(format!("stat {path}: {err}")))?
            .len();
        let token = self.token().await?;
        let request = TransferRequest {
            endpoint: job.upload_endpoint(),
            path,
            file_name: file_name.clone(),
            size,
            metadata: vec![
                ("submission".to_string(), submission_id.to_string()),
                ("name".to_string(), file_name.to_string()),
                ("jwtToken".to_string(), token),
            ],
        };
        self.transfer.transfer(&request).await?;
        Ok(UploadOutcome::Uploaded)
    }

    async fn token(&self) -> Result<String, KiraError> {
        self.tokens
            .get_token()
            .await
            .map_err(|err| KiraError::UploadAuth(Box::new(err)))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use camino::Utf8PathBuf;
    use parking_lot::Mutex;

    use super::*;
    use crate::token::{TokenPolicy, TokenSource};

    struct StaticToken;

    #[async_trait]
    impl TokenSource for StaticToken {
        async fn retrieve_token(&self) -> Result<String, KiraError> {
            Ok("jwt".to_string())
        }
    }

    struct FailingToken;

    #[async_trait]
    impl TokenSource for FailingToken {
        async fn retrieve_token(&self) -> Result<String, KiraError> {
            Err(KiraError::AuthStatus {
                status: 401,
                message: "denied".to_string(),
            })
        }
    }

    struct KnownFiles(Vec<&'static str>);

    #[async_trait]
    impl ArchiveClient for KnownFiles {
        async fn is_file_uploaded(
            &self,
            _archive_api_url: &str,
            _submission_id: &str,
            file_name: &str,
            _token: &str,
        ) -> Result<bool, KiraError> {
            Ok(self.0.contains(&file_name))
        }
    }

    #[derive(Default)]
    struct RecordingTransfer {
        requests: Mutex<Vec<TransferRequest>>,
    }

    #[async_trait]
    impl ResumableTransfer for RecordingTransfer {
        async fn transfer(&self, request: &TransferRequest) -> Result<(), KiraError> {
            self.requests.lock().push(request.clone());
            Ok(())
        }
    }

    fn job() -> Job {
        serde_json::from_value(serde_json::json!({
            "manifest_id": "m-1",
            "submission_url": "https://usi/api/submissions/sub-1",
            "dsp_api_url": "https://usi",
            "files": [
                { "name": "R1.fastq.gz", "cloud_url": "s3://b/R1.fastq.gz" },
                { "name": "R2.fastq.gz", "cloud_url": "s3://b/R2.fastq.gz" }
            ]
        }))
        .unwrap()
    }

    fn work_dir(temp: &tempfile::TempDir) -> Utf8PathBuf {
        let dir = Utf8PathBuf::from_path_buf(temp.path().to_path_buf()).unwrap();
        std::fs::write(dir.join("R1.fastq.gz"), b"@r1").unwrap();
        std::fs::write(dir.join("R2.fastq.gz"), b"@r2r2").unwrap();
        dir
    }

    #[tokio::test]
    async fn uploads_missing_files_with_metadata() {
        let temp = tempfile::tempdir().unwrap();
        let dir = work_dir(&temp);
        let transfer = Arc::new(RecordingTransfer::default());
        let publisher = Publisher::new(
            TokenCache::new(Arc::new(StaticToken), TokenPolicy::default()),
            Arc::new(KnownFiles(vec!["R1.fastq.gz"])),
            transfer.clone(),
        );

        let outcomes = publisher.publish(&job(), &dir).await.unwrap();
        assert_eq!(
            outcomes,
            vec![UploadOutcome::AlreadyUploaded, UploadOutcome::Uploaded]
        );

        let requests = transfer.requests.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert_eq!(request.endpoint, "https://usi/files/");
        assert_eq!(request.file_name.as_str(), "R2.fastq.gz");
        assert_eq!(request.size, 5);
        assert_eq!(
            request.metadata,
            vec![
                ("submission".to_string(), "sub-1".to_string()),
                ("name".to_string(), "R2.fastq.gz".to_string()),
                ("jwtToken".to_string(), "jwt".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn auth_failure_is_an_upload_failure() {
        let temp = tempfile::tempdir().unwrap();
        let dir = work_dir(&temp);
        let transfer = Arc::new(RecordingTransfer::default());
        let publisher = Publisher::new(
            TokenCache::new(Arc::new(FailingToken), TokenPolicy::default()),
            Arc::new(KnownFiles(vec![])),
            transfer.clone(),
        );

        let err = publisher.publish(&job(), &dir).await.unwrap_err();
        assert_matches!(err, KiraError::UploadAuth(_));
        assert!(transfer.requests.lock().is_empty());
    }
}
