use std::fmt;
use std::io::SeekFrom;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use camino::Utf8PathBuf;
use reqwest::header::{CACHE_CONTROL, CONTENT_TYPE, LOCATION};
use reqwest::{Client, StatusCode};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, warn};

use crate::domain::FileName;
use crate::error::KiraError;

pub const TUS_VERSION: &str = "1.0.0";
pub const DEFAULT_CHUNK_SIZE: usize = 2_000_000;
pub const DEFAULT_RETRY_DELAYS_MS: [u64; 4] = [0, 1000, 3000, 5000];

const TUS_RESUMABLE: &str = "Tus-Resumable";
const UPLOAD_LENGTH: &str = "Upload-Length";
const UPLOAD_METADATA: &str = "Upload-Metadata";
const UPLOAD_OFFSET: &str = "Upload-Offset";
const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub endpoint: String,
    pub path: Utf8PathBuf,
    pub file_name: FileName,
    pub size: u64,
    pub metadata: Vec<(String, String)>,
}

#[async_trait]
pub trait ResumableTransfer: Send + Sync {
    async fn transfer(&self, request: &TransferRequest) -> Result<(), KiraError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TusError {
    Transport(String),
    Status { status: u16, message: String },
    Protocol(String),
}

impl TusError {
    pub fn is_transient(&self) -> bool {
        match self {
            TusError::Transport(_) => true,
            TusError::Status { status, .. } => {
                matches!(status, 409 | 423 | 429) || (500..600).contains(status)
            }
            TusError::Protocol(_) => false,
        }
    }
}

impl fmt::Display for TusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TusError::Transport(message) => write!(f, "transport error: {message}"),
            TusError::Status { status, message } => write!(f, "status {status}: {message}"),
            TusError::Protocol(message) => write!(f, "protocol error: {message}"),
        }
    }
}

#[async_trait]
pub trait TusTransport: Send + Sync {
    async fn create(
        &self,
        endpoint: &str,
        upload_length: u64,
        metadata: &str,
    ) -> Result<String, TusError>;

    async fn patch(&self, upload_url: &str, offset: u64, chunk: Bytes) -> Result<u64, TusError>;

    async fn head(&self, upload_url: &str) -> Result<u64, TusError>;
}

/// `Upload-Metadata` value: comma separated `key base64(value)` pairs.
pub fn encode_metadata(metadata: &[(String, String)]) -> String {
    metadata
        .iter()
        .map(|(key, value)| format!("{key} {}", STANDARD.encode(value.as_bytes())))
        .collect::<Vec<_>>()
        .join(",")
}

#[derive(Clone)]
pub struct HttpTusTransport {
    client: Client,
}

impl HttpTusTransport {
    pub fn new() -> Result<Self, KiraError> {
        let client = Client::builder()
            .user_agent(format!("kira-au/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|err| KiraError::Upload {
                file_name: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }
}

async fn status_error(response: reqwest::Response) -> TusError {
    let status = response.status().as_u16();
    let message = response.text().await.unwrap_or_default();
    TusError::Status { status, message }
}

fn offset_header(response: &reqwest::Response) -> Result<u64, TusError> {
    response
        .headers()
        .get(UPLOAD_OFFSET)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse().ok())
        .ok_or_else(|| TusError::Protocol("missing Upload-Offset header".to_string()))
}

#[async_trait]
impl TusTransport for HttpTusTransport {
    async fn create(
        &self,
        endpoint: &str,
        upload_length: u64,
        metadata: &str,
    ) -> Result<String, TusError> {
        let response = self
            .client
            .post(endpoint)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_LENGTH, upload_length)
            .header(UPLOAD_METADATA, metadata)
            .send()
            .await
            .map_err(|err| TusError::Transport(err.to_string()))?;
        if response.status() != StatusCode::CREATED {
            return Err(status_error(response).await);
        }
        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|value| value.to_str().ok())
            .ok_or_else(|| TusError::Protocol("missing Location header".to_string()))?;
        let base = url::Url::parse(endpoint)
            .map_err(|err| TusError::Protocol(format!("invalid endpoint {endpoint}: {err}")))?;
        let upload_url = base
            .join(location)
            .map_err(|err| TusError::Protocol(format!("invalid Location {location}: {err}")))?;
        Ok(upload_url.to_string())
    }

    async fn patch(&self, upload_url: &str, offset: u64, chunk: Bytes) -> Result<u64, TusError> {
        let response = self
            .client
            .patch(upload_url)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(UPLOAD_OFFSET, offset)
            .header(CONTENT_TYPE, OFFSET_OCTET_STREAM)
            .body(chunk)
            .send()
            .await
            .map_err(|err| TusError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        offset_header(&response)
    }

    async fn head(&self, upload_url: &str) -> Result<u64, TusError> {
        let response = self
            .client
            .head(upload_url)
            .header(TUS_RESUMABLE, TUS_VERSION)
            .header(CACHE_CONTROL, "no-store")
            .send()
            .await
            .map_err(|err| TusError::Transport(err.to_string()))?;
        if !response.status().is_success() {
            return Err(status_error(response).await);
        }
        offset_header(&response)
    }
}

pub struct TusUploader<T: TusTransport> {
    transport: T,
    chunk_size: usize,
    retry_delays: Vec<Duration>,
}

impl<T: TusTransport> TusUploader<T> {
    pub fn new(transport: T, chunk_size: usize, retry_delays_ms: &[u64]) -> Self {
        Self {
            transport,
            chunk_size: chunk_size.max(1),
            retry_delays: retry_delays_ms
                .iter()
                .copied()
                .map(Duration::from_millis)
                .collect(),
        }
    }

    async fn create_with_retries(
        &self,
        request: &TransferRequest,
        metadata: &str,
    ) -> Result<String, KiraError> {
        let mut attempt = 0usize;
        loop {
            match self
                .transport
                .create(&request.endpoint, request.size, metadata)
                .await
            {
                Ok(url) => return Ok(url),
                Err(err) if err.is_transient() && attempt < self.retry_delays.len() => {
                    warn!(file = %request.file_name, error = %err, attempt, "upload creation failed, retrying");
                    tokio::time::sleep(self.retry_delays[attempt]).await;
                    attempt += 1;
                }
                Err(err) => return Err(upload_error(request, err)),
            }
        }
    }
}

fn upload_error(request: &TransferRequest, err: TusError) -> KiraError {
    KiraError::Upload {
        file_name: request.file_name.to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl<T: TusTransport> ResumableTransfer for TusUploader<T> {
    async fn transfer(&self, request: &TransferRequest) -> Result<(), KiraError> {
        let metadata = encode_metadata(&request.metadata);
        let upload_url = self.create_with_retries(request, &metadata).await?;
        info!(file = %request.file_name, size = request.size, upload_url, "upload created");

        let mut file = tokio::fs::File::open(request.path.as_std_path())
            .await
            .map_err(|err| KiraError::Filesystem(format!("open {}: {err}", request.path)))?;

        let mut offset = 0u64;
        let mut attempt = 0usize;
        while offset < request.size {
            let len = (request.size - offset).min(self.chunk_size as u64) as usize;
            let mut chunk = vec![0u8; len];
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|err| KiraError::Filesystem(format!("seek {}: {err}", request.path)))?;
            file.read_exact(&mut chunk)
                .await
                .map_err(|err| KiraError::Filesystem(format!("read {}: {err}", request.path)))?;

            match self
                .transport
                .patch(&upload_url, offset, Bytes::from(chunk))
                .await
            {
                Ok(new_offset) if new_offset > offset => {
                    debug!(file = %request.file_name, offset = new_offset, total = request.size, "chunk uploaded");
                    offset = new_offset;
                    attempt = 0;
                }
                Ok(new_offset) => {
                    return Err(upload_error(
                        request,
                        TusError::Protocol(format!(
                            "server offset {new_offset} did not advance past {offset}"
                        )),
                    ));
                }
                Err(err) if err.is_transient() && attempt < self.retry_delays.len() => {
                    warn!(file = %request.file_name, error = %err, offset, attempt, "chunk failed, retrying");
                    tokio::time::sleep(self.retry_delays[attempt]).await;
                    attempt += 1;
                    match self.transport.head(&upload_url).await {
                        Ok(server_offset) if server_offset <= request.size => offset = server_offset,
                        Ok(server_offset) => {
                            return Err(upload_error(
                                request,
                                TusError::Protocol(format!(
                                    "server offset {server_offset} beyond length {}",
                                    request.size
                                )),
                            ));
                        }
                        Err(err) if err.is_transient() => {
                            warn!(file = %request.file_name, error = %err, "offset lookup failed");
                        }
                        Err(err) => return Err(upload_error(request, err)),
                    }
                }
                Err(err) => return Err(upload_error(request, err)),
            }
        }
        info!(file = %request.file_name, bytes = request.size, "upload complete");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use assert_matches::assert_matches;
    use httpmock::Method::{HEAD, PATCH};
    use httpmock::prelude::*;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct MockTransport {
        creates: Mutex<Vec<(String, u64, String)>>,
        patches: Mutex<Vec<(u64, Vec<u8>)>>,
        heads: Mutex<usize>,
        patch_failures: Mutex<VecDeque<TusError>>,
        server_offset: Mutex<u64>,
    }

    #[async_trait]
    impl TusTransport for MockTransport {
        async fn create(
            &self,
            endpoint: &str,
            upload_length: u64,
            metadata: &str,
        ) -> Result<String, TusError> {
            self.creates
                .lock()
                .push((endpoint.to_string(), upload_length, metadata.to_string()));
            Ok(format!("{endpoint}upload-1"))
        }

        async fn patch(
            &self,
            _upload_url: &str,
            offset: u64,
            chunk: Bytes,
        ) -> Result<u64, TusError> {
            if let Some(err) = self.patch_failures.lock().pop_front() {
                return Err(err);
            }
            self.patches.lock().push((offset, chunk.to_vec()));
            let mut server_offset = self.server_offset.lock();
            *server_offset = offset + chunk.len() as u64;
            Ok(*server_offset)
        }

        async fn head(&self, _upload_url: &str) -> Result<u64, TusError> {
            *self.heads.lock() += 1;
            Ok(*self.server_offset.lock())
        }
    }

    fn request(dir: &tempfile::TempDir, contents: &[u8]) -> TransferRequest {
        let path = Utf8PathBuf::from_path_buf(dir.path().join("out.bam")).unwrap();
        std::fs::write(&path, contents).unwrap();
        TransferRequest {
            endpoint: "https://archive/files/".to_string(),
            path,
            file_name: "out.bam".parse().unwrap(),
            size: contents.len() as u64,
            metadata: vec![("submission".to_string(), "sub-1".to_string())],
        }
    }

    #[test]
    fn metadata_is_base64_encoded() {
        let metadata = vec![
            ("submission".to_string(), "sub-1".to_string()),
            ("name".to_string(), "a".to_string()),
        ];
        assert_eq!(encode_metadata(&metadata), "submission c3ViLTE=,name YQ==");
    }

    #[test]
    fn conflict_and_server_errors_are_transient() {
        let status = |status| TusError::Status {
            status,
            message: String::new(),
        };
        assert!(status(409).is_transient());
        assert!(status(423).is_transient());
        assert!(status(503).is_transient());
        assert!(!status(403).is_transient());
        assert!(!TusError::Protocol("x".to_string()).is_transient());
    }

    #[tokio::test]
    async fn uploads_in_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(&dir, b"abcde");
        let uploader = TusUploader::new(MockTransport::default(), 2, &[0]);

        uploader.transfer(&request).await.unwrap();

        let creates = uploader.transport.creates.lock();
        assert_eq!(creates.len(), 1);
        assert_eq!(creates[0].1, 5);
        assert_eq!(creates[0].2, "submission c3ViLTE=");
        let patches = uploader.transport.patches.lock();
        assert_eq!(
            *patches,
            vec![
                (0, b"ab".to_vec()),
                (2, b"cd".to_vec()),
                (4, b"e".to_vec())
            ]
        );
    }

    #[tokio::test]
    async fn zero_byte_file_needs_no_patch() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(&dir, b"");
        let uploader = TusUploader::new(MockTransport::default(), 2, &[0]);

        uploader.transfer(&request).await.unwrap();

        assert_eq!(uploader.transport.creates.lock().len(), 1);
        assert!(uploader.transport.patches.lock().is_empty());
    }

    #[tokio::test]
    async fn resumes_from_server_offset_after_transient_failure() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(&dir, b"abcdef");
        let transport = MockTransport::default();
        transport
            .patch_failures
            .lock()
            .push_back(TusError::Transport("reset".to_string()));
        let uploader = TusUploader::new(transport, 4, &[0, 0]);

        uploader.transfer(&request).await.unwrap();

        assert_eq!(*uploader.transport.heads.lock(), 1);
        let patches = uploader.transport.patches.lock();
        assert_eq!(
            *patches,
            vec![(0, b"abcd".to_vec()), (4, b"ef".to_vec())]
        );
    }

    #[tokio::test]
    async fn gives_up_when_schedule_is_exhausted() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(&dir, b"abc");
        let transport = MockTransport::default();
        for _ in 0..3 {
            transport.patch_failures.lock().push_back(TusError::Status {
                status: 503,
                message: "busy".to_string(),
            });
        }
        let uploader = TusUploader::new(transport, 4, &[0, 0]);

        let err = uploader.transfer(&request).await.unwrap_err();
        assert_matches!(err, KiraError::Upload { file_name, .. } if file_name == "out.bam");
        assert_eq!(*uploader.transport.heads.lock(), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let dir = tempfile::tempdir().unwrap();
        let request = request(&dir, b"abc");
        let transport = MockTransport::default();
        transport.patch_failures.lock().push_back(TusError::Status {
            status: 403,
            message: "forbidden".to_string(),
        });
        let uploader = TusUploader::new(transport, 4, &[0, 0]);

        let err = uploader.transfer(&request).await.unwrap_err();
        assert_matches!(err, KiraError::Upload { message, .. } if message.contains("403"));
        assert_eq!(*uploader.transport.heads.lock(), 0);
    }

    #[tokio::test]
    async fn http_transport_speaks_tus() {
        let server = MockServer::start_async().await;
        let create = server.mock(|when, then| {
            when.method(POST)
                .path("/files/")
                .header("Tus-Resumable", "1.0.0")
                .header("Upload-Length", "3")
                .header("Upload-Metadata", "name YQ==");
            then.status(201).header("Location", "/files/abc123");
        });
        let patch = server.mock(|when, then| {
            when.method(PATCH)
                .path("/files/abc123")
                .header("Upload-Offset", "0")
                .header("Content-Type", "application/offset+octet-stream")
                .body("xyz");
            then.status(204).header("Upload-Offset", "3");
        });
        let head = server.mock(|when, then| {
            when.method(HEAD).path("/files/abc123");
            then.status(200).header("Upload-Offset", "3");
        });

        let transport = HttpTusTransport::new().unwrap();
        let upload_url = transport
            .create(&server.url("/files/"), 3, "name YQ==")
            .await
            .unwrap();
        assert_eq!(upload_url, server.url("/files/abc123"));
        let offset = transport
            .patch(&upload_url, 0, Bytes::from_static(b"xyz"))
            .await
            .unwrap();
        assert_eq!(offset, 3);
        assert_eq!(transport.head(&upload_url).await.unwrap(), 3);

        create.assert();
        patch.assert();
        head.assert();
    }
}
