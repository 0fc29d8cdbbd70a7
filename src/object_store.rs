use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use camino::Utf8Path;
use chrono::Utc;
use futures::stream::{self, BoxStream};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use url::Url;

use crate::acquire::{Acquirer, pending_files};
use crate::domain::{File, Job, ObjectLocator};
use crate::error::KiraError;
use crate::fs_util;
use crate::sigv4::{S3Credentials, sign_ranged_get, uri_encode};

pub const DEFAULT_RANGE_SIZE: u64 = 30_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    start: u64,
    len: u64,
}

impl HttpRange {
    pub fn new(start: u64, len: u64) -> Self {
        Self {
            start,
            len: len.max(1),
        }
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    /// Inclusive last byte, as written in the header.
    pub fn end(&self) -> u64 {
        self.start + self.len - 1
    }

    pub fn end_exclusive(&self) -> u64 {
        self.start + self.len
    }

    pub fn next(self) -> Self {
        Self {
            start: self.start + self.len,
            len: self.len,
        }
    }
}

impl fmt::Display for HttpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bytes={}-{}", self.start, self.end())
    }
}

pub struct RangeResponse {
    pub total_size: u64,
    /// The server ignored the range and sent the whole object.
    pub whole_object: bool,
    pub body: BoxStream<'static, Result<Bytes, KiraError>>,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get_range(
        &self,
        locator: &ObjectLocator,
        range: HttpRange,
    ) -> Result<RangeResponse, KiraError>;
}

#[derive(Clone)]
pub struct HttpObjectStore {
    client: Client,
    endpoint: Url,
    region: String,
    credentials: Option<S3Credentials>,
}

impl HttpObjectStore {
    pub fn new(endpoint: impl AsRef<str>) -> Result<Self, KiraError> {
        let endpoint = endpoint.as_ref();
        let endpoint = Url::parse(endpoint).map_err(|err| {
            KiraError::InvalidConfig(format!("object store endpoint {endpoint}: {err}"))
        })?;
        if endpoint.host_str().is_none() {
            return Err(KiraError::InvalidConfig(format!(
                "object store endpoint {endpoint} has no host"
            )));
        }
        let client = Client::builder()
            .user_agent(format!("kira-au/{}", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|err| KiraError::ObjectStoreHttp(err.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            region: String::new(),
            credentials: None,
        })
    }

    pub fn with_credentials(
        mut self,
        region: impl Into<String>,
        credentials: Option<S3Credentials>,
    ) -> Self {
        self.region = region.into();
        self.credentials = credentials;
        self
    }

    pub fn object_url(&self, locator: &ObjectLocator) -> Url {
        let mut url = self.endpoint.clone();
        let prefix = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!(
            "{prefix}/{}/{}",
            uri_encode(&locator.bucket, false),
            uri_encode(&locator.key, true)
        ));
        url
    }

    fn request(&self, url: &Url, range: HttpRange) -> reqwest::RequestBuilder {
        let range = range.to_string();
        let mut request = self.client.get(url.clone()).header(RANGE, &range);
        if let Some(credentials) = &self.credentials {
            let host = match (url.host_str(), url.port()) {
                (Some(host), Some(port)) => format!("{host}:{port}"),
                (Some(host), None) => host.to_string(),
                (None, _) => String::new(),
            };
            let signed = sign_ranged_get(
                credentials,
                &self.region,
                &host,
                url.path(),
                &range,
                Utc::now(),
            );
            for (name, value) in signed.headers() {
                request = request.header(name, value);
            }
        }
        request
    }

    async fn send_with_retries(
        &self,
        url: &Url,
        range: HttpRange,
    ) -> Result<reqwest::Response, KiraError> {
        const MAX_RETRIES: usize = 3;
        const BASE_DELAY_MS: u64 = 200;
        let mut attempt = 0usize;
        loop {
            let response = self.request(url, range).send().await;
            match response {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < MAX_RETRIES && is_retryable_status(status) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < MAX_RETRIES && is_retryable_error(&err) {
                        let delay = BASE_DELAY_MS * (attempt as u64 + 1);
                        tokio::time::sleep(Duration::from_millis(delay)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(KiraError::ObjectStoreHttp(err.to_string()));
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_range(
        &self,
        locator: &ObjectLocator,
        range: HttpRange,
    ) -> Result<RangeResponse, KiraError> {
        let url = self.object_url(locator);
        let response = self.send_with_retries(&url, range).await?;
        let status = response.status();
        let content_range = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(total_from_content_range);

        match status {
            StatusCode::PARTIAL_CONTENT => {
                let total_size = content_range.ok_or_else(|| {
                    KiraError::ObjectStoreHttp(format!("missing Content-Range for {url}"))
                })?;
                Ok(RangeResponse {
                    total_size,
                    whole_object: false,
                    body: byte_stream(response),
                })
            }
            StatusCode::OK => {
                let total_size = response
                    .headers()
                    .get(CONTENT_LENGTH)
                    .and_then(|value| value.to_str().ok())
                    .and_then(|value| value.parse::<u64>().ok())
                    .unwrap_or(0);
                if range.start() > 0 {
                    return Err(KiraError::ObjectStoreHttp(format!(
                        "server ignored range {range} for {url}"
                    )));
                }
                Ok(RangeResponse {
                    total_size,
                    whole_object: true,
                    body: byte_stream(response),
                })
            }
            StatusCode::RANGE_NOT_SATISFIABLE if content_range == Some(0) => Ok(RangeResponse {
                total_size: 0,
                whole_object: true,
                body: stream::empty().boxed(),
            }),
            _ => {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "object store request failed".to_string());
                Err(KiraError::ObjectStoreStatus {
                    status: status.as_u16(),
                    message,
                })
            }
        }
    }
}

fn byte_stream(response: reqwest::Response) -> BoxStream<'static, Result<Bytes, KiraError>> {
    response
        .bytes_stream()
        .map_err(|err| KiraError::ObjectStoreHttp(err.to_string()))
        .boxed()
}

pub fn total_from_content_range(value: &str) -> Option<u64> {
    let (_, total) = value.trim().rsplit_once('/')?;
    total.trim().parse().ok()
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

pub struct RangedAcquirer<S: ObjectStore> {
    store: S,
    range_size: u64,
}

impl<S: ObjectStore> RangedAcquirer<S> {
    pub fn new(store: S, range_size: u64) -> Self {
        Self {
            store,
            range_size: range_size.max(1),
        }
    }

    async fn fetch_file(&self, file: &File, work_dir: &Utf8Path) -> Result<(), KiraError> {
        let source = file
            .source()
            .ok_or_else(|| KiraError::MissingSource(file.name.to_string()))?;
        let locator: ObjectLocator = source.parse()?;
        let dest = work_dir.join(file.name.as_str());
        let partial = fs_util::partial_path(&dest);

        info!(file = %file.name, source, "downloading");
        let mut out = tokio::fs::File::create(partial.as_std_path())
            .await
            .map_err(|err| KiraError::Filesystem(format!("create {partial}: {err}")))?;

        let mut range = HttpRange::new(0, self.range_size);
        let mut written = 0u64;
        loop {
            let response = self.store.get_range(&locator, range).await?;
            let mut body = response.body;
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                out.write_all(&chunk)
                    .await
                    .map_err(|err| KiraError::Filesystem(format!("write {partial}: {err}")))?;
                written += chunk.len() as u64;
            }
            debug!(file = %file.name, %range, total = response.total_size, "range written");
            if response.whole_object || range.end_exclusive() >= response.total_size {
                break;
            }
            range = range.next();
        }
        out.flush()
            .await
            .map_err(|err| KiraError::Filesystem(format!("flush {partial}: {err}")))?;
        drop(out);

        fs_util::promote(&partial, &dest).await?;
        info!(file = %file.name, bytes = written, "download finished");
        Ok(())
    }
}

#[async_trait]
impl<S: ObjectStore> Acquirer for RangedAcquirer<S> {
    async fn acquire(&self, job: &Job, base_dir: &Utf8Path) -> Result<(), KiraError> {
        let (work_dir, pending) = pending_files(job, base_dir).await?;
        if pending.is_empty() {
            return Ok(());
        }
        info!(
            manifest_id = %job.manifest_id,
            files = pending.len(),
            "downloading files from object store"
        );
        futures::future::try_join_all(
            pending
                .into_iter()
                .map(|file| self.fetch_file(file, &work_dir)),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use httpmock::prelude::*;

    use super::*;

    fn locator() -> ObjectLocator {
        ObjectLocator {
            bucket: "bucket".to_string(),
            key: "staging/R1.fastq.gz".to_string(),
        }
    }

    async fn collect(body: BoxStream<'static, Result<Bytes, KiraError>>) -> Vec<u8> {
        body.try_fold(Vec::new(), |mut acc, chunk| async move {
            acc.extend_from_slice(&chunk);
            Ok(acc)
        })
        .await
        .unwrap()
    }

    #[test]
    fn range_header_and_advance() {
        let range = HttpRange::new(0, 10);
        assert_eq!(range.to_string(), "bytes=0-9");
        let next = range.next();
        assert_eq!(next.to_string(), "bytes=10-19");
        assert_eq!(next.end_exclusive(), 20);
    }

    #[test]
    fn parse_content_range_total() {
        assert_eq!(total_from_content_range("bytes 0-9/25"), Some(25));
        assert_eq!(total_from_content_range("bytes */0"), Some(0));
        assert_eq!(total_from_content_range("bytes 0-9/*"), None);
    }

    #[tokio::test]
    async fn http_store_sends_range_and_reads_total() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/bucket/staging/R1.fastq.gz")
                .header("Range", "bytes=10-19");
            then.status(206)
                .header("Content-Range", "bytes 10-19/25")
                .body("0123456789");
        });

        let store = HttpObjectStore::new(server.base_url()).unwrap();
        let response = store
            .get_range(&locator(), HttpRange::new(10, 10))
            .await
            .unwrap();
        assert_eq!(response.total_size, 25);
        assert!(!response.whole_object);
        assert_eq!(collect(response.body).await, b"0123456789");
        mock.assert();
    }

    #[tokio::test]
    async fn http_store_treats_unsatisfiable_empty_object_as_zero_length() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/bucket/staging/R1.fastq.gz");
            then.status(416).header("Content-Range", "bytes */0");
        });

        let store = HttpObjectStore::new(server.base_url()).unwrap();
        let response = store
            .get_range(&locator(), HttpRange::new(0, 10))
            .await
            .unwrap();
        assert_eq!(response.total_size, 0);
        assert!(collect(response.body).await.is_empty());
    }

    #[tokio::test]
    async fn http_store_maps_missing_key() {
        let server = MockServer::start_async().await;
        server.mock(|when, then| {
            when.method(GET).path("/bucket/staging/R1.fastq.gz");
            then.status(404).body("NoSuchKey");
        });

        let store = HttpObjectStore::new(server.base_url()).unwrap();
        let err = store
            .get_range(&locator(), HttpRange::new(0, 10))
            .await
            .err()
            .unwrap();
        assert_matches!(err, KiraError::ObjectStoreStatus { status: 404, .. });
    }

    #[tokio::test]
    async fn http_store_encodes_reserved_characters_in_key() {
        let server = MockServer::start_async().await;
        let mock = server.mock(|when, then| {
            when.method(GET).path("/bucket/dir/a%23b%2Bc.fastq");
            then.status(206)
                .header("Content-Range", "bytes 0-2/3")
                .body("abc");
        });

        let store = HttpObjectStore::new(server.base_url()).unwrap();
        let locator: ObjectLocator = "s3://bucket/dir/a#b+c.fastq".parse().unwrap();
        assert_eq!(store.object_url(&locator).path(), "/bucket/dir/a%23b%2Bc.fastq");
        let response = store
            .get_range(&locator, HttpRange::new(0, 10))
            .await
            .unwrap();
        assert_eq!(collect(response.body).await, b"abc");
        mock.assert();
    }

    #[test]
    fn object_url_keeps_endpoint_path_prefix() {
        let store = HttpObjectStore::new("http://minio:9000/storage/").unwrap();
        let url = store.object_url(&locator());
        assert_eq!(url.as_str(), "http://minio:9000/storage/bucket/staging/R1.fastq.gz");
    }

    #[tokio::test]
    async fn http_store_signs_requests_with_credentials() {
        let server = MockServer::start_async().await;
        let signed = server.mock(|when, then| {
            when.method(GET)
                .path("/bucket/staging/R1.fastq.gz")
                .header_prefix(
                    "authorization",
                    "AWS4-HMAC-SHA256 Credential=AKID/",
                )
                .header_includes("authorization", "/eu-west-1/s3/aws4_request,")
                .header_includes(
                    "authorization",
                    "SignedHeaders=host;range;x-amz-content-sha256;x-amz-date;x-amz-security-token,",
                )
                .header("x-amz-content-sha256", crate::sigv4::EMPTY_PAYLOAD_SHA256)
                .header("x-amz-security-token", "session")
                .header_exists("x-amz-date");
            then.status(206)
                .header("Content-Range", "bytes 0-3/4")
                .body("ACGT");
        });

        let store = HttpObjectStore::new(server.base_url())
            .unwrap()
            .with_credentials(
                "eu-west-1",
                Some(S3Credentials {
                    access_key_id: "AKID".to_string(),
                    secret_access_key: "secret".to_string(),
                    session_token: Some("session".to_string()),
                }),
            );
        let response = store
            .get_range(&locator(), HttpRange::new(0, 10))
            .await
            .unwrap();
        assert_eq!(response.total_size, 4);
        signed.assert();
    }

    #[tokio::test]
    async fn http_store_without_credentials_sends_no_signature() {
        let server = MockServer::start_async().await;
        let anonymous = server.mock(|when, then| {
            when.method(GET)
                .path("/bucket/staging/R1.fastq.gz")
                .header_missing("authorization");
            then.status(206)
                .header("Content-Range", "bytes 0-3/4")
                .body("ACGT");
        });

        let store = HttpObjectStore::new(server.base_url()).unwrap();
        store
            .get_range(&locator(), HttpRange::new(0, 10))
            .await
            .unwrap();
        anonymous.assert();
    }
}
