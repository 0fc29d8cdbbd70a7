use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::error::KiraError;

const SEARCH_PAGE_SIZE: u32 = 1000;

#[async_trait]
pub trait ArchiveClient: Send + Sync {
    async fn is_file_uploaded(
        &self,
        archive_api_url: &str,
        submission_id: &str,
        file_name: &str,
        token: &str,
    ) -> Result<bool, KiraError>;
}

#[derive(Debug, Deserialize)]
struct FileSearchPage {
    #[serde(rename = "_embedded")]
    embedded: Option<EmbeddedFiles>,
    #[serde(rename = "_links")]
    links: Option<PageLinks>,
}

impl FileSearchPage {
    fn contains(&self, file_name: &str) -> bool {
        self.embedded
            .as_ref()
            .is_some_and(|embedded| embedded.files.iter().any(|file| file.filename == file_name))
    }

    fn next_href(&self) -> Option<&str> {
        self.links
            .as_ref()
            .and_then(|links| links.next.as_ref())
            .map(|link| link.href.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct PageLinks {
    next: Option<Link>,
}

#[derive(Debug, Deserialize)]
struct Link {
    href: String,
}

#[derive(Debug, Deserialize)]
struct EmbeddedFiles {
    #[serde(default)]
    files: Vec<ArchivedFile>,
}

#[derive(Debug, Deserialize)]
struct ArchivedFile {
    filename: String,
}

#[derive(Clone)]
pub struct UsiArchiveClient {
    client: Client,
}

impl UsiArchiveClient {
    pub fn new() -> Result<Self, KiraError> {
        let client = Client::builder()
            .user_agent(format!("kira-au/{}", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|err| KiraError::ArchiveHttp(err.to_string()))?;
        Ok(Self { client })
    }

    pub fn search_url(archive_api_url: &str) -> String {
        format!(
            "{}/api/files/search/by-submission",
            archive_api_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl ArchiveClient for UsiArchiveClient {
    async fn is_file_uploaded(
        &self,
        archive_api_url: &str,
        submission_id: &str,
        file_name: &str,
        token: &str,
    ) -> Result<bool, KiraError> {
        let mut request = self.client.get(Self::search_url(archive_api_url)).query(&[
            ("submissionId", submission_id.to_string()),
            ("size", SEARCH_PAGE_SIZE.to_string()),
        ]);
        loop {
            let response = request
                .bearer_auth(token)
                .send()
                .await
                .map_err(|err| KiraError::ArchiveHttp(err.to_string()))?;

            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                debug!(submission_id, "submission has no files yet");
                return Ok(false);
            }
            if !status.is_success() {
                let message = response
                    .text()
                    .await
                    .unwrap_or_else(|_| "archive request failed".to_string());
                return Err(KiraError::ArchiveStatus {
                    status: status.as_u16(),
                    message,
                });
            }

            let current = response.url().clone();
            let page: FileSearchPage = response
                .json()
                .await
                .map_err(|err| KiraError::ArchiveHttp(err.to_string()))?;
            if page.contains(file_name) {
                return Ok(true);
            }
            let Some(href) = page.next_href() else {
                return Ok(false);
            };
            let next = current
                .join(href)
                .map_err(|err| KiraError::ArchiveHttp(format!("bad next link {href}: {err}")))?;
            if next == current {
                return Ok(false);
            }
            debug!(submission_id, next = %next, "following next page of files");
            request = self.client.get(next);
        }
    }
}
