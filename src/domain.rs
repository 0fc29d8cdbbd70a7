use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::KiraError;

static MANIFEST_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("valid manifest id regex"));

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ManifestId(String);

impl ManifestId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ManifestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ManifestId {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let is_valid = MANIFEST_ID_RE.is_match(value) && value != "." && value != "..";
        if !is_valid {
            return Err(KiraError::InvalidManifestId(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for ManifestId {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ManifestId> for String {
    fn from(value: ManifestId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FileName(String);

impl FileName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileName {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        // Names are passed to external tools as arguments.
        let is_valid = MANIFEST_ID_RE.is_match(value)
            && value != "."
            && value != ".."
            && !value.starts_with('-');
        if !is_valid {
            return Err(KiraError::InvalidFileName(value.to_string()));
        }
        Ok(Self(value.to_string()))
    }
}

impl TryFrom<String> for FileName {
    type Error = KiraError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FileName> for String {
    fn from(value: FileName) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub name: FileName,
    #[serde(default, alias = "readIndex")]
    pub read_index: Option<String>,
    #[serde(default, alias = "sourceLocator")]
    pub cloud_url: Option<String>,
}

impl File {
    pub fn source(&self) -> Option<&str> {
        self.cloud_url
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversion {
    #[serde(alias = "outputName")]
    pub output_name: FileName,
    pub inputs: Vec<File>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    #[serde(alias = "manifestId")]
    pub manifest_id: ManifestId,
    #[serde(alias = "submissionUrl")]
    pub submission_url: String,
    #[serde(
        rename = "dsp_api_url",
        alias = "archive_api_url",
        alias = "archiveApiUrl"
    )]
    pub archive_api_url: String,
    #[serde(default)]
    pub ingest_api_url: Option<String>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub conversion: Option<Conversion>,
    #[serde(
        default,
        rename = "dcp_bundle_uuid",
        alias = "bundle_id",
        alias = "bundleId"
    )]
    pub bundle_id: Option<String>,
}

impl Job {
    pub fn from_json(payload: &[u8]) -> Result<Self, KiraError> {
        serde_json::from_slice(payload).map_err(|err| KiraError::JobParse(err.to_string()))
    }

    pub fn files_to_acquire(&self) -> &[File] {
        match &self.conversion {
            Some(conversion) => &conversion.inputs,
            None => &self.files,
        }
    }

    pub fn files_to_publish(&self) -> Vec<FileName> {
        match &self.conversion {
            Some(conversion) => vec![conversion.output_name.clone()],
            None => self.files.iter().map(|file| file.name.clone()).collect(),
        }
    }

    pub fn work_dir(&self, base_dir: &Utf8Path) -> Utf8PathBuf {
        base_dir.join(self.manifest_id.as_str())
    }

    pub fn submission_id(&self) -> Result<String, KiraError> {
        submission_id_from_url(&self.submission_url)
    }

    pub fn upload_endpoint(&self) -> String {
        format!("{}/files/", self.archive_api_url.trim_end_matches('/'))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Plan {
    #[serde(default)]
    pub jobs: Vec<Job>,
}

pub fn submission_id_from_url(submission_url: &str) -> Result<String, KiraError> {
    let url = url::Url::parse(submission_url)
        .map_err(|_| KiraError::InvalidSubmissionUrl(submission_url.to_string()))?;
    url.path_segments()
        .and_then(|segments| segments.filter(|segment| !segment.is_empty()).last())
        .map(str::to_string)
        .ok_or_else(|| KiraError::InvalidSubmissionUrl(submission_url.to_string()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectLocator {
    pub bucket: String,
    pub key: String,
}

impl FromStr for ObjectLocator {
    type Err = KiraError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let rest = value
            .trim()
            .strip_prefix("s3://")
            .ok_or_else(|| KiraError::InvalidSourceLocator(value.to_string()))?;
        let (bucket, key) = rest
            .split_once('/')
            .ok_or_else(|| KiraError::InvalidSourceLocator(value.to_string()))?;
        if bucket.is_empty() || key.is_empty() {
            return Err(KiraError::InvalidSourceLocator(value.to_string()));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadOutcome {
    Uploaded,
    AlreadyUploaded,
}
