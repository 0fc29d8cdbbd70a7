use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum KiraError {
    #[error("invalid manifest id: {0}")]
    InvalidManifestId(String),

    #[error("invalid file name: {0}")]
    InvalidFileName(String),

    #[error("invalid source locator: {0}")]
    InvalidSourceLocator(String),

    #[error("invalid submission URL: {0}")]
    InvalidSubmissionUrl(String),

    #[error("failed to parse job payload: {0}")]
    JobParse(String),

    #[error("missing config file kira-au.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("upload plan does not exist: {0}")]
    MissingPlan(PathBuf),

    #[error("failed to parse upload plan: {0}")]
    PlanParse(String),

    #[error("object store request failed: {0}")]
    ObjectStoreHttp(String),

    #[error("object store returned status {status}: {message}")]
    ObjectStoreStatus { status: u16, message: String },

    #[error("missing source locator for file {0}")]
    MissingSource(String),

    #[error("bundle resolution failed: {0}")]
    BundleResolution(String),

    #[error("bundle download failed: {0}")]
    BundleDownload(String),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("fastq2bam conversion failed with exit code {exit_code:?}: {stderr}")]
    Conversion {
        exit_code: Option<i32>,
        stderr: String,
    },

    #[error("token request failed: {0}")]
    AuthHttp(String),

    #[error("auth service returned status {status}: {message}")]
    AuthStatus { status: u16, message: String },

    #[error("token refresh failed: {0}")]
    AuthRefresh(String),

    #[error("upload could not be authenticated")]
    UploadAuth(#[source] Box<KiraError>),

    #[error("archive request failed: {0}")]
    ArchiveHttp(String),

    #[error("archive returned status {status}: {message}")]
    ArchiveStatus { status: u16, message: String },

    #[error("upload of {file_name} failed: {message}")]
    Upload { file_name: String, message: String },

    #[error("message broker error: {0}")]
    Broker(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Parse,
    Config,
    Acquisition,
    Conversion,
    Upload,
    Auth,
    Broker,
    Filesystem,
}

impl KiraError {
    pub fn class(&self) -> FailureClass {
        match self {
            KiraError::InvalidManifestId(_)
            | KiraError::InvalidFileName(_)
            | KiraError::JobParse(_)
            | KiraError::PlanParse(_) => FailureClass::Parse,
            KiraError::MissingConfig
            | KiraError::ConfigRead(_)
            | KiraError::ConfigParse(_)
            | KiraError::InvalidConfig(_)
            | KiraError::MissingPlan(_) => FailureClass::Config,
            KiraError::InvalidSourceLocator(_)
            | KiraError::ObjectStoreHttp(_)
            | KiraError::ObjectStoreStatus { .. }
            | KiraError::MissingSource(_)
            | KiraError::BundleResolution(_)
            | KiraError::BundleDownload(_)
            | KiraError::MissingTool(_) => FailureClass::Acquisition,
            KiraError::Conversion { .. } => FailureClass::Conversion,
            KiraError::InvalidSubmissionUrl(_)
            | KiraError::UploadAuth(_)
            | KiraError::ArchiveHttp(_)
            | KiraError::ArchiveStatus { .. }
            | KiraError::Upload { .. } => FailureClass::Upload,
            KiraError::AuthHttp(_) | KiraError::AuthStatus { .. } | KiraError::AuthRefresh(_) => {
                FailureClass::Auth
            }
            KiraError::Broker(_) => FailureClass::Broker,
            KiraError::Filesystem(_) => FailureClass::Filesystem,
        }
    }
}
