use std::fs;
use std::path::PathBuf;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

use crate::convert::{DEFAULT_SCHEMA, DEFAULT_TOOL_PATH};
use crate::error::KiraError;
use crate::object_store::DEFAULT_RANGE_SIZE;
use crate::sigv4::S3Credentials;
use crate::token::TokenPolicy;
use crate::tus::{DEFAULT_CHUNK_SIZE, DEFAULT_RETRY_DELAYS_MS};

pub const CONFIG_FILE_NAME: &str = "kira-au.json";
pub const DEFAULT_PLAN_FILE_NAME: &str = "upload-plan.json";

pub const ENV_BASE_DIR: &str = "KIRA_AU_BASE_DIR";
pub const ENV_PLAN_PATH: &str = "KIRA_AU_PLAN_PATH";
pub const ENV_AUTH_URL: &str = "KIRA_AU_AUTH_URL";
pub const ENV_AUTH_USERNAME: &str = "KIRA_AU_AUTH_USERNAME";
pub const ENV_AUTH_PASSWORD: &str = "KIRA_AU_AUTH_PASSWORD";
pub const ENV_AWS_ACCESS_KEY_ID: &str = "AWS_ACCESS_KEY_ID";
pub const ENV_AWS_SECRET_ACCESS_KEY: &str = "AWS_SECRET_ACCESS_KEY";
pub const ENV_AWS_SESSION_TOKEN: &str = "AWS_SESSION_TOKEN";
pub const ENV_AWS_REGION: &str = "AWS_REGION";
pub const ENV_AWS_DEFAULT_REGION: &str = "AWS_DEFAULT_REGION";

pub const DEFAULT_OBJECT_STORE_ENDPOINT: &str = "https://s3.amazonaws.com";
pub const DEFAULT_OBJECT_STORE_REGION: &str = "us-east-1";

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub base_dir: Option<String>,
    #[serde(default)]
    pub plan_path: Option<String>,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub token: TokenSection,
    #[serde(default)]
    pub object_store: ObjectStoreSection,
    #[serde(default)]
    pub bundle: BundleSection,
    #[serde(default)]
    pub conversion: ConversionSection,
    #[serde(default)]
    pub upload: UploadSection,
    #[serde(default)]
    pub amqp: AmqpSection,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AuthSection {
    pub url: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct TokenSection {
    pub valid_duration_ms: Option<i64>,
    pub refresh_lead_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ObjectStoreSection {
    pub endpoint: Option<String>,
    pub range_size: Option<u64>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct BundleSection {
    pub cli_path: Option<String>,
    pub replica: Option<String>,
    pub cache_dir: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ConversionSection {
    pub tool_path: Option<String>,
    pub schema: Option<String>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct UploadSection {
    pub chunk_size: Option<usize>,
    pub retry_delays_ms: Option<Vec<u64>>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct AmqpSection {
    pub scheme: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub exchange: Option<String>,
    pub exchange_type: Option<String>,
    pub queue: Option<String>,
    pub routing_key: Option<String>,
    pub prefetch: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub url: Option<String>,
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct ObjectStoreSettings {
    pub endpoint: String,
    pub range_size: u64,
    pub region: String,
    /// `None` sends unsigned requests.
    pub credentials: Option<S3Credentials>,
}

#[derive(Debug, Clone)]
pub struct BundleSettings {
    pub cli_path: PathBuf,
    pub replica: String,
    pub cache_dir: Utf8PathBuf,
}

#[derive(Debug, Clone)]
pub struct ConversionSettings {
    pub tool_path: PathBuf,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub chunk_size: usize,
    pub retry_delays_ms: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AmqpSettings {
    pub scheme: String,
    pub host: String,
    pub port: u16,
    pub exchange: String,
    pub exchange_type: String,
    pub queue: String,
    pub routing_key: String,
    pub prefetch: u16,
}

impl AmqpSettings {
    pub fn uri(&self) -> String {
        format!("{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub base_dir: Utf8PathBuf,
    pub plan_path: Utf8PathBuf,
    pub auth: AuthSettings,
    pub token: TokenPolicy,
    pub object_store: ObjectStoreSettings,
    pub bundle: BundleSettings,
    pub conversion: ConversionSettings,
    pub upload: UploadSettings,
    pub amqp: AmqpSettings,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, KiraError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(CONFIG_FILE_NAME),
        };

        if path.is_none() && !config_path.exists() {
            return Err(KiraError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| KiraError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| KiraError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, KiraError> {
        Self::resolve_with_env(config, |key| std::env::var(key).ok())
    }

    pub fn resolve_with_env(
        config: Config,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<ResolvedConfig, KiraError> {
        let env = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let base_dir = match env(ENV_BASE_DIR).or(config.base_dir) {
            Some(dir) => Utf8PathBuf::from(trim_trailing_slash(&dir)),
            None => default_base_dir()?,
        };
        let plan_path = env(ENV_PLAN_PATH)
            .or(config.plan_path)
            .map(Utf8PathBuf::from)
            .unwrap_or_else(|| base_dir.join(DEFAULT_PLAN_FILE_NAME));

        let auth = AuthSettings {
            url: env(ENV_AUTH_URL).or(config.auth.url),
            username: env(ENV_AUTH_USERNAME)
                .or(config.auth.username)
                .unwrap_or_default(),
            password: env(ENV_AUTH_PASSWORD)
                .or(config.auth.password)
                .unwrap_or_default(),
        };

        let defaults = TokenPolicy::default();
        let token = TokenPolicy {
            valid_duration_ms: config
                .token
                .valid_duration_ms
                .unwrap_or(defaults.valid_duration_ms),
            refresh_lead_ms: config
                .token
                .refresh_lead_ms
                .unwrap_or(defaults.refresh_lead_ms),
        };
        if token.valid_duration_ms <= 0 || token.refresh_lead_ms < 0 {
            return Err(KiraError::InvalidConfig(
                "token durations must be positive".to_string(),
            ));
        }

        let credentials = match (
            env(ENV_AWS_ACCESS_KEY_ID).or(config.object_store.access_key_id),
            env(ENV_AWS_SECRET_ACCESS_KEY).or(config.object_store.secret_access_key),
        ) {
            (Some(access_key_id), Some(secret_access_key)) => Some(S3Credentials {
                access_key_id,
                secret_access_key,
                session_token: env(ENV_AWS_SESSION_TOKEN).or(config.object_store.session_token),
            }),
            (None, None) => None,
            _ => {
                return Err(KiraError::InvalidConfig(
                    "object store access key id and secret must be set together".to_string(),
                ));
            }
        };
        let object_store = ObjectStoreSettings {
            endpoint: config
                .object_store
                .endpoint
                .unwrap_or_else(|| DEFAULT_OBJECT_STORE_ENDPOINT.to_string()),
            range_size: config.object_store.range_size.unwrap_or(DEFAULT_RANGE_SIZE),
            region: env(ENV_AWS_REGION)
                .or_else(|| env(ENV_AWS_DEFAULT_REGION))
                .or(config.object_store.region)
                .unwrap_or_else(|| DEFAULT_OBJECT_STORE_REGION.to_string()),
            credentials,
        };
        if object_store.range_size == 0 {
            return Err(KiraError::InvalidConfig(
                "object_store.range_size must be greater than zero".to_string(),
            ));
        }

        let bundle = BundleSettings {
            cli_path: PathBuf::from(config.bundle.cli_path.unwrap_or_else(|| "hca".to_string())),
            replica: config.bundle.replica.unwrap_or_else(|| "aws".to_string()),
            cache_dir: config
                .bundle
                .cache_dir
                .map(|dir| Utf8PathBuf::from(trim_trailing_slash(&dir)))
                .unwrap_or_else(|| base_dir.clone()),
        };

        let conversion = ConversionSettings {
            tool_path: PathBuf::from(
                config
                    .conversion
                    .tool_path
                    .unwrap_or_else(|| DEFAULT_TOOL_PATH.to_string()),
            ),
            schema: config
                .conversion
                .schema
                .unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
        };

        let upload = UploadSettings {
            chunk_size: config.upload.chunk_size.unwrap_or(DEFAULT_CHUNK_SIZE),
            retry_delays_ms: config
                .upload
                .retry_delays_ms
                .unwrap_or_else(|| DEFAULT_RETRY_DELAYS_MS.to_vec()),
        };
        if upload.chunk_size == 0 {
            return Err(KiraError::InvalidConfig(
                "upload.chunk_size must be greater than zero".to_string(),
            ));
        }

        let amqp = AmqpSettings {
            scheme: config.amqp.scheme.unwrap_or_else(|| "amqp".to_string()),
            host: config.amqp.host.unwrap_or_else(|| "localhost".to_string()),
            port: config.amqp.port.unwrap_or(5672),
            exchange: config
                .amqp
                .exchange
                .unwrap_or_else(|| "ingest.archival.exchange".to_string()),
            exchange_type: config
                .amqp
                .exchange_type
                .unwrap_or_else(|| "topic".to_string()),
            queue: config
                .amqp
                .queue
                .unwrap_or_else(|| "ingest.archival.upload.queue".to_string()),
            routing_key: config
                .amqp
                .routing_key
                .unwrap_or_else(|| "ingest.archival.upload".to_string()),
            prefetch: config.amqp.prefetch.unwrap_or(100),
        };
        if amqp.prefetch == 0 {
            return Err(KiraError::InvalidConfig(
                "amqp.prefetch must be greater than zero".to_string(),
            ));
        }

        Ok(ResolvedConfig {
            base_dir,
            plan_path,
            auth,
            token,
            object_store,
            bundle,
            conversion,
            upload,
            amqp,
        })
    }
}

fn trim_trailing_slash(dir: &str) -> &str {
    if dir.len() > 1 {
        dir.strip_suffix('/').unwrap_or(dir)
    } else {
        dir
    }
}

fn default_base_dir() -> Result<Utf8PathBuf, KiraError> {
    BaseDirs::new()
        .and_then(|dirs| {
            Utf8PathBuf::from_path_buf(dirs.data_local_dir().join("kira-archive-uploader")).ok()
        })
        .ok_or_else(|| KiraError::Filesystem("unable to resolve data directory".to_string()))
}
