use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use camino::{Utf8Path, Utf8PathBuf};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::info;

use crate::acquire::{Acquirer, pending_files};
use crate::domain::{File, FileName, Job};
use crate::error::KiraError;
use crate::fs_util::{self, LinkKind};
use crate::process::{ProcessRunner, SystemProcessRunner};

#[async_trait]
pub trait BundleRepository: Send + Sync {
    async fn resolve_version(&self, bundle_id: &str) -> Result<String, KiraError>;

    // Files land in `cache_dir/<bundle_id>.<version>`.
    async fn download(
        &self,
        bundle_id: &str,
        version: &str,
        file_names: &[FileName],
        cache_dir: &Utf8Path,
    ) -> Result<(), KiraError>;
}

#[derive(Debug, Deserialize)]
struct GetBundleResponse {
    bundle: BundleInfo,
}

#[derive(Debug, Deserialize)]
struct BundleInfo {
    version: String,
}

pub struct HcaCliBundleRepository<R: ProcessRunner = SystemProcessRunner> {
    cli_path: PathBuf,
    replica: String,
    runner: R,
}

impl HcaCliBundleRepository<SystemProcessRunner> {
    pub fn new(cli_path: impl Into<PathBuf>, replica: impl Into<String>) -> Self {
        Self::with_runner(cli_path, replica, SystemProcessRunner)
    }
}

impl<R: ProcessRunner> HcaCliBundleRepository<R> {
    pub fn with_runner(cli_path: impl Into<PathBuf>, replica: impl Into<String>, runner: R) -> Self {
        Self {
            cli_path: cli_path.into(),
            replica: replica.into(),
            runner,
        }
    }

    pub fn get_bundle_args(&self, bundle_id: &str) -> Vec<String> {
        vec![
            "dss".to_string(),
            "get-bundle".to_string(),
            "--uuid".to_string(),
            bundle_id.to_string(),
            "--replica".to_string(),
            self.replica.clone(),
        ]
    }

    pub fn download_args(
        &self,
        bundle_id: &str,
        version: &str,
        file_names: &[FileName],
    ) -> Vec<String> {
        let mut args = vec![
            "dss".to_string(),
            "download".to_string(),
            "--bundle-uuid".to_string(),
            bundle_id.to_string(),
            "--version".to_string(),
            version.to_string(),
            "--replica".to_string(),
            self.replica.clone(),
            "--no-metadata".to_string(),
            "--data-filter".to_string(),
        ];
        args.extend(file_names.iter().map(|name| name.to_string()));
        args
    }

    async fn run(
        &self,
        args: &[String],
        cwd: Option<&Utf8Path>,
    ) -> Result<crate::process::ProcessOutput, KiraError> {
        self.runner
            .run(&self.cli_path, args, cwd.map(Utf8Path::as_std_path))
            .await
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::NotFound => {
                    KiraError::MissingTool(self.cli_path.display().to_string())
                }
                _ => KiraError::BundleDownload(err.to_string()),
            })
    }
}

#[async_trait]
impl<R: ProcessRunner> BundleRepository for HcaCliBundleRepository<R> {
    async fn resolve_version(&self, bundle_id: &str) -> Result<String, KiraError> {
        let output = self.run(&self.get_bundle_args(bundle_id), None).await?;
        if !output.success() {
            return Err(KiraError::BundleResolution(
                output.failure_message(&self.cli_path),
            ));
        }
        let response: GetBundleResponse = serde_json::from_str(&output.stdout)
            .map_err(|err| KiraError::BundleResolution(format!("{bundle_id}: {err}")))?;
        Ok(response.bundle.version)
    }

    async fn download(
        &self,
        bundle_id: &str,
        version: &str,
        file_names: &[FileName],
        cache_dir: &Utf8Path,
    ) -> Result<(), KiraError> {
        let args = self.download_args(bundle_id, version, file_names);
        let output = self.run(&args, Some(cache_dir)).await?;
        if !output.success() {
            return Err(KiraError::BundleDownload(
                output.failure_message(&self.cli_path),
            ));
        }
        Ok(())
    }
}

pub struct BundleAcquirer<B: BundleRepository> {
    repository: B,
    cache_dir: Utf8PathBuf,
    population_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl<B: BundleRepository> BundleAcquirer<B> {
    pub fn new(repository: B, cache_dir: Utf8PathBuf) -> Self {
        Self {
            repository,
            cache_dir,
            population_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn bundle_root(&self, bundle_id: &str, version: &str) -> Utf8PathBuf {
        self.cache_dir.join(format!("{bundle_id}.{version}"))
    }

    fn population_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.population_locks.lock();
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    fn release_population_lock(&self, key: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.population_locks.lock();
        drop(lock);
        if locks
            .get(key)
            .is_some_and(|entry| Arc::strong_count(entry) == 1)
        {
            locks.remove(key);
        }
    }

    async fn populate(
        &self,
        bundle_id: &str,
        version: &str,
        bundle_root: &Utf8Path,
        wanted: &[&File],
    ) -> Result<(), KiraError> {
        let mut missing = Vec::new();
        for file in wanted {
            if !fs_util::file_exists(&bundle_root.join(file.name.as_str())).await {
                missing.push(file.name.clone());
            }
        }
        if missing.is_empty() {
            info!(bundle = %bundle_root, "bundle already cached");
            return Ok(());
        }
        fs_util::ensure_dir(&self.cache_dir).await?;
        self.repository
            .download(bundle_id, version, &missing, &self.cache_dir)
            .await?;
        info!(bundle = %bundle_root, files = missing.len(), "bundle files downloaded");
        Ok(())
    }
}

#[async_trait]
impl<B: BundleRepository> Acquirer for BundleAcquirer<B> {
    async fn acquire(&self, job: &Job, base_dir: &Utf8Path) -> Result<(), KiraError> {
        let (work_dir, pending) = pending_files(job, base_dir).await?;
        if pending.is_empty() {
            return Ok(());
        }
        let bundle_id = job
            .bundle_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                KiraError::BundleResolution(format!("job {} has no bundle id", job.manifest_id))
            })?;
        // Both values end up in a directory name.
        bundle_id
            .parse::<FileName>()
            .map_err(|_| KiraError::BundleResolution(format!("invalid bundle id {bundle_id}")))?;

        info!(
            manifest_id = %job.manifest_id,
            bundle_id,
            files = pending.len(),
            "acquiring files from bundle"
        );
        let version = self.repository.resolve_version(bundle_id).await?;
        version
            .parse::<FileName>()
            .map_err(|_| KiraError::BundleResolution(format!("invalid bundle version {version}")))?;

        let bundle_root = self.bundle_root(bundle_id, &version);
        let key = format!("{bundle_id}.{version}");
        let lock = self.population_lock(&key);
        let populated = {
            let _guard = lock.lock().await;
            self.populate(bundle_id, &version, &bundle_root, &pending)
                .await
        };
        self.release_population_lock(&key, lock);
        populated?;

        for file in pending {
            let source = bundle_root.join(file.name.as_str());
            if !fs_util::file_exists(&source).await {
                return Err(KiraError::BundleDownload(format!(
                    "{} missing from {bundle_root}",
                    file.name
                )));
            }
            let dest = work_dir.join(file.name.as_str());
            fs_util::remove_stale_entry(&dest).await?;
            let kind = fs_util::link_or_copy(&source, &dest).await?;
            if kind == LinkKind::HardLink {
                info!(dest = %dest, source = %source, "created link");
            }
        }
        Ok(())
    }
}
