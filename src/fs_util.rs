use std::io;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::fs;
use tracing::{debug, warn};

use crate::error::KiraError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkKind {
    HardLink,
    Copy,
}

/// Existence probe behind every idempotency check. I/O errors count as absent.
pub async fn file_exists(path: &Utf8Path) -> bool {
    fs::try_exists(path.as_std_path()).await.unwrap_or(false)
}

pub async fn ensure_dir(path: &Utf8Path) -> Result<(), KiraError> {
    fs::create_dir_all(path.as_std_path())
        .await
        .map_err(|err| KiraError::Filesystem(format!("create {path}: {err}")))
}

pub fn partial_path(dest: &Utf8Path) -> Utf8PathBuf {
    let name = dest.file_name().unwrap_or("download");
    match dest.parent() {
        Some(parent) => parent.join(format!(".{name}.part")),
        None => Utf8PathBuf::from(format!(".{name}.part")),
    }
}

pub async fn promote(partial: &Utf8Path, dest: &Utf8Path) -> Result<(), KiraError> {
    fs::rename(partial.as_std_path(), dest.as_std_path())
        .await
        .map_err(|err| KiraError::Filesystem(format!("rename {partial} -> {dest}: {err}")))
}

pub async fn remove_stale_entry(path: &Utf8Path) -> Result<bool, KiraError> {
    match fs::symlink_metadata(path.as_std_path()).await {
        Ok(_) => {
            debug!(path = %path, "removing existing link");
            fs::remove_file(path.as_std_path())
                .await
                .map_err(|err| KiraError::Filesystem(format!("remove {path}: {err}")))?;
            Ok(true)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(KiraError::Filesystem(format!("stat {path}: {err}"))),
    }
}

/// Hard-links `source` to `dest`, copying instead when the two paths live
/// on different filesystems.
pub async fn link_or_copy(source: &Utf8Path, dest: &Utf8Path) -> Result<LinkKind, KiraError> {
    match fs::hard_link(source.as_std_path(), dest.as_std_path()).await {
        Ok(()) => Ok(LinkKind::HardLink),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            warn!(source = %source, dest = %dest, "hard link crosses devices, copying");
            fs::copy(source.as_std_path(), dest.as_std_path())
                .await
                .map_err(|err| KiraError::Filesystem(format!("copy {source} -> {dest}: {err}")))?;
            Ok(LinkKind::Copy)
        }
        Err(err) => Err(KiraError::Filesystem(format!(
            "link {source} -> {dest}: {err}"
        ))),
    }
}
