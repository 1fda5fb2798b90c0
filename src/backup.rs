use crate::{library::Library, manifest::ManifestStore};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMeta {
    pub timestamp: u64,
    #[serde(default)]
    pub time: Option<String>,
    pub reason: Option<String>,
    pub target: Option<PathBuf>,
    pub profile: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct LastBackup {
    path: PathBuf,
    timestamp: u64,
}

/// Snapshots the library and, when a target is given, that target's
/// deployment manifest.
pub fn create_backup(
    data_dir: &Path,
    library: &Library,
    target_root: Option<&Path>,
    reason: Option<&str>,
) -> Result<PathBuf> {
    let stamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let backup_root = data_dir.join("backups");
    fs::create_dir_all(&backup_root).context("create backups dir")?;
    let backup_dir = unique_backup_dir(&backup_root, stamp);
    fs::create_dir_all(&backup_dir).context("create backup dir")?;

    let library_json = serde_json::to_string_pretty(library).context("serialize library")?;
    fs::write(backup_dir.join("library.json"), library_json).context("write library backup")?;

    if let Some(target_root) = target_root {
        let manifest_path = ManifestStore::new(data_dir).manifest_path(target_root);
        if manifest_path.exists() {
            fs::copy(&manifest_path, backup_dir.join("manifest.json"))
                .context("copy manifest backup")?;
        }
    }

    let meta = BackupMeta {
        timestamp: stamp,
        time: i64::try_from(stamp)
            .ok()
            .and_then(|secs| OffsetDateTime::from_unix_timestamp(secs).ok())
            .and_then(|time| time.format(&Rfc3339).ok()),
        reason: reason.map(|value| value.to_string()),
        target: target_root.map(Path::to_path_buf),
        profile: library.active_profile.clone(),
    };
    let meta_json = serde_json::to_string_pretty(&meta).context("serialize backup meta")?;
    fs::write(backup_dir.join("meta.json"), meta_json).context("write backup meta")?;

    let last = LastBackup {
        path: backup_dir.clone(),
        timestamp: stamp,
    };
    let last_json = serde_json::to_string_pretty(&last).context("serialize last backup")?;
    fs::write(backup_root.join("last.json"), last_json).context("write last backup")?;

    Ok(backup_dir)
}

pub fn load_last_backup(data_dir: &Path) -> Result<Option<PathBuf>> {
    let path = data_dir.join("backups").join("last.json");
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(&path).context("read last backup")?;
    let last: LastBackup = serde_json::from_str(&raw).context("parse last backup")?;
    if last.path.exists() {
        Ok(Some(last.path))
    } else {
        Ok(None)
    }
}

pub fn load_backup_meta(backup_dir: &Path) -> Result<BackupMeta> {
    let raw = fs::read_to_string(backup_dir.join("meta.json")).context("read backup meta")?;
    let meta = serde_json::from_str(&raw).context("parse backup meta")?;
    Ok(meta)
}

/// Two backups within the same second get `-1`, `-2`, ... suffixes.
fn unique_backup_dir(backup_root: &Path, stamp: u64) -> PathBuf {
    let base = backup_root.join(format!("backup-{stamp}"));
    if !base.exists() {
        return base;
    }
    (1..)
        .map(|n| backup_root.join(format!("backup-{stamp}-{n}")))
        .find(|candidate| !candidate.exists())
        .unwrap_or(base)
}
