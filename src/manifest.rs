//! Durable record of what the engine has placed in a target directory.
//!
//! One manifest per target root lives under `<data_dir>/deployments/`. It is
//! loaded fresh at the start of every deploy/undeploy and swapped
//! atomically at the end; it is the only state the engine trusts about the
//! target.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    ffi::OsString,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkKind {
    #[default]
    Symlink,
    Copy,
}

impl LinkKind {
    pub fn label(self) -> &'static str {
        match self {
            LinkKind::Symlink => "symlink",
            LinkKind::Copy => "copy",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "symlink" | "link" => Some(LinkKind::Symlink),
            "copy" => Some(LinkKind::Copy),
            _ => None,
        }
    }
}

/// Fingerprint of a copied file, used to prove ownership before removal
/// and to notice when the staged source changed since the copy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CopyStamp {
    pub size: u64,
    pub blake3: String,
    pub source_size: u64,
    #[serde(default)]
    pub source_modified: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub source_mod_id: String,
    pub link_kind: LinkKind,
    /// Path relative to the target root, `/`-separated, as written on disk.
    pub relative_path: String,
    /// Absolute path of the staged file this entry was produced from.
    pub source: PathBuf,
    /// Set when symlink mode fell back to a copy for this path.
    #[serde(default)]
    pub fell_back: bool,
    #[serde(default)]
    pub copy: Option<CopyStamp>,
}

impl ManifestEntry {
    pub fn dest(&self, target_root: &Path) -> PathBuf {
        join_relative(target_root, &self.relative_path)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployedProfile {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployManifest {
    pub version: u32,
    pub target_root: PathBuf,
    #[serde(default)]
    pub profile: Option<DeployedProfile>,
    #[serde(default)]
    pub deployed_at: Option<String>,
    #[serde(default)]
    pub mode: Option<LinkKind>,
    /// Staging root of every mod that has an entry, keyed by mod id.
    #[serde(default)]
    pub staging_roots: BTreeMap<String, PathBuf>,
    #[serde(default)]
    pub entries: BTreeMap<String, ManifestEntry>,
    /// Directories under the target root that the engine created.
    #[serde(default)]
    pub directories: BTreeSet<String>,
}

impl DeployManifest {
    pub fn empty(target_root: &Path) -> Self {
        Self {
            version: MANIFEST_VERSION,
            target_root: target_root.to_path_buf(),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty() && self.directories.is_empty()
    }

    /// Drops staging roots that no remaining entry refers to.
    pub fn prune_staging_roots(&mut self) {
        let used: BTreeSet<&String> = self
            .entries
            .values()
            .map(|entry| &entry.source_mod_id)
            .collect();
        self.staging_roots.retain(|mod_id, _| used.contains(mod_id));
    }
}

/// Locates manifests (and their lock files) for target roots under the
/// application data directory.
#[derive(Debug, Clone)]
pub struct ManifestStore {
    root: PathBuf,
}

impl ManifestStore {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            root: data_dir.join("deployments"),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn manifest_path(&self, target_root: &Path) -> PathBuf {
        self.root.join(format!("{}.json", target_key(target_root)))
    }

    pub fn lock_path(&self, target_root: &Path) -> PathBuf {
        self.root.join(format!("{}.lock", target_key(target_root)))
    }

    pub fn load(&self, target_root: &Path) -> Result<DeployManifest> {
        let path = self.manifest_path(target_root);
        if !path.exists() {
            return Ok(DeployManifest::empty(target_root));
        }
        let raw = fs::read_to_string(&path).context("read manifest")?;
        let manifest: DeployManifest = serde_json::from_str(&raw).context("parse manifest")?;
        if manifest.version != MANIFEST_VERSION {
            anyhow::bail!(
                "unsupported manifest version {} in {:?}",
                manifest.version,
                path
            );
        }
        Ok(manifest)
    }

    pub fn save(&self, manifest: &DeployManifest) -> Result<()> {
        if manifest.is_empty() {
            return self.clear(&manifest.target_root);
        }
        fs::create_dir_all(&self.root).context("create deployments dir")?;
        let path = self.manifest_path(&manifest.target_root);
        let raw = serde_json::to_string_pretty(manifest).context("serialize manifest")?;
        write_atomic(&path, raw.as_bytes()).context("write manifest")?;
        Ok(())
    }

    /// Removing the file is the atomic "clear": a missing manifest loads as
    /// empty.
    pub fn clear(&self, target_root: &Path) -> Result<()> {
        let path = self.manifest_path(target_root);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("clear manifest {:?}", path)),
        }
    }
}

/// Stable short key for a target root. Canonicalized when possible so that
/// two spellings of the same directory share one manifest.
pub fn target_key(target_root: &Path) -> String {
    let canonical = fs::canonicalize(target_root).unwrap_or_else(|_| target_root.to_path_buf());
    let hash = blake3::hash(canonical.to_string_lossy().as_bytes()).to_hex();
    hash[..16].to_string()
}

pub fn join_relative(root: &Path, relative: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in relative.split('/').filter(|part| !part.is_empty()) {
        path.push(part);
    }
    path
}

/// Writes `contents` next to `path`, fsyncs, renames over `path`, then
/// fsyncs the directory.
pub fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no parent"))?;
    fs::create_dir_all(parent)?;
    let file_name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let mut temp_name = OsString::from(file_name);
    temp_name.push(format!(".{}.tmp", std::process::id()));
    let temp_path = parent.join(temp_name);

    let result = (|| {
        let mut file = fs::File::create(&temp_path)?;
        file.write_all(contents)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&temp_path, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&temp_path);
    }
    result?;
    sync_dir(parent)
}

/// Makes a rename inside `dir` durable.
#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    fs::File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}
