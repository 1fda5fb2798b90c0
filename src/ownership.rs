//! Proof of ownership for deployed artifacts.
//!
//! Nothing in the target directory is deleted unless [`check`] says the
//! engine put it there and it has not been touched since.

use crate::manifest::{LinkKind, ManifestEntry};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    fs,
    io::{self, Read},
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftKind {
    /// Nothing exists at the recorded path anymore.
    Missing,
    /// A symlink was replaced by a file/directory or the other way round.
    KindChanged,
    /// The symlink points somewhere other than the recorded staged file.
    Retargeted,
    /// The recorded source is not inside its mod's staging root.
    OutsideStaging,
    /// A copied file no longer has the size or content that was written.
    ContentChanged,
}

impl DriftKind {
    pub fn label(self) -> &'static str {
        match self {
            DriftKind::Missing => "missing",
            DriftKind::KindChanged => "kind changed",
            DriftKind::Retargeted => "retargeted",
            DriftKind::OutsideStaging => "outside staging",
            DriftKind::ContentChanged => "content changed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    pub path: String,
    pub kind: DriftKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    Owned,
    Missing,
    Drifted(DriftKind),
}

impl Ownership {
    /// Drift worth reporting, including a vanished artifact.
    pub fn drift(self) -> Option<DriftKind> {
        match self {
            Ownership::Owned => None,
            Ownership::Missing => Some(DriftKind::Missing),
            Ownership::Drifted(kind) => Some(kind),
        }
    }
}

pub fn check(
    dest: &Path,
    entry: &ManifestEntry,
    staging_roots: &BTreeMap<String, PathBuf>,
) -> io::Result<Ownership> {
    let meta = match fs::symlink_metadata(dest) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Ownership::Missing),
        Err(err) => return Err(err),
    };
    let file_type = meta.file_type();

    match entry.link_kind {
        LinkKind::Symlink => {
            if !file_type.is_symlink() {
                return Ok(Ownership::Drifted(DriftKind::KindChanged));
            }
            let link = fs::read_link(dest)?;
            if link != entry.source {
                return Ok(Ownership::Drifted(DriftKind::Retargeted));
            }
            if !source_in_staging(entry, staging_roots) {
                return Ok(Ownership::Drifted(DriftKind::OutsideStaging));
            }
            Ok(Ownership::Owned)
        }
        LinkKind::Copy => {
            if file_type.is_symlink() || !file_type.is_file() {
                return Ok(Ownership::Drifted(DriftKind::KindChanged));
            }
            let Some(stamp) = entry.copy.as_ref() else {
                return Ok(Ownership::Drifted(DriftKind::ContentChanged));
            };
            if meta.len() != stamp.size {
                return Ok(Ownership::Drifted(DriftKind::ContentChanged));
            }
            if hash_file(dest)? != stamp.blake3 {
                return Ok(Ownership::Drifted(DriftKind::ContentChanged));
            }
            Ok(Ownership::Owned)
        }
    }
}

/// Outcome of [`remove_owned`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    Removed,
    AlreadyAbsent,
    Refused(DriftKind),
}

/// Deletes the artifact at `dest` only after [`check`] proves ownership.
pub fn remove_owned(
    dest: &Path,
    entry: &ManifestEntry,
    staging_roots: &BTreeMap<String, PathBuf>,
) -> io::Result<Removal> {
    take_owned(dest, entry, staging_roots, |dest| fs::remove_file(dest))
}

/// Like [`remove_owned`], but moves the artifact to `aside` so it can be
/// put back unchanged. `aside` must be on the same filesystem.
pub fn set_aside_owned(
    dest: &Path,
    entry: &ManifestEntry,
    staging_roots: &BTreeMap<String, PathBuf>,
    aside: &Path,
) -> io::Result<Removal> {
    take_owned(dest, entry, staging_roots, |dest| fs::rename(dest, aside))
}

fn take_owned(
    dest: &Path,
    entry: &ManifestEntry,
    staging_roots: &BTreeMap<String, PathBuf>,
    take: impl FnOnce(&Path) -> io::Result<()>,
) -> io::Result<Removal> {
    match check(dest, entry, staging_roots)? {
        Ownership::Owned => {
            take(dest)?;
            Ok(Removal::Removed)
        }
        Ownership::Missing => Ok(Removal::AlreadyAbsent),
        Ownership::Drifted(kind) => Ok(Removal::Refused(kind)),
    }
}

fn source_in_staging(entry: &ManifestEntry, staging_roots: &BTreeMap<String, PathBuf>) -> bool {
    staging_roots
        .get(&entry.source_mod_id)
        .is_some_and(|root| entry.source.starts_with(root))
}

pub fn hash_file(path: &Path) -> io::Result<String> {
    let mut file = fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::CopyStamp;

    fn roots(mod_id: &str, root: &Path) -> BTreeMap<String, PathBuf> {
        BTreeMap::from([(mod_id.to_string(), root.to_path_buf())])
    }

    fn copy_entry(source: &Path, dest: &Path) -> ManifestEntry {
        ManifestEntry {
            source_mod_id: "mod-a".to_string(),
            link_kind: LinkKind::Copy,
            relative_path: "a.bin".to_string(),
            source: source.to_path_buf(),
            fell_back: false,
            copy: Some(CopyStamp {
                size: fs::metadata(dest).unwrap().len(),
                blake3: hash_file(dest).unwrap(),
                source_size: 0,
                source_modified: None,
            }),
        }
    }

    #[test]
    fn copy_is_owned_until_edited() {
        let staging = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let source = staging.path().join("a.bin");
        let dest = target.path().join("a.bin");
        fs::write(&source, b"mod bytes").unwrap();
        fs::write(&dest, b"mod bytes").unwrap();
        let entry = copy_entry(&source, &dest);
        let roots = roots("mod-a", staging.path());

        assert_eq!(check(&dest, &entry, &roots).unwrap(), Ownership::Owned);
        fs::write(&dest, b"user bytes").unwrap();
        assert_eq!(
            check(&dest, &entry, &roots).unwrap(),
            Ownership::Drifted(DriftKind::ContentChanged)
        );
        assert_eq!(
            remove_owned(&dest, &entry, &roots).unwrap(),
            Removal::Refused(DriftKind::ContentChanged)
        );
        assert!(dest.exists());
    }

    #[test]
    fn set_aside_moves_only_owned_copies() {
        let staging = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let source = staging.path().join("a.bin");
        let dest = target.path().join("a.bin");
        let aside = target.path().join("aside.bin");
        fs::write(&source, b"mod bytes").unwrap();
        fs::write(&dest, b"mod bytes").unwrap();
        let entry = copy_entry(&source, &dest);
        let roots = roots("mod-a", staging.path());

        fs::write(&dest, b"user bytes").unwrap();
        assert_eq!(
            set_aside_owned(&dest, &entry, &roots, &aside).unwrap(),
            Removal::Refused(DriftKind::ContentChanged)
        );
        assert!(!aside.exists());

        fs::write(&dest, b"mod bytes").unwrap();
        assert_eq!(
            set_aside_owned(&dest, &entry, &roots, &aside).unwrap(),
            Removal::Removed
        );
        assert!(!dest.exists());
        assert_eq!(fs::read(&aside).unwrap(), b"mod bytes");
    }

    #[test]
    fn missing_artifact_is_reported_missing() {
        let staging = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let dest = target.path().join("a.bin");
        fs::write(&dest, b"x").unwrap();
        let entry = copy_entry(&staging.path().join("a.bin"), &dest);
        fs::remove_file(&dest).unwrap();

        let roots = roots("mod-a", staging.path());
        assert_eq!(check(&dest, &entry, &roots).unwrap(), Ownership::Missing);
        assert_eq!(
            remove_owned(&dest, &entry, &roots).unwrap(),
            Removal::AlreadyAbsent
        );
    }

    #[cfg(unix)]
    #[test]
    fn symlink_must_point_at_recorded_source_inside_staging() {
        let staging = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let source = staging.path().join("a.bin");
        let other = staging.path().join("b.bin");
        fs::write(&source, b"a").unwrap();
        fs::write(&other, b"b").unwrap();
        let dest = target.path().join("a.bin");
        std::os::unix::fs::symlink(&source, &dest).unwrap();

        let entry = ManifestEntry {
            source_mod_id: "mod-a".to_string(),
            link_kind: LinkKind::Symlink,
            relative_path: "a.bin".to_string(),
            source: source.clone(),
            fell_back: false,
            copy: None,
        };
        let good_roots = roots("mod-a", staging.path());
        assert_eq!(check(&dest, &entry, &good_roots).unwrap(), Ownership::Owned);

        let foreign_roots = roots("mod-a", Path::new("/somewhere/else"));
        assert_eq!(
            check(&dest, &entry, &foreign_roots).unwrap(),
            Ownership::Drifted(DriftKind::OutsideStaging)
        );

        fs::remove_file(&dest).unwrap();
        std::os::unix::fs::symlink(&other, &dest).unwrap();
        assert_eq!(
            check(&dest, &entry, &good_roots).unwrap(),
            Ownership::Drifted(DriftKind::Retargeted)
        );

        fs::remove_file(&dest).unwrap();
        fs::write(&dest, b"vanilla").unwrap();
        assert_eq!(
            remove_owned(&dest, &entry, &good_roots).unwrap(),
            Removal::Refused(DriftKind::KindChanged)
        );
        assert_eq!(fs::read(&dest).unwrap(), b"vanilla");
    }

    #[cfg(unix)]
    #[test]
    fn dangling_symlink_to_deleted_mod_is_still_owned() {
        let staging = tempfile::TempDir::new().unwrap();
        let target = tempfile::TempDir::new().unwrap();
        let source = staging.path().join("gone.bin");
        let dest = target.path().join("gone.bin");
        std::os::unix::fs::symlink(&source, &dest).unwrap();

        let entry = ManifestEntry {
            source_mod_id: "mod-a".to_string(),
            link_kind: LinkKind::Symlink,
            relative_path: "gone.bin".to_string(),
            source,
            fell_back: false,
            copy: None,
        };
        let roots = roots("mod-a", staging.path());
        assert_eq!(
            remove_owned(&dest, &entry, &roots).unwrap(),
            Removal::Removed
        );
        assert!(fs::symlink_metadata(&dest).is_err());
    }
}
