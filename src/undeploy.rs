use crate::{
    deploy::{check_target, prune_directories},
    error::{EngineError, PathError, PathFailure},
    lock,
    manifest::ManifestStore,
    ownership::{self, DriftKind, DriftReport, Removal},
    task::CancelToken,
};
use serde::Serialize;
use std::path::Path;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UndeployResult {
    pub removed: usize,
    pub drift: Vec<DriftReport>,
    pub failures: Vec<PathFailure>,
    /// Entries still recorded afterwards (drifted, failed or not reached).
    pub remaining: usize,
    pub manifest_cleared: bool,
    pub cancelled: bool,
}

/// Removes everything the manifest proves the engine owns. The current
/// profile plays no part: only the manifest says what is deployed.
#[tracing::instrument(skip_all, fields(target = ?target_root))]
pub fn undeploy(
    store: &ManifestStore,
    target_root: &Path,
    cancel: Option<&CancelToken>,
) -> Result<UndeployResult, EngineError> {
    check_target(target_root)?;
    let _guard = lock::acquire(store, target_root)?;
    let mut manifest = store.load(target_root).map_err(EngineError::manifest)?;
    let mut result = UndeployResult::default();

    let keys: Vec<String> = manifest.entries.keys().cloned().collect();
    for key in keys {
        if cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("undeploy cancelled");
            result.cancelled = true;
            break;
        }
        let Some(entry) = manifest.entries.get(&key) else {
            continue;
        };
        let dest = entry.dest(target_root);
        match ownership::remove_owned(&dest, entry, &manifest.staging_roots) {
            Ok(Removal::Removed) => {
                manifest.entries.remove(&key);
                result.removed += 1;
            }
            Ok(Removal::AlreadyAbsent) => {
                warn!(path = %key, "deployed file already gone");
                manifest.entries.remove(&key);
                result.drift.push(DriftReport {
                    path: key,
                    kind: DriftKind::Missing,
                });
            }
            Ok(Removal::Refused(kind)) => {
                warn!(path = %key, drift = kind.label(), "leaving changed file in place");
                result.drift.push(DriftReport { path: key, kind });
            }
            Err(err) => {
                error!(path = %key, error = %err, "failed to remove deployed file");
                result
                    .failures
                    .push(PathFailure::new(key, PathError::io("remove", &err)));
            }
        }
    }

    prune_directories(target_root, &mut manifest.directories);
    manifest.prune_staging_roots();
    result.remaining = manifest.entries.len();

    if manifest.entries.is_empty() {
        if !manifest.directories.is_empty() {
            warn!(
                directories = manifest.directories.len(),
                "leaving directories that hold untracked files"
            );
        }
        store.clear(target_root).map_err(EngineError::manifest)?;
        result.manifest_cleared = true;
    } else {
        store.save(&manifest).map_err(EngineError::manifest)?;
    }

    info!(
        removed = result.removed,
        drift = result.drift.len(),
        failures = result.failures.len(),
        remaining = result.remaining,
        cancelled = result.cancelled,
        "undeploy finished"
    );
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        conflicts::Winner,
        deploy::{deploy, DeployOptions},
        library::Profile,
        manifest::{join_relative, LinkKind},
    };
    use std::{collections::BTreeMap, fs, path::PathBuf};
    use tempfile::TempDir;

    fn deployed(files: &[&str]) -> (TempDir, ManifestStore, PathBuf) {
        let dir = TempDir::new().unwrap();
        let staging = dir.path().join("staging/a");
        let target = dir.path().join("game");
        fs::create_dir_all(&target).unwrap();
        let mut winners = BTreeMap::new();
        for rel in files {
            let source = join_relative(&staging, rel);
            fs::create_dir_all(source.parent().unwrap()).unwrap();
            fs::write(&source, rel.as_bytes()).unwrap();
            winners.insert(
                rel.to_string(),
                Winner {
                    mod_id: "a".to_string(),
                    relative_path: rel.to_string(),
                    source,
                },
            );
        }
        let store = ManifestStore::new(&dir.path().join("data"));
        let options = DeployOptions {
            mode: LinkKind::Copy,
            ..DeployOptions::default()
        };
        let roots = BTreeMap::from([("a".to_string(), staging)]);
        deploy(
            &store,
            &target,
            &winners,
            &roots,
            &Profile::new("Test"),
            &options,
        )
        .unwrap();
        (dir, store, target)
    }

    #[test]
    fn removes_everything_and_restores_empty_target() {
        let (_dir, store, target) = deployed(&["nativePC/tex/a.tex", "readme.txt"]);
        let result = undeploy(&store, &target, None).unwrap();

        assert_eq!(result.removed, 2);
        assert!(result.manifest_cleared);
        assert!(!store.manifest_path(&target).exists());
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn manual_deletion_is_reported_as_drift() {
        let (_dir, store, target) = deployed(&["a.bin", "b.bin"]);
        fs::remove_file(target.join("a.bin")).unwrap();

        let result = undeploy(&store, &target, None).unwrap();
        assert_eq!(result.removed, 1);
        assert!(result.failures.is_empty());
        assert_eq!(
            result.drift,
            vec![DriftReport {
                path: "a.bin".to_string(),
                kind: DriftKind::Missing,
            }]
        );
        assert!(result.manifest_cleared);
    }

    #[test]
    fn changed_file_survives_and_stays_recorded() {
        let (_dir, store, target) = deployed(&["keep/a.bin", "b.bin"]);
        fs::write(target.join("keep/a.bin"), "user content").unwrap();

        let result = undeploy(&store, &target, None).unwrap();
        assert_eq!(result.removed, 1);
        assert_eq!(result.remaining, 1);
        assert!(!result.manifest_cleared);
        assert_eq!(
            fs::read_to_string(target.join("keep/a.bin")).unwrap(),
            "user content"
        );

        let manifest = store.load(&target).unwrap();
        assert_eq!(manifest.entries.keys().collect::<Vec<_>>(), vec!["keep/a.bin"]);
        assert!(manifest.directories.contains("keep"));

        let again = undeploy(&store, &target, None).unwrap();
        assert_eq!(again.removed, 0);
        assert_eq!(again.remaining, 1);
    }

    #[test]
    fn vanilla_files_in_created_directories_are_kept() {
        let (_dir, store, target) = deployed(&["mods/a.bin"]);
        fs::write(target.join("mods/vanilla.bin"), "vanilla").unwrap();

        let result = undeploy(&store, &target, None).unwrap();
        assert_eq!(result.removed, 1);
        assert!(result.manifest_cleared);
        assert_eq!(
            fs::read_to_string(target.join("mods/vanilla.bin")).unwrap(),
            "vanilla"
        );
    }

    #[test]
    fn cancelled_undeploy_keeps_unprocessed_entries() {
        let (_dir, store, target) = deployed(&["a.bin", "b.bin"]);
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = undeploy(&store, &target, Some(&cancel)).unwrap();
        assert!(result.cancelled);
        assert_eq!(result.removed, 0);
        assert_eq!(result.remaining, 2);
        assert!(target.join("a.bin").exists());
        assert_eq!(store.load(&target).unwrap().entries.len(), 2);
    }

    #[test]
    fn nothing_deployed_is_a_clean_noop() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("game");
        fs::create_dir_all(&target).unwrap();
        let store = ManifestStore::new(dir.path());

        let result = undeploy(&store, &target, None).unwrap();
        assert_eq!(result.removed, 0);
        assert!(result.manifest_cleared);
    }
}
