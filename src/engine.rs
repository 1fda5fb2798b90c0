use crate::{
    conflicts::{self, Resolution},
    deploy::{self, DeployOptions, DeploymentResult, VerifyReport},
    error::EngineError,
    library::{ModRepository, Profile, ProfileManager},
    manifest::{LinkKind, ManifestStore},
    mod_index::{self, ModIndex, PathCase},
    task::CancelToken,
    undeploy::{self, UndeployResult},
};
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::{Path, PathBuf},
};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub path_case: PathCase,
    pub fallback_to_copy: bool,
    pub abort_on_first_error: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            path_case: PathCase::Sensitive,
            fallback_to_copy: true,
            abort_on_first_error: false,
        }
    }
}

/// Entry point for resolving and (un)deploying profiles against a target.
pub struct Engine<R: ModRepository> {
    repository: R,
    store: ManifestStore,
    settings: EngineSettings,
}

impl<R: ModRepository> Engine<R> {
    pub fn new(repository: R, store: ManifestStore, settings: EngineSettings) -> Self {
        Self {
            repository,
            store,
            settings,
        }
    }

    /// Indexes every enabled mod of `profile` and resolves conflicts.
    pub fn resolve(&self, profile: &Profile) -> Resolution {
        self.resolve_with_roots(profile).0
    }

    pub fn deploy(
        &self,
        profile: &Profile,
        target_root: &Path,
        mode: LinkKind,
        cancel: Option<CancelToken>,
    ) -> Result<DeploymentResult, EngineError> {
        let (resolution, staging_roots) = self.resolve_with_roots(profile);
        let options = DeployOptions {
            mode,
            fallback_to_copy: self.settings.fallback_to_copy,
            abort_on_first_error: self.settings.abort_on_first_error,
            cancel,
        };
        deploy::deploy(
            &self.store,
            target_root,
            &resolution.winning_paths,
            &staging_roots,
            profile,
            &options,
        )
    }

    /// Deploys whatever profile `profiles` reports as active.
    pub fn deploy_active<P: ProfileManager>(
        &self,
        profiles: &P,
        target_root: &Path,
        mode: LinkKind,
        cancel: Option<CancelToken>,
    ) -> Result<DeploymentResult, EngineError> {
        let profile = profiles
            .get_active_profile()
            .ok_or_else(|| EngineError::ProfileMissing("active profile".to_string()))?;
        self.deploy(&profile, target_root, mode, cancel)
    }

    pub fn undeploy(
        &self,
        target_root: &Path,
        cancel: Option<&CancelToken>,
    ) -> Result<UndeployResult, EngineError> {
        undeploy::undeploy(&self.store, target_root, cancel)
    }

    pub fn verify(&self, target_root: &Path) -> Result<VerifyReport, EngineError> {
        deploy::verify(&self.store, target_root)
    }

    fn resolve_with_roots(&self, profile: &Profile) -> (Resolution, BTreeMap<String, PathBuf>) {
        let mut indices: HashMap<String, ModIndex> = HashMap::new();
        let mut index_errors = Vec::new();
        let mut seen = HashSet::new();

        for entry in profile.order.iter().filter(|entry| entry.enabled) {
            if !seen.insert(entry.id.as_str()) {
                continue;
            }
            let Some(staged) = self.repository.get_mod(&entry.id) else {
                continue;
            };
            let index = match mod_index::index_mod(&staged, self.settings.path_case) {
                Ok(index) => index,
                Err(err) => {
                    warn!(mod_id = %staged.id, name = %staged.name, error = %err, "mod contributes no files");
                    index_errors.push((staged.id.clone(), err.to_string()));
                    ModIndex::empty(&staged)
                }
            };
            if index.is_empty() {
                debug!(mod_id = %staged.id, "mod has no files");
            }
            indices.insert(staged.id.clone(), index);
        }

        let staging_roots = indices
            .values()
            .map(|index| (index.mod_id.clone(), index.root.clone()))
            .collect();
        let mut resolution = conflicts::resolve(profile, &indices);
        resolution.index_errors = index_errors;
        (resolution, staging_roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{deploy::DeployOutcome, library::StagedMod};
    use std::fs;
    use tempfile::TempDir;

    struct MemoryRepository(Vec<StagedMod>);

    impl ModRepository for MemoryRepository {
        fn get_mod(&self, id: &str) -> Option<StagedMod> {
            self.0.iter().find(|staged| staged.id == id).cloned()
        }

        fn list_mods(&self) -> Vec<StagedMod> {
            self.0.clone()
        }
    }

    struct NoActiveProfile;

    impl ProfileManager for NoActiveProfile {
        fn get_active_profile(&self) -> Option<Profile> {
            None
        }
    }

    fn staged(dir: &Path, id: &str, files: &[&str]) -> StagedMod {
        let root = dir.join("staging").join(id);
        for rel in files {
            let path = root.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, format!("{id}:{rel}")).unwrap();
        }
        StagedMod {
            id: id.to_string(),
            name: id.to_uppercase(),
            root,
        }
    }

    fn engine(dir: &Path, mods: Vec<StagedMod>) -> Engine<MemoryRepository> {
        Engine::new(
            MemoryRepository(mods),
            ManifestStore::new(&dir.join("data")),
            EngineSettings::default(),
        )
    }

    #[test]
    fn unreadable_mod_root_is_reported_and_skipped() {
        let dir = TempDir::new().unwrap();
        let good = staged(dir.path(), "good", &["a.bin"]);
        let broken = StagedMod {
            id: "broken".to_string(),
            name: "Broken".to_string(),
            root: dir.path().join("does-not-exist"),
        };
        let engine = engine(dir.path(), vec![good, broken]);
        let mut profile = Profile::new("Test");
        profile.set_enabled("broken", true);
        profile.set_enabled("good", true);
        profile.set_enabled("ghost", true);

        let resolution = engine.resolve(&profile);
        assert_eq!(resolution.winning_paths.len(), 1);
        assert_eq!(resolution.index_errors.len(), 1);
        assert_eq!(resolution.index_errors[0].0, "broken");
        assert_eq!(resolution.missing_mods, vec!["ghost"]);
    }

    #[test]
    fn insensitive_paths_collide_across_case() {
        let dir = TempDir::new().unwrap();
        let a = staged(dir.path(), "a", &["NativePC/Tex.bin"]);
        let b = staged(dir.path(), "b", &["nativepc/tex.BIN"]);
        let mut engine = engine(dir.path(), vec![a, b]);
        let mut profile = Profile::new("Test");
        profile.set_enabled("a", true);
        profile.set_enabled("b", true);

        assert!(!engine.resolve(&profile).has_conflicts());
        engine.settings.path_case = PathCase::Insensitive;
        let resolution = engine.resolve(&profile);
        assert_eq!(resolution.conflicts.len(), 1);
        assert_eq!(
            resolution.winning_paths["nativepc/tex.bin"].relative_path,
            "nativepc/tex.BIN"
        );
    }

    #[test]
    fn deploy_then_undeploy_leaves_target_empty() {
        let dir = TempDir::new().unwrap();
        let a = staged(dir.path(), "a", &["x/1.bin", "x/2.bin"]);
        let b = staged(dir.path(), "b", &["x/2.bin", "y/3.bin"]);
        let engine = engine(dir.path(), vec![a, b]);
        let target = dir.path().join("game");
        fs::create_dir_all(&target).unwrap();
        let mut profile = Profile::new("Test");
        profile.set_enabled("a", true);
        profile.set_enabled("b", true);

        let result = engine
            .deploy(&profile, &target, LinkKind::Copy, None)
            .unwrap();
        assert_eq!(result.outcome, DeployOutcome::Committed);
        assert_eq!(result.created, 3);
        assert_eq!(fs::read_to_string(target.join("x/2.bin")).unwrap(), "b:x/2.bin");
        assert!(engine.verify(&target).unwrap().is_clean());

        let undone = engine.undeploy(&target, None).unwrap();
        assert_eq!(undone.removed, 3);
        assert!(undone.manifest_cleared);
        assert_eq!(fs::read_dir(&target).unwrap().count(), 0);
    }

    #[test]
    fn deploy_active_requires_a_profile() {
        let dir = TempDir::new().unwrap();
        let engine = engine(dir.path(), Vec::new());
        let err = engine
            .deploy_active(&NoActiveProfile, dir.path(), LinkKind::Copy, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::ProfileMissing(_)));
    }
}
