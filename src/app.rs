use crate::{
    backup,
    config::AppConfig,
    deploy::DeploymentResult,
    engine::Engine,
    library::{Library, ModEntry, Profile},
    lock,
    manifest::{LinkKind, ManifestStore},
    task::{self, CancelToken, TaskHandle},
    undeploy::UndeployResult,
};
use anyhow::{bail, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

/// Per-invocation overrides of the configured deploy behaviour.
#[derive(Debug, Clone, Default)]
pub struct DeployRequest {
    pub mode: Option<LinkKind>,
    pub backup: Option<bool>,
    pub abort_on_first_error: Option<bool>,
}

pub struct App {
    pub data_dir: PathBuf,
    pub config: AppConfig,
    pub library: Library,
}

impl App {
    pub fn initialize_in(data_dir: &Path) -> Result<Self> {
        let mut config = AppConfig::load_or_create(data_dir)?;
        let mut library = Library::load_or_create(data_dir)?;
        library.ensure_mods_in_profiles();
        if library.profile(&config.active_profile).is_some() {
            library.active_profile = config.active_profile.clone();
        } else {
            config.active_profile = library.active_profile.clone();
        }
        library.save(data_dir)?;
        config.save(data_dir)?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            config,
            library,
        })
    }

    pub fn save(&self) -> Result<()> {
        self.library.save(&self.data_dir)?;
        self.config.save(&self.data_dir)
    }

    pub fn store(&self) -> ManifestStore {
        ManifestStore::new(&self.data_dir)
    }

    pub fn engine(&self) -> Engine<Library> {
        Engine::new(
            self.library.clone(),
            self.store(),
            self.config.engine_settings(),
        )
    }

    pub fn target_root(&self) -> Result<PathBuf> {
        self.config
            .game_dir
            .clone()
            .context("no game directory configured (stagehand config set game_dir PATH)")
    }

    /// The named profile, or the active one.
    pub fn profile(&self, name: Option<&str>) -> Result<&Profile> {
        if let Some(name) = name {
            return self
                .library
                .profile(name)
                .ok_or_else(|| anyhow::anyhow!("Unknown profile: {name}"));
        }
        self.library
            .active_profile()
            .ok_or_else(|| anyhow::anyhow!("No active profile"))
    }

    pub fn profile_mut(&mut self, name: Option<&str>) -> Result<&mut Profile> {
        let name = match name {
            Some(name) => name.to_string(),
            None => self.library.active_profile.clone(),
        };
        self.library
            .profile_mut(&name)
            .ok_or_else(|| anyhow::anyhow!("Unknown profile: {name}"))
    }

    pub fn set_active_profile(&mut self, name: &str) -> Result<()> {
        self.library.set_active_profile(name)?;
        self.config.active_profile = name.to_string();
        self.save()
    }

    pub fn rename_profile(&mut self, from: &str, to: &str) -> Result<()> {
        self.library.rename_profile(from, to)?;
        if self.config.active_profile == from {
            self.config.active_profile = to.to_string();
        }
        self.save()
    }

    pub fn delete_profile(&mut self, name: &str) -> Result<()> {
        self.library.delete_profile(name)?;
        self.config.active_profile = self.library.active_profile.clone();
        self.save()
    }

    /// Registers an already-staged folder as a mod. Relative paths are tried
    /// under the staging directory first.
    pub fn add_mod(&mut self, name: &str, path: &Path) -> Result<ModEntry> {
        let root = self.resolve_mod_root(path)?;
        let entry = self.library.add_mod(name, &root)?.clone();
        self.save()?;
        info!(mod_id = %entry.id, root = ?entry.root, "added mod");
        Ok(entry)
    }

    pub fn remove_mod(&mut self, key: &str) -> Result<ModEntry> {
        let id = self
            .library
            .find_mod(key)
            .map(|entry| entry.id.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown mod: {key}"))?;
        let removed = self
            .library
            .remove_mod(&id)
            .ok_or_else(|| anyhow::anyhow!("Unknown mod: {key}"))?;
        self.save()?;
        info!(mod_id = %removed.id, "removed mod");
        Ok(removed)
    }

    /// Runs a deploy of `profile_name` (or the active profile) on a worker
    /// thread. The backup, if any, is taken before the worker starts.
    pub fn start_deploy(
        &self,
        profile_name: Option<&str>,
        request: &DeployRequest,
        cancel: CancelToken,
    ) -> Result<TaskHandle<DeploymentResult>> {
        let target = self.target_root()?;
        let profile = self.profile(profile_name)?.clone();
        let mode = request.mode.unwrap_or(self.config.deployment_mode);

        if request.backup.unwrap_or(self.config.backup_before_deploy) {
            let dir = backup::create_backup(
                &self.data_dir,
                &self.library,
                Some(&target),
                Some("deploy"),
            )
            .context("backup before deploy")?;
            info!(backup = ?dir, "created backup");
        }

        let mut settings = self.config.engine_settings();
        if let Some(abort) = request.abort_on_first_error {
            settings.abort_on_first_error = abort;
        }
        let engine = Engine::new(self.library.clone(), self.store(), settings);
        Ok(task::spawn("deploy", cancel, move |cancel| {
            let result = engine.deploy(&profile, &target, mode, Some(cancel))?;
            Ok(result)
        }))
    }

    pub fn start_undeploy(&self, cancel: CancelToken) -> Result<TaskHandle<UndeployResult>> {
        let target = self.target_root()?;
        let engine = self.engine();
        Ok(task::spawn("undeploy", cancel, move |cancel| {
            let result = engine.undeploy(&target, Some(&cancel))?;
            Ok(result)
        }))
    }

    /// Clears a lock left behind by a crashed deploy or undeploy.
    pub fn unlock(&self) -> Result<bool> {
        let target = self.target_root()?;
        lock::force_unlock(&self.store(), &target).context("remove lock file")
    }

    fn resolve_mod_root(&self, path: &Path) -> Result<PathBuf> {
        let candidate = if path.is_absolute() {
            path.to_path_buf()
        } else {
            let staged = self.config.staging_dir(&self.data_dir).join(path);
            if staged.is_dir() {
                staged
            } else {
                std::env::current_dir()
                    .context("resolve current dir")?
                    .join(path)
            }
        };
        if !candidate.is_dir() {
            bail!("mod folder not found: {}", candidate.display());
        }
        fs::canonicalize(&candidate).with_context(|| format!("resolve {:?}", candidate))
    }
}
