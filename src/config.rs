use crate::{
    engine::EngineSettings,
    library::DEFAULT_PROFILE,
    manifest::LinkKind,
    mod_index::PathCase,
};
use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};

pub const HOME_ENV: &str = "STAGEHAND_HOME";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Target directory deployments are written into.
    #[serde(default)]
    pub game_dir: Option<PathBuf>,
    /// Where staged mod folders live; relative mod paths resolve against it.
    #[serde(default)]
    pub staging_dir: Option<PathBuf>,
    #[serde(default)]
    pub deployment_mode: LinkKind,
    #[serde(default = "default_true")]
    pub fallback_to_copy: bool,
    #[serde(default)]
    pub abort_on_first_error: bool,
    #[serde(default = "default_true")]
    pub backup_before_deploy: bool,
    #[serde(default)]
    pub path_case: PathCase,
    #[serde(default = "default_profile")]
    pub active_profile: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            game_dir: None,
            staging_dir: None,
            deployment_mode: LinkKind::Symlink,
            fallback_to_copy: true,
            abort_on_first_error: false,
            backup_before_deploy: true,
            path_case: PathCase::Sensitive,
            active_profile: default_profile(),
        }
    }
}

impl AppConfig {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir).context("create app data dir")?;
        let path = data_dir.join("config.json");
        if path.exists() {
            let raw = fs::read_to_string(&path).context("read app config")?;
            let config: AppConfig = serde_json::from_str(&raw).context("parse app config")?;
            return Ok(config);
        }

        let config = AppConfig::default();
        config.save(data_dir)?;
        Ok(config)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create app data dir")?;
        let path = data_dir.join("config.json");
        let raw = serde_json::to_string_pretty(self).context("serialize app config")?;
        fs::write(path, raw).context("write app config")?;
        Ok(())
    }

    pub fn staging_dir(&self, data_dir: &Path) -> PathBuf {
        self.staging_dir
            .clone()
            .unwrap_or_else(|| data_dir.join("mods"))
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            path_case: self.path_case,
            fallback_to_copy: self.fallback_to_copy,
            abort_on_first_error: self.abort_on_first_error,
        }
    }

    /// Sets one field from its textual form, as typed on the command line.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "game_dir" => self.game_dir = parse_optional_path(value),
            "staging_dir" => self.staging_dir = parse_optional_path(value),
            "deployment_mode" => {
                self.deployment_mode = LinkKind::parse(value)
                    .with_context(|| format!("unknown deployment mode: {value}"))?;
            }
            "fallback_to_copy" => self.fallback_to_copy = parse_bool(value)?,
            "abort_on_first_error" => self.abort_on_first_error = parse_bool(value)?,
            "backup_before_deploy" => self.backup_before_deploy = parse_bool(value)?,
            "path_case" => {
                self.path_case = PathCase::parse(value)
                    .with_context(|| format!("unknown path case: {value}"))?;
            }
            "active_profile" => {
                if value.trim().is_empty() {
                    bail!("profile name cannot be empty");
                }
                self.active_profile = value.trim().to_string();
            }
            _ => bail!("unknown config key: {key}"),
        }
        Ok(())
    }

    /// `(key, value)` pairs in the order `config show` prints them.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        let path = |value: &Option<PathBuf>| {
            value
                .as_ref()
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "-".to_string())
        };
        vec![
            ("game_dir", path(&self.game_dir)),
            ("staging_dir", path(&self.staging_dir)),
            ("deployment_mode", self.deployment_mode.label().to_string()),
            ("fallback_to_copy", self.fallback_to_copy.to_string()),
            ("abort_on_first_error", self.abort_on_first_error.to_string()),
            ("backup_before_deploy", self.backup_before_deploy.to_string()),
            ("path_case", self.path_case.label().to_string()),
            ("active_profile", self.active_profile.clone()),
        ]
    }
}

/// `$STAGEHAND_HOME` if set, otherwise the platform's local data dir.
pub fn base_data_dir() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
        return Ok(PathBuf::from(home));
    }
    let base = BaseDirs::new().context("resolve home dir")?;
    Ok(base.data_local_dir().join("stagehand"))
}

fn parse_optional_path(value: &str) -> Option<PathBuf> {
    match value.trim() {
        "" | "-" | "none" => None,
        other => Some(PathBuf::from(other)),
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        _ => bail!("expected true or false, got {value}"),
    }
}

fn default_true() -> bool {
    true
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}
