use crate::manifest::write_atomic;
use anyhow::{bail, Context, Result};
use blake3::Hasher;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    fs,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

pub const DEFAULT_PROFILE: &str = "Default";

/// Immutable view of a staged mod, as handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedMod {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
}

pub trait ModRepository {
    fn get_mod(&self, id: &str) -> Option<StagedMod>;
    fn list_mods(&self) -> Vec<StagedMod>;
}

pub trait ProfileManager {
    fn get_active_profile(&self) -> Option<Profile>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Library {
    pub mods: Vec<ModEntry>,
    pub profiles: Vec<Profile>,
    pub active_profile: String,
}

impl Default for Library {
    fn default() -> Self {
        Self {
            mods: Vec::new(),
            profiles: vec![Profile::new(DEFAULT_PROFILE)],
            active_profile: DEFAULT_PROFILE.to_string(),
        }
    }
}

impl Library {
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        let library_path = data_dir.join("library.json");
        if library_path.exists() {
            let raw = fs::read_to_string(&library_path).context("read library.json")?;
            let mut library: Library = serde_json::from_str(&raw).context("parse library.json")?;
            if library.profiles.is_empty() {
                library.profiles.push(Profile::new(DEFAULT_PROFILE));
            }
            if !library
                .profiles
                .iter()
                .any(|profile| profile.name == library.active_profile)
            {
                library.active_profile = library.profiles[0].name.clone();
            }
            library.ensure_mods_in_profiles();
            return Ok(library);
        }

        let library = Library::default();
        library.save(data_dir)?;
        Ok(library)
    }

    pub fn save(&self, data_dir: &Path) -> Result<()> {
        fs::create_dir_all(data_dir).context("create data dir")?;
        let library_path = data_dir.join("library.json");
        let raw = serde_json::to_string_pretty(self).context("serialize library.json")?;
        write_atomic(&library_path, raw.as_bytes()).context("write library.json")?;
        Ok(())
    }

    pub fn active_profile_mut(&mut self) -> Option<&mut Profile> {
        self.profiles
            .iter_mut()
            .find(|profile| profile.name == self.active_profile)
    }

    pub fn active_profile(&self) -> Option<&Profile> {
        self.profile(&self.active_profile)
    }

    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.iter().find(|profile| profile.name == name)
    }

    pub fn profile_mut(&mut self, name: &str) -> Option<&mut Profile> {
        self.profiles.iter_mut().find(|profile| profile.name == name)
    }

    pub fn create_profile(&mut self, name: &str) -> Result<&Profile> {
        let name = name.trim();
        if name.is_empty() {
            bail!("profile name cannot be empty");
        }
        if self.profile(name).is_some() {
            bail!("profile already exists: {name}");
        }
        let mut profile = Profile::new(name);
        let mod_ids: Vec<String> = self.mods.iter().map(|m| m.id.clone()).collect();
        profile.ensure_mods(&mod_ids);
        self.profiles.push(profile);
        Ok(&self.profiles[self.profiles.len() - 1])
    }

    pub fn rename_profile(&mut self, from: &str, to: &str) -> Result<()> {
        let to = to.trim();
        if to.is_empty() {
            bail!("profile name cannot be empty");
        }
        if from != to && self.profile(to).is_some() {
            bail!("profile already exists: {to}");
        }
        let profile = self
            .profile_mut(from)
            .with_context(|| format!("profile not found: {from}"))?;
        profile.name = to.to_string();
        if self.active_profile == from {
            self.active_profile = to.to_string();
        }
        Ok(())
    }

    /// Deletes a profile. The last remaining profile cannot be deleted.
    pub fn delete_profile(&mut self, name: &str) -> Result<()> {
        let index = self
            .profiles
            .iter()
            .position(|profile| profile.name == name)
            .with_context(|| format!("profile not found: {name}"))?;
        if self.profiles.len() == 1 {
            bail!("cannot delete the only profile");
        }
        self.profiles.remove(index);
        if self.active_profile == name {
            self.active_profile = self.profiles[0].name.clone();
        }
        Ok(())
    }

    pub fn set_active_profile(&mut self, name: &str) -> Result<()> {
        if self.profile(name).is_none() {
            bail!("profile not found: {name}");
        }
        self.active_profile = name.to_string();
        Ok(())
    }

    pub fn ensure_mods_in_profiles(&mut self) {
        let mod_ids: Vec<String> = self.mods.iter().map(|m| m.id.clone()).collect();
        for profile in &mut self.profiles {
            profile.ensure_mods(&mod_ids);
        }
    }

    pub fn index_by_id(&self) -> HashMap<String, ModEntry> {
        self.mods
            .iter()
            .cloned()
            .map(|mod_entry| (mod_entry.id.clone(), mod_entry))
            .collect()
    }

    pub fn mod_by_id(&self, id: &str) -> Option<&ModEntry> {
        self.mods.iter().find(|entry| entry.id == id)
    }

    pub fn mod_by_name(&self, name: &str) -> Option<&ModEntry> {
        self.mods.iter().find(|entry| entry.name == name)
    }

    /// Finds a mod by id first, then by exact name.
    pub fn find_mod(&self, key: &str) -> Option<&ModEntry> {
        self.mod_by_id(key).or_else(|| self.mod_by_name(key))
    }

    /// Registers an already-staged mod directory. The new mod is appended
    /// to every profile, disabled.
    pub fn add_mod(&mut self, name: &str, root: &Path) -> Result<&ModEntry> {
        let name = name.trim();
        if name.is_empty() {
            bail!("mod name cannot be empty");
        }
        if self.mod_by_name(name).is_some() {
            bail!("a mod named {name:?} is already registered");
        }
        let entry = ModEntry::new(name, root);
        if self.mod_by_id(&entry.id).is_some() {
            bail!("mod already registered: {}", entry.id);
        }
        self.mods.push(entry);
        self.ensure_mods_in_profiles();
        Ok(&self.mods[self.mods.len() - 1])
    }

    pub fn update_mod(&mut self, updated: ModEntry) -> Result<()> {
        let entry = self
            .mods
            .iter_mut()
            .find(|entry| entry.id == updated.id)
            .with_context(|| format!("mod not found: {}", updated.id))?;
        *entry = updated;
        Ok(())
    }

    /// Removes a mod from the library and from every profile's load order.
    pub fn remove_mod(&mut self, id: &str) -> Option<ModEntry> {
        let index = self.mods.iter().position(|entry| entry.id == id)?;
        let removed = self.mods.remove(index);
        for profile in &mut self.profiles {
            profile.order.retain(|entry| entry.id != id);
        }
        Some(removed)
    }

    /// Case-insensitive search over name, author and tags.
    pub fn search(&self, query: &str) -> Vec<&ModEntry> {
        let query = query.to_lowercase();
        self.mods
            .iter()
            .filter(|entry| {
                entry.name.to_lowercase().contains(&query)
                    || entry
                        .author
                        .as_deref()
                        .is_some_and(|author| author.to_lowercase().contains(&query))
                    || entry
                        .tags
                        .iter()
                        .any(|tag| tag.to_lowercase().contains(&query))
            })
            .collect()
    }
}

impl ModRepository for Library {
    fn get_mod(&self, id: &str) -> Option<StagedMod> {
        self.mod_by_id(id).map(ModEntry::staged)
    }

    fn list_mods(&self) -> Vec<StagedMod> {
        self.mods.iter().map(ModEntry::staged).collect()
    }
}

impl ProfileManager for Library {
    fn get_active_profile(&self) -> Option<Profile> {
        self.active_profile().cloned()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Profile {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub order: Vec<ProfileEntry>,
}

impl Profile {
    pub fn new(name: &str) -> Self {
        Self {
            id: make_id("profile", name),
            name: name.to_string(),
            description: None,
            order: Vec::new(),
        }
    }

    pub fn ensure_mods(&mut self, mod_ids: &[String]) {
        for id in mod_ids {
            if !self.order.iter().any(|entry| entry.id == *id) {
                self.order.push(ProfileEntry {
                    id: id.clone(),
                    enabled: false,
                });
            }
        }
    }

    pub fn entry(&self, mod_id: &str) -> Option<&ProfileEntry> {
        self.order.iter().find(|entry| entry.id == mod_id)
    }

    pub fn position(&self, mod_id: &str) -> Option<usize> {
        self.order.iter().position(|entry| entry.id == mod_id)
    }

    /// Enables or disables a mod, appending it at the end of the load order
    /// if the profile has no entry for it yet.
    pub fn set_enabled(&mut self, mod_id: &str, enabled: bool) {
        if let Some(entry) = self.order.iter_mut().find(|entry| entry.id == mod_id) {
            entry.enabled = enabled;
            return;
        }
        self.order.push(ProfileEntry {
            id: mod_id.to_string(),
            enabled,
        });
    }

    pub fn enabled_ids(&self) -> Vec<&str> {
        self.order
            .iter()
            .filter(|entry| entry.enabled)
            .map(|entry| entry.id.as_str())
            .collect()
    }

    pub fn move_up(&mut self, index: usize) {
        if index == 0 || index >= self.order.len() {
            return;
        }
        self.order.swap(index, index - 1);
    }

    pub fn move_down(&mut self, index: usize) {
        if index + 1 >= self.order.len() {
            return;
        }
        self.order.swap(index, index + 1);
    }

    /// Moves the entry at `from` to `to`, clamping `to` to the end.
    pub fn move_to(&mut self, from: usize, to: usize) {
        if from >= self.order.len() {
            return;
        }
        let entry = self.order.remove(from);
        let to = to.min(self.order.len());
        self.order.insert(to, entry);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProfileEntry {
    pub id: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModEntry {
    pub id: String,
    pub name: String,
    pub root: PathBuf,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    pub added_at: i64,
}

impl ModEntry {
    pub fn new(name: &str, root: &Path) -> Self {
        Self {
            id: make_id("mod", &format!("{name}\0{}", root.to_string_lossy())),
            name: name.to_string(),
            root: root.to_path_buf(),
            version: None,
            author: None,
            description: None,
            tags: Vec::new(),
            added_at: now_timestamp(),
        }
    }

    pub fn staged(&self) -> StagedMod {
        StagedMod {
            id: self.id.clone(),
            name: self.name.clone(),
            root: self.root.clone(),
        }
    }

    pub fn is_staged(&self) -> bool {
        self.root.is_dir()
    }
}

/// Set of mod ids referenced by a profile that the library does not know.
pub fn dangling_ids(library: &Library, profile: &Profile) -> HashSet<String> {
    profile
        .order
        .iter()
        .filter(|entry| library.mod_by_id(&entry.id).is_none())
        .map(|entry| entry.id.clone())
        .collect()
}

fn make_id(prefix: &str, seed: &str) -> String {
    let mut hasher = Hasher::new();
    hasher.update(seed.as_bytes());
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    hasher.update(&nanos.to_le_bytes());
    let hash = hasher.finalize().to_hex();
    format!("{prefix}-{}", &hash[..16])
}

fn now_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
