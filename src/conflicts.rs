use crate::{library::Profile, mod_index::ModIndex};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::PathBuf,
};
use tracing::{debug, warn};

/// The mod whose copy of a path ends up in the target directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Winner {
    pub mod_id: String,
    pub relative_path: String,
    pub source: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conflict {
    pub path: String,
    /// Every enabled mod that ships this path, in load order.
    pub contenders: Vec<String>,
    pub winner: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Resolution {
    pub winning_paths: BTreeMap<String, Winner>,
    pub conflicts: Vec<Conflict>,
    /// Enabled profile entries with no known mod.
    pub missing_mods: Vec<String>,
    /// Enabled mods whose root could not be indexed, with the reason.
    pub index_errors: Vec<(String, String)>,
}

impl Resolution {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }

    pub fn conflicts_for_mod(&self, mod_id: &str) -> Vec<&Conflict> {
        self.conflicts
            .iter()
            .filter(|conflict| conflict.contenders.iter().any(|id| id == mod_id))
            .collect()
    }

    /// Number of files each mod loses to a later mod.
    pub fn overridden_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for conflict in &self.conflicts {
            for loser in conflict.contenders.iter().filter(|id| **id != conflict.winner) {
                *counts.entry(loser.clone()).or_insert(0) += 1;
            }
        }
        counts
    }
}

/// Later entries in `profile.order` win. Disabled entries and entries without
/// an index are skipped; a mod listed twice only counts at its first
/// position.
pub fn resolve(profile: &Profile, indices: &HashMap<String, ModIndex>) -> Resolution {
    let mut touched: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut winning_paths = BTreeMap::new();
    let mut missing_mods = Vec::new();
    let mut seen = HashSet::new();

    for entry in &profile.order {
        if !seen.insert(entry.id.as_str()) {
            warn!(profile = %profile.name, mod_id = %entry.id, "mod listed twice in load order");
            continue;
        }
        if !entry.enabled {
            continue;
        }
        let Some(index) = indices.get(&entry.id) else {
            warn!(profile = %profile.name, mod_id = %entry.id, "mod in profile but not found");
            missing_mods.push(entry.id.clone());
            continue;
        };
        for file in &index.files {
            touched
                .entry(file.key.clone())
                .or_default()
                .push(index.mod_id.clone());
            winning_paths.insert(
                file.key.clone(),
                Winner {
                    mod_id: index.mod_id.clone(),
                    relative_path: file.relative_path.clone(),
                    source: index.source_path(file),
                },
            );
        }
    }

    let conflicts: Vec<Conflict> = touched
        .into_iter()
        .filter(|(_, contenders)| contenders.len() > 1)
        .map(|(path, contenders)| {
            let winner = contenders[contenders.len() - 1].clone();
            Conflict {
                path,
                contenders,
                winner,
            }
        })
        .collect();

    debug!(
        profile = %profile.name,
        files = winning_paths.len(),
        conflicts = conflicts.len(),
        "resolved profile"
    );

    Resolution {
        winning_paths,
        conflicts,
        missing_mods,
        index_errors: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mod_index::IndexedFile;

    fn index(mod_id: &str, paths: &[&str]) -> ModIndex {
        ModIndex {
            mod_id: mod_id.to_string(),
            root: PathBuf::from(format!("/staging/{mod_id}")),
            files: paths
                .iter()
                .map(|path| IndexedFile {
                    key: path.to_string(),
                    relative_path: path.to_string(),
                })
                .collect(),
        }
    }

    fn indices(list: Vec<ModIndex>) -> HashMap<String, ModIndex> {
        list.into_iter()
            .map(|index| (index.mod_id.clone(), index))
            .collect()
    }

    fn profile(entries: &[(&str, bool)]) -> Profile {
        let mut profile = Profile::new("Test");
        for (id, enabled) in entries {
            profile.set_enabled(id, *enabled);
        }
        profile
    }

    #[test]
    fn later_load_order_wins() {
        let indices = indices(vec![index("a", &["x/y.dat"]), index("b", &["x/y.dat"])]);
        let resolution = resolve(&profile(&[("a", true), ("b", true)]), &indices);

        assert_eq!(resolution.winning_paths["x/y.dat"].mod_id, "b");
        assert_eq!(
            resolution.winning_paths["x/y.dat"].source,
            PathBuf::from("/staging/b/x/y.dat")
        );
        assert_eq!(
            resolution.conflicts,
            vec![Conflict {
                path: "x/y.dat".to_string(),
                contenders: vec!["a".to_string(), "b".to_string()],
                winner: "b".to_string(),
            }]
        );
    }

    #[test]
    fn disabling_the_winner_falls_back_to_next_contender() {
        let indices = indices(vec![
            index("a", &["shared.bin"]),
            index("b", &["shared.bin"]),
            index("c", &["shared.bin"]),
        ]);
        let resolution = resolve(&profile(&[("a", true), ("b", true), ("c", false)]), &indices);
        assert_eq!(resolution.winning_paths["shared.bin"].mod_id, "b");
        assert_eq!(resolution.conflicts[0].winner, "b");
        assert_eq!(resolution.conflicts[0].contenders, vec!["a", "b"]);

        let resolution = resolve(&profile(&[("a", true), ("b", false), ("c", false)]), &indices);
        assert_eq!(resolution.winning_paths["shared.bin"].mod_id, "a");
        assert!(!resolution.has_conflicts());
    }

    #[test]
    fn resolution_is_deterministic() {
        let indices = indices(vec![
            index("a", &["z.bin", "m.bin", "a.bin"]),
            index("b", &["m.bin", "q.bin"]),
            index("c", &["a.bin", "m.bin"]),
        ]);
        let profile = profile(&[("c", true), ("a", true), ("b", true)]);

        let first = resolve(&profile, &indices);
        let second = resolve(&profile, &indices);
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        let paths: Vec<&str> = first.conflicts.iter().map(|c| c.path.as_str()).collect();
        assert_eq!(paths, vec!["a.bin", "m.bin"]);
        assert_eq!(first.conflicts[1].contenders, vec!["c", "a", "b"]);
    }

    #[test]
    fn dangling_entries_are_skipped_not_fatal() {
        let indices = indices(vec![index("a", &["one.bin"])]);
        let resolution = resolve(&profile(&[("ghost", true), ("a", true)]), &indices);
        assert_eq!(resolution.missing_mods, vec!["ghost"]);
        assert_eq!(resolution.winning_paths.len(), 1);
    }

    #[test]
    fn duplicate_entries_count_once() {
        let indices = indices(vec![index("a", &["one.bin"]), index("b", &["one.bin"])]);
        let mut profile = profile(&[("a", true), ("b", true)]);
        profile.order.push(crate::library::ProfileEntry {
            id: "a".to_string(),
            enabled: true,
        });
        let resolution = resolve(&profile, &indices);
        assert_eq!(resolution.winning_paths["one.bin"].mod_id, "b");
        assert_eq!(resolution.conflicts[0].contenders, vec!["a", "b"]);
    }

    #[test]
    fn conflicts_for_mod_and_overridden_counts() {
        let indices = indices(vec![
            index("a", &["1.bin", "2.bin"]),
            index("b", &["1.bin"]),
            index("c", &["2.bin", "3.bin"]),
        ]);
        let resolution = resolve(&profile(&[("a", true), ("b", true), ("c", true)]), &indices);
        assert_eq!(resolution.conflicts_for_mod("a").len(), 2);
        assert_eq!(resolution.conflicts_for_mod("b").len(), 1);
        assert_eq!(resolution.overridden_counts().get("a"), Some(&2));
        assert_eq!(resolution.overridden_counts().get("c"), None);
    }
}
