use crate::{error::IndexError, library::StagedMod};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashSet,
    fs, io,
    path::{Component, Path, PathBuf},
};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// How relative paths are compared when deciding whether two mods touch the
/// same file. Should match the target filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathCase {
    #[default]
    Sensitive,
    Insensitive,
}

impl PathCase {
    pub fn label(self) -> &'static str {
        match self {
            PathCase::Sensitive => "sensitive",
            PathCase::Insensitive => "insensitive",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "sensitive" => Some(PathCase::Sensitive),
            "insensitive" => Some(PathCase::Insensitive),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedFile {
    /// Comparison key: `/`-separated, case-folded under `PathCase::Insensitive`.
    pub key: String,
    /// Path inside the mod root, `/`-separated, original case.
    pub relative_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModIndex {
    pub mod_id: String,
    pub root: PathBuf,
    pub files: Vec<IndexedFile>,
}

impl ModIndex {
    pub fn empty(staged: &StagedMod) -> Self {
        Self {
            mod_id: staged.id.clone(),
            root: staged.root.clone(),
            files: Vec::new(),
        }
    }

    pub fn source_path(&self, file: &IndexedFile) -> PathBuf {
        crate::manifest::join_relative(&self.root, &file.relative_path)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

pub fn index_mod(staged: &StagedMod, case: PathCase) -> Result<ModIndex, IndexError> {
    let files = index_root(&staged.root, case)?;
    debug!(mod_id = %staged.id, files = files.len(), "indexed mod");
    Ok(ModIndex {
        mod_id: staged.id.clone(),
        root: staged.root.clone(),
        files,
    })
}

/// Walks `root` and returns every file below it, sorted by key.
///
/// Symlinks inside the tree are followed; a link that would re-enter one of
/// its own ancestors is skipped, so each link is traversed at most once.
pub fn index_root(root: &Path, case: PathCase) -> Result<Vec<IndexedFile>, IndexError> {
    let meta = match fs::metadata(root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(IndexError::Missing(root.to_path_buf()))
        }
        Err(err) => {
            return Err(IndexError::Unreadable {
                path: root.to_path_buf(),
                source: err,
            })
        }
    };
    if !meta.is_dir() {
        return Err(IndexError::NotADirectory(root.to_path_buf()));
    }
    if let Err(err) = fs::read_dir(root) {
        return Err(IndexError::Unreadable {
            path: root.to_path_buf(),
            source: err,
        });
    }

    let mut files = Vec::new();
    for entry in WalkDir::new(root).follow_links(true).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                if err.loop_ancestor().is_some() {
                    warn!(root = ?root, path = ?err.path(), "skipping symlink loop in mod");
                } else {
                    warn!(root = ?root, error = %err, "skipping unreadable mod entry");
                }
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        let Some(relative_path) = normalize_relative(rel) else {
            warn!(path = ?entry.path(), "skipping file with unrepresentable path");
            continue;
        };
        let key = fold_key(&relative_path, case);
        files.push(IndexedFile { key, relative_path });
    }

    files.sort_by(|a, b| {
        a.key
            .cmp(&b.key)
            .then_with(|| a.relative_path.cmp(&b.relative_path))
    });
    let mut seen = HashSet::new();
    files.retain(|file| {
        if seen.insert(file.key.clone()) {
            return true;
        }
        warn!(
            root = ?root,
            path = %file.relative_path,
            "file collides with another file of the same mod under case-insensitive paths"
        );
        false
    });
    Ok(files)
}

/// `/`-joined normal components. `None` for paths that escape the root or
/// are not valid UTF-8.
pub fn normalize_relative(rel: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?),
            Component::CurDir => {}
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

pub fn fold_key(relative_path: &str, case: PathCase) -> String {
    match case {
        PathCase::Sensitive => relative_path.to_string(),
        PathCase::Insensitive => relative_path.to_lowercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, rel.as_bytes()).unwrap();
    }

    #[test]
    fn lists_files_sorted_and_excludes_directories() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "nativePC/tex/b.tex");
        write(dir.path(), "nativePC/tex/a.tex");
        write(dir.path(), "readme.txt");
        fs::create_dir_all(dir.path().join("empty/dir")).unwrap();

        let files = index_root(dir.path(), PathCase::Sensitive).unwrap();
        let keys: Vec<&str> = files.iter().map(|file| file.key.as_str()).collect();
        assert_eq!(
            keys,
            vec!["nativePC/tex/a.tex", "nativePC/tex/b.tex", "readme.txt"]
        );
    }

    #[test]
    fn insensitive_case_folds_keys_but_keeps_relative_path() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "NativePC/Tex/A.tex");

        let files = index_root(dir.path(), PathCase::Insensitive).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "nativepc/tex/a.tex");
        assert_eq!(files[0].relative_path, "NativePC/Tex/A.tex");
    }

    #[test]
    fn missing_root_is_an_index_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let err = index_root(&dir.path().join("gone"), PathCase::Sensitive).unwrap_err();
        assert!(matches!(err, IndexError::Missing(_)));
    }

    #[test]
    fn file_root_is_an_index_error() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "file.bin");
        let err = index_root(&dir.path().join("file.bin"), PathCase::Sensitive).unwrap_err();
        assert!(matches!(err, IndexError::NotADirectory(_)));
    }

    #[cfg(unix)]
    #[test]
    fn symlink_cycles_are_walked_once() {
        let dir = tempfile::TempDir::new().unwrap();
        write(dir.path(), "data/file.bin");
        std::os::unix::fs::symlink(dir.path(), dir.path().join("data/loop")).unwrap();

        let files = index_root(dir.path(), PathCase::Sensitive).unwrap();
        let keys: Vec<&str> = files.iter().map(|file| file.key.as_str()).collect();
        assert_eq!(keys, vec!["data/file.bin"]);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_directories_inside_the_mod_are_followed() {
        let dir = tempfile::TempDir::new().unwrap();
        let outside = tempfile::TempDir::new().unwrap();
        write(outside.path(), "shared.bin");
        std::os::unix::fs::symlink(outside.path(), dir.path().join("linked")).unwrap();

        let files = index_root(dir.path(), PathCase::Sensitive).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].key, "linked/shared.bin");
    }

    #[test]
    fn normalize_rejects_parent_components() {
        assert_eq!(normalize_relative(Path::new("../x")), None);
        assert_eq!(
            normalize_relative(Path::new("./a/b.txt")),
            Some("a/b.txt".to_string())
        );
    }
}
