use crate::{error::EngineError, manifest::ManifestStore};
use std::{
    collections::HashSet,
    fs,
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Mutex, OnceLock},
};
use tracing::{debug, warn};

fn active_targets() -> &'static Mutex<HashSet<PathBuf>> {
    static ACTIVE: OnceLock<Mutex<HashSet<PathBuf>>> = OnceLock::new();
    ACTIVE.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Held for the duration of one deploy or undeploy against a target root.
/// Dropping it releases both the in-process slot and the lock file.
#[derive(Debug)]
pub struct OperationGuard {
    key: PathBuf,
    lock_path: PathBuf,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.lock_path);
        let mut active = active_targets()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        active.remove(&self.key);
        debug!(target = ?self.key, "released operation lock");
    }
}

/// Claims the target root. Fails fast with `OperationInProgress` if another
/// thread of this process or another live process holds it.
pub fn acquire(store: &ManifestStore, target_root: &Path) -> Result<OperationGuard, EngineError> {
    let key = fs::canonicalize(target_root).unwrap_or_else(|_| target_root.to_path_buf());
    {
        let mut active = active_targets()
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !active.insert(key.clone()) {
            return Err(EngineError::OperationInProgress {
                target: target_root.to_path_buf(),
            });
        }
    }

    let lock_path = store.lock_path(target_root);
    match create_lock_file(&lock_path) {
        Ok(()) => {
            debug!(target = ?key, "acquired operation lock");
            Ok(OperationGuard { key, lock_path })
        }
        Err(err) => {
            let mut active = active_targets()
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            active.remove(&key);
            if err.kind() == io::ErrorKind::AlreadyExists {
                Err(EngineError::OperationInProgress {
                    target: target_root.to_path_buf(),
                })
            } else {
                Err(EngineError::Io(err))
            }
        }
    }
}

/// Removes a lock file regardless of who holds it. Returns whether one existed.
pub fn force_unlock(store: &ManifestStore, target_root: &Path) -> io::Result<bool> {
    match fs::remove_file(store.lock_path(target_root)) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err),
    }
}

fn create_lock_file(lock_path: &Path) -> io::Result<()> {
    if let Some(parent) = lock_path.parent() {
        fs::create_dir_all(parent)?;
    }
    match write_new_lock(lock_path) {
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists && is_stale(lock_path) => {
            warn!(lock = ?lock_path, "reclaiming lock left by a dead process");
            fs::remove_file(lock_path)?;
            write_new_lock(lock_path)
        }
        other => other,
    }
}

fn write_new_lock(lock_path: &Path) -> io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(lock_path)?;
    writeln!(file, "{}", std::process::id())
}

#[cfg(target_os = "linux")]
fn is_stale(lock_path: &Path) -> bool {
    let Ok(raw) = fs::read_to_string(lock_path) else {
        return false;
    };
    let Ok(pid) = raw.trim().parse::<u32>() else {
        return false;
    };
    pid != std::process::id() && !Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(target_os = "linux"))]
fn is_stale(_lock_path: &Path) -> bool {
    false
}
