//! Materializes a resolved load order onto a target directory.
//!
//! A deploy diffs the winning paths against the previous manifest, applies
//! only the difference, and swaps in the new manifest once the batch is
//! done. Files that the manifest does not prove the engine owns are never
//! removed or overwritten.

use crate::{
    conflicts::Winner,
    error::{EngineError, PathError, PathFailure},
    library::Profile,
    lock,
    manifest::{
        join_relative, CopyStamp, DeployManifest, DeployedProfile, LinkKind, ManifestEntry,
        ManifestStore,
    },
    ownership::{self, DriftKind, DriftReport, Ownership, Removal},
    task::CancelToken,
};
use filetime::{set_file_mtime, FileTime};
use serde::Serialize;
use std::{
    cmp::Reverse,
    collections::{BTreeMap, BTreeSet, HashSet},
    fs, io,
    path::{Path, PathBuf},
};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct DeployOptions {
    pub mode: LinkKind,
    pub fallback_to_copy: bool,
    pub abort_on_first_error: bool,
    pub cancel: Option<CancelToken>,
}

impl Default for DeployOptions {
    fn default() -> Self {
        Self {
            mode: LinkKind::Symlink,
            fallback_to_copy: true,
            abort_on_first_error: false,
            cancel: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployPhase {
    Pending,
    Planning,
    Applying,
    Committed,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeployOutcome {
    Committed,
    RolledBack,
    Cancelled,
}

impl DeployOutcome {
    pub fn label(self) -> &'static str {
        match self {
            DeployOutcome::Committed => "committed",
            DeployOutcome::RolledBack => "rolled back",
            DeployOutcome::Cancelled => "cancelled",
        }
    }

    fn phase(self) -> DeployPhase {
        match self {
            DeployOutcome::Committed => DeployPhase::Committed,
            DeployOutcome::RolledBack => DeployPhase::RolledBack,
            DeployOutcome::Cancelled => DeployPhase::Cancelled,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlannedFile {
    pub key: String,
    pub mod_id: String,
    pub relative_path: String,
    pub source: PathBuf,
}

impl PlannedFile {
    fn new(key: &str, winner: &Winner) -> Self {
        Self {
            key: key.to_string(),
            mod_id: winner.mod_id.clone(),
            relative_path: winner.relative_path.clone(),
            source: winner.source.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DeployPlan {
    /// New, replaced and healed paths, in key order.
    pub to_create: Vec<PlannedFile>,
    /// Recorded paths to delete, including the old side of replacements.
    pub to_remove: Vec<String>,
    pub unchanged: Vec<String>,
    /// Recorded paths whose artifact vanished; dropped from the manifest.
    pub missing: Vec<String>,
    pub drift: Vec<DriftReport>,
    pub failures: Vec<PathFailure>,
}

impl DeployPlan {
    pub fn is_noop(&self) -> bool {
        self.to_create.is_empty() && self.to_remove.is_empty() && self.missing.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeploymentResult {
    pub outcome: DeployOutcome,
    pub created: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub fallbacks: usize,
    pub failures: Vec<PathFailure>,
    pub drift: Vec<DriftReport>,
    /// The manifest as it stands on disk after the operation.
    pub manifest: DeployManifest,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub owned: usize,
    pub drift: Vec<DriftReport>,
    pub failures: Vec<PathFailure>,
}

impl VerifyReport {
    pub fn is_clean(&self) -> bool {
        self.drift.is_empty() && self.failures.is_empty()
    }
}

#[tracing::instrument(
    skip_all,
    fields(target = ?target_root, profile = %profile.name, mode = options.mode.label())
)]
pub fn deploy(
    store: &ManifestStore,
    target_root: &Path,
    winning_paths: &BTreeMap<String, Winner>,
    staging_roots: &BTreeMap<String, PathBuf>,
    profile: &Profile,
    options: &DeployOptions,
) -> Result<DeploymentResult, EngineError> {
    enter(DeployPhase::Pending);
    check_target(target_root)?;
    let _guard = lock::acquire(store, target_root)?;
    let previous = store.load(target_root).map_err(EngineError::manifest)?;

    enter(DeployPhase::Planning);
    let plan = plan(target_root, &previous, winning_paths, options);
    info!(
        create = plan.to_create.len(),
        remove = plan.to_remove.len(),
        unchanged = plan.unchanged.len(),
        missing = plan.missing.len(),
        "planned deploy"
    );

    enter(DeployPhase::Applying);
    let mut roots = previous.staging_roots.clone();
    roots.extend(
        staging_roots
            .iter()
            .map(|(mod_id, root)| (mod_id.clone(), root.clone())),
    );
    let mut run = Applier::new(target_root, options, roots);
    run.failures.extend(plan.failures.iter().cloned());
    run.drift.extend(plan.drift.iter().cloned());

    let outcome = match run.apply(&previous, &plan) {
        ApplyStatus::Completed => DeployOutcome::Committed,
        ApplyStatus::Cancelled => DeployOutcome::Cancelled,
        ApplyStatus::Aborted => DeployOutcome::RolledBack,
    };

    let manifest = match outcome {
        DeployOutcome::RolledBack => {
            run.rollback();
            previous
        }
        DeployOutcome::Committed => {
            run.discard_set_aside();
            let mut manifest = run.next_manifest(&previous, &plan);
            manifest.profile = Some(DeployedProfile {
                id: profile.id.clone(),
                name: profile.name.clone(),
            });
            manifest.mode = Some(options.mode);
            manifest.deployed_at = now_rfc3339();
            store.save(&manifest).map_err(EngineError::manifest)?;
            manifest
        }
        DeployOutcome::Cancelled => {
            run.discard_set_aside();
            let manifest = run.next_manifest(&previous, &plan);
            store.save(&manifest).map_err(EngineError::manifest)?;
            manifest
        }
    };
    enter(outcome.phase());

    let result = DeploymentResult {
        outcome,
        created: run.created_count(),
        removed: run.removed_count(),
        unchanged: plan.unchanged.len(),
        fallbacks: run.fallbacks,
        failures: run.failures,
        drift: run.drift,
        manifest,
    };
    info!(
        outcome = result.outcome.label(),
        created = result.created,
        removed = result.removed,
        unchanged = result.unchanged,
        fallbacks = result.fallbacks,
        failures = result.failures.len(),
        drift = result.drift.len(),
        "deploy finished"
    );
    Ok(result)
}

/// Diffs the wanted state against what the previous manifest recorded and
/// what is actually on disk. Touches nothing.
pub fn plan(
    target_root: &Path,
    previous: &DeployManifest,
    winning_paths: &BTreeMap<String, Winner>,
    options: &DeployOptions,
) -> DeployPlan {
    let mut plan = DeployPlan::default();

    for (key, entry) in &previous.entries {
        let dest = entry.dest(target_root);
        let ownership = match ownership::check(&dest, entry, &previous.staging_roots) {
            Ok(ownership) => ownership,
            Err(err) => {
                error!(path = %key, error = %err, "cannot inspect deployed file");
                plan.failures
                    .push(PathFailure::new(key.clone(), PathError::io("inspect", &err)));
                continue;
            }
        };
        let wanted = winning_paths.get(key);
        match ownership {
            Ownership::Owned => match wanted {
                Some(winner) if is_current(entry, winner, options) => {
                    plan.unchanged.push(key.clone());
                }
                Some(winner) => {
                    plan.to_remove.push(key.clone());
                    plan.to_create.push(PlannedFile::new(key, winner));
                }
                None => plan.to_remove.push(key.clone()),
            },
            Ownership::Missing => {
                warn!(path = %key, "deployed file is gone from the target");
                plan.missing.push(key.clone());
                plan.drift.push(DriftReport {
                    path: key.clone(),
                    kind: DriftKind::Missing,
                });
                if let Some(winner) = wanted {
                    plan.to_create.push(PlannedFile::new(key, winner));
                }
            }
            Ownership::Drifted(kind) => {
                warn!(path = %key, drift = kind.label(), "deployed file was changed externally, leaving it alone");
                plan.drift.push(DriftReport {
                    path: key.clone(),
                    kind,
                });
            }
        }
    }

    for (key, winner) in winning_paths {
        if !previous.entries.contains_key(key) {
            plan.to_create.push(PlannedFile::new(key, winner));
        }
    }
    plan.to_create.sort_by(|a, b| a.key.cmp(&b.key));
    plan
}

/// Read-only ownership check of everything the manifest records.
pub fn verify(store: &ManifestStore, target_root: &Path) -> Result<VerifyReport, EngineError> {
    let manifest = store.load(target_root).map_err(EngineError::manifest)?;
    let mut report = VerifyReport::default();
    for (key, entry) in &manifest.entries {
        match ownership::check(&entry.dest(target_root), entry, &manifest.staging_roots) {
            Ok(Ownership::Owned) => report.owned += 1,
            Ok(other) => {
                if let Some(kind) = other.drift() {
                    report.drift.push(DriftReport {
                        path: key.clone(),
                        kind,
                    });
                }
            }
            Err(err) => report
                .failures
                .push(PathFailure::new(key.clone(), PathError::io("inspect", &err))),
        }
    }
    Ok(report)
}

/// Preconditions shared by deploy and undeploy.
pub(crate) fn check_target(target_root: &Path) -> Result<(), EngineError> {
    let unavailable = |reason: String| EngineError::TargetUnavailable {
        path: target_root.to_path_buf(),
        reason,
    };
    let meta = match fs::metadata(target_root) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Err(unavailable("does not exist".to_string()))
        }
        Err(err) => return Err(unavailable(err.to_string())),
    };
    if !meta.is_dir() {
        return Err(unavailable("not a directory".to_string()));
    }
    if meta.permissions().readonly() {
        return Err(unavailable("read-only".to_string()));
    }
    Ok(())
}

/// Removes recorded directories that are empty, deepest first. Entries for
/// directories that no longer exist are dropped; non-empty ones are kept.
/// Returns the directories actually removed from disk.
pub(crate) fn prune_directories(
    target_root: &Path,
    directories: &mut BTreeSet<String>,
) -> Vec<String> {
    let mut removed = Vec::new();
    let mut ordered: Vec<String> = directories.iter().cloned().collect();
    ordered.sort_by_key(|rel| Reverse(rel.split('/').count()));
    for rel in ordered {
        let dir = join_relative(target_root, &rel);
        match fs::symlink_metadata(&dir) {
            Ok(meta) if meta.is_dir() => {
                let empty = fs::read_dir(&dir)
                    .map(|mut entries| entries.next().is_none())
                    .unwrap_or(false);
                if !empty {
                    continue;
                }
                match fs::remove_dir(&dir) {
                    Ok(()) => {
                        debug!(dir = %rel, "removed directory");
                        directories.remove(&rel);
                        removed.push(rel);
                    }
                    Err(err) => warn!(dir = %rel, error = %err, "failed to remove directory"),
                }
            }
            Ok(_) => {
                warn!(dir = %rel, "recorded directory was replaced, forgetting it");
                directories.remove(&rel);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                directories.remove(&rel);
            }
            Err(err) => warn!(dir = %rel, error = %err, "cannot inspect directory"),
        }
    }
    removed
}

fn enter(phase: DeployPhase) {
    info!(?phase, "deploy phase");
}

fn is_current(entry: &ManifestEntry, winner: &Winner, options: &DeployOptions) -> bool {
    if entry.source_mod_id != winner.mod_id || entry.source != winner.source {
        return false;
    }
    let kind_matches = entry.link_kind == options.mode
        || (entry.fell_back && options.mode == LinkKind::Symlink && options.fallback_to_copy);
    if !kind_matches {
        return false;
    }
    match (&entry.link_kind, &entry.copy) {
        (LinkKind::Copy, Some(stamp)) => !copy_is_stale(&entry.source, stamp),
        _ => true,
    }
}

fn copy_is_stale(source: &Path, stamp: &CopyStamp) -> bool {
    match fs::metadata(source) {
        Ok(meta) => meta.len() != stamp.source_size || modified_secs(&meta) != stamp.source_modified,
        Err(_) => true,
    }
}

fn modified_secs(meta: &fs::Metadata) -> Option<i64> {
    Some(FileTime::from_last_modification_time(meta).unix_seconds())
}

fn now_rfc3339() -> Option<String> {
    OffsetDateTime::now_utc().format(&Rfc3339).ok()
}

enum Step {
    /// `aside` holds the artifact when it was moved instead of deleted.
    Removed {
        key: String,
        entry: ManifestEntry,
        aside: Option<PathBuf>,
    },
    Created {
        key: String,
        entry: ManifestEntry,
        adopted: bool,
    },
    Directory(String),
    /// A recorded directory emptied by this run's removals and deleted.
    Pruned(String),
}

enum ApplyStatus {
    Completed,
    Cancelled,
    Aborted,
}

struct Applier<'a> {
    target_root: &'a Path,
    options: &'a DeployOptions,
    staging_roots: BTreeMap<String, PathBuf>,
    steps: Vec<Step>,
    /// Holds removed artifacts until the run is final, in abort mode only.
    aside_dir: Option<PathBuf>,
    /// Keys found already absent while removing them.
    vanished: Vec<String>,
    failures: Vec<PathFailure>,
    drift: Vec<DriftReport>,
    fallbacks: usize,
}

impl<'a> Applier<'a> {
    fn new(
        target_root: &'a Path,
        options: &'a DeployOptions,
        staging_roots: BTreeMap<String, PathBuf>,
    ) -> Self {
        Self {
            target_root,
            options,
            staging_roots,
            steps: Vec::new(),
            aside_dir: None,
            vanished: Vec::new(),
            failures: Vec::new(),
            drift: Vec::new(),
            fallbacks: 0,
        }
    }

    fn cancelled(&self) -> bool {
        self.options
            .cancel
            .as_ref()
            .is_some_and(CancelToken::is_cancelled)
    }

    fn fail(&mut self, key: &str, error: PathError) {
        error!(path = %key, error = %error, "deploy step failed");
        self.failures.push(PathFailure::new(key, error));
    }

    fn apply(&mut self, previous: &DeployManifest, plan: &DeployPlan) -> ApplyStatus {
        let mut blocked = HashSet::new();

        for key in &plan.to_remove {
            if self.cancelled() {
                warn!("deploy cancelled during removals");
                return ApplyStatus::Cancelled;
            }
            let Some(entry) = previous.entries.get(key) else {
                continue;
            };
            let dest = entry.dest(self.target_root);
            let taken = if self.options.abort_on_first_error {
                self.next_aside_path().and_then(|aside| {
                    ownership::set_aside_owned(&dest, entry, &previous.staging_roots, &aside)
                        .map(|removal| (removal, Some(aside)))
                })
            } else {
                ownership::remove_owned(&dest, entry, &previous.staging_roots)
                    .map(|removal| (removal, None))
            };
            match taken {
                Ok((Removal::Removed, aside)) => {
                    debug!(path = %key, "removed");
                    self.steps.push(Step::Removed {
                        key: key.clone(),
                        entry: entry.clone(),
                        aside,
                    });
                }
                Ok((Removal::AlreadyAbsent, _)) => {
                    self.vanished.push(key.clone());
                    self.drift.push(DriftReport {
                        path: key.clone(),
                        kind: DriftKind::Missing,
                    });
                }
                Ok((Removal::Refused(kind), _)) => {
                    warn!(path = %key, drift = kind.label(), "refusing to remove changed file");
                    self.drift.push(DriftReport {
                        path: key.clone(),
                        kind,
                    });
                    blocked.insert(key.clone());
                }
                Err(err) => {
                    self.fail(key, PathError::io("remove", &err));
                    blocked.insert(key.clone());
                    if self.options.abort_on_first_error {
                        return ApplyStatus::Aborted;
                    }
                }
            }
        }

        let mut directories = previous.directories.clone();
        for rel in prune_directories(self.target_root, &mut directories) {
            self.steps.push(Step::Pruned(rel));
        }

        for planned in &plan.to_create {
            if self.cancelled() {
                warn!("deploy cancelled during creations");
                return ApplyStatus::Cancelled;
            }
            if blocked.contains(&planned.key) {
                continue;
            }
            if let Err(error) = self.create(planned) {
                self.fail(&planned.key, error);
                if self.options.abort_on_first_error {
                    return ApplyStatus::Aborted;
                }
            }
        }
        ApplyStatus::Completed
    }

    fn create(&mut self, planned: &PlannedFile) -> Result<(), PathError> {
        let dest = join_relative(self.target_root, &planned.relative_path);
        self.ensure_parents(&planned.relative_path)?;

        match fs::symlink_metadata(&dest) {
            Ok(meta) => {
                let points_at_source = meta.file_type().is_symlink()
                    && fs::read_link(&dest).is_ok_and(|link| link == planned.source);
                if points_at_source && self.options.mode == LinkKind::Symlink {
                    info!(path = %planned.key, "adopting existing link to the staged file");
                    self.record_created(planned, LinkKind::Symlink, false, None, true);
                    return Ok(());
                }
                return Err(PathError::VanillaCollision);
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(PathError::io("inspect", &err)),
        }

        let source_meta = match fs::metadata(&planned.source) {
            Ok(meta) => meta,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(PathError::SourceMissing)
            }
            Err(err) => return Err(PathError::io("read source", &err)),
        };

        match self.options.mode {
            LinkKind::Symlink => match link_file(&planned.source, &dest) {
                Ok(()) => {
                    debug!(path = %planned.key, "linked");
                    self.record_created(planned, LinkKind::Symlink, false, None, false);
                }
                Err(err) if self.options.fallback_to_copy => {
                    warn!(path = %planned.key, error = %err, "symlink failed, falling back to copy");
                    let stamp = copy_file(&planned.source, &source_meta, &dest)
                        .map_err(|err| PathError::io("copy", &err))?;
                    self.fallbacks += 1;
                    self.record_created(planned, LinkKind::Copy, true, Some(stamp), false);
                }
                Err(err) => {
                    return Err(PathError::CrossFilesystemLink {
                        reason: err.to_string(),
                    })
                }
            },
            LinkKind::Copy => {
                let stamp = copy_file(&planned.source, &source_meta, &dest)
                    .map_err(|err| PathError::io("copy", &err))?;
                debug!(path = %planned.key, "copied");
                self.record_created(planned, LinkKind::Copy, false, Some(stamp), false);
            }
        }
        Ok(())
    }

    fn ensure_parents(&mut self, relative_path: &str) -> Result<(), PathError> {
        let parts: Vec<&str> = relative_path
            .split('/')
            .filter(|part| !part.is_empty())
            .collect();
        let mut dir = self.target_root.to_path_buf();
        let mut rel = String::new();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            dir.push(part);
            if !rel.is_empty() {
                rel.push('/');
            }
            rel.push_str(part);
            match fs::metadata(&dir) {
                Ok(meta) if meta.is_dir() => {}
                Ok(_) => {
                    return Err(PathError::Io {
                        op: "create directory",
                        reason: format!("{rel} exists and is not a directory"),
                    })
                }
                Err(err) if err.kind() == io::ErrorKind::NotFound => {
                    fs::create_dir(&dir).map_err(|err| PathError::io("create directory", &err))?;
                    debug!(dir = %rel, "created directory");
                    self.steps.push(Step::Directory(rel.clone()));
                }
                Err(err) => return Err(PathError::io("create directory", &err)),
            }
        }
        Ok(())
    }

    fn record_created(
        &mut self,
        planned: &PlannedFile,
        link_kind: LinkKind,
        fell_back: bool,
        copy: Option<CopyStamp>,
        adopted: bool,
    ) {
        self.steps.push(Step::Created {
            key: planned.key.clone(),
            entry: ManifestEntry {
                source_mod_id: planned.mod_id.clone(),
                link_kind,
                relative_path: planned.relative_path.clone(),
                source: planned.source.clone(),
                fell_back,
                copy,
            },
            adopted,
        });
    }

    /// Reverses this run's steps, newest first. Best effort: anything that
    /// cannot be undone is reported as a failure.
    fn rollback(&mut self) {
        warn!(steps = self.steps.len(), "rolling back deploy");
        for step in std::mem::take(&mut self.steps).into_iter().rev() {
            match step {
                Step::Created {
                    key,
                    entry,
                    adopted,
                } => {
                    if adopted {
                        continue;
                    }
                    let dest = entry.dest(self.target_root);
                    match ownership::remove_owned(&dest, &entry, &self.staging_roots) {
                        Ok(Removal::Removed | Removal::AlreadyAbsent) => {}
                        Ok(Removal::Refused(kind)) => {
                            self.drift.push(DriftReport { path: key, kind });
                        }
                        Err(err) => self.fail(&key, PathError::io("roll back create", &err)),
                    }
                }
                Step::Removed { key, entry, aside } => {
                    let Some(aside) = aside else {
                        self.fail(
                            &key,
                            PathError::Io {
                                op: "roll back remove",
                                reason: "removed file was not kept".to_string(),
                            },
                        );
                        continue;
                    };
                    if let Err(err) = fs::rename(&aside, entry.dest(self.target_root)) {
                        self.fail(&key, PathError::io("roll back remove", &err));
                    }
                }
                Step::Directory(rel) => {
                    let dir = join_relative(self.target_root, &rel);
                    if let Err(err) = fs::remove_dir(&dir) {
                        let occupied =
                            fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_some());
                        if err.kind() != io::ErrorKind::NotFound && !occupied {
                            warn!(dir = %rel, error = %err, "failed to remove directory");
                        }
                    }
                }
                Step::Pruned(rel) => {
                    if let Err(err) = fs::create_dir_all(join_relative(self.target_root, &rel)) {
                        self.fail(&rel, PathError::io("roll back directory", &err));
                    }
                }
            }
        }
        self.remove_aside_dir();
    }

    /// A fresh slot in the rollback directory, created on first use.
    fn next_aside_path(&mut self) -> io::Result<PathBuf> {
        let dir = match &self.aside_dir {
            Some(dir) => dir.clone(),
            None => {
                let dir = create_aside_dir(self.target_root)?;
                self.aside_dir = Some(dir.clone());
                dir
            }
        };
        Ok(dir.join(self.steps.len().to_string()))
    }

    /// Deletes the artifacts kept for a rollback that is no longer needed.
    fn discard_set_aside(&mut self) {
        for step in &self.steps {
            if let Step::Removed {
                key,
                aside: Some(aside),
                ..
            } = step
            {
                if let Err(err) = fs::remove_file(aside) {
                    warn!(path = %key, error = %err, "failed to discard replaced file");
                }
            }
        }
        self.remove_aside_dir();
    }

    fn remove_aside_dir(&mut self) {
        if let Some(dir) = self.aside_dir.take() {
            if let Err(err) = fs::remove_dir(&dir) {
                warn!(dir = ?dir, error = %err, "failed to remove rollback directory");
            }
        }
    }

    /// Previous entries updated with exactly the steps that completed.
    fn next_manifest(&self, previous: &DeployManifest, plan: &DeployPlan) -> DeployManifest {
        let mut manifest = previous.clone();
        for key in plan.missing.iter().chain(&self.vanished) {
            manifest.entries.remove(key);
        }
        for step in &self.steps {
            match step {
                Step::Removed { key, .. } => {
                    manifest.entries.remove(key);
                }
                Step::Created { key, entry, .. } => {
                    if let Some(root) = self.staging_roots.get(&entry.source_mod_id) {
                        manifest
                            .staging_roots
                            .insert(entry.source_mod_id.clone(), root.clone());
                    }
                    manifest.entries.insert(key.clone(), entry.clone());
                }
                Step::Directory(rel) => {
                    manifest.directories.insert(rel.clone());
                }
                Step::Pruned(rel) => {
                    manifest.directories.remove(rel);
                }
            }
        }
        prune_directories(self.target_root, &mut manifest.directories);
        manifest.prune_staging_roots();
        manifest
    }

    fn created_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, Step::Created { .. }))
            .count()
    }

    fn removed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| matches!(step, Step::Removed { .. }))
            .count()
    }
}

/// `.stagehand-rollback-<pid>` under the target root, so set-aside renames
/// stay on the target's filesystem.
fn create_aside_dir(target_root: &Path) -> io::Result<PathBuf> {
    let base = format!(".stagehand-rollback-{}", std::process::id());
    for attempt in 0..100 {
        let name = if attempt == 0 {
            base.clone()
        } else {
            format!("{base}-{attempt}")
        };
        let dir = target_root.join(name);
        match fs::create_dir(&dir) {
            Ok(()) => return Ok(dir),
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => continue,
            Err(err) => return Err(err),
        }
    }
    Err(io::Error::new(
        io::ErrorKind::AlreadyExists,
        "no free rollback directory under the target",
    ))
}

#[cfg(test)]
thread_local! {
    static REFUSE_SYMLINKS: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
fn symlinks_refused() -> bool {
    REFUSE_SYMLINKS.with(std::cell::Cell::get)
}

#[cfg(not(test))]
fn symlinks_refused() -> bool {
    false
}

fn link_file(source: &Path, dest: &Path) -> io::Result<()> {
    if symlinks_refused() {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "symlinks refused on this thread",
        ));
    }
    create_symlink(source, dest)
}

/// Copies bytes and permissions, keeps the source mtime, and stamps the
/// written file.
fn copy_file(source: &Path, source_meta: &fs::Metadata, dest: &Path) -> io::Result<CopyStamp> {
    let result = (|| -> io::Result<CopyStamp> {
        let size = fs::copy(source, dest)?;
        let modified = FileTime::from_last_modification_time(source_meta);
        set_file_mtime(dest, modified)?;
        Ok(CopyStamp {
            size,
            blake3: ownership::hash_file(dest)?,
            source_size: source_meta.len(),
            source_modified: Some(modified.unix_seconds()),
        })
    })();
    if result.is_err() {
        let _ = fs::remove_file(dest);
    }
    result
}

#[cfg(unix)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, dest)
}

#[cfg(windows)]
fn create_symlink(source: &Path, dest: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, dest)
}

#[cfg(not(any(unix, windows)))]
fn create_symlink(_source: &Path, _dest: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlink unavailable on this platform",
    ))
}
