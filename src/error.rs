use serde::Serialize;
use std::{io, path::PathBuf};
use thiserror::Error;

/// Whole-operation failures. Anything returned as `Err` here aborted before
/// a single target path was touched.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("target directory unavailable: {path:?} ({reason})")]
    TargetUnavailable { path: PathBuf, reason: String },
    #[error("another deploy or undeploy is already running for {target:?}")]
    OperationInProgress { target: PathBuf },
    #[error("profile not found: {0}")]
    ProfileMissing(String),
    #[error("deployment manifest: {0}")]
    Manifest(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl EngineError {
    pub(crate) fn manifest(err: anyhow::Error) -> Self {
        EngineError::Manifest(format!("{err:#}"))
    }
}

/// A mod root that could not be indexed. The mod contributes no files.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("mod root not found: {0:?}")]
    Missing(PathBuf),
    #[error("mod root is not a directory: {0:?}")]
    NotADirectory(PathBuf),
    #[error("mod root unreadable: {path:?}: {source}")]
    Unreadable {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Failure of a single target path inside a deploy or undeploy batch.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathError {
    #[error("untracked file already exists at the target path")]
    VanillaCollision,
    #[error("symlink not supported between staging and target: {reason}")]
    CrossFilesystemLink { reason: String },
    #[error("staged source file is missing")]
    SourceMissing,
    #[error("{op} failed: {reason}")]
    Io { op: &'static str, reason: String },
}

impl PathError {
    pub(crate) fn io(op: &'static str, err: &io::Error) -> Self {
        PathError::Io {
            op,
            reason: err.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            PathError::VanillaCollision => "vanilla_collision",
            PathError::CrossFilesystemLink { .. } => "cross_filesystem_link",
            PathError::SourceMissing => "source_missing",
            PathError::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PathFailure {
    pub path: String,
    pub error: PathError,
}

impl PathFailure {
    pub fn new(path: impl Into<String>, error: PathError) -> Self {
        Self {
            path: path.into(),
            error,
        }
    }
}

impl std::fmt::Display for PathFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.path, self.error)
    }
}
