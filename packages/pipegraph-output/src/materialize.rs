//! Symlink materialization with a never-clobber conflict policy
//!
//! | destination                         | result                               |
//! |-------------------------------------|--------------------------------------|
//! | missing                             | `Created` (or `DryRunReported`)      |
//! | symlink to the source               | `AlreadyCorrect`                     |
//! | symlink elsewhere, `force_overwrite`| relinked, `Created`                  |
//! | symlink elsewhere                   | `SkippedConflict`                    |
//! | regular file, directory, ...        | `SkippedConflict`, always            |
//!
//! The check-then-act sequence is not atomic against other processes; a
//! racing writer shows up as a `SkippedConflict` or an IO error.

use pipegraph_storage::{File, ProvenanceGraph};
use serde::Serialize;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{OutputError, Result};
use crate::identity::{FileIdentityResolver, Indirection};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaterializeOptions {
    pub dry_run: bool,
    pub force_overwrite: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Outcome {
    Created,
    AlreadyCorrect,
    SkippedConflict { reason: String },
    DryRunReported,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Created => "created",
            Outcome::AlreadyCorrect => "already_correct",
            Outcome::SkippedConflict { .. } => "skipped_conflict",
            Outcome::DryRunReported => "dry_run_reported",
        }
    }

    /// Reported error for a conflict
    pub fn conflict(&self, destination: &Path) -> Option<OutputError> {
        match self {
            Outcome::SkippedConflict { reason } => Some(OutputError::SkippedConflict {
                destination: destination.to_path_buf(),
                reason: reason.clone(),
            }),
            _ => None,
        }
    }
}

/// One materialized (or reported) link
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Materialized {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub outcome: Outcome,
}

pub struct Materializer<'g> {
    identity: FileIdentityResolver<'g>,
    options: MaterializeOptions,
    /// Serializes directory creation when units run in parallel
    dir_lock: Mutex<()>,
}

impl<'g> Materializer<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph, options: MaterializeOptions) -> Self {
        Self {
            identity: FileIdentityResolver::new(graph),
            options,
            dir_lock: Mutex::new(()),
        }
    }

    pub fn options(&self) -> MaterializeOptions {
        self.options
    }

    /// Link `destination` to the physical file behind `file`
    pub fn materialize(&self, file: &File, destination: &Path) -> Result<Materialized> {
        let source = self.identity.resolve(file, Indirection::Terminal)?.path;
        let outcome = self.apply(file, &source, destination)?;

        match &outcome {
            Outcome::SkippedConflict { reason } => {
                warn!("Skipped {}: {}", destination.display(), reason)
            }
            Outcome::DryRunReported => {
                info!("would link {} -> {}", destination.display(), source.display())
            }
            other => debug!("{} {} -> {}", other.as_str(), destination.display(), source.display()),
        }

        Ok(Materialized {
            source,
            destination: destination.to_path_buf(),
            outcome,
        })
    }

    fn apply(&self, file: &File, source: &Path, destination: &Path) -> Result<Outcome> {
        let meta = match fs::symlink_metadata(destination) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.options.dry_run {
                    return Ok(Outcome::DryRunReported);
                }
                self.create_parent(destination)?;
                create_symlink(source, destination)?;
                return Ok(Outcome::Created);
            }
            Err(e) => return Err(e.into()),
        };

        if !meta.file_type().is_symlink() {
            let what = if meta.is_dir() { "a directory" } else { "a regular file" };
            return Ok(Outcome::SkippedConflict {
                reason: format!("{} exists at the destination", what),
            });
        }

        let target = fs::read_link(destination)?;
        if points_at(destination, &target, source) || points_at(destination, &target, &file.path) {
            return Ok(Outcome::AlreadyCorrect);
        }

        if !self.options.force_overwrite {
            return Ok(Outcome::SkippedConflict {
                reason: format!("existing symlink points to {}", target.display()),
            });
        }
        if self.options.dry_run {
            return Ok(Outcome::DryRunReported);
        }

        fs::remove_file(destination)?;
        create_symlink(source, destination)?;
        Ok(Outcome::Created)
    }

    fn create_parent(&self, destination: &Path) -> io::Result<()> {
        let Some(parent) = destination.parent() else {
            return Ok(());
        };
        let _guard = self.dir_lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        fs::create_dir_all(parent)
    }
}

/// Whether link `target` (as read from `link`) refers to `expected`
fn points_at(link: &Path, target: &Path, expected: &Path) -> bool {
    if target == expected {
        return true;
    }
    let joined = match link.parent() {
        Some(dir) if target.is_relative() => dir.join(target),
        _ => target.to_path_buf(),
    };
    if normalize(&joined) == normalize(expected) {
        return true;
    }
    // Symlinked parent directories only line up after canonicalization
    match (fs::canonicalize(&joined), fs::canonicalize(expected)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Lexical cleanup: drops `.` and folds `..` into the preceding segment
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => match out.components().next_back() {
                Some(Component::Normal(_)) => {
                    out.pop();
                }
                Some(Component::RootDir) | Some(Component::Prefix(_)) => {}
                _ => out.push(component),
            },
            other => out.push(other),
        }
    }
    out
}

#[cfg(unix)]
fn create_symlink(source: &Path, destination: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(source, destination)
}

#[cfg(windows)]
fn create_symlink(source: &Path, destination: &Path) -> io::Result<()> {
    std::os::windows::fs::symlink_file(source, destination)
}
