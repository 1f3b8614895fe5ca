use pipegraph_storage::{FileId, InstanceId, StorageError, UnitId};
use std::path::PathBuf;
use thiserror::Error;

use crate::config::ConfigError;

pub type Result<T> = std::result::Result<T, OutputError>;

#[derive(Error, Debug)]
pub enum OutputError {
    #[error("Configuration error: {0}")]
    ConfigValidation(#[from] ConfigError),

    #[error("Unit {unit}: input paths share no common ancestor directory ({})", join_paths(.inputs))]
    NoCommonAncestor { unit: UnitId, inputs: Vec<PathBuf> },

    #[error("Unit {unit}: basename from input needs exactly one input path, found {inputs}")]
    AmbiguousInput { unit: UnitId, inputs: usize },

    #[error("Unit {unit}: no selected file has all metadata keys [{}]", .keys.join(", "))]
    MissingMetadataKeys { unit: UnitId, keys: Vec<String> },

    #[error("Unit {unit}: invalid destination: {reason}")]
    InvalidDestination { unit: UnitId, reason: String },

    #[error("Broken indirection chain: file {file} points at missing file {missing}")]
    BrokenChain { file: FileId, missing: FileId },

    #[error("Indirection cycle through file {0}")]
    IndirectionCycle(FileId),

    #[error("Incomplete lineage: no completed record for instance {instance}, unit {unit}, stage {position}")]
    IncompleteLineage {
        instance: InstanceId,
        unit: UnitId,
        position: u32,
    },

    #[error("Lineage cycle through instance {instance}, unit {unit}")]
    LineageCycle { instance: InstanceId, unit: UnitId },

    #[error("File {0} has no producing stage record")]
    NoProducer(FileId),

    #[error("Stage output {0} has no file record")]
    UnknownFile(FileId),

    #[error("Skipped {}: {reason}", .destination.display())]
    SkippedConflict { destination: PathBuf, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn join_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl OutputError {
    pub fn category(&self) -> ErrorCategory {
        match self {
            OutputError::ConfigValidation(_) => ErrorCategory::Fatal,
            OutputError::NoCommonAncestor { .. }
            | OutputError::AmbiguousInput { .. }
            | OutputError::MissingMetadataKeys { .. }
            | OutputError::InvalidDestination { .. } => ErrorCategory::PerUnit,
            OutputError::UnknownFile(_)
            | OutputError::SkippedConflict { .. }
            | OutputError::Io(_) => ErrorCategory::PerFile,
            OutputError::BrokenChain { .. }
            | OutputError::IndirectionCycle(_)
            | OutputError::IncompleteLineage { .. }
            | OutputError::LineageCycle { .. }
            | OutputError::NoProducer(_) => ErrorCategory::Lookup,
            OutputError::Storage(_) => ErrorCategory::Infrastructure,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.category() == ErrorCategory::Fatal
    }
}

/// How far an error reaches in a materialization pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Raised before any side effect; the run does not start
    Fatal,
    /// The unit is skipped and the pass continues
    PerUnit,
    /// The file is skipped and the pass continues
    PerFile,
    /// Fatal to one lineage lookup only
    Lookup,
    /// Graph backend failure
    Infrastructure,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::Fatal => "fatal",
            ErrorCategory::PerUnit => "per_unit",
            ErrorCategory::PerFile => "per_file",
            ErrorCategory::Lookup => "lookup",
            ErrorCategory::Infrastructure => "infrastructure",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
