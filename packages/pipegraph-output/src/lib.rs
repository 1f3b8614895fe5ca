/*
 * Pipegraph Output - provenance-aware output materialization
 *
 * Turns the stage records of a pipeline instance into a tree of symlinks
 * laid out by input structure or metadata, and reports the causal lineage
 * of any recorded file.
 *
 * Components:
 * - FileIdentityResolver (indirection chains)
 * - LineageResolver (cross-instance causal chains)
 * - OutputSelector (stage/kind/metadata selection, dedup)
 * - PathComposer (directory and basename modes, rewrites)
 * - Materializer (never-clobber symlink policy)
 */

// Public modules
pub mod checksum;
pub mod compose;
pub mod config;
pub mod error;
pub mod identity;
pub mod lineage;
pub mod materialize;
pub mod orchestrator;
pub mod report;
pub mod selector;

// Re-exports
pub use compose::{Layout, PathComposer};
pub use config::{BasenameMode, ConfigError, DirectoryMode, OutputConfig, RewriteRule, ValidatedConfig};
pub use error::{ErrorCategory, OutputError, Result};
pub use identity::{FileIdentityResolver, Indirection};
pub use lineage::LineageResolver;
pub use materialize::{MaterializeOptions, Materialized, Materializer, Outcome};
pub use orchestrator::{OutputOrchestrator, OutputReport, ReportedError};
pub use report::{FileQuery, LineageEntry, LineageReporter, ReportField, ReportFormat};
pub use selector::{
    MetadataFilter, OutputSelector, SelectedOutput, Selection, SelectionQuery, StageKindSelector,
    UnitSelection,
};
