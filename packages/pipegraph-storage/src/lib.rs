//! pipegraph-storage - provenance graph of a batch pipeline system
//!
//! Files, input units, pipeline instances and the stage records linking them,
//! as populated by the producing pipeline system.
//!
//! ## Core Principles
//!
//! 1. **Read-only for consumers**: the output engine only queries the graph
//! 2. **One record per triple**: at most one `StageRecord` per
//!    (instance, unit, stage position); a re-run replaces it
//! 3. **Acyclic lineage**: unit links and file indirections never form cycles
//!
//! ## Usage
//!
//! ```rust
//! use pipegraph_storage::domain::*;
//! use pipegraph_storage::InMemoryGraph;
//!
//! let mut graph = InMemoryGraph::new();
//! graph
//!     .add_source(DataSource::fixed(SourceId(1)))
//!     .add_instance(PipelineInstance::new(InstanceId(1), "mapping", SourceId(1)).with_stage("align"))
//!     .add_unit(InputUnit::new(UnitId(1), SourceId(1)).with_input("/in/s1.fq"))
//!     .add_file(File::new(FileId(1), "/out/s1.bam"))
//!     .add_record(StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1).with_output("bam", FileId(1)));
//!
//! let record = graph.stage_record(InstanceId(1), UnitId(1), 1, false).unwrap();
//! assert!(record.is_some());
//! ```

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use error::{ErrorKind, Result, StorageError};

pub use domain::{
    DataSource, File, FileId, InputUnit, InstanceId, JobStats, Page, PipelineInstance,
    ProvenanceGraph, RecordId, SourceId, SourceKind, StageMember, StageRecord, UnitId, UnitLink,
    UpstreamFeed,
};
pub use infrastructure::{GraphSnapshot, InMemoryGraph};

#[cfg(feature = "sqlite")]
pub use infrastructure::SqliteProvenanceGraph;
