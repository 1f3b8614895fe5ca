//! Domain layer for the provenance graph
//!
//! # Domain Models
//!
//! - `File`: a physical output (or input) file with metadata and an optional
//!   indirection link to the file that replaced it
//! - `InputUnit`: one unit of work enumerated by a `DataSource`
//! - `PipelineInstance`: an ordered list of `StageMember`s bound to a source
//! - `StageRecord`: the persisted result of one stage for one (instance, unit)
//! - `UnitLink`: parent/child edge between units of different instances
//!
//! # Port Trait
//!
//! - `ProvenanceGraph`: read-only query surface consumed by the output engine
//!
//! The graph is populated by the producing pipeline system. Nothing in this
//! crate runs a stage; records are created once a stage finishes and are never
//! mutated by readers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::Result;

// ═══════════════════════════════════════════════════════════════════════════
// Identifiers
// ═══════════════════════════════════════════════════════════════════════════

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }
    };
}

id_type!(
    /// File record identifier
    FileId
);
id_type!(
    /// Input unit identifier
    UnitId
);
id_type!(
    /// Pipeline instance identifier
    InstanceId
);
id_type!(
    /// Data source identifier
    SourceId
);
id_type!(
    /// Stage record identifier
    RecordId
);

// ═══════════════════════════════════════════════════════════════════════════
// Domain Models
// ═══════════════════════════════════════════════════════════════════════════

/// A file known to the provenance graph
///
/// `size` and `exists` are a cache of the last disk stat and may be stale
/// while the producing system is still writing. A size of zero means "unknown
/// or empty"; readers refresh it before deciding the file is missing.
///
/// # Examples
///
/// ```rust
/// use pipegraph_storage::domain::{File, FileId};
///
/// let file = File::new(FileId(7), "/data/run1/HG1.bam").with_metadata("sample", "HG1");
/// assert_eq!(file.basename(), Some("HG1.bam"));
/// assert_eq!(file.metadata_value("sample"), Some("HG1"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct File {
    pub id: FileId,
    /// Absolute path
    pub path: PathBuf,
    /// Cached size on disk in bytes
    #[serde(default)]
    pub size: u64,
    /// Cached existence flag
    #[serde(default)]
    pub exists: bool,
    /// Optional content checksum (hex)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Indirection link: the file this record was replaced by
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub moved_to: Option<FileId>,
}

impl File {
    pub fn new(id: FileId, path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            path: path.into(),
            size: 0,
            exists: false,
            checksum: None,
            metadata: BTreeMap::new(),
            moved_to: None,
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = size;
        self.exists = true;
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn moved_to(mut self, target: FileId) -> Self {
        self.moved_to = Some(target);
        self
    }

    pub fn basename(&self) -> Option<&str> {
        self.path.file_name().and_then(|name| name.to_str())
    }

    pub fn metadata_value(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Re-stat the file on disk, updating the cached size and existence flag.
    ///
    /// Returns the refreshed existence flag.
    pub fn refresh_stat(&mut self) -> bool {
        match std::fs::metadata(&self.path) {
            Ok(meta) => {
                self.size = meta.len();
                self.exists = true;
            }
            Err(_) => {
                self.size = 0;
                self.exists = false;
            }
        }
        self.exists
    }
}

/// One unit of work ("data element") enumerated by a data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputUnit {
    pub id: UnitId,
    pub source: SourceId,
    /// Original input paths, in declaration order
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    /// Withdrawn units are hidden from listings unless explicitly requested
    #[serde(default)]
    pub withdrawn: bool,
}

impl InputUnit {
    pub fn new(id: UnitId, source: SourceId) -> Self {
        Self {
            id,
            source,
            inputs: Vec::new(),
            withdrawn: false,
        }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.inputs.push(path.into());
        self
    }

    pub fn withdrawn(mut self) -> Self {
        self.withdrawn = true;
        self
    }
}

/// Mapping from an upstream instance to the member whose outputs it feeds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpstreamFeed {
    pub instance: InstanceId,
    /// 1-based position of the consumed upstream StageMember
    pub position: u32,
}

/// How a data source enumerates its units
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceKind {
    /// Units listed directly (file lists, manifests, ...)
    Fixed,
    /// Units derived from other pipeline instances' outputs
    Derived { feeds: Vec<UpstreamFeed> },
}

/// Data source attached to one or more pipeline instances
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataSource {
    pub id: SourceId,
    pub kind: SourceKind,
}

impl DataSource {
    pub fn fixed(id: SourceId) -> Self {
        Self {
            id,
            kind: SourceKind::Fixed,
        }
    }

    pub fn derived(id: SourceId, feeds: Vec<UpstreamFeed>) -> Self {
        Self {
            id,
            kind: SourceKind::Derived { feeds },
        }
    }

    pub fn is_derived(&self) -> bool {
        matches!(self.kind, SourceKind::Derived { .. })
    }

    /// Upstream member consumed from `instance`, if it contributes to this source
    pub fn feed_from(&self, instance: InstanceId) -> Option<u32> {
        match &self.kind {
            SourceKind::Fixed => None,
            SourceKind::Derived { feeds } => feeds
                .iter()
                .find(|feed| feed.instance == instance)
                .map(|feed| feed.position),
        }
    }
}

/// A stage definition bound to its 1-based position in an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageMember {
    pub position: u32,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl StageMember {
    pub fn new(position: u32, name: impl Into<String>) -> Self {
        Self {
            position,
            name: name.into(),
            description: None,
        }
    }
}

/// A configured pipeline ("setup") running against one data source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineInstance {
    pub id: InstanceId,
    pub name: String,
    pub source: SourceId,
    /// Members ordered by ascending position
    pub members: Vec<StageMember>,
}

impl PipelineInstance {
    pub fn new(id: InstanceId, name: impl Into<String>, source: SourceId) -> Self {
        Self {
            id,
            name: name.into(),
            source,
            members: Vec::new(),
        }
    }

    /// Append a stage; positions are assigned 1, 2, 3, ...
    pub fn with_stage(mut self, name: impl Into<String>) -> Self {
        let position = self.members.len() as u32 + 1;
        self.members.push(StageMember::new(position, name));
        self
    }

    pub fn member(&self, position: u32) -> Option<&StageMember> {
        self.members.iter().find(|m| m.position == position)
    }

    pub fn member_named(&self, name: &str) -> Option<&StageMember> {
        self.members.iter().find(|m| m.name == name)
    }

    /// Members sorted by position, regardless of storage order
    pub fn ordered_members(&self) -> Vec<&StageMember> {
        let mut members: Vec<_> = self.members.iter().collect();
        members.sort_by_key(|m| m.position);
        members
    }
}

/// Scheduler-reported statistics for the job that ran a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobStats {
    pub wall_time_secs: f64,
    pub cpu_time_secs: f64,
    pub exit_status: i32,
}

/// One stage having run for one (instance, unit) pair ("step state")
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: RecordId,
    pub instance: InstanceId,
    pub unit: UnitId,
    /// Position of the StageMember within the instance
    pub position: u32,
    pub complete: bool,
    /// Output kind → produced files, in production order
    #[serde(default)]
    pub outputs: BTreeMap<String, Vec<FileId>>,
    /// Summary of the command line that ran
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job: Option<JobStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl StageRecord {
    pub fn new(id: RecordId, instance: InstanceId, unit: UnitId, position: u32) -> Self {
        Self {
            id,
            instance,
            unit,
            position,
            complete: true,
            outputs: BTreeMap::new(),
            command: None,
            job: None,
            completed_at: None,
        }
    }

    pub fn with_output(mut self, kind: impl Into<String>, file: FileId) -> Self {
        self.outputs.entry(kind.into()).or_default().push(file);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn incomplete(mut self) -> Self {
        self.complete = false;
        self
    }

    pub fn produced(&self, file: FileId) -> bool {
        self.outputs.values().any(|files| files.contains(&file))
    }
}

/// Cross-instance lineage edge: `child` was derived from `parent`'s outputs
/// in `upstream_instance`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitLink {
    pub parent: UnitId,
    pub child: UnitId,
    pub upstream_instance: InstanceId,
}

/// Paging window for unit enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn first(limit: usize) -> Self {
        Self { offset: 0, limit }
    }

    pub fn next(self) -> Self {
        Self {
            offset: self.offset + self.limit,
            limit: self.limit,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Port Trait: ProvenanceGraph
// ═══════════════════════════════════════════════════════════════════════════

/// Read-only provenance graph query surface
///
/// All calls are blocking. Implementations may be backed by a database that
/// the producing system mutates concurrently; callers tolerate
/// eventually-consistent reads.
///
/// # Implementations
///
/// - `InMemoryGraph`: BTreeMap-backed (id-ordered), loadable from a JSON snapshot
/// - `SqliteProvenanceGraph`: SQLite adapter
pub trait ProvenanceGraph: Send + Sync {
    // ═══════════════════════════════════════════════════════════════════════
    // Instances and sources
    // ═══════════════════════════════════════════════════════════════════════

    /// # Errors
    ///
    /// Returns `ErrorKind::InstanceNotFound` if the instance doesn't exist
    fn instance(&self, id: InstanceId) -> Result<PipelineInstance>;

    /// Look up an instance by its unique name
    fn instance_by_name(&self, name: &str) -> Result<PipelineInstance>;

    fn source(&self, id: SourceId) -> Result<DataSource>;

    // ═══════════════════════════════════════════════════════════════════════
    // Units
    // ═══════════════════════════════════════════════════════════════════════

    fn unit(&self, id: UnitId) -> Result<InputUnit>;

    /// List units of a source ordered by id; withdrawn units are skipped
    /// unless `include_withdrawn`
    fn list_units(
        &self,
        source: SourceId,
        include_withdrawn: bool,
        page: Page,
    ) -> Result<Vec<InputUnit>>;

    /// Links whose child is `child`, in declaration order
    fn links_to_child(&self, child: UnitId) -> Result<Vec<UnitLink>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Stage records
    // ═══════════════════════════════════════════════════════════════════════

    /// The record for (instance, unit, position); incomplete records are only
    /// returned when `include_incomplete`
    fn stage_record(
        &self,
        instance: InstanceId,
        unit: UnitId,
        position: u32,
        include_incomplete: bool,
    ) -> Result<Option<StageRecord>>;

    /// Records that list `file` among their outputs, ordered by record id
    fn producers_of(&self, file: FileId) -> Result<Vec<StageRecord>>;

    // ═══════════════════════════════════════════════════════════════════════
    // Files
    // ═══════════════════════════════════════════════════════════════════════

    /// # Errors
    ///
    /// Returns `ErrorKind::FileNotFound` if no record has this id
    fn file(&self, id: FileId) -> Result<File>;

    fn file_by_path(&self, path: &Path) -> Result<Option<File>>;

    /// Files whose indirection link points at `target`
    fn files_replaced_by(&self, target: FileId) -> Result<Vec<File>>;

    /// Files carrying a value for metadata `key`, ordered by id
    fn files_with_metadata_key(&self, key: &str) -> Result<Vec<File>>;
}

// ═══════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_builders() {
        let file = File::new(FileId(1), "/out/a/HG1.vcf.gz")
            .with_metadata("sample", "HG1")
            .with_size(120)
            .with_checksum("abc");

        assert_eq!(file.basename(), Some("HG1.vcf.gz"));
        assert_eq!(file.metadata_value("sample"), Some("HG1"));
        assert_eq!(file.metadata_value("lane"), None);
        assert!(file.exists);
        assert_eq!(file.size, 120);
        assert_eq!(file.checksum.as_deref(), Some("abc"));
    }

    #[test]
    fn test_file_refresh_stat() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"hello").unwrap();

        let mut file = File::new(FileId(1), &path);
        assert!(!file.exists);
        assert!(file.refresh_stat());
        assert_eq!(file.size, 5);

        std::fs::remove_file(&path).unwrap();
        assert!(!file.refresh_stat());
        assert_eq!(file.size, 0);
    }

    #[test]
    fn test_instance_members() {
        let instance = PipelineInstance::new(InstanceId(1), "qc", SourceId(1))
            .with_stage("align")
            .with_stage("call");

        assert_eq!(instance.member(2).unwrap().name, "call");
        assert_eq!(instance.member_named("align").unwrap().position, 1);
        assert!(instance.member(3).is_none());
    }

    #[test]
    fn test_source_feed_lookup() {
        let source = DataSource::derived(
            SourceId(2),
            vec![UpstreamFeed {
                instance: InstanceId(1),
                position: 3,
            }],
        );

        assert!(source.is_derived());
        assert_eq!(source.feed_from(InstanceId(1)), Some(3));
        assert_eq!(source.feed_from(InstanceId(9)), None);
        assert_eq!(DataSource::fixed(SourceId(1)).feed_from(InstanceId(1)), None);
    }

    #[test]
    fn test_stage_record_outputs() {
        let record = StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1)
            .with_output("bam", FileId(10))
            .with_output("bam", FileId(11))
            .with_output("bai", FileId(12));

        assert_eq!(record.outputs["bam"], vec![FileId(10), FileId(11)]);
        assert!(record.produced(FileId(12)));
        assert!(!record.produced(FileId(13)));
    }

    #[test]
    fn test_source_kind_serde() {
        let source = DataSource::derived(
            SourceId(2),
            vec![UpstreamFeed {
                instance: InstanceId(1),
                position: 2,
            }],
        );

        let json = serde_json::to_string(&source).unwrap();
        assert!(json.contains("\"type\":\"derived\""));

        let back: DataSource = serde_json::from_str(&json).unwrap();
        assert_eq!(back, source);
    }

    #[test]
    fn test_page_next() {
        let page = Page::first(50).next();
        assert_eq!(page.offset, 50);
        assert_eq!(page.limit, 50);
    }
}
