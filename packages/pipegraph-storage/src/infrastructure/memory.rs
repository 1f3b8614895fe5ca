//! In-memory provenance graph
//!
//! Backs tests and JSON snapshot files exported from the producing system.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::domain::{
    DataSource, File, FileId, InputUnit, InstanceId, Page, PipelineInstance, ProvenanceGraph,
    RecordId, SourceId, StageRecord, UnitId, UnitLink,
};
use crate::error::{ErrorKind, Result, StorageError};

/// Serializable dump of a whole graph
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSnapshot {
    #[serde(default)]
    pub sources: Vec<DataSource>,
    #[serde(default)]
    pub instances: Vec<PipelineInstance>,
    #[serde(default)]
    pub units: Vec<InputUnit>,
    #[serde(default)]
    pub files: Vec<File>,
    #[serde(default)]
    pub records: Vec<StageRecord>,
    /// Unit links in declaration order
    #[serde(default)]
    pub links: Vec<UnitLink>,
}

/// BTreeMap-backed graph; iteration order is id order
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraph {
    sources: BTreeMap<SourceId, DataSource>,
    instances: BTreeMap<InstanceId, PipelineInstance>,
    units: BTreeMap<UnitId, InputUnit>,
    files: BTreeMap<FileId, File>,
    records: BTreeMap<RecordId, StageRecord>,
    links: Vec<UnitLink>,
}

impl InMemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: GraphSnapshot) -> Self {
        let mut graph = Self::new();
        for source in snapshot.sources {
            graph.add_source(source);
        }
        for instance in snapshot.instances {
            graph.add_instance(instance);
        }
        for unit in snapshot.units {
            graph.add_unit(unit);
        }
        for file in snapshot.files {
            graph.add_file(file);
        }
        for record in snapshot.records {
            graph.add_record(record);
        }
        for link in snapshot.links {
            graph.add_link(link);
        }
        graph
    }

    /// Load a JSON snapshot from disk
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let snapshot: GraphSnapshot = serde_json::from_str(&content)?;
        Ok(Self::from_snapshot(snapshot))
    }

    pub fn snapshot(&self) -> GraphSnapshot {
        GraphSnapshot {
            sources: self.sources.values().cloned().collect(),
            instances: self.instances.values().cloned().collect(),
            units: self.units.values().cloned().collect(),
            files: self.files.values().cloned().collect(),
            records: self.records.values().cloned().collect(),
            links: self.links.clone(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.snapshot())?)
    }

    pub fn add_source(&mut self, source: DataSource) -> &mut Self {
        self.sources.insert(source.id, source);
        self
    }

    pub fn add_instance(&mut self, instance: PipelineInstance) -> &mut Self {
        self.instances.insert(instance.id, instance);
        self
    }

    pub fn add_unit(&mut self, unit: InputUnit) -> &mut Self {
        self.units.insert(unit.id, unit);
        self
    }

    pub fn add_file(&mut self, file: File) -> &mut Self {
        self.files.insert(file.id, file);
        self
    }

    /// Insert a record, replacing any existing record for the same
    /// (instance, unit, position) triple
    pub fn add_record(&mut self, record: StageRecord) -> &mut Self {
        self.records.retain(|_, existing| {
            !(existing.instance == record.instance
                && existing.unit == record.unit
                && existing.position == record.position)
        });
        self.records.insert(record.id, record);
        self
    }

    pub fn add_link(&mut self, link: UnitLink) -> &mut Self {
        self.links.push(link);
        self
    }
}

impl ProvenanceGraph for InMemoryGraph {
    fn instance(&self, id: InstanceId) -> Result<PipelineInstance> {
        self.instances
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::instance_not_found(id))
    }

    fn instance_by_name(&self, name: &str) -> Result<PipelineInstance> {
        self.instances
            .values()
            .find(|instance| instance.name == name)
            .cloned()
            .ok_or_else(|| StorageError::instance_not_found(name))
    }

    fn source(&self, id: SourceId) -> Result<DataSource> {
        self.sources.get(&id).cloned().ok_or_else(|| {
            StorageError::new(ErrorKind::Config, format!("Data source not found: {}", id))
        })
    }

    fn unit(&self, id: UnitId) -> Result<InputUnit> {
        self.units
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::unit_not_found(id))
    }

    fn list_units(
        &self,
        source: SourceId,
        include_withdrawn: bool,
        page: Page,
    ) -> Result<Vec<InputUnit>> {
        Ok(self
            .units
            .values()
            .filter(|unit| unit.source == source)
            .filter(|unit| include_withdrawn || !unit.withdrawn)
            .skip(page.offset)
            .take(page.limit)
            .cloned()
            .collect())
    }

    fn links_to_child(&self, child: UnitId) -> Result<Vec<UnitLink>> {
        Ok(self
            .links
            .iter()
            .filter(|link| link.child == child)
            .cloned()
            .collect())
    }

    fn stage_record(
        &self,
        instance: InstanceId,
        unit: UnitId,
        position: u32,
        include_incomplete: bool,
    ) -> Result<Option<StageRecord>> {
        Ok(self
            .records
            .values()
            .find(|r| r.instance == instance && r.unit == unit && r.position == position)
            .filter(|r| include_incomplete || r.complete)
            .cloned())
    }

    fn producers_of(&self, file: FileId) -> Result<Vec<StageRecord>> {
        Ok(self
            .records
            .values()
            .filter(|record| record.produced(file))
            .cloned()
            .collect())
    }

    fn file(&self, id: FileId) -> Result<File> {
        self.files
            .get(&id)
            .cloned()
            .ok_or_else(|| StorageError::file_not_found(id))
    }

    fn file_by_path(&self, path: &Path) -> Result<Option<File>> {
        Ok(self.files.values().find(|file| file.path == path).cloned())
    }

    fn files_replaced_by(&self, target: FileId) -> Result<Vec<File>> {
        Ok(self
            .files
            .values()
            .filter(|file| file.moved_to == Some(target))
            .cloned()
            .collect())
    }

    fn files_with_metadata_key(&self, key: &str) -> Result<Vec<File>> {
        Ok(self
            .files
            .values()
            .filter(|file| file.metadata.contains_key(key))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample_graph() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph
            .add_source(DataSource::fixed(SourceId(1)))
            .add_instance(
                PipelineInstance::new(InstanceId(1), "mapping", SourceId(1)).with_stage("align"),
            )
            .add_unit(InputUnit::new(UnitId(1), SourceId(1)).with_input("/in/a.fq"))
            .add_unit(InputUnit::new(UnitId(2), SourceId(1)).withdrawn())
            .add_unit(InputUnit::new(UnitId(3), SourceId(1)))
            .add_file(File::new(FileId(1), "/out/a.bam").with_metadata("sample", "A"))
            .add_file(File::new(FileId(2), "/out/old.bam").moved_to(FileId(1)))
            .add_record(
                StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1)
                    .with_output("bam", FileId(1)),
            );
        graph
    }

    #[test]
    fn test_list_units_paging_and_withdrawn() {
        let graph = sample_graph();

        let visible = graph
            .list_units(SourceId(1), false, Page::first(10))
            .unwrap();
        let ids: Vec<_> = visible.iter().map(|u| u.id).collect();
        assert_eq!(ids, vec![UnitId(1), UnitId(3)]);

        let all = graph.list_units(SourceId(1), true, Page::first(2)).unwrap();
        assert_eq!(all.len(), 2);
        let rest = graph
            .list_units(SourceId(1), true, Page::first(2).next())
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, UnitId(3));
    }

    #[test]
    fn test_stage_record_completion_filter() {
        let mut graph = sample_graph();
        graph.add_record(StageRecord::new(RecordId(2), InstanceId(1), UnitId(3), 1).incomplete());

        assert!(graph
            .stage_record(InstanceId(1), UnitId(3), 1, false)
            .unwrap()
            .is_none());
        assert!(graph
            .stage_record(InstanceId(1), UnitId(3), 1, true)
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_add_record_replaces_same_triple() {
        let mut graph = sample_graph();
        graph.add_record(
            StageRecord::new(RecordId(5), InstanceId(1), UnitId(1), 1).with_output("bam", FileId(2)),
        );

        let record = graph
            .stage_record(InstanceId(1), UnitId(1), 1, false)
            .unwrap()
            .unwrap();
        assert_eq!(record.id, RecordId(5));
        assert_eq!(graph.snapshot().records.len(), 1);
    }

    #[test]
    fn test_file_queries() {
        let graph = sample_graph();

        assert!(graph.file(FileId(9)).unwrap_err().is_not_found());
        let by_path = graph.file_by_path(Path::new("/out/a.bam")).unwrap();
        assert_eq!(by_path.map(|f| f.id), Some(FileId(1)));

        let replaced = graph.files_replaced_by(FileId(1)).unwrap();
        assert_eq!(replaced.len(), 1);
        assert_eq!(replaced[0].id, FileId(2));

        let tagged = graph.files_with_metadata_key("sample").unwrap();
        assert_eq!(tagged.len(), 1);

        let producers = graph.producers_of(FileId(1)).unwrap();
        assert_eq!(producers.len(), 1);
    }

    #[test]
    fn test_json_snapshot_roundtrip() {
        let graph = sample_graph();
        let json = graph.to_json().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.json");
        std::fs::write(&path, json).unwrap();

        let loaded = InMemoryGraph::from_json_file(&path).unwrap();
        assert_eq!(loaded.instance_by_name("mapping").unwrap().id, InstanceId(1));
        assert_eq!(loaded.snapshot().files.len(), 2);
    }

    #[test]
    fn test_snapshot_rejects_unknown_fields() {
        let result: std::result::Result<GraphSnapshot, _> =
            serde_json::from_str(r#"{"setups": []}"#);
        assert!(result.is_err());
    }
}
