//! Output selection over the units of one pipeline instance
//!
//! A `Selection` walks the instance's units page by page and yields, per unit,
//! the output files allowed by the stage/kind selectors and the metadata
//! filter. Files are deduplicated by resolved identity across the whole pass:
//! retry-tolerant stages may let several units reference the same physical
//! output, and it is emitted once, for the first unit that claims it.

use pipegraph_storage::{
    File, FileId, InputUnit, Page, PipelineInstance, ProvenanceGraph, StageMember,
};
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

use crate::config::ConfigError;
use crate::error::{OutputError, Result};
use crate::identity::{FileIdentityResolver, Indirection};

pub const DEFAULT_PAGE_SIZE: usize = 500;

// ═══════════════════════════════════════════════════════════════════════════
// Stage/kind selectors
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageRef {
    Name(String),
    Position(u32),
}

/// `"name"`, `"3"`, `"name|kind"` or `"3|kind"`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageKindSelector {
    pub stage: StageRef,
    pub kind: Option<String>,
}

impl FromStr for StageKindSelector {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let invalid = |reason: &str| ConfigError::InvalidSelector {
            selector: s.to_string(),
            reason: reason.to_string(),
        };

        let (stage, kind) = match s.split_once('|') {
            Some((stage, kind)) => (stage.trim(), Some(kind.trim())),
            None => (s.trim(), None),
        };
        if stage.is_empty() {
            return Err(invalid("missing stage name or position"));
        }
        if kind.map_or(false, |k| k.is_empty() || k.contains('|')) {
            return Err(invalid("kind must be a single non-empty name"));
        }

        let stage = match stage.parse::<u32>() {
            Ok(0) => return Err(invalid("stage positions start at 1")),
            Ok(position) => StageRef::Position(position),
            Err(_) => StageRef::Name(stage.to_string()),
        };

        Ok(Self {
            stage,
            kind: kind.map(str::to_string),
        })
    }
}

impl fmt::Display for StageKindSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.stage {
            StageRef::Name(name) => write!(f, "{}", name)?,
            StageRef::Position(position) => write!(f, "{}", position)?,
        }
        if let Some(kind) = &self.kind {
            write!(f, "|{}", kind)?;
        }
        Ok(())
    }
}

/// Stage members of one instance with the kinds allowed for each
#[derive(Debug, Clone)]
pub struct AllowedOutputs {
    /// Ordered by position; `None` allows every kind
    stages: Vec<(StageMember, Option<BTreeSet<String>>)>,
}

impl AllowedOutputs {
    /// Resolve selectors against `instance`. An empty selector list allows
    /// every kind of every stage.
    pub fn resolve(
        instance: &PipelineInstance,
        selectors: &[StageKindSelector],
    ) -> std::result::Result<Self, ConfigError> {
        let members = instance.ordered_members();

        if selectors.is_empty() {
            return Ok(Self {
                stages: members.into_iter().map(|m| (m.clone(), None)).collect(),
            });
        }

        let mut allowed: Vec<(StageMember, Option<BTreeSet<String>>)> = Vec::new();
        for selector in selectors {
            let member = match &selector.stage {
                StageRef::Name(name) => instance.member_named(name),
                StageRef::Position(position) => instance.member(*position),
            }
            .ok_or_else(|| ConfigError::UnknownStage {
                selector: selector.to_string(),
                instance: instance.name.clone(),
            })?;

            let index = match allowed.iter().position(|(m, _)| m.position == member.position) {
                Some(index) => index,
                None => {
                    allowed.push((member.clone(), Some(BTreeSet::new())));
                    allowed.len() - 1
                }
            };
            match (&selector.kind, &mut allowed[index].1) {
                (None, kinds) => *kinds = None,
                (Some(kind), Some(kinds)) => {
                    kinds.insert(kind.clone());
                }
                (Some(_), None) => {}
            }
        }

        allowed.sort_by_key(|(m, _)| m.position);
        Ok(Self { stages: allowed })
    }

    pub fn stages(&self) -> impl Iterator<Item = &StageMember> {
        self.stages.iter().map(|(m, _)| m)
    }

    pub fn allows(&self, position: u32, kind: &str) -> bool {
        self.stages.iter().any(|(m, kinds)| {
            m.position == position && kinds.as_ref().map_or(true, |k| k.contains(kind))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Metadata filter
// ═══════════════════════════════════════════════════════════════════════════

/// Every key must be present with a value matching its pattern (unanchored)
#[derive(Debug, Clone, Default)]
pub struct MetadataFilter {
    rules: Vec<(String, Regex)>,
}

impl MetadataFilter {
    pub fn new<K, P>(rules: impl IntoIterator<Item = (K, P)>) -> std::result::Result<Self, ConfigError>
    where
        K: Into<String>,
        P: AsRef<str>,
    {
        let rules = rules
            .into_iter()
            .map(|(key, pattern)| {
                let pattern = pattern.as_ref();
                Regex::new(pattern)
                    .map(|re| (key.into(), re))
                    .map_err(|source| ConfigError::InvalidPattern {
                        pattern: pattern.to_string(),
                        source,
                    })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Parse `key=pattern[,key=pattern...]`
    pub fn parse(expression: &str) -> std::result::Result<Self, ConfigError> {
        let mut pairs = Vec::new();
        for part in expression.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, pattern) = part.split_once('=').ok_or_else(|| {
                ConfigError::InvalidSelector {
                    selector: part.to_string(),
                    reason: "expected key=pattern".to_string(),
                }
            })?;
            pairs.push((key.trim().to_string(), pattern.trim().to_string()));
        }
        Self::new(pairs)
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rules.iter().map(|(k, _)| k.as_str())
    }

    pub fn matches(&self, file: &File) -> bool {
        self.rules.iter().all(|(key, pattern)| {
            file.metadata_value(key)
                .map_or(false, |value| pattern.is_match(value))
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Selection
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone)]
pub struct SelectionQuery {
    pub stages: Vec<StageKindSelector>,
    pub metadata: MetadataFilter,
    pub include_withdrawn: bool,
    pub include_incomplete: bool,
    pub page_size: usize,
}

impl Default for SelectionQuery {
    fn default() -> Self {
        Self {
            stages: Vec::new(),
            metadata: MetadataFilter::default(),
            include_withdrawn: false,
            include_incomplete: false,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// One emitted output
#[derive(Debug, Clone)]
pub struct SelectedOutput {
    pub stage: StageMember,
    pub kind: String,
    /// The file as recorded by the stage
    pub file: File,
    /// The terminal file after following indirections
    pub resolved: File,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct UnitStats {
    pub considered: usize,
    pub passed_filter: usize,
    pub duplicates: usize,
    pub missing: usize,
}

impl UnitStats {
    pub fn merge(&mut self, other: &UnitStats) {
        self.considered += other.considered;
        self.passed_filter += other.passed_filter;
        self.duplicates += other.duplicates;
        self.missing += other.missing;
    }
}

/// Everything selected for one unit
#[derive(Debug)]
pub struct UnitSelection {
    pub unit: InputUnit,
    pub outputs: Vec<SelectedOutput>,
    pub stats: UnitStats,
    /// Per-file problems (broken chains); the files were skipped
    pub errors: Vec<OutputError>,
}

pub struct OutputSelector<'g> {
    graph: &'g dyn ProvenanceGraph,
}

impl<'g> OutputSelector<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph) -> Self {
        Self { graph }
    }

    /// Start a selection pass over `instance`.
    ///
    /// Fails up front if a stage selector doesn't name a stage of the instance.
    pub fn select(
        &self,
        instance: &PipelineInstance,
        query: SelectionQuery,
    ) -> std::result::Result<Selection<'g>, ConfigError> {
        let allowed = AllowedOutputs::resolve(instance, &query.stages)?;
        Ok(Selection {
            graph: self.graph,
            identity: FileIdentityResolver::new(self.graph),
            instance: instance.clone(),
            allowed,
            page: Page::first(query.page_size.max(1)),
            query,
            buffer: VecDeque::new(),
            exhausted: false,
            seen: HashSet::new(),
        })
    }
}

/// Iterator over per-unit selections; owns the dedup set for this pass
pub struct Selection<'g> {
    graph: &'g dyn ProvenanceGraph,
    identity: FileIdentityResolver<'g>,
    instance: PipelineInstance,
    allowed: AllowedOutputs,
    query: SelectionQuery,
    page: Page,
    buffer: VecDeque<InputUnit>,
    exhausted: bool,
    seen: HashSet<FileId>,
}

impl<'g> Selection<'g> {
    pub fn instance(&self) -> &PipelineInstance {
        &self.instance
    }

    fn fill_buffer(&mut self) -> Result<()> {
        let units = self.graph.list_units(
            self.instance.source,
            self.query.include_withdrawn,
            self.page,
        )?;
        if units.len() < self.page.limit {
            self.exhausted = true;
        }
        self.page = self.page.next();
        self.buffer.extend(units);
        Ok(())
    }

    fn select_unit(&mut self, unit: InputUnit) -> Result<UnitSelection> {
        let mut selection = UnitSelection {
            unit,
            outputs: Vec::new(),
            stats: UnitStats::default(),
            errors: Vec::new(),
        };

        let stages: Vec<StageMember> = self.allowed.stages().cloned().collect();
        for stage in stages {
            let Some(record) = self.graph.stage_record(
                self.instance.id,
                selection.unit.id,
                stage.position,
                self.query.include_incomplete,
            )?
            else {
                continue;
            };

            for (kind, files) in &record.outputs {
                if !self.allowed.allows(stage.position, kind) {
                    continue;
                }
                for &file_id in files {
                    selection.stats.considered += 1;

                    let file = match self.graph.file(file_id) {
                        Ok(file) => file,
                        Err(e) if e.is_not_found() => {
                            warn!(
                                "unit {}: output {} has no file record, skipped",
                                selection.unit.id, file_id
                            );
                            selection.errors.push(OutputError::UnknownFile(file_id));
                            continue;
                        }
                        Err(e) => return Err(e.into()),
                    };
                    if !self.query.metadata.matches(&file) {
                        continue;
                    }
                    selection.stats.passed_filter += 1;

                    let mut resolved = match self.identity.resolve(&file, Indirection::Terminal) {
                        Ok(resolved) => resolved,
                        Err(e) => {
                            warn!("unit {}: skipping file {}: {}", selection.unit.id, file.id, e);
                            selection.errors.push(e);
                            continue;
                        }
                    };

                    if self.seen.contains(&resolved.id) {
                        debug!(
                            "unit {}: file {} already emitted in this pass",
                            selection.unit.id, resolved.id
                        );
                        selection.stats.duplicates += 1;
                        continue;
                    }

                    if resolved.size == 0 && !resolved.refresh_stat() {
                        warn!(
                            "unit {}: file {} ({}) does not exist on disk, skipped",
                            selection.unit.id,
                            resolved.id,
                            resolved.path.display()
                        );
                        selection.stats.missing += 1;
                        continue;
                    }

                    self.seen.insert(resolved.id);
                    selection.outputs.push(SelectedOutput {
                        stage: stage.clone(),
                        kind: kind.clone(),
                        file,
                        resolved,
                    });
                }
            }
        }

        if !self.query.metadata.is_empty()
            && selection.stats.considered > 0
            && selection.stats.passed_filter == 0
        {
            debug!(
                "unit {}: metadata filter eliminated all {} candidates",
                selection.unit.id, selection.stats.considered
            );
        }

        Ok(selection)
    }
}

impl<'g> Iterator for Selection<'g> {
    type Item = Result<UnitSelection>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() && !self.exhausted {
            if let Err(e) = self.fill_buffer() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        let unit = self.buffer.pop_front()?;
        Some(self.select_unit(unit))
    }
}

#[cfg(test)]
mod tests {
    use super::Result;
    use super::*;
    use pipegraph_storage::*;
    use pretty_assertions::assert_eq;

    fn graph() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph
            .add_source(DataSource::fixed(SourceId(1)))
            .add_instance(
                PipelineInstance::new(InstanceId(1), "mapping", SourceId(1))
                    .with_stage("align")
                    .with_stage("stats"),
            )
            .add_unit(InputUnit::new(UnitId(1), SourceId(1)))
            .add_unit(InputUnit::new(UnitId(2), SourceId(1)))
            .add_unit(InputUnit::new(UnitId(3), SourceId(1)).withdrawn())
            .add_file(File::new(FileId(1), "/o/u1.bam").with_size(10).with_metadata("sample", "HG1"))
            .add_file(File::new(FileId(2), "/o/u1.bai").with_size(10).with_metadata("sample", "HG1"))
            .add_file(File::new(FileId(3), "/o/u1.stats").with_size(10))
            .add_file(File::new(FileId(4), "/o/u2.bam").with_size(10).with_metadata("sample", "HG2"))
            .add_file(File::new(FileId(5), "/o/u3.bam").with_size(10).with_metadata("sample", "HG3"))
            .add_record(
                StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1)
                    .with_output("bam", FileId(1))
                    .with_output("bai", FileId(2)),
            )
            .add_record(
                StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2)
                    .with_output("stats", FileId(3)),
            )
            .add_record(
                // Re-run of unit 2 also claims unit 1's bam
                StageRecord::new(RecordId(3), InstanceId(1), UnitId(2), 1)
                    .with_output("bam", FileId(1))
                    .with_output("bam", FileId(4)),
            )
            .add_record(
                StageRecord::new(RecordId(4), InstanceId(1), UnitId(3), 1)
                    .with_output("bam", FileId(5)),
            );
        graph
    }

    fn run(graph: &InMemoryGraph, query: SelectionQuery) -> Vec<UnitSelection> {
        let instance = graph.instance(InstanceId(1)).unwrap();
        OutputSelector::new(graph)
            .select(&instance, query)
            .unwrap()
            .collect::<Result<Vec<_>>>()
            .unwrap()
    }

    fn emitted(selections: &[UnitSelection]) -> Vec<(i64, i64)> {
        selections
            .iter()
            .flat_map(|s| s.outputs.iter().map(move |o| (s.unit.id.0, o.file.id.0)))
            .collect()
    }

    #[test]
    fn test_parse_selectors() {
        assert_eq!(
            "align".parse::<StageKindSelector>().unwrap(),
            StageKindSelector {
                stage: StageRef::Name("align".into()),
                kind: None
            }
        );
        assert_eq!(
            "2|bam".parse::<StageKindSelector>().unwrap(),
            StageKindSelector {
                stage: StageRef::Position(2),
                kind: Some("bam".into())
            }
        );
        assert!("".parse::<StageKindSelector>().is_err());
        assert!("0".parse::<StageKindSelector>().is_err());
        assert!("align|".parse::<StageKindSelector>().is_err());
        assert_eq!("align|bam".parse::<StageKindSelector>().unwrap().to_string(), "align|bam");
    }

    #[test]
    fn test_selects_everything_and_dedups_across_units() {
        let graph = graph();
        let selections = run(&graph, SelectionQuery::default());

        // File 1 is claimed by units 1 and 2 but emitted once; unit 3 is withdrawn
        assert_eq!(emitted(&selections), vec![(1, 2), (1, 1), (1, 3), (2, 4)]);
        assert_eq!(selections[1].stats.duplicates, 1);
        assert_eq!(selections.len(), 2);
    }

    #[test]
    fn test_include_withdrawn() {
        let graph = graph();
        let selections = run(
            &graph,
            SelectionQuery {
                include_withdrawn: true,
                ..Default::default()
            },
        );
        assert_eq!(selections.len(), 3);
        assert_eq!(selections[2].outputs[0].file.id, FileId(5));
    }

    #[test]
    fn test_stage_and_kind_restriction() {
        let graph = graph();
        let selections = run(
            &graph,
            SelectionQuery {
                stages: vec!["align|bam".parse().unwrap()],
                ..Default::default()
            },
        );
        assert_eq!(emitted(&selections), vec![(1, 1), (2, 4)]);

        let selections = run(
            &graph,
            SelectionQuery {
                stages: vec!["2".parse().unwrap()],
                ..Default::default()
            },
        );
        assert_eq!(emitted(&selections), vec![(1, 3)]);
    }

    #[test]
    fn test_unrestricted_selector_wins_over_kind() {
        let graph = graph();
        let instance = graph.instance(InstanceId(1)).unwrap();
        let allowed = AllowedOutputs::resolve(
            &instance,
            &["align|bam".parse().unwrap(), "align".parse().unwrap()],
        )
        .unwrap();
        assert!(allowed.allows(1, "bai"));
        assert!(!allowed.allows(2, "stats"));
    }

    #[test]
    fn test_unknown_stage_fails_before_selection() {
        let graph = graph();
        let instance = graph.instance(InstanceId(1)).unwrap();
        let result = OutputSelector::new(&graph).select(
            &instance,
            SelectionQuery {
                stages: vec!["variant_call".parse().unwrap()],
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(ConfigError::UnknownStage { .. })));
    }

    #[test]
    fn test_metadata_filter() {
        let graph = graph();
        let selections = run(
            &graph,
            SelectionQuery {
                metadata: MetadataFilter::parse("sample=HG2").unwrap(),
                ..Default::default()
            },
        );
        assert_eq!(emitted(&selections), vec![(2, 4)]);
        // Unit 1 had candidates but none passed; it contributes nothing
        assert_eq!(selections[0].stats.considered, 3);
        assert_eq!(selections[0].stats.passed_filter, 0);
        assert!(selections[0].outputs.is_empty());
    }

    #[test]
    fn test_metadata_filter_is_substring_regex() {
        let filter = MetadataFilter::parse("sample=G[12]").unwrap();
        let hit = File::new(FileId(1), "/a").with_metadata("sample", "HG1");
        let miss = File::new(FileId(2), "/b").with_metadata("sample", "HG3");
        let missing_key = File::new(FileId(3), "/c");
        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
        assert!(!filter.matches(&missing_key));
        assert!(MetadataFilter::parse("sample=(").is_err());
        assert!(MetadataFilter::parse("sample").is_err());
    }

    #[test]
    fn test_paging_covers_every_unit() {
        let graph = graph();
        let selections = run(
            &graph,
            SelectionQuery {
                page_size: 1,
                include_withdrawn: true,
                ..Default::default()
            },
        );
        assert_eq!(selections.len(), 3);
    }

    #[test]
    fn test_moved_file_dedups_by_resolved_identity() {
        let mut graph = graph();
        graph
            .add_file(File::new(FileId(6), "/old/u2.bam").moved_to(FileId(4)))
            .add_record(
                StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2)
                    .with_output("stats", FileId(6)),
            );
        let selections = run(&graph, SelectionQuery::default());

        // Unit 1 emits file 6 (resolving to 4); unit 2's direct claim on 4 is a duplicate
        let unit1 = &selections[0];
        let moved = unit1.outputs.iter().find(|o| o.file.id == FileId(6)).unwrap();
        assert_eq!(moved.resolved.id, FileId(4));
        assert_eq!(selections[1].stats.duplicates, 2);
    }

    #[test]
    fn test_missing_file_is_refreshed_and_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let present = dir.path().join("present.txt");
        std::fs::write(&present, b"data").unwrap();

        let mut graph = graph();
        graph
            .add_file(File::new(FileId(7), &present))
            .add_file(File::new(FileId(8), dir.path().join("absent.txt")))
            .add_record(
                StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2)
                    .with_output("stats", FileId(7))
                    .with_output("stats", FileId(8)),
            );
        let selections = run(
            &graph,
            SelectionQuery {
                stages: vec!["stats".parse().unwrap()],
                ..Default::default()
            },
        );

        assert_eq!(selections[0].outputs.len(), 1);
        assert_eq!(selections[0].outputs[0].resolved.size, 4);
        assert_eq!(selections[0].stats.missing, 1);
    }

    #[test]
    fn test_broken_chain_skips_file_and_reports() {
        let mut graph = graph();
        graph
            .add_file(File::new(FileId(9), "/o/broken").moved_to(FileId(404)))
            .add_record(
                StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2)
                    .with_output("stats", FileId(9)),
            );
        let selections = run(&graph, SelectionQuery::default());

        assert_eq!(selections[0].errors.len(), 1);
        assert!(matches!(
            selections[0].errors[0],
            OutputError::BrokenChain { .. }
        ));
    }

    #[test]
    fn test_dangling_output_id_skips_file_and_keeps_dedup() {
        let mut graph = graph();
        graph.add_record(
            StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1)
                .with_output("bam", FileId(1))
                .with_output("bam", FileId(99)),
        );
        let selections = run(&graph, SelectionQuery::default());

        assert_eq!(selections.len(), 2);
        assert_eq!(selections[0].errors.len(), 1);
        assert!(matches!(selections[0].errors[0], OutputError::UnknownFile(FileId(99))));
        // Unit 1 still claims the bam, so unit 2 sees it as a duplicate
        assert!(emitted(&selections).contains(&(1, 1)));
        assert!(!emitted(&selections).contains(&(2, 1)));
        assert_eq!(selections[1].stats.duplicates, 1);
    }
}
