//! Lineage report: where a file came from
//!
//! For each requested file the reporter finds the producing stage record
//! (files that replaced older records inherit those records' producers),
//! reconstructs its causal chain, and renders the selected fields. Lookup
//! failures are rendered inline for that file; the report always completes.

use pipegraph_storage::{
    File, FileId, InstanceId, PipelineInstance, ProvenanceGraph, StageRecord,
};
use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::str::FromStr;
use tracing::{debug, warn};

use crate::checksum::checksum;
use crate::config::ConfigError;
use crate::error::{OutputError, Result};
use crate::identity::{FileIdentityResolver, Indirection};
use crate::lineage::LineageResolver;
use crate::selector::{MetadataFilter, OutputSelector, SelectionQuery, StageKindSelector};

// ═══════════════════════════════════════════════════════════════════════════
// Fields and formats
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReportField {
    Path,
    Size,
    Checksum,
    Metadata,
    Lineage,
    Commands,
    Jobs,
}

impl ReportField {
    pub const ALL: [ReportField; 7] = [
        ReportField::Path,
        ReportField::Size,
        ReportField::Checksum,
        ReportField::Metadata,
        ReportField::Lineage,
        ReportField::Commands,
        ReportField::Jobs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReportField::Path => "path",
            ReportField::Size => "size",
            ReportField::Checksum => "checksum",
            ReportField::Metadata => "metadata",
            ReportField::Lineage => "lineage",
            ReportField::Commands => "commands",
            ReportField::Jobs => "jobs",
        }
    }

    /// Comma-separated field list, e.g. `path,lineage`
    pub fn parse_list(list: &str) -> std::result::Result<Vec<Self>, ConfigError> {
        list.split(',')
            .map(str::trim)
            .filter(|f| !f.is_empty())
            .map(str::parse)
            .collect()
    }
}

impl FromStr for ReportField {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ReportField::ALL
            .into_iter()
            .find(|f| f.as_str() == s)
            .ok_or_else(|| ConfigError::InvalidSelector {
                selector: s.to_string(),
                reason: format!(
                    "unknown report field, expected one of {}",
                    ReportField::ALL.map(|f| f.as_str()).join(", ")
                ),
            })
    }
}

impl fmt::Display for ReportField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReportFormat {
    /// One tab-separated row per file, header first
    #[default]
    Tsv,
    /// A multi-line block per file
    Report,
}

impl FromStr for ReportFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "tsv" => Ok(ReportFormat::Tsv),
            "report" => Ok(ReportFormat::Report),
            other => Err(ConfigError::InvalidSelector {
                selector: other.to_string(),
                reason: "format must be 'tsv' or 'report'".to_string(),
            }),
        }
    }
}

/// Which files to report on
#[derive(Debug, Clone)]
pub enum FileQuery {
    Ids(Vec<FileId>),
    /// Files whose metadata matches every `key=pattern`
    Search(MetadataFilter),
    /// Every output of one stage of one instance
    Stage {
        instance: String,
        stage: StageKindSelector,
    },
}

// ═══════════════════════════════════════════════════════════════════════════
// Entries
// ═══════════════════════════════════════════════════════════════════════════

/// One record of a lineage chain with display names resolved
#[derive(Debug, Clone)]
pub struct ChainStep {
    pub instance: String,
    pub stage: String,
    pub record: StageRecord,
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}[unit {}]", self.instance, self.stage, self.record.unit)
    }
}

#[derive(Debug)]
pub struct LineageEntry {
    pub file: File,
    /// Terminal file behind the indirection chain
    pub resolved: Option<File>,
    pub chain: Vec<ChainStep>,
    pub error: Option<OutputError>,
}

pub struct LineageReporter<'g> {
    graph: &'g dyn ProvenanceGraph,
    identity: FileIdentityResolver<'g>,
    lineage: LineageResolver<'g>,
}

impl<'g> LineageReporter<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph) -> Self {
        Self {
            graph,
            identity: FileIdentityResolver::new(graph),
            lineage: LineageResolver::new(graph),
        }
    }

    /// Files matched by `query`, in query order (ids) or id order (search)
    pub fn find_files(&self, query: &FileQuery) -> Result<Vec<File>> {
        match query {
            FileQuery::Ids(ids) => ids
                .iter()
                .map(|id| self.graph.file(*id).map_err(OutputError::from))
                .collect(),
            FileQuery::Search(filter) => {
                let Some(key) = filter.keys().next() else {
                    return Err(ConfigError::InvalidSelector {
                        selector: String::new(),
                        reason: "search expression has no key=pattern term".to_string(),
                    }
                    .into());
                };
                Ok(self
                    .graph
                    .files_with_metadata_key(key)?
                    .into_iter()
                    .filter(|file| filter.matches(file))
                    .collect())
            }
            FileQuery::Stage { instance, stage } => {
                let instance = self.graph.instance_by_name(instance)?;
                let query = SelectionQuery {
                    stages: vec![stage.clone()],
                    include_withdrawn: true,
                    ..Default::default()
                };
                let mut files = Vec::new();
                for unit in OutputSelector::new(self.graph).select(&instance, query)? {
                    files.extend(unit?.outputs.into_iter().map(|o| o.file));
                }
                Ok(files)
            }
        }
    }

    /// Build the entry for one file; never fails
    pub fn entry(&self, file: File) -> LineageEntry {
        let mut entry = LineageEntry {
            file,
            resolved: None,
            chain: Vec::new(),
            error: None,
        };

        match self.identity.resolve(&entry.file, Indirection::Terminal) {
            Ok(resolved) => entry.resolved = Some(resolved),
            Err(e) => {
                entry.error = Some(e);
                return entry;
            }
        }

        match self.producer(&entry.file).and_then(|record| self.lineage.chain(&record)) {
            Ok(chain) => match self.named(chain) {
                Ok(steps) => entry.chain = steps,
                Err(e) => entry.error = Some(e),
            },
            Err(e) => {
                warn!("Lineage lookup failed for file {}: {}", entry.file.id, e);
                entry.error = Some(e);
            }
        }
        entry
    }

    /// Record that produced `file` or a record it replaced, nearest first
    fn producer(&self, file: &File) -> Result<StageRecord> {
        for alias in self.identity.aliases(file)? {
            if let Some(record) = self.graph.producers_of(alias.id)?.into_iter().next() {
                debug!("file {} produced by record {} (via file {})", file.id, record.id, alias.id);
                return Ok(record);
            }
        }
        Err(OutputError::NoProducer(file.id))
    }

    fn named(&self, chain: Vec<StageRecord>) -> Result<Vec<ChainStep>> {
        let mut instances: HashMap<InstanceId, PipelineInstance> = HashMap::new();
        chain
            .into_iter()
            .map(|record| -> Result<ChainStep> {
                if !instances.contains_key(&record.instance) {
                    instances.insert(record.instance, self.graph.instance(record.instance)?);
                }
                let instance = &instances[&record.instance];
                let stage = instance
                    .member(record.position)
                    .map(|m| m.name.clone())
                    .unwrap_or_else(|| record.position.to_string());
                Ok(ChainStep {
                    instance: instance.name.clone(),
                    stage,
                    record,
                })
            })
            .collect()
    }

    /// Find, resolve and render in one go
    pub fn write<W: Write>(
        &self,
        query: &FileQuery,
        fields: &[ReportField],
        format: ReportFormat,
        out: &mut W,
    ) -> Result<Vec<LineageEntry>> {
        let entries: Vec<LineageEntry> = self
            .find_files(query)?
            .into_iter()
            .map(|file| self.entry(file))
            .collect();
        render(&entries, fields, format, out)?;
        Ok(entries)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Rendering
// ═══════════════════════════════════════════════════════════════════════════

pub fn render<W: Write>(
    entries: &[LineageEntry],
    fields: &[ReportField],
    format: ReportFormat,
    out: &mut W,
) -> io::Result<()> {
    match format {
        ReportFormat::Tsv => render_tsv(entries, fields, out),
        ReportFormat::Report => render_report(entries, fields, out),
    }
}

fn render_tsv<W: Write>(entries: &[LineageEntry], fields: &[ReportField], out: &mut W) -> io::Result<()> {
    let header: Vec<&str> = std::iter::once("file_id")
        .chain(fields.iter().map(|f| f.as_str()))
        .chain(std::iter::once("error"))
        .collect();
    writeln!(out, "{}", header.join("\t"))?;

    for entry in entries {
        let mut row = vec![entry.file.id.to_string()];
        for field in fields {
            row.push(field_value(entry, *field).join("; "));
        }
        row.push(entry.error.as_ref().map(|e| e.to_string()).unwrap_or_default());
        let row: Vec<String> = row.into_iter().map(|c| c.replace(['\t', '\n'], " ")).collect();
        writeln!(out, "{}", row.join("\t"))?;
    }
    Ok(())
}

fn render_report<W: Write>(entries: &[LineageEntry], fields: &[ReportField], out: &mut W) -> io::Result<()> {
    for (i, entry) in entries.iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        writeln!(out, "file {}", entry.file.id)?;
        for field in fields {
            let values = field_value(entry, *field);
            match values.as_slice() {
                [] => writeln!(out, "  {}: -", field)?,
                [single] if !matches!(field, ReportField::Lineage | ReportField::Commands | ReportField::Jobs) => {
                    writeln!(out, "  {}: {}", field, single)?
                }
                many => {
                    writeln!(out, "  {}:", field)?;
                    for (n, value) in many.iter().enumerate() {
                        writeln!(out, "    {}. {}", n + 1, value)?;
                    }
                }
            }
        }
        if let Some(error) = &entry.error {
            writeln!(out, "  error: {}", error)?;
        }
    }
    Ok(())
}

/// Rendered values of one field; lists render one value per record
fn field_value(entry: &LineageEntry, field: ReportField) -> Vec<String> {
    let target = entry.resolved.as_ref().unwrap_or(&entry.file);
    match field {
        ReportField::Path => vec![target.path.display().to_string()],
        ReportField::Size => {
            let mut file = target.clone();
            if file.size == 0 {
                file.refresh_stat();
            }
            vec![file.size.to_string()]
        }
        ReportField::Checksum => match checksum(target) {
            Ok(sum) => vec![sum],
            Err(e) => vec![format!("unavailable ({})", e)],
        },
        ReportField::Metadata => {
            if target.metadata.is_empty() && entry.file.metadata.is_empty() {
                return Vec::new();
            }
            let metadata = if target.metadata.is_empty() {
                &entry.file.metadata
            } else {
                &target.metadata
            };
            vec![metadata
                .iter()
                .map(|(k, v)| format!("{}={}", k, v))
                .collect::<Vec<_>>()
                .join(",")]
        }
        ReportField::Lineage => entry.chain.iter().map(|step| step.to_string()).collect(),
        ReportField::Commands => entry
            .chain
            .iter()
            .map(|step| {
                format!(
                    "{}: {}",
                    step,
                    step.record.command.as_deref().unwrap_or("-")
                )
            })
            .collect(),
        ReportField::Jobs => entry
            .chain
            .iter()
            .map(|step| match &step.record.job {
                Some(job) => format!(
                    "{}: wall {:.1}s, cpu {:.1}s, exit {}",
                    step, job.wall_time_secs, job.cpu_time_secs, job.exit_status
                ),
                None => format!("{}: -", step),
            })
            .collect(),
    }
}
