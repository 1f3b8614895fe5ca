//! One materialization (or print-only) pass over a pipeline instance
//!
//! Selection always runs sequentially because the dedup set belongs to a
//! single pass. Composition and materialization run per unit, optionally on
//! the rayon pool; results are merged into the report in unit order.

use pipegraph_storage::{InstanceId, PipelineInstance, ProvenanceGraph, UnitId};
use rayon::prelude::*;
use serde::Serialize;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{info, warn};

use crate::checksum::checksum;
use crate::compose::PathComposer;
use crate::config::{ConfigError, ValidatedConfig};
use crate::error::{ErrorCategory, OutputError, Result};
use crate::materialize::{Materialized, Materializer, Outcome};
use crate::selector::{OutputSelector, SelectedOutput, UnitSelection, UnitStats};

/// Aggregated result of one pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct OutputReport {
    pub instance: String,
    pub units_seen: usize,
    pub units_skipped: usize,
    pub files_considered: usize,
    pub files_filtered_out: usize,
    pub files_duplicate: usize,
    pub files_missing: usize,
    pub files_selected: usize,
    pub created: usize,
    pub already_correct: usize,
    pub skipped_conflict: usize,
    pub dry_run_reported: usize,
    pub printed: usize,
    pub errors: Vec<ReportedError>,
    /// Set when fail-fast stopped the pass
    pub aborted: bool,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReportedError {
    pub category: ErrorCategory,
    pub message: String,
}

impl From<&OutputError> for ReportedError {
    fn from(err: &OutputError) -> Self {
        Self {
            category: err.category(),
            message: err.to_string(),
        }
    }
}

impl OutputReport {
    fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            ..Default::default()
        }
    }

    fn merge_stats(&mut self, stats: &UnitStats) {
        self.files_considered += stats.considered;
        self.files_filtered_out += stats.considered - stats.passed_filter;
        self.files_duplicate += stats.duplicates;
        self.files_missing += stats.missing;
    }

    fn count(&mut self, outcome: &Outcome) {
        match outcome {
            Outcome::Created => self.created += 1,
            Outcome::AlreadyCorrect => self.already_correct += 1,
            Outcome::SkippedConflict { .. } => self.skipped_conflict += 1,
            Outcome::DryRunReported => self.dry_run_reported += 1,
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// One-line human summary
    pub fn summary(&self) -> String {
        format!(
            "{}: {} units ({} skipped), {} files selected of {} considered \
             ({} filtered, {} duplicate, {} missing); created {}, already correct {}, \
             conflicts {}, dry-run {}, printed {}; {} errors{}",
            self.instance,
            self.units_seen,
            self.units_skipped,
            self.files_selected,
            self.files_considered,
            self.files_filtered_out,
            self.files_duplicate,
            self.files_missing,
            self.created,
            self.already_correct,
            self.skipped_conflict,
            self.dry_run_reported,
            self.printed,
            self.errors.len(),
            if self.aborted { " (aborted)" } else { "" },
        )
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Everything one unit contributed, merged into the report afterwards
#[derive(Debug, Default)]
struct UnitResult {
    unit: Option<UnitId>,
    stats: UnitStats,
    selected: usize,
    skipped: bool,
    lines: Vec<String>,
    materialized: Vec<Materialized>,
    errors: Vec<OutputError>,
}

pub struct OutputOrchestrator<'g> {
    graph: &'g dyn ProvenanceGraph,
    config: ValidatedConfig,
}

impl<'g> OutputOrchestrator<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph, config: ValidatedConfig) -> Self {
        Self { graph, config }
    }

    pub fn config(&self) -> &ValidatedConfig {
        &self.config
    }

    /// Look up the configured instance by name, then by numeric id
    pub fn find_instance(&self) -> Result<PipelineInstance> {
        let name = self.config.instance();
        match self.graph.instance_by_name(name) {
            Ok(instance) => Ok(instance),
            Err(e) if e.is_not_found() => match name.parse::<i64>() {
                Ok(id) => Ok(self.graph.instance(InstanceId(id))?),
                Err(_) => Err(e.into()),
            },
            Err(e) => Err(e.into()),
        }
    }

    /// Run one pass. Print-only lines and dry-run pairs go to `out`.
    ///
    /// # Errors
    ///
    /// Only errors raised before the first side effect: an unknown instance
    /// or stage, or a layout missing outside print-only mode. Everything
    /// later is collected in the report.
    pub fn run<W: Write>(&self, out: &mut W) -> Result<OutputReport> {
        let start = Instant::now();
        let instance = self.find_instance()?;
        let selection = OutputSelector::new(self.graph)
            .select(&instance, self.config.selection_query())?;

        let composer = if self.config.print_only() {
            None
        } else {
            let layout = self
                .config
                .layout()
                .ok_or(ConfigError::MissingMode("directory"))?;
            Some(PathComposer::new(layout))
        };
        let materializer = Materializer::new(self.graph, self.config.materialize_options());

        info!(
            "Starting output pass for instance '{}' ({} stages, mode: {})",
            instance.name,
            instance.members.len(),
            self.mode_name()
        );

        let mut report = OutputReport::new(&instance.name);

        if self.config.parallel() && !self.config.print_only() {
            let selections: Vec<Result<UnitSelection>> = selection.collect();
            info!("Selected {} units, materializing in parallel", selections.len());
            let fail_fast = self.config.fail_fast();
            let stop = AtomicBool::new(false);
            let results: Vec<UnitResult> = selections
                .into_par_iter()
                .map(|selection| {
                    // Units not yet started once a failure is seen are left alone
                    if stop.load(Ordering::Relaxed) {
                        return UnitResult::default();
                    }
                    let result = self.process_unit(selection, composer.as_ref(), &materializer);
                    if fail_fast && !result.errors.is_empty() {
                        stop.store(true, Ordering::Relaxed);
                    }
                    result
                })
                .collect();
            for result in results {
                if !self.merge(&mut report, result, out)? {
                    break;
                }
            }
        } else {
            for selection in selection {
                let result = self.process_unit(selection, composer.as_ref(), &materializer);
                if !self.merge(&mut report, result, out)? {
                    break;
                }
            }
        }

        report.duration_ms = start.elapsed().as_millis() as u64;
        info!("Output pass finished: {}", report.summary());
        Ok(report)
    }

    fn mode_name(&self) -> &'static str {
        if self.config.print_only() {
            "print-only"
        } else if self.config.materialize_options().dry_run {
            "dry-run"
        } else {
            "materialize"
        }
    }

    fn process_unit(
        &self,
        selection: Result<UnitSelection>,
        composer: Option<&PathComposer<'_>>,
        materializer: &Materializer<'_>,
    ) -> UnitResult {
        let selection = match selection {
            Ok(selection) => selection,
            Err(e) => {
                warn!("Unit enumeration failed: {}", e);
                return UnitResult {
                    errors: vec![e],
                    ..Default::default()
                };
            }
        };

        let mut result = UnitResult {
            unit: Some(selection.unit.id),
            stats: selection.stats,
            selected: selection.outputs.len(),
            errors: selection.errors,
            ..Default::default()
        };
        if selection.outputs.is_empty() {
            return result;
        }

        let Some(composer) = composer else {
            self.print_unit(&selection.outputs, &mut result);
            return result;
        };

        let destinations = match composer.compose_unit(&selection.unit, &selection.outputs) {
            Ok(destinations) => destinations,
            Err(e) => {
                warn!("Skipping unit {}: {}", selection.unit.id, e);
                result.skipped = true;
                result.errors.push(e);
                return result;
            }
        };

        for (output, destination) in selection.outputs.iter().zip(destinations) {
            match materializer.materialize(&output.file, &destination) {
                Ok(materialized) => {
                    if let Some(conflict) = materialized.outcome.conflict(&destination) {
                        result.errors.push(conflict);
                    }
                    if materialized.outcome == Outcome::DryRunReported {
                        result.lines.push(format!(
                            "{} -> {}",
                            materialized.destination.display(),
                            materialized.source.display()
                        ));
                    }
                    result.materialized.push(materialized);
                }
                Err(e) => {
                    warn!("Skipped {}: {}", destination.display(), e);
                    result.errors.push(e);
                }
            }
        }
        result
    }

    fn print_unit(&self, outputs: &[SelectedOutput], result: &mut UnitResult) {
        for output in outputs {
            let path = output.resolved.path.display().to_string();
            if !self.config.include_checksum() {
                result.lines.push(path);
                continue;
            }
            match checksum(&output.resolved) {
                Ok(sum) => result.lines.push(format!("{}\t{}", path, sum)),
                Err(e) => {
                    warn!("Cannot checksum {}: {}", path, e);
                    result.errors.push(e.into());
                }
            }
        }
    }

    /// Fold one unit into the report; `false` stops the pass
    fn merge<W: Write>(&self, report: &mut OutputReport, result: UnitResult, out: &mut W) -> Result<bool> {
        if result.unit.is_some() {
            report.units_seen += 1;
        }
        report.merge_stats(&result.stats);
        report.files_selected += result.selected;
        if result.skipped {
            report.units_skipped += 1;
        }

        for line in &result.lines {
            writeln!(out, "{}", line)?;
        }
        if self.config.print_only() {
            report.printed += result.lines.len();
        }
        for materialized in &result.materialized {
            report.count(&materialized.outcome);
        }
        report.errors.extend(result.errors.iter().map(ReportedError::from));

        if self.config.fail_fast() && !result.errors.is_empty() {
            warn!(
                "Fail-fast: stopping after unit {}",
                result.unit.map_or_else(|| "?".to_string(), |u| u.to_string())
            );
            report.aborted = true;
            return Ok(false);
        }
        Ok(true)
    }
}
