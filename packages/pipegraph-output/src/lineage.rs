//! Causal chain reconstruction across linked pipeline instances
//!
//! For a record at (instance, unit, position) the chain is: the chains of
//! every upstream record this unit was derived from (in link declaration
//! order), followed by this instance's own records for positions 1..=position.

use pipegraph_storage::{InstanceId, ProvenanceGraph, StageRecord, UnitId};
use tracing::debug;

use crate::error::{OutputError, Result};

#[derive(Clone, Copy)]
pub struct LineageResolver<'g> {
    graph: &'g dyn ProvenanceGraph,
}

impl<'g> LineageResolver<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph) -> Self {
        Self { graph }
    }

    /// Ordered list of all records that causally contributed to `record`,
    /// earliest first, ending with `record` itself.
    ///
    /// # Errors
    ///
    /// `IncompleteLineage` when any expected completed record is missing;
    /// `LineageCycle` if unit links loop back on themselves.
    pub fn chain(&self, record: &StageRecord) -> Result<Vec<StageRecord>> {
        let mut visiting = Vec::new();
        let mut chain = Vec::new();
        self.collect(
            record.instance,
            record.unit,
            record.position,
            Some(record),
            &mut visiting,
            &mut chain,
        )?;
        debug!(
            "lineage of record {}: {} records",
            record.id,
            chain.len()
        );
        Ok(chain)
    }

    fn collect(
        &self,
        instance_id: InstanceId,
        unit: UnitId,
        target: u32,
        terminal: Option<&StageRecord>,
        visiting: &mut Vec<(InstanceId, UnitId)>,
        chain: &mut Vec<StageRecord>,
    ) -> Result<()> {
        if visiting.contains(&(instance_id, unit)) {
            return Err(OutputError::LineageCycle {
                instance: instance_id,
                unit,
            });
        }
        visiting.push((instance_id, unit));

        let instance = self.graph.instance(instance_id)?;
        let source = self.graph.source(instance.source)?;

        if source.is_derived() {
            for link in self.graph.links_to_child(unit)? {
                // Links from instances this source doesn't consume are ignored
                let Some(position) = source.feed_from(link.upstream_instance) else {
                    continue;
                };
                self.collect(
                    link.upstream_instance,
                    link.parent,
                    position,
                    None,
                    visiting,
                    chain,
                )?;
            }
        }

        let missing = |position| OutputError::IncompleteLineage {
            instance: instance_id,
            unit,
            position,
        };

        if instance.member(target).is_none() {
            return Err(missing(target));
        }

        for member in instance.ordered_members() {
            if member.position > target {
                break;
            }
            let record = match terminal {
                Some(record) if member.position == target => record.clone(),
                _ => self
                    .graph
                    .stage_record(instance_id, unit, member.position, false)?
                    .ok_or_else(|| missing(member.position))?,
            };
            chain.push(record);
        }

        visiting.pop();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipegraph_storage::*;
    use pretty_assertions::assert_eq;

    /// mapping (fixed source, 3 stages) feeds calling (derived, 2 stages)
    /// with mapping's stage 3 output
    fn linked_graph() -> InMemoryGraph {
        let mut graph = InMemoryGraph::new();
        graph
            .add_source(DataSource::fixed(SourceId(1)))
            .add_source(DataSource::derived(
                SourceId(2),
                vec![UpstreamFeed {
                    instance: InstanceId(1),
                    position: 3,
                }],
            ))
            .add_instance(
                PipelineInstance::new(InstanceId(1), "mapping", SourceId(1))
                    .with_stage("align")
                    .with_stage("sort")
                    .with_stage("markdup"),
            )
            .add_instance(
                PipelineInstance::new(InstanceId(2), "calling", SourceId(2))
                    .with_stage("call")
                    .with_stage("filter"),
            )
            .add_unit(InputUnit::new(UnitId(1), SourceId(1)))
            .add_unit(InputUnit::new(UnitId(2), SourceId(2)))
            .add_link(UnitLink {
                parent: UnitId(1),
                child: UnitId(2),
                upstream_instance: InstanceId(1),
            });

        let mut id = 0;
        for position in 1..=3 {
            id += 1;
            graph.add_record(StageRecord::new(RecordId(id), InstanceId(1), UnitId(1), position));
        }
        for position in 1..=2 {
            id += 1;
            graph.add_record(StageRecord::new(RecordId(id), InstanceId(2), UnitId(2), position));
        }
        graph
    }

    fn ids(chain: &[StageRecord]) -> Vec<i64> {
        chain.iter().map(|r| r.id.0).collect()
    }

    #[test]
    fn test_single_instance_two_stages() {
        let graph = linked_graph();
        let resolver = LineageResolver::new(&graph);

        let stage2 = graph
            .stage_record(InstanceId(1), UnitId(1), 2, false)
            .unwrap()
            .unwrap();
        let chain = resolver.chain(&stage2).unwrap();
        assert_eq!(ids(&chain), vec![1, 2]);
    }

    #[test]
    fn test_upstream_chain_comes_first() {
        let graph = linked_graph();
        let resolver = LineageResolver::new(&graph);

        let filter = graph
            .stage_record(InstanceId(2), UnitId(2), 2, false)
            .unwrap()
            .unwrap();
        let chain = resolver.chain(&filter).unwrap();
        assert_eq!(ids(&chain), vec![1, 2, 3, 4, 5]);

        // Deterministic across invocations
        assert_eq!(resolver.chain(&filter).unwrap(), chain);
    }

    #[test]
    fn test_unregistered_upstream_link_is_ignored() {
        let mut graph = linked_graph();
        graph
            .add_source(DataSource::fixed(SourceId(3)))
            .add_instance(PipelineInstance::new(InstanceId(3), "other", SourceId(3)).with_stage("x"))
            .add_unit(InputUnit::new(UnitId(3), SourceId(3)))
            .add_link(UnitLink {
                parent: UnitId(3),
                child: UnitId(2),
                upstream_instance: InstanceId(3),
            });
        let resolver = LineageResolver::new(&graph);

        let call = graph
            .stage_record(InstanceId(2), UnitId(2), 1, false)
            .unwrap()
            .unwrap();
        assert_eq!(ids(&resolver.chain(&call).unwrap()), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_missing_upstream_record_is_incomplete() {
        let mut graph = linked_graph();
        graph.add_record(StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2).incomplete());
        let resolver = LineageResolver::new(&graph);

        let call = graph
            .stage_record(InstanceId(2), UnitId(2), 1, false)
            .unwrap()
            .unwrap();
        let err = resolver.chain(&call).unwrap_err();
        assert!(matches!(
            err,
            OutputError::IncompleteLineage {
                instance: InstanceId(1),
                unit: UnitId(1),
                position: 2
            }
        ));
    }

    #[test]
    fn test_link_cycle_is_detected() {
        let mut graph = InMemoryGraph::new();
        graph
            .add_source(DataSource::derived(
                SourceId(1),
                vec![UpstreamFeed {
                    instance: InstanceId(1),
                    position: 1,
                }],
            ))
            .add_instance(PipelineInstance::new(InstanceId(1), "loop", SourceId(1)).with_stage("a"))
            .add_unit(InputUnit::new(UnitId(1), SourceId(1)))
            .add_link(UnitLink {
                parent: UnitId(1),
                child: UnitId(1),
                upstream_instance: InstanceId(1),
            })
            .add_record(StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1));
        let resolver = LineageResolver::new(&graph);

        let record = graph
            .stage_record(InstanceId(1), UnitId(1), 1, false)
            .unwrap()
            .unwrap();
        assert!(matches!(
            resolver.chain(&record),
            Err(OutputError::LineageCycle { .. })
        ));
    }
}
