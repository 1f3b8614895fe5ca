//! Shared fixture for integration tests
//!
//! Two linked instances over real files in a temp dir:
//!
//! - `mapping` (fixed source 1): align → sort, units 1 (S1), 2 (S2), 3 (S3, withdrawn)
//! - `calling` (derived source 2, consumes mapping/sort): call, unit 10 ← unit 1
//!
//! Unit 2's sorted bam (file 5) was archived: it is replaced by file 8, which
//! the sort record also lists under the `final` kind.

#![allow(dead_code)]

use pipegraph_output::{OutputConfig, OutputOrchestrator, OutputReport};
use pipegraph_storage::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

pub struct Fixture {
    pub dir: TempDir,
    pub graph: InMemoryGraph,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let archive = dir.path().join("archive");
        fs::create_dir_all(&work).unwrap();
        fs::create_dir_all(&archive).unwrap();

        let write = |path: PathBuf| -> PathBuf {
            fs::write(&path, path.file_name().unwrap().to_string_lossy().as_bytes()).unwrap();
            path
        };
        let file = |id: i64, path: PathBuf, sample: &str| {
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            let mut file = File::new(FileId(id), path).with_metadata("sample", sample);
            if size > 0 {
                file = file.with_size(size);
            }
            file
        };

        let s1_raw = write(work.join("S1.raw.bam"));
        let s1_sorted = write(work.join("S1.sorted.bam"));
        let s1_bai = write(work.join("S1.sorted.bam.bai"));
        let s2_raw = write(work.join("S2.raw.bam"));
        let s3_sorted = write(work.join("S3.sorted.bam"));
        let s1_vcf = write(work.join("S1.vcf.gz"));
        let s2_archived = write(archive.join("S2.sorted.bam"));

        let mut graph = InMemoryGraph::new();
        graph
            .add_source(DataSource::fixed(SourceId(1)))
            .add_source(DataSource::derived(
                SourceId(2),
                vec![UpstreamFeed {
                    instance: InstanceId(1),
                    position: 2,
                }],
            ))
            .add_instance(
                PipelineInstance::new(InstanceId(1), "mapping", SourceId(1))
                    .with_stage("align")
                    .with_stage("sort"),
            )
            .add_instance(PipelineInstance::new(InstanceId(2), "calling", SourceId(2)).with_stage("call"))
            .add_unit(InputUnit::new(UnitId(1), SourceId(1)).with_input("/in/run1/S1/r1.fq"))
            .add_unit(InputUnit::new(UnitId(2), SourceId(1)).with_input("/in/run1/S2/r1.fq"))
            .add_unit(
                InputUnit::new(UnitId(3), SourceId(1))
                    .with_input("/in/run1/S3/r1.fq")
                    .withdrawn(),
            )
            .add_unit(InputUnit::new(UnitId(10), SourceId(2)))
            .add_link(UnitLink {
                parent: UnitId(1),
                child: UnitId(10),
                upstream_instance: InstanceId(1),
            })
            .add_file(file(1, s1_raw, "S1"))
            .add_file(file(2, s1_sorted, "S1"))
            .add_file(file(3, s1_bai, "S1"))
            .add_file(file(4, s2_raw, "S2"))
            .add_file(file(5, work.join("S2.sorted.bam"), "S2").moved_to(FileId(8)))
            .add_file(file(6, s3_sorted, "S3"))
            .add_file(file(7, s1_vcf, "S1"))
            .add_file(file(8, s2_archived, "S2"))
            .add_record(
                StageRecord::new(RecordId(1), InstanceId(1), UnitId(1), 1)
                    .with_output("bam", FileId(1))
                    .with_command("bwa mem ref.fa r1.fq"),
            )
            .add_record(
                StageRecord::new(RecordId(2), InstanceId(1), UnitId(1), 2)
                    .with_output("bam", FileId(2))
                    .with_output("bai", FileId(3))
                    .with_command("samtools sort S1.raw.bam"),
            )
            .add_record(
                StageRecord::new(RecordId(3), InstanceId(1), UnitId(2), 1)
                    .with_output("bam", FileId(4))
                    .with_command("bwa mem ref.fa r1.fq"),
            )
            .add_record(
                StageRecord::new(RecordId(4), InstanceId(1), UnitId(2), 2)
                    .with_output("bam", FileId(5))
                    .with_output("final", FileId(8))
                    .with_command("samtools sort S2.raw.bam"),
            )
            .add_record(StageRecord::new(RecordId(5), InstanceId(1), UnitId(3), 2).with_output("bam", FileId(6)))
            .add_record(
                StageRecord::new(RecordId(6), InstanceId(2), UnitId(10), 1)
                    .with_output("vcf", FileId(7))
                    .with_command("bcftools call S1.sorted.bam"),
            );

        Self { dir, graph }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("results")
    }

    pub fn work(&self, name: &str) -> PathBuf {
        self.dir.path().join("work").join(name)
    }

    /// Validate and run one pass, returning the report and everything written to stdout
    pub fn run(&self, config: OutputConfig) -> (OutputReport, String) {
        let mut out = Vec::new();
        let report = OutputOrchestrator::new(&self.graph, config.validate().unwrap())
            .run(&mut out)
            .unwrap();
        (report, String::from_utf8(out).unwrap())
    }
}
