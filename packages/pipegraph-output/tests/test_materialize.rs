//! End-to-end materialization over a two-instance graph
//!
//! Covers the layout modes, dedup across kinds, withdrawn units, and the
//! never-clobber policy for pre-existing destinations.

#![cfg(unix)]

mod common;

use common::Fixture;
use pipegraph_output::{BasenameMode, DirectoryMode, ErrorCategory, OutputConfig};
use pretty_assertions::assert_eq;
use std::fs;
use std::os::unix::fs::symlink;

fn group_by_sample(fixture: &Fixture) -> OutputConfig {
    OutputConfig::new("mapping", fixture.root())
        .directory(DirectoryMode::GroupByMetadata {
            keys: vec!["sample".into()],
        })
        .basename(BasenameMode::AsOutput)
}

#[test]
fn test_mirror_input_with_input_names() {
    let fixture = Fixture::new();
    let root = fixture.root();
    let config = OutputConfig::new("mapping", &root)
        .stage("sort|bam")
        .directory(DirectoryMode::MirrorInput)
        .basename(BasenameMode::AsInput {
            token: ".sorted".into(),
        });

    let (report, _) = fixture.run(config);

    assert_eq!(report.units_seen, 2);
    assert_eq!(report.created, 2);
    assert!(!report.has_errors());

    let s1 = root.join("in/run1/S1/r1.sorted.bam");
    let s2 = root.join("in/run1/S2/r1.sorted.bam");
    assert_eq!(fs::read_link(&s1).unwrap(), fixture.work("S1.sorted.bam"));
    // Archived file: the link follows the indirection to the terminal copy
    assert_eq!(
        fs::read_link(&s2).unwrap(),
        fixture.path().join("archive/S2.sorted.bam")
    );
    assert_eq!(fs::read_to_string(&s2).unwrap(), "S2.sorted.bam");
}

#[test]
fn test_second_run_creates_nothing() {
    let fixture = Fixture::new();

    let (first, _) = fixture.run(group_by_sample(&fixture));
    assert!(first.created > 0);

    let (second, _) = fixture.run(group_by_sample(&fixture));
    assert_eq!(second.created, 0);
    assert_eq!(second.already_correct, first.created);
    assert_eq!(second.skipped_conflict, 0);
}

#[test]
fn test_duplicate_terminal_file_emitted_once() {
    let fixture = Fixture::new();
    let config = group_by_sample(&fixture).stage("sort");

    let (report, _) = fixture.run(config);

    // S1: bam + bai; S2: bam and final both resolve to the archived copy
    assert_eq!(report.files_considered, 4);
    assert_eq!(report.files_duplicate, 1);
    assert_eq!(report.files_selected, 3);
    assert_eq!(report.created, 3);

    let root = fixture.root();
    assert!(root.join("S1/S1.sorted.bam").is_symlink());
    assert!(root.join("S1/S1.sorted.bam.bai").is_symlink());
    assert!(root.join("S2/S2.sorted.bam").is_symlink());
}

#[test]
fn test_withdrawn_units_are_opt_in() {
    let fixture = Fixture::new();

    let (hidden, _) = fixture.run(group_by_sample(&fixture).stage("sort|bam"));
    assert_eq!(hidden.units_seen, 2);
    assert!(!fixture.root().join("S3").exists());

    let (shown, _) = fixture.run(
        group_by_sample(&fixture)
            .stage("sort|bam")
            .include_withdrawn(true),
    );
    assert_eq!(shown.units_seen, 3);
    assert!(fixture.root().join("S3/S3.sorted.bam").is_symlink());
}

#[test]
fn test_metadata_filter_limits_units() {
    let fixture = Fixture::new();
    let config = group_by_sample(&fixture).stage("align").filter("sample", "^S2$");

    let (report, _) = fixture.run(config);

    assert_eq!(report.created, 1);
    assert_eq!(report.files_filtered_out, 1);
    assert!(fixture.root().join("S2/S2.raw.bam").is_symlink());
    assert!(!fixture.root().join("S1").exists());
}

#[test]
fn test_names_from_metadata_and_rewrites() {
    let fixture = Fixture::new();
    let root = fixture.root();
    let template = "%sample%_final".to_string();
    let config = OutputConfig::new("mapping", &root)
        .stage("sort|bam")
        .directory(DirectoryMode::MirrorInput)
        .basename(BasenameMode::FromMetadata { template })
        .directory_rewrite(r"^run(\d+)$", "batch_$1")
        .basename_rewrite("_final", "");

    let (report, _) = fixture.run(config);

    assert_eq!(report.created, 2);
    assert!(root.join("in/batch_1/S1/S1.bam").is_symlink());
    assert!(root.join("in/batch_1/S2/S2.bam").is_symlink());
}

#[test]
fn test_regular_file_is_never_replaced() {
    let fixture = Fixture::new();
    let blocked = fixture.root().join("S1/S1.sorted.bam");
    fs::create_dir_all(blocked.parent().unwrap()).unwrap();
    fs::write(&blocked, "keep me").unwrap();

    let config = group_by_sample(&fixture).stage("sort").force_overwrite(true);
    let (report, _) = fixture.run(config);

    assert_eq!(report.skipped_conflict, 1);
    assert_eq!(report.created, 2);
    assert_eq!(report.errors.len(), 1);
    assert_eq!(report.errors[0].category, ErrorCategory::PerFile);
    assert!(report.errors[0].message.contains("a regular file exists"));
    assert_eq!(fs::read_to_string(&blocked).unwrap(), "keep me");
}

#[test]
fn test_foreign_symlink_needs_force() {
    let fixture = Fixture::new();
    let dest = fixture.root().join("S1/S1.raw.bam");
    fs::create_dir_all(dest.parent().unwrap()).unwrap();
    symlink("/somewhere/else.bam", &dest).unwrap();

    let (report, _) = fixture.run(group_by_sample(&fixture).stage("align"));
    assert_eq!(report.skipped_conflict, 1);
    assert!(report.errors[0].message.contains("/somewhere/else.bam"));
    assert_eq!(fs::read_link(&dest).unwrap().to_str(), Some("/somewhere/else.bam"));

    let (forced, _) = fixture.run(group_by_sample(&fixture).stage("align").force_overwrite(true));
    assert_eq!(forced.skipped_conflict, 0);
    assert_eq!(fs::read_link(&dest).unwrap(), fixture.work("S1.raw.bam"));
}

#[test]
fn test_dry_run_lists_pairs_without_side_effects() {
    let fixture = Fixture::new();
    let config = group_by_sample(&fixture).stage("align").dry_run(true);

    let (report, out) = fixture.run(config);

    assert_eq!(report.dry_run_reported, 2);
    let lines: Vec<&str> = out.lines().collect();
    assert_eq!(
        lines,
        vec![
            format!(
                "{} -> {}",
                fixture.root().join("S1/S1.raw.bam").display(),
                fixture.work("S1.raw.bam").display()
            ),
            format!(
                "{} -> {}",
                fixture.root().join("S2/S2.raw.bam").display(),
                fixture.work("S2.raw.bam").display()
            ),
        ]
    );
    assert!(!fixture.root().exists());
}

#[test]
fn test_print_only_prints_terminal_paths() {
    let fixture = Fixture::new();
    let config = OutputConfig::new("mapping", "")
        .stage("sort|bam")
        .print_only(true);

    let (report, out) = fixture.run(config);

    assert_eq!(report.printed, 2);
    assert_eq!(
        out,
        format!(
            "{}\n{}\n",
            fixture.work("S1.sorted.bam").display(),
            fixture.path().join("archive/S2.sorted.bam").display()
        )
    );
}

#[test]
fn test_parallel_matches_sequential() {
    let sequential = Fixture::new();
    let parallel = Fixture::new();

    let (a, _) = sequential.run(group_by_sample(&sequential));
    let (b, _) = parallel.run(group_by_sample(&parallel).parallel(true));

    assert_eq!(a.created, b.created);
    assert_eq!(a.files_duplicate, b.files_duplicate);
    assert_eq!(a.units_seen, b.units_seen);
}
