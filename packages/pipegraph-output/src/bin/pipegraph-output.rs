//! Pipegraph Output CLI
//!
//! # Usage
//!
//! ```bash
//! # Link every bam of the align stage, grouped by sample, without touching disk
//! pipegraph-output --graph provenance.db materialize --instance mapping \
//!     --stage 'align|bam' --root /results --group-by sample --as-output --dry-run
//!
//! # Same layout from a YAML file
//! pipegraph-output --graph provenance.db materialize --config layout.yaml
//!
//! # Lineage of two files as a multi-line report
//! pipegraph-output --graph provenance.json lineage --file 12 --file 13 \
//!     --fields path,checksum,lineage,commands --format report
//! ```
//!
//! Exit status: 2 on configuration errors, 1 when the graph cannot be opened
//! or a fail-fast run stopped, 0 otherwise.

use anyhow::Context;
use clap::{ArgAction, Args, Parser, Subcommand};
use pipegraph_output::config::{BasenameMode, ConfigError, DirectoryMode, OutputConfig, RewriteRule};
use pipegraph_output::report::{FileQuery, LineageReporter, ReportField, ReportFormat};
use pipegraph_output::selector::MetadataFilter;
use pipegraph_output::{OutputError, OutputOrchestrator};
use pipegraph_storage::{FileId, InMemoryGraph, ProvenanceGraph};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;

#[derive(Parser)]
#[command(name = "pipegraph-output")]
#[command(about = "Materialize pipeline outputs as symlink trees and report their lineage", long_about = None)]
struct Cli {
    /// Provenance graph: SQLite database or JSON snapshot (*.json)
    #[arg(short, long)]
    graph: PathBuf,

    /// More logging (-v debug, -vv trace); RUST_LOG overrides
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Link selected outputs into a destination tree
    Materialize(MaterializeArgs),

    /// Report the lineage of recorded files
    Lineage(LineageArgs),
}

#[derive(Args)]
struct MaterializeArgs {
    /// Pipeline instance name or id
    #[arg(short, long)]
    instance: Option<String>,

    /// YAML configuration (version 1); flags below override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Stage selector: name, position, name|kind or position|kind
    #[arg(short, long = "stage", value_name = "SELECTOR")]
    stages: Vec<String>,

    /// Metadata filter, all must match
    #[arg(short, long = "filter", value_name = "KEY=PATTERN")]
    filters: Vec<String>,

    /// Destination root
    #[arg(short, long)]
    root: Option<PathBuf>,

    /// Directory: deepest common ancestor of the unit's inputs
    #[arg(long, conflicts_with = "group_by")]
    mirror_input: bool,

    /// Directory: one level per metadata key
    #[arg(long, value_name = "KEY,...", value_delimiter = ',')]
    group_by: Option<Vec<String>>,

    /// Basename: producer-assigned name
    #[arg(long, conflicts_with_all = ["as_input", "from_metadata"])]
    as_output: bool,

    /// Basename: input name without extension + TOKEN + output suffix
    #[arg(long, value_name = "TOKEN", conflicts_with = "from_metadata")]
    as_input: Option<String>,

    /// Basename: %key% template + output suffix
    #[arg(long, value_name = "TEMPLATE")]
    from_metadata: Option<String>,

    /// Rewrite applied to each directory segment
    #[arg(long = "dir-rewrite", value_name = "SEARCH=REPLACEMENT")]
    dir_rewrites: Vec<String>,

    /// Rewrite applied to each basename
    #[arg(long = "name-rewrite", value_name = "SEARCH=REPLACEMENT")]
    name_rewrites: Vec<String>,

    /// Report what would be linked without touching the filesystem
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// Print resolved output paths instead of linking
    #[arg(long)]
    print_only: bool,

    /// Append a checksum to print-only lines
    #[arg(long)]
    checksum: bool,

    /// Replace symlinks that point elsewhere (never regular files)
    #[arg(long)]
    force: bool,

    /// Include withdrawn units
    #[arg(long)]
    withdrawn: bool,

    /// Include records of stages that haven't completed
    #[arg(long)]
    incomplete: bool,

    /// Stop at the first unit or file error
    #[arg(long)]
    fail_fast: bool,

    /// Compose and link units on all cores
    #[arg(long)]
    parallel: bool,

    /// Print the run report as JSON on stdout
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct LineageArgs {
    /// File id (repeatable)
    #[arg(long = "file", value_name = "ID", conflicts_with_all = ["search", "instance"])]
    files: Vec<i64>,

    /// Metadata search, key=pattern[,key=pattern...]
    #[arg(long, conflicts_with = "instance")]
    search: Option<String>,

    /// Pipeline instance whose stage outputs to report
    #[arg(long, requires = "stage")]
    instance: Option<String>,

    /// Stage selector within --instance
    #[arg(long, requires = "instance")]
    stage: Option<String>,

    /// Fields: path,size,checksum,metadata,lineage,commands,jobs
    #[arg(long, default_value = "path,lineage")]
    fields: String,

    /// tsv or report
    #[arg(long, default_value = "tsv")]
    format: String,
}

const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

/// How a subcommand that returned normally finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Completed,
    /// Fail-fast stopped the pass
    Aborted,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    let stdout = io::stdout();
    ExitCode::from(run(cli, &mut stdout.lock()))
}

/// Execute one invocation, writing machine-readable output to `out`
fn run<W: Write>(cli: Cli, out: &mut W) -> u8 {
    let graph = match open_graph(&cli.graph) {
        Ok(graph) => graph,
        Err(e) => {
            eprintln!("error: {:#}", e);
            return EXIT_FAILURE;
        }
    };

    let result = match cli.command {
        Commands::Materialize(args) => materialize(graph.as_ref(), args, out),
        Commands::Lineage(args) => lineage(graph.as_ref(), args, out),
    };
    if let Err(e) = &result {
        eprintln!("error: {}", e);
    }
    exit_status(&result)
}

fn exit_status(result: &Result<Status, OutputError>) -> u8 {
    match result {
        Ok(Status::Completed) => 0,
        Ok(Status::Aborted) => EXIT_FAILURE,
        Err(e) if e.is_fatal() => EXIT_CONFIG,
        Err(_) => EXIT_FAILURE,
    }
}

/// Logs go to stderr so stdout stays machine-readable
fn setup_logging(verbose: u8) {
    use tracing_subscriber::EnvFilter;

    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .init();
}

fn open_graph(path: &Path) -> anyhow::Result<Box<dyn ProvenanceGraph>> {
    let is_json = path.extension().map_or(false, |ext| ext == "json");
    if is_json {
        let graph = InMemoryGraph::from_json_file(path)
            .with_context(|| format!("failed to load graph snapshot {}", path.display()))?;
        return Ok(Box::new(graph));
    }
    open_database(path)
}

#[cfg(feature = "sqlite")]
fn open_database(path: &Path) -> anyhow::Result<Box<dyn ProvenanceGraph>> {
    use pipegraph_storage::SqliteProvenanceGraph;

    anyhow::ensure!(path.exists(), "graph database {} does not exist", path.display());
    let graph = SqliteProvenanceGraph::open(path)
        .with_context(|| format!("failed to open graph database {}", path.display()))?;
    Ok(Box::new(graph))
}

#[cfg(not(feature = "sqlite"))]
fn open_database(path: &Path) -> anyhow::Result<Box<dyn ProvenanceGraph>> {
    anyhow::bail!(
        "{} is not a JSON snapshot and SQLite support is not compiled in",
        path.display()
    )
}

// ═══════════════════════════════════════════════════════════════════════════
// materialize
// ═══════════════════════════════════════════════════════════════════════════

fn materialize<W: Write>(graph: &dyn ProvenanceGraph, args: MaterializeArgs, out: &mut W) -> Result<Status, OutputError> {
    let json = args.json;
    let config = build_config(args)?.validate()?;
    let fail_fast = config.fail_fast();
    let orchestrator = OutputOrchestrator::new(graph, config);

    let report = if json {
        // stdout carries only the report document
        let stderr = io::stderr();
        let report = orchestrator.run(&mut stderr.lock())?;
        let rendered = report.to_json().map_err(io::Error::from)?;
        writeln!(out, "{}", rendered)?;
        report
    } else {
        let report = orchestrator.run(out)?;
        for error in &report.errors {
            eprintln!("{}: {}", error.category, error.message);
        }
        info!("{}", report.summary());
        report
    };

    if fail_fast && report.aborted {
        return Ok(Status::Aborted);
    }
    Ok(Status::Completed)
}

fn build_config(args: MaterializeArgs) -> Result<OutputConfig, ConfigError> {
    let mut config = match &args.config {
        Some(path) => OutputConfig::from_yaml(path)?,
        None => OutputConfig::default(),
    };

    if let Some(instance) = args.instance {
        config.instance = instance;
    }
    if let Some(root) = args.root {
        config.root = root;
    }
    config.stages.extend(args.stages);
    for filter in &args.filters {
        let (key, pattern) = filter.split_once('=').ok_or_else(|| ConfigError::InvalidSelector {
            selector: filter.clone(),
            reason: "expected key=pattern".to_string(),
        })?;
        config.metadata_filter.insert(key.to_string(), pattern.to_string());
    }

    if args.mirror_input {
        config.directory = Some(DirectoryMode::MirrorInput);
    } else if let Some(keys) = args.group_by {
        config.directory = Some(DirectoryMode::GroupByMetadata { keys });
    }

    if args.as_output {
        config.basename = Some(BasenameMode::AsOutput);
    } else if let Some(token) = args.as_input {
        config.basename = Some(BasenameMode::AsInput { token });
    } else if let Some(template) = args.from_metadata {
        config.basename = Some(BasenameMode::FromMetadata { template });
    }

    for rule in &args.dir_rewrites {
        config.directory_rewrites.push(rule.parse::<RewriteRule>()?);
    }
    for rule in &args.name_rewrites {
        config.basename_rewrites.push(rule.parse::<RewriteRule>()?);
    }

    config.dry_run |= args.dry_run;
    config.print_only |= args.print_only;
    config.include_checksum |= args.checksum;
    config.force_overwrite |= args.force;
    config.include_withdrawn |= args.withdrawn;
    config.include_incomplete |= args.incomplete;
    config.fail_fast |= args.fail_fast;
    config.parallel |= args.parallel;

    Ok(config)
}

// ═══════════════════════════════════════════════════════════════════════════
// lineage
// ═══════════════════════════════════════════════════════════════════════════

fn lineage<W: Write>(graph: &dyn ProvenanceGraph, args: LineageArgs, out: &mut W) -> Result<Status, OutputError> {
    let fields = ReportField::parse_list(&args.fields)?;
    let format: ReportFormat = args.format.parse()?;

    let query = if !args.files.is_empty() {
        FileQuery::Ids(args.files.into_iter().map(FileId).collect())
    } else if let Some(search) = args.search {
        FileQuery::Search(MetadataFilter::parse(&search)?)
    } else if let (Some(instance), Some(stage)) = (args.instance, args.stage) {
        FileQuery::Stage {
            instance,
            stage: stage.parse()?,
        }
    } else {
        return Err(ConfigError::InvalidSelector {
            selector: String::new(),
            reason: "give --file, --search or --instance with --stage".to_string(),
        }
        .into());
    };

    let entries = LineageReporter::new(graph).write(&query, &fields, format, out)?;

    let failed = entries.iter().filter(|e| e.error.is_some()).count();
    info!("Reported {} files ({} with lookup errors)", entries.len(), failed);
    Ok(Status::Completed)
}
