//! Run configuration
//!
//! `OutputConfig` is the raw, user-facing configuration. It is built with the
//! fluent methods below, loaded from YAML (`io`), or assembled from CLI flags.
//! `validate()` checks every cross-field rule once and compiles patterns and
//! templates into a `ValidatedConfig`; nothing runs on an unvalidated config.
//!
//! # Example
//!
//! ```rust
//! use pipegraph_output::config::{BasenameMode, DirectoryMode, OutputConfig};
//!
//! let config = OutputConfig::new("mapping", "/results")
//!     .stage("align|bam")
//!     .directory(DirectoryMode::GroupByMetadata { keys: vec!["sample".into()] })
//!     .basename(BasenameMode::AsOutput)
//!     .dry_run(true)
//!     .validate()
//!     .unwrap();
//!
//! assert!(config.layout().is_some());
//! ```

pub mod error;
pub mod io;

pub use error::{ConfigError, ConfigResult};
pub use io::OutputConfigV1;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::compose::{BasenameLayout, DirectoryLayout, Layout, Rewrite, Template};
use crate::materialize::MaterializeOptions;
use crate::selector::{MetadataFilter, SelectionQuery, StageKindSelector, DEFAULT_PAGE_SIZE};

// ═══════════════════════════════════════════════════════════════════════════
// Modes
// ═══════════════════════════════════════════════════════════════════════════

/// How the destination directory of a unit is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum DirectoryMode {
    /// Deepest common ancestor of the unit's original input paths
    MirrorInput,
    /// One segment per metadata key, in order
    GroupByMetadata { keys: Vec<String> },
}

/// How each destination basename is chosen
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum BasenameMode {
    /// Producer-assigned basename, verbatim
    AsOutput,
    /// Input basename without its extension, plus `token` and the output suffix
    AsInput { token: String },
    /// `%key%` placeholders filled from metadata, plus the output suffix
    FromMetadata { template: String },
}

/// One ordered `(search, replacement)` rewrite
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RewriteRule {
    pub search: String,
    pub replacement: String,
}

impl RewriteRule {
    pub fn new(search: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self {
            search: search.into(),
            replacement: replacement.into(),
        }
    }
}

/// `search=replacement`, split at the first `=`
impl FromStr for RewriteRule {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((search, replacement)) if !search.is_empty() => {
                Ok(Self::new(search, replacement))
            }
            _ => Err(ConfigError::InvalidRewrite(s.to_string())),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// OutputConfig
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutputConfig {
    /// Pipeline instance name (or numeric id)
    pub instance: String,
    /// Stage/kind selectors; empty selects every kind of every stage
    pub stages: Vec<String>,
    /// Metadata key → pattern; all must match
    pub metadata_filter: BTreeMap<String, String>,
    pub include_withdrawn: bool,
    pub include_incomplete: bool,

    pub root: PathBuf,
    pub directory: Option<DirectoryMode>,
    pub basename: Option<BasenameMode>,
    pub directory_rewrites: Vec<RewriteRule>,
    pub basename_rewrites: Vec<RewriteRule>,

    pub dry_run: bool,
    pub print_only: bool,
    pub include_checksum: bool,
    pub force_overwrite: bool,
    pub fail_fast: bool,
    pub parallel: bool,
}

impl OutputConfig {
    pub fn new(instance: impl Into<String>, root: impl Into<PathBuf>) -> Self {
        Self {
            instance: instance.into(),
            root: root.into(),
            ..Default::default()
        }
    }

    /// Load from a YAML file (schema v1)
    pub fn from_yaml(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> ConfigResult<Self> {
        OutputConfigV1::parse(content).map(Self::from)
    }

    pub fn to_yaml(&self) -> ConfigResult<String> {
        Ok(serde_yaml::to_string(&OutputConfigV1::from(self.clone()))?)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Fluent setters
    // ═══════════════════════════════════════════════════════════════════════

    pub fn stage(mut self, selector: impl Into<String>) -> Self {
        self.stages.push(selector.into());
        self
    }

    pub fn filter(mut self, key: impl Into<String>, pattern: impl Into<String>) -> Self {
        self.metadata_filter.insert(key.into(), pattern.into());
        self
    }

    pub fn directory(mut self, mode: DirectoryMode) -> Self {
        self.directory = Some(mode);
        self
    }

    pub fn basename(mut self, mode: BasenameMode) -> Self {
        self.basename = Some(mode);
        self
    }

    pub fn directory_rewrite(mut self, search: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.directory_rewrites.push(RewriteRule::new(search, replacement));
        self
    }

    pub fn basename_rewrite(mut self, search: impl Into<String>, replacement: impl Into<String>) -> Self {
        self.basename_rewrites.push(RewriteRule::new(search, replacement));
        self
    }

    pub fn include_withdrawn(mut self, yes: bool) -> Self {
        self.include_withdrawn = yes;
        self
    }

    pub fn include_incomplete(mut self, yes: bool) -> Self {
        self.include_incomplete = yes;
        self
    }

    pub fn dry_run(mut self, yes: bool) -> Self {
        self.dry_run = yes;
        self
    }

    pub fn print_only(mut self, yes: bool) -> Self {
        self.print_only = yes;
        self
    }

    pub fn include_checksum(mut self, yes: bool) -> Self {
        self.include_checksum = yes;
        self
    }

    pub fn force_overwrite(mut self, yes: bool) -> Self {
        self.force_overwrite = yes;
        self
    }

    pub fn fail_fast(mut self, yes: bool) -> Self {
        self.fail_fast = yes;
        self
    }

    pub fn parallel(mut self, yes: bool) -> Self {
        self.parallel = yes;
        self
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Validation
    // ═══════════════════════════════════════════════════════════════════════

    /// Check all cross-field rules and compile patterns.
    ///
    /// Stage selectors are parsed here but resolved against the instance's
    /// members when the selection starts, still before any side effect.
    pub fn validate(self) -> ConfigResult<ValidatedConfig> {
        if self.instance.trim().is_empty() {
            return Err(ConfigError::MissingInstance);
        }

        if self.print_only {
            if self.dry_run {
                return Err(ConfigError::Conflicting {
                    first: "print_only",
                    second: "dry_run",
                });
            }
            if self.force_overwrite {
                return Err(ConfigError::Conflicting {
                    first: "print_only",
                    second: "force_overwrite",
                });
            }
        } else if self.root.as_os_str().is_empty() {
            return Err(ConfigError::EmptyRoot);
        }

        let stages = self
            .stages
            .iter()
            .map(|s| s.parse::<StageKindSelector>())
            .collect::<ConfigResult<Vec<_>>>()?;
        let metadata = MetadataFilter::new(&self.metadata_filter)?;

        let layout = match (&self.directory, &self.basename) {
            (Some(directory), Some(basename)) => Some(self.compile_layout(directory, basename)?),
            (None, _) if !self.print_only => return Err(ConfigError::MissingMode("directory")),
            (_, None) if !self.print_only => return Err(ConfigError::MissingMode("basename")),
            _ => None,
        };

        Ok(ValidatedConfig {
            stages,
            metadata,
            layout,
            config: self,
        })
    }

    fn compile_layout(
        &self,
        directory: &DirectoryMode,
        basename: &BasenameMode,
    ) -> ConfigResult<Layout> {
        let directory = match directory {
            DirectoryMode::MirrorInput => DirectoryLayout::MirrorInput,
            DirectoryMode::GroupByMetadata { keys } => {
                if keys.is_empty() || keys.iter().any(|k| k.trim().is_empty()) {
                    return Err(ConfigError::EmptyGroupKeys);
                }
                DirectoryLayout::GroupByMetadata { keys: keys.clone() }
            }
        };

        let basename = match basename {
            BasenameMode::AsOutput => BasenameLayout::AsOutput,
            BasenameMode::AsInput { token } => BasenameLayout::AsInput {
                token: token.clone(),
            },
            BasenameMode::FromMetadata { template } => {
                BasenameLayout::FromMetadata(Template::parse(template)?)
            }
        };

        Ok(Layout {
            root: self.root.clone(),
            directory,
            basename,
            directory_rewrites: compile_rewrites(&self.directory_rewrites)?,
            basename_rewrites: compile_rewrites(&self.basename_rewrites)?,
        })
    }
}

fn compile_rewrites(rules: &[RewriteRule]) -> ConfigResult<Vec<Rewrite>> {
    rules.iter().map(Rewrite::new).collect()
}

// ═══════════════════════════════════════════════════════════════════════════
// ValidatedConfig
// ═══════════════════════════════════════════════════════════════════════════

/// A configuration that passed `OutputConfig::validate`
#[derive(Debug, Clone)]
pub struct ValidatedConfig {
    config: OutputConfig,
    stages: Vec<StageKindSelector>,
    metadata: MetadataFilter,
    /// `None` only in print-only runs without modes
    layout: Option<Layout>,
}

impl ValidatedConfig {
    pub fn raw(&self) -> &OutputConfig {
        &self.config
    }

    pub fn instance(&self) -> &str {
        &self.config.instance
    }

    pub fn layout(&self) -> Option<&Layout> {
        self.layout.as_ref()
    }

    pub fn selection_query(&self) -> SelectionQuery {
        SelectionQuery {
            stages: self.stages.clone(),
            metadata: self.metadata.clone(),
            include_withdrawn: self.config.include_withdrawn,
            include_incomplete: self.config.include_incomplete,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn materialize_options(&self) -> MaterializeOptions {
        MaterializeOptions {
            dry_run: self.config.dry_run,
            force_overwrite: self.config.force_overwrite,
        }
    }

    pub fn print_only(&self) -> bool {
        self.config.print_only
    }

    pub fn include_checksum(&self) -> bool {
        self.config.include_checksum
    }

    pub fn fail_fast(&self) -> bool {
        self.config.fail_fast
    }

    pub fn parallel(&self) -> bool {
        self.config.parallel
    }
}
