//! Configuration I/O (YAML schema v1)
//!
//! ```yaml
//! version: 1
//! selection:
//!   instance: mapping
//!   stages: ["align|bam", "3"]
//!   filter:
//!     sample: "^HG"
//! layout:
//!   root: /results
//!   directory: { mode: group_by_metadata, keys: [sample, lane] }
//!   basename: { mode: as_output }
//!   basename_rewrites:
//!     - { search: "(\\w+)_raw", replacement: "$1_clean" }
//! flags:
//!   dry_run: true
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{BasenameMode, ConfigError, ConfigResult, DirectoryMode, OutputConfig, RewriteRule};

pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// YAML Schema v1
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputConfigV1 {
    /// Schema version (always 1 for v1)
    pub version: u32,

    #[serde(default)]
    pub selection: SelectionSection,

    #[serde(default)]
    pub layout: LayoutSection,

    #[serde(default)]
    pub flags: FlagsSection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SelectionSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stages: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub include_withdrawn: bool,
    #[serde(default)]
    pub include_incomplete: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LayoutSection {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<DirectoryMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub basename: Option<BasenameMode>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub directory_rewrites: Vec<RewriteRule>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub basename_rewrites: Vec<RewriteRule>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagsSection {
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub print_only: bool,
    #[serde(default)]
    pub include_checksum: bool,
    #[serde(default)]
    pub force_overwrite: bool,
    #[serde(default)]
    pub fail_fast: bool,
    #[serde(default)]
    pub parallel: bool,
}

impl OutputConfigV1 {
    /// Parse and version-check a YAML document
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(content)?;
        if value.get("version").is_none() {
            return Err(ConfigError::MissingVersion);
        }

        let export: OutputConfigV1 = serde_yaml::from_value(value)?;
        if !SUPPORTED_VERSIONS.contains(&export.version) {
            return Err(ConfigError::UnsupportedVersion {
                found: export.version,
                supported: SUPPORTED_VERSIONS.to_vec(),
            });
        }
        Ok(export)
    }
}

impl From<OutputConfigV1> for OutputConfig {
    fn from(export: OutputConfigV1) -> Self {
        let OutputConfigV1 {
            selection,
            layout,
            flags,
            ..
        } = export;

        OutputConfig {
            instance: selection.instance.unwrap_or_default(),
            stages: selection.stages,
            metadata_filter: selection.filter,
            include_withdrawn: selection.include_withdrawn,
            include_incomplete: selection.include_incomplete,
            root: layout.root.unwrap_or_default(),
            directory: layout.directory,
            basename: layout.basename,
            directory_rewrites: layout.directory_rewrites,
            basename_rewrites: layout.basename_rewrites,
            dry_run: flags.dry_run,
            print_only: flags.print_only,
            include_checksum: flags.include_checksum,
            force_overwrite: flags.force_overwrite,
            fail_fast: flags.fail_fast,
            parallel: flags.parallel,
        }
    }
}

impl From<OutputConfig> for OutputConfigV1 {
    fn from(config: OutputConfig) -> Self {
        OutputConfigV1 {
            version: 1,
            selection: SelectionSection {
                instance: Some(config.instance).filter(|i| !i.is_empty()),
                stages: config.stages,
                filter: config.metadata_filter,
                include_withdrawn: config.include_withdrawn,
                include_incomplete: config.include_incomplete,
            },
            layout: LayoutSection {
                root: Some(config.root).filter(|r| !r.as_os_str().is_empty()),
                directory: config.directory,
                basename: config.basename,
                directory_rewrites: config.directory_rewrites,
                basename_rewrites: config.basename_rewrites,
            },
            flags: FlagsSection {
                dry_run: config.dry_run,
                print_only: config.print_only,
                include_checksum: config.include_checksum,
                force_overwrite: config.force_overwrite,
                fail_fast: config.fail_fast,
                parallel: config.parallel,
            },
        }
    }
}
