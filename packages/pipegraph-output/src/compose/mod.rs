//! Destination path composition
//!
//! A destination is `root / directory segments / basename`. The directory is
//! decided once per unit, the basename once per selected file; both come
//! from a mode chosen at configuration time. Any failure skips the whole unit
//! so a unit is either laid out completely or not at all.

pub mod naming;
pub mod rewrite;

pub use naming::{common_ancestor, detect_suffix, sanitize_segment, strip_extension, Template};
pub use rewrite::Rewrite;

use pipegraph_storage::{File, InputUnit};
use std::path::PathBuf;

use crate::error::{OutputError, Result};
use crate::selector::SelectedOutput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirectoryLayout {
    MirrorInput,
    GroupByMetadata { keys: Vec<String> },
}

#[derive(Debug, Clone)]
pub enum BasenameLayout {
    AsOutput,
    AsInput { token: String },
    FromMetadata(Template),
}

/// Compiled path layout
#[derive(Debug, Clone)]
pub struct Layout {
    pub root: PathBuf,
    pub directory: DirectoryLayout,
    pub basename: BasenameLayout,
    pub directory_rewrites: Vec<Rewrite>,
    pub basename_rewrites: Vec<Rewrite>,
}

pub struct PathComposer<'a> {
    layout: &'a Layout,
}

impl<'a> PathComposer<'a> {
    pub fn new(layout: &'a Layout) -> Self {
        Self { layout }
    }

    /// Destination for every output of `unit`, in the same order.
    ///
    /// # Errors
    ///
    /// Per-unit errors: `NoCommonAncestor`, `MissingMetadataKeys`,
    /// `AmbiguousInput`, `InvalidDestination`.
    pub fn compose_unit(&self, unit: &InputUnit, outputs: &[SelectedOutput]) -> Result<Vec<PathBuf>> {
        let directory = self.directory(unit, outputs)?;
        let stem = self.unit_stem(unit, outputs)?;

        outputs
            .iter()
            .map(|output| {
                let name = self.basename(unit, output, stem.as_deref())?;
                Ok(directory.join(name))
            })
            .collect()
    }

    fn directory(&self, unit: &InputUnit, outputs: &[SelectedOutput]) -> Result<PathBuf> {
        let segments = match &self.layout.directory {
            DirectoryLayout::MirrorInput => {
                common_ancestor(&unit.inputs).ok_or_else(|| OutputError::NoCommonAncestor {
                    unit: unit.id,
                    inputs: unit.inputs.clone(),
                })?
            }
            DirectoryLayout::GroupByMetadata { keys } => {
                let file = naming::first_with_keys(candidates(outputs), keys).ok_or_else(|| {
                    OutputError::MissingMetadataKeys {
                        unit: unit.id,
                        keys: keys.clone(),
                    }
                })?;
                keys.iter()
                    .filter_map(|key| file.metadata_value(key))
                    .map(sanitize_segment)
                    .collect()
            }
        };

        let mut directory = self.layout.root.clone();
        for segment in segments {
            let rewritten = rewrite::apply_all(&self.layout.directory_rewrites, &segment);
            // A rewrite may introduce separators; each piece nests one level
            for piece in rewritten.split('/').filter(|p| !p.is_empty()) {
                if piece == "." || piece == ".." {
                    return Err(OutputError::InvalidDestination {
                        unit: unit.id,
                        reason: format!("directory segment '{}' from '{}'", piece, segment),
                    });
                }
                directory.push(piece);
            }
        }
        Ok(directory)
    }

    /// Unit-wide part of the basename, for modes that have one
    fn unit_stem(&self, unit: &InputUnit, outputs: &[SelectedOutput]) -> Result<Option<String>> {
        match &self.layout.basename {
            BasenameLayout::AsOutput => Ok(None),
            BasenameLayout::AsInput { token } => {
                let [input] = unit.inputs.as_slice() else {
                    return Err(OutputError::AmbiguousInput {
                        unit: unit.id,
                        inputs: unit.inputs.len(),
                    });
                };
                let name = input
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .ok_or_else(|| OutputError::InvalidDestination {
                        unit: unit.id,
                        reason: format!("input path {} has no file name", input.display()),
                    })?;
                Ok(Some(format!("{}{}", strip_extension(&name), token)))
            }
            BasenameLayout::FromMetadata(template) => {
                let rendered = naming::first_with_keys(candidates(outputs), template.keys())
                    .and_then(|file| template.render(file))
                    .ok_or_else(|| OutputError::MissingMetadataKeys {
                        unit: unit.id,
                        keys: template.keys().to_vec(),
                    })?;
                Ok(Some(rendered))
            }
        }
    }

    fn basename(&self, unit: &InputUnit, output: &SelectedOutput, stem: Option<&str>) -> Result<String> {
        let produced = output.file.basename().ok_or_else(|| OutputError::InvalidDestination {
            unit: unit.id,
            reason: format!("file {} has no basename", output.file.id),
        })?;

        let name = match stem {
            None => produced.to_string(),
            Some(stem) => naming::with_suffix(stem, detect_suffix(produced)),
        };
        let name = rewrite::apply_all(&self.layout.basename_rewrites, &name);

        if name.is_empty() || name == "." || name == ".." || name.contains('/') {
            return Err(OutputError::InvalidDestination {
                unit: unit.id,
                reason: format!("basename '{}' for file {}", name, output.file.id),
            });
        }
        Ok(name)
    }
}

/// Files whose metadata may drive naming, in selection order: each recorded
/// file, then its resolved replacement when that is a different record
fn candidates(outputs: &[SelectedOutput]) -> impl Iterator<Item = &File> {
    outputs.iter().flat_map(|o| {
        std::iter::once(&o.file).chain((o.resolved.id != o.file.id).then_some(&o.resolved))
    })
}
