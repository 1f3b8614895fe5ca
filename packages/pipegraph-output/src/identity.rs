//! File identity resolution through recorded indirections
//!
//! A file record that was moved or replaced keeps an indirection link to its
//! successor. Resolution walks that chain to the physical file.

use pipegraph_storage::{File, FileId, ProvenanceGraph};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::debug;

use crate::error::{OutputError, Result};

/// How far to walk the indirection chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Indirection {
    /// Stop after the first hop
    FirstHop,
    /// Follow to the terminal file
    Terminal,
}

impl From<bool> for Indirection {
    fn from(follow: bool) -> Self {
        if follow {
            Indirection::Terminal
        } else {
            Indirection::FirstHop
        }
    }
}

#[derive(Clone, Copy)]
pub struct FileIdentityResolver<'g> {
    graph: &'g dyn ProvenanceGraph,
}

impl<'g> FileIdentityResolver<'g> {
    pub fn new(graph: &'g dyn ProvenanceGraph) -> Self {
        Self { graph }
    }

    /// Resolve `file` through its indirection chain.
    ///
    /// A file without an indirection resolves to itself. A hop to a missing
    /// record fails with `BrokenChain`; a revisited record fails with
    /// `IndirectionCycle`.
    pub fn resolve(&self, file: &File, mode: impl Into<Indirection>) -> Result<File> {
        let mode = mode.into();
        let mut current = file.clone();
        let mut seen = HashSet::from([current.id]);

        while let Some(next_id) = current.moved_to {
            let next = match self.graph.file(next_id) {
                Ok(next) => next,
                Err(e) if e.is_not_found() => {
                    return Err(OutputError::BrokenChain {
                        file: current.id,
                        missing: next_id,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            if !seen.insert(next.id) {
                return Err(OutputError::IndirectionCycle(next.id));
            }
            debug!("file {} resolved through {} -> {}", file.id, current.id, next.id);
            current = next;
            if mode == Indirection::FirstHop {
                break;
            }
        }

        Ok(current)
    }

    pub fn resolve_id(&self, id: FileId, mode: impl Into<Indirection>) -> Result<File> {
        let file = self.graph.file(id)?;
        self.resolve(&file, mode)
    }

    /// Physical path of the terminal file
    pub fn physical_path(&self, file: &File) -> Result<PathBuf> {
        Ok(self.resolve(file, Indirection::Terminal)?.path)
    }

    /// All records that resolve to `file`: the file itself plus every record
    /// whose indirection chain leads to it, nearest first
    pub fn aliases(&self, file: &File) -> Result<Vec<File>> {
        let mut aliases = vec![file.clone()];
        let mut seen = HashSet::from([file.id]);
        let mut cursor = 0;
        while cursor < aliases.len() {
            let target = aliases[cursor].id;
            for older in self.graph.files_replaced_by(target)? {
                if seen.insert(older.id) {
                    aliases.push(older);
                }
            }
            cursor += 1;
        }
        Ok(aliases)
    }
}
