//! Path naming helpers: common ancestors, segment sanitizing, suffix
//! detection and metadata templates

use once_cell::sync::Lazy;
use pipegraph_storage::File;
use regex::Regex;
use std::path::{Component, Path};

use crate::config::{ConfigError, ConfigResult};

static UNSAFE_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^\w#]").expect("valid regex"));
static COMPRESSED_SUFFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\.([^.]+\.gz)$").expect("valid regex"));

const INDEX_SUFFIX: &str = "bam.bai";

/// Replace every character that is not a word character or `#` with `_`
pub fn sanitize_segment(value: &str) -> String {
    UNSAFE_CHARS.replace_all(value, "_").into_owned()
}

/// Directory segments of `path`'s parent, ignoring root and prefix components
fn directory_segments(path: &Path) -> Vec<String> {
    path.parent()
        .map(|dir| {
            dir.components()
                .filter_map(|c| match c {
                    Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Deepest directory shared by all `paths`, as segments below the root.
///
/// A single path yields its own directory. Returns `None` when the shared
/// prefix is empty.
pub fn common_ancestor<P: AsRef<Path>>(paths: &[P]) -> Option<Vec<String>> {
    let dirs: Vec<Vec<String>> = paths.iter().map(|p| directory_segments(p.as_ref())).collect();
    let shortest = dirs.iter().map(Vec::len).min()?;

    let mut common = Vec::new();
    for depth in 0..shortest {
        let segment = &dirs[0][depth];
        if dirs.iter().all(|d| &d[depth] == segment) {
            common.push(segment.clone());
        } else {
            break;
        }
    }

    if common.is_empty() {
        None
    } else {
        Some(common)
    }
}

/// Suffix used when a basename is rebuilt.
///
/// `x.bam.bai` → `bam.bai`, `x.vcf.gz` → `vcf.gz`, otherwise the final
/// dot-delimited segment. Names without a dot have no suffix.
pub fn detect_suffix(basename: &str) -> Option<&str> {
    if basename.ends_with(INDEX_SUFFIX)
        && basename.len() > INDEX_SUFFIX.len()
        && basename.as_bytes()[basename.len() - INDEX_SUFFIX.len() - 1] == b'.'
    {
        return Some(&basename[basename.len() - INDEX_SUFFIX.len()..]);
    }
    if let Some(caps) = COMPRESSED_SUFFIX.captures(basename) {
        return caps.get(1).map(|m| m.as_str());
    }
    match basename.rsplit_once('.') {
        Some((_, ext)) if !ext.is_empty() => Some(ext),
        _ => None,
    }
}

/// `basename` without its final extension
pub fn strip_extension(basename: &str) -> &str {
    match basename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem,
        _ => basename,
    }
}

/// Append `.suffix` when there is one
pub fn with_suffix(stem: &str, suffix: Option<&str>) -> String {
    match suffix {
        Some(suffix) => format!("{}.{}", stem, suffix),
        None => stem.to_string(),
    }
}

/// First file carrying a value for every key
pub fn first_with_keys<'a, I>(files: I, keys: &[String]) -> Option<&'a File>
where
    I: IntoIterator<Item = &'a File>,
{
    files
        .into_iter()
        .find(|file| keys.iter().all(|key| file.metadata_value(key).is_some()))
}

// ═══════════════════════════════════════════════════════════════════════════
// Template
// ═══════════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, PartialEq, Eq)]
enum Piece {
    Literal(String),
    Key(String),
}

/// A `%key%` basename template, e.g. `%sample%_L%lane%`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    source: String,
    pieces: Vec<Piece>,
    keys: Vec<String>,
}

impl Template {
    pub fn parse(template: &str) -> ConfigResult<Self> {
        let parts: Vec<&str> = template.split('%').collect();
        if parts.len() % 2 == 0 {
            return Err(ConfigError::invalid_template(
                template,
                "placeholders need an even number of '%'",
            ));
        }

        let mut pieces = Vec::new();
        let mut keys = Vec::new();
        for (i, part) in parts.into_iter().enumerate() {
            if i % 2 == 1 {
                if part.is_empty() {
                    return Err(ConfigError::invalid_template(template, "empty placeholder"));
                }
                keys.push(part.to_string());
                pieces.push(Piece::Key(part.to_string()));
            } else if !part.is_empty() {
                if part.contains('/') {
                    return Err(ConfigError::invalid_template(
                        template,
                        "literal text must not contain '/'",
                    ));
                }
                pieces.push(Piece::Literal(part.to_string()));
            }
        }

        if keys.is_empty() {
            return Err(ConfigError::invalid_template(
                template,
                "no metadata placeholder",
            ));
        }

        Ok(Self {
            source: template.to_string(),
            pieces,
            keys,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Metadata keys in order of appearance
    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    /// Fill placeholders with sanitized values; `None` if a key is missing
    pub fn render(&self, file: &File) -> Option<String> {
        let mut out = String::new();
        for piece in &self.pieces {
            match piece {
                Piece::Literal(text) => out.push_str(text),
                Piece::Key(key) => out.push_str(&sanitize_segment(file.metadata_value(key)?)),
            }
        }
        Some(out)
    }
}
