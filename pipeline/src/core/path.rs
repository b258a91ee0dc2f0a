//! Data path resolution and confinement to the permitted data root.
//!
//! Resolution is lexical only: nothing here touches the filesystem. Both `/`
//! and `\` are treated as separators so that paths written for either platform
//! family are judged the same way.

use std::path::{Path, PathBuf};

use crate::core::outcome::{ErrorKind, Failure};
use crate::core::types::{CodeSubmission, DataContext};

/// Default marker token for in-code data path lines (`# FILE_PATH: data.csv`).
pub const DEFAULT_PATH_MARKER: &str = "FILE_PATH";

const COMMENT_PREFIXES: [&str; 3] = ["#", "//", "--"];

/// Resolves the data file for one submission against a fixed root.
#[derive(Debug, Clone)]
pub struct PathResolver<'a> {
    root: &'a Path,
    marker: &'a str,
}

impl<'a> PathResolver<'a> {
    pub fn new(root: &'a Path, marker: &'a str) -> Self {
        Self { root, marker }
    }

    /// Return the validated data path or a `MissingDataPath` failure.
    ///
    /// Precedence: `DataContext.path`, then the submission's extracted marker,
    /// then a scan of the code text.
    pub fn resolve(
        &self,
        data: &DataContext,
        submission: &CodeSubmission,
    ) -> Result<PathBuf, Failure> {
        let raw = data
            .path
            .as_ref()
            .map(|path| path.to_string_lossy().into_owned())
            .or_else(|| submission.embedded_path_marker.clone())
            .or_else(|| find_marker_value(&submission.text, self.marker))
            .ok_or_else(|| {
                missing(format!(
                    "no data path provided (set the data context path or add a `{}: <path>` line)",
                    self.marker
                ))
            })?;
        confine(self.root, &raw).map_err(|reason| missing(format!("{reason}: {raw}")))
    }
}

fn missing(message: String) -> Failure {
    Failure::new(ErrorKind::MissingDataPath, message)
}

/// Value of the first marker line in `text`, matched case-insensitively.
pub fn find_marker_value(text: &str, marker: &str) -> Option<String> {
    text.lines().find_map(|line| marker_value(line, marker))
}

/// Code with every marker line removed, ready for execution.
pub fn strip_marker_lines(text: &str, marker: &str) -> String {
    text.lines()
        .filter(|line| marker_value(line, marker).is_none())
        .collect::<Vec<_>>()
        .join("\n")
}

fn marker_value(line: &str, marker: &str) -> Option<String> {
    if marker.is_empty() {
        return None;
    }
    let mut rest = line.trim_start();
    while let Some(stripped) = COMMENT_PREFIXES
        .iter()
        .find_map(|prefix| rest.strip_prefix(prefix))
    {
        rest = stripped.trim_start();
    }
    let head = rest.get(..marker.len())?;
    if !head.eq_ignore_ascii_case(marker) {
        return None;
    }
    let after = rest[marker.len()..].trim_start();
    let value = after
        .strip_prefix(':')
        .or_else(|| after.strip_prefix('='))?
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '`' | '[' | ']' | '<' | '>'))
        .trim();
    (!value.is_empty()).then(|| value.to_string())
}

/// Lexically confine `raw` to `root`, returning the absolute path.
fn confine(root: &Path, raw: &str) -> Result<PathBuf, &'static str> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err("empty data path");
    }
    if trimmed.to_ascii_lowercase().contains("%2e%2e") {
        return Err("encoded traversal segment");
    }

    let candidate = Segments::parse(trimmed);
    if candidate.parts.iter().any(|part| part == "..") {
        return Err("path traversal segment");
    }

    let root = Segments::parse(&root.to_string_lossy());
    let resolved = if candidate.absolute {
        candidate
    } else {
        Segments {
            absolute: root.absolute,
            parts: root
                .parts
                .iter()
                .cloned()
                .chain(candidate.parts)
                .collect(),
        }
    };

    if !resolved.starts_with(&root) {
        return Err("path escapes the data root");
    }
    if resolved.parts.len() == root.parts.len() {
        return Err("path names the data root itself");
    }
    Ok(resolved.to_path_buf())
}

/// Normalized path: `.` and empty segments dropped, separators unified.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Segments {
    absolute: bool,
    parts: Vec<String>,
}

impl Segments {
    fn parse(raw: &str) -> Self {
        let unified = raw.replace('\\', "/");
        let absolute = unified.starts_with('/') || has_drive_prefix(&unified);
        let parts = unified
            .split('/')
            .filter(|part| !part.is_empty() && *part != ".")
            .map(str::to_string)
            .collect();
        Self { absolute, parts }
    }

    fn starts_with(&self, root: &Segments) -> bool {
        self.absolute == root.absolute
            && self.parts.len() >= root.parts.len()
            && self
                .parts
                .iter()
                .zip(&root.parts)
                .all(|(part, root_part)| segment_eq(part, root_part))
    }

    fn to_path_buf(&self) -> PathBuf {
        let joined = self.parts.join("/");
        if self.absolute && !has_drive_prefix(&joined) {
            PathBuf::from(format!("/{joined}"))
        } else {
            PathBuf::from(joined)
        }
    }
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Drive letters compare case-insensitively; other segments exactly.
fn segment_eq(part: &str, root_part: &str) -> bool {
    if has_drive_prefix(part) && part.len() == 2 {
        part.eq_ignore_ascii_case(root_part)
    } else {
        part == root_part
    }
}
