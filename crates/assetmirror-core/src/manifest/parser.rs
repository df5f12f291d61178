//! Manifest line decoding.
//!
//! Lines follow the checksum-listing convention `<digest>  <path>`. A leading
//! backslash marks an escaped path, in which `\\` stands for a backslash and
//! `\n` for a newline, so any filename fits on one line.

use super::{AssetEntry, ManifestError};
use crate::scope::SCOPE_ROOT;

/// Separator between digest and path
const DELIMITER: &str = "  ";

/// Decode one non-empty manifest line.
pub fn parse_line(line: &str) -> Result<AssetEntry, ManifestError> {
    let (escaped, rest) = match line.strip_prefix('\\') {
        Some(rest) => (true, rest),
        None => (false, line),
    };

    let (digest, raw_path) = rest
        .split_once(DELIMITER)
        .ok_or_else(|| ManifestError::MissingDelimiter(line.to_string()))?;

    let path = if escaped {
        unescape_path(raw_path)
    } else {
        raw_path.to_string()
    };

    let path = normalize_path(&path);
    if has_dot_segment(&path) {
        return Err(ManifestError::DotSegment(path));
    }
    Ok(AssetEntry::new(path, digest))
}

/// Whether the path has a `.` or `..` segment, which URL joining would resolve
/// away
fn has_dot_segment(path: &str) -> bool {
    path.strip_prefix(SCOPE_ROOT)
        .unwrap_or(path)
        .split('/')
        .any(|segment| segment == "." || segment == "..")
}

/// Prefix `./` onto paths that lack it
pub(crate) fn normalize_path(path: &str) -> String {
    if path.starts_with(SCOPE_ROOT) {
        path.to_string()
    } else {
        format!("{}{}", SCOPE_ROOT, path)
    }
}

fn unescape_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            // Unknown sequences pass through untouched
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}
