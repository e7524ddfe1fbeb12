//! Path identity: canonical form, collision-free ids, display names.
//!
//! A registered folder is identified by its canonical path, which is the raw
//! path with trailing separators removed. Ids are an escaped rendering of
//! the canonical path that never contains a path separator, so they are safe
//! as map keys and in display contexts.

use std::path::{Component, Path, PathBuf, is_separator};

/// Stands in for `%` in ids. Escaped itself so distinct paths never collide.
const ESCAPE: char = '_';

/// Bytes left as-is in ids. Everything else is written as `_XX`.
fn is_unreserved(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'!' | b'~' | b'*' | b'\'' | b'(' | b')')
}

/// Remove trailing separators. The root path stays as it is.
pub fn canonicalize(path: impl AsRef<Path>) -> PathBuf {
    let raw = path.as_ref().to_string_lossy();
    let trimmed = raw.trim_end_matches(is_separator);
    if trimmed.is_empty() {
        PathBuf::from(raw.as_ref())
    } else {
        PathBuf::from(trimmed)
    }
}

/// Canonical path rendered as a string.
pub fn canonical_str(path: impl AsRef<Path>) -> String {
    canonicalize(path).to_string_lossy().into_owned()
}

/// Collision-free id for a path, derived from its canonical form.
pub fn identity_of(path: impl AsRef<Path>) -> String {
    let canonical = canonical_str(path);
    let mut id = String::with_capacity(canonical.len() * 2);
    for b in canonical.bytes() {
        if is_unreserved(b) {
            id.push(b as char);
        } else {
            id.push(ESCAPE);
            id.push_str(&format!("{b:02X}"));
        }
    }
    id
}

/// Inverse of [`identity_of`]. Returns `None` for strings that are not ids.
pub fn decode_identity(id: &str) -> Option<PathBuf> {
    let bytes = id.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => {
                let hex = id.get(i + 1..i + 3)?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            },
            b if is_unreserved(b) => {
                out.push(b);
                i += 1;
            },
            _ => return None,
        }
    }
    String::from_utf8(out).ok().map(PathBuf::from)
}

/// Last non-empty segment of the canonical path, or the path itself (root).
pub fn display_name_of(path: impl AsRef<Path>) -> String {
    let canonical = canonical_str(path);
    canonical
        .split(is_separator)
        .rfind(|segment| !segment.is_empty())
        .map(str::to_string)
        .unwrap_or(canonical)
}

/// Parent directory of the canonical path, if any.
pub fn parent_of(path: impl AsRef<Path>) -> Option<PathBuf> {
    canonicalize(path).parent().map(Path::to_path_buf)
}

/// Longest shared leading run of path components.
///
/// Returns `None` for an empty input or when the paths share nothing (for
/// example, relative paths with different first segments).
pub fn common_prefix(paths: &[PathBuf]) -> Option<PathBuf> {
    let (first, rest) = paths.split_first()?;
    let first = canonicalize(first);
    let mut shared: Vec<Component<'_>> = first.components().collect();
    for path in rest {
        let path = canonicalize(path);
        let matching = shared
            .iter()
            .zip(path.components())
            .take_while(|(a, b)| **a == *b)
            .count();
        shared.truncate(matching);
    }
    if shared.is_empty() {
        return None;
    }
    Some(shared.iter().collect())
}

/// Whether `path` equals `ancestor` or lies beneath it.
pub fn is_within(path: impl AsRef<Path>, ancestor: impl AsRef<Path>) -> bool {
    canonicalize(path).starts_with(canonicalize(ancestor))
}
