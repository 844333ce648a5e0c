//! Path-pattern normalization and the symlink boundary rule.
//!
//! Real-path resolution is only accepted when it preserves or narrows the
//! scope of the user-named path. A symlink planted at or under a restricted
//! path must not be able to widen a deny rule onto an unrelated tree.

use std::path::Component;
use std::path::Path;
use std::path::PathBuf;

pub const GLOB_CHARS: &[char] = &['*', '?', '[', ']'];

pub fn contains_glob_chars(pattern: &str) -> bool {
    pattern.contains(GLOB_CHARS)
}

/// Expand a leading `~` or `~/` against the current user's home directory.
pub fn expand_tilde(pattern: &str) -> PathBuf {
    if pattern == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = pattern.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(pattern)
}

/// Normalize a user path pattern to an absolute string suitable for a
/// sandbox rule: tilde expansion, cwd-relative resolution, then real-path
/// resolution subject to the symlink boundary rule. Glob patterns only
/// resolve the static prefix; the glob remainder is spliced back verbatim.
pub fn normalize_path_pattern(pattern: &str, cwd: &Path) -> String {
    let expanded = expand_tilde(pattern);
    let absolute = if expanded.is_absolute() {
        expanded
    } else {
        cwd.join(expanded)
    };
    let flat = lexically_clean(&absolute);

    let text = flat.to_string_lossy().to_string();
    match text.find(GLOB_CHARS) {
        Some(first_meta) => {
            // Resolve the directory containing the first glob segment and
            // splice the rest of the pattern back on.
            let prefix = &text[..first_meta];
            let split = prefix.rfind('/').unwrap_or(0);
            let (dir, rest) = if split == 0 {
                ("/", text[1..].to_string())
            } else {
                (&text[..split], text[split + 1..].to_string())
            };
            let resolved = resolve_within_boundary(Path::new(dir));
            let resolved = resolved.to_string_lossy();
            let resolved = resolved.trim_end_matches('/');
            format!("{resolved}/{rest}")
        }
        None => resolve_within_boundary(&flat).to_string_lossy().to_string(),
    }
}

/// Real-path resolution constrained by the boundary rule. Violations fall
/// back to the original, unresolved path.
pub fn resolve_within_boundary(path: &Path) -> PathBuf {
    match std::fs::canonicalize(path) {
        Ok(resolved) if within_boundary(path, &resolved) => resolved,
        _ => path.to_path_buf(),
    }
}

/// True when `resolved` equals `original`, equals its macOS
/// private-prefixed twin, or is a strict descendant of either. Resolutions
/// to `/`, to single-segment paths, to ancestors, or to unrelated trees
/// are outside the boundary.
pub fn within_boundary(original: &Path, resolved: &Path) -> bool {
    if resolved == original {
        return true;
    }
    if resolved == Path::new("/") {
        return false;
    }
    let anchors = boundary_anchors(original);
    if anchors.iter().any(|anchor| resolved == anchor) {
        return true;
    }
    // Strict descendants only beyond this point; a resolution that is a
    // single segment under / is never a descendant of a non-root anchor
    // unless the anchor itself is /.
    anchors
        .iter()
        .filter(|anchor| anchor.as_path() != Path::new("/"))
        .any(|anchor| resolved.starts_with(anchor))
}

/// The original path plus its `/private`-prefixed (or stripped) twin for
/// the macOS `/tmp` and `/var` symlinks.
fn boundary_anchors(original: &Path) -> Vec<PathBuf> {
    let mut anchors = vec![original.to_path_buf()];
    let text = original.to_string_lossy();
    for bare in ["/tmp", "/var"] {
        let private = format!("/private{bare}");
        if text == *bare || text.starts_with(&format!("{bare}/")) {
            anchors.push(PathBuf::from(format!("/private{text}")));
        } else if text == private || text.starts_with(&format!("{private}/")) {
            if let Some(stripped) = text.strip_prefix("/private") {
                anchors.push(PathBuf::from(stripped));
            }
        }
    }
    anchors
}

/// Remove `.` and resolve `..` components lexically, without touching the
/// filesystem.
fn lexically_clean(path: &Path) -> PathBuf {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => clean.push("/"),
            Component::CurDir => {}
            Component::ParentDir => {
                clean.pop();
            }
            Component::Normal(part) => clean.push(part),
            Component::Prefix(_) => {}
        }
    }
    if clean.as_os_str().is_empty() {
        PathBuf::from("/")
    } else {
        clean
    }
}

/// Every ancestor directory of `path`, nearest first, up to but not
/// including `/`.
pub fn ancestor_directories(path: &Path) -> Vec<PathBuf> {
    let mut ancestors = Vec::new();
    let mut current = path.parent();
    while let Some(dir) = current {
        if dir == Path::new("/") {
            break;
        }
        ancestors.push(dir.to_path_buf());
        current = dir.parent();
    }
    ancestors
}
