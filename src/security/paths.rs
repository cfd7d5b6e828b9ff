//! Path containment for files written under a base directory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is empty after sanitization")]
    Empty,

    #[error("path {0} escapes the storage directory")]
    Escapes(String),
}

/// Strip traversal segments, NUL bytes and empty segments from a relative
/// path. Backslashes are treated as separators.
pub fn sanitize_path(input: &str) -> String {
    input
        .replace('\0', "")
        .replace('\\', "/")
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != "." && *segment != "..")
        .collect::<Vec<_>>()
        .join("/")
}

/// Lexically resolve `.` and `..` without touching the filesystem.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir | Component::Normal(_) => {
                out.push(component.as_os_str())
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if !matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    // `..` above the root stays at the root.
                    continue;
                }
                out.pop();
            }
        }
    }
    out
}

/// True when `candidate`, resolved against `base` if relative, stays inside
/// `base`.
pub fn is_within_base(base: &Path, candidate: &Path) -> bool {
    let base = normalize(base);
    let resolved = if candidate.is_absolute() {
        normalize(candidate)
    } else {
        normalize(&base.join(candidate))
    };
    resolved.starts_with(&base) && resolved != base
}

/// Join a sanitized `relative` onto `base`, refusing anything that would
/// land outside it.
pub fn resolve_within(base: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let clean = sanitize_path(relative);
    if clean.is_empty() {
        return Err(PathError::Empty);
    }
    let full = base.join(&clean);
    if !is_within_base(base, &full) {
        return Err(PathError::Escapes(relative.to_string()));
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_path() {
        assert_eq!(sanitize_path("../../etc/passwd"), "etc/passwd");
        assert_eq!(sanitize_path("a/./b//c"), "a/b/c");
        assert_eq!(sanitize_path("..\\..\\windows\\win.ini"), "windows/win.ini");
        assert_eq!(sanitize_path("img\0.png"), "img.png");
        assert_eq!(sanitize_path("..."), "...");
        assert_eq!(sanitize_path("/../"), "");
    }

    #[test]
    fn test_is_within_base() {
        let base = Path::new("/srv/uploads");
        assert!(is_within_base(base, Path::new("a/b.png")));
        assert!(is_within_base(base, Path::new("/srv/uploads/x/../y.png")));
        assert!(!is_within_base(base, Path::new("../secrets")));
        assert!(!is_within_base(base, Path::new("/srv/uploads-evil/a.png")));
        assert!(!is_within_base(base, Path::new("/srv/uploads/..")));
        assert!(!is_within_base(base, Path::new("/etc/passwd")));
    }

    #[test]
    fn test_resolve_within() {
        let base = Path::new("/srv/uploads");
        assert_eq!(
            resolve_within(base, "../../etc/passwd").unwrap(),
            PathBuf::from("/srv/uploads/etc/passwd")
        );
        assert_eq!(resolve_within(base, "../.."), Err(PathError::Empty));
    }
}
