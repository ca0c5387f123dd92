//! Path resolution: confine file access to a task's root directory.
//!
//! Relative paths resolve against the root. Absolute paths are accepted only
//! if they land inside it. Symlinks are resolved through the deepest existing
//! ancestor, so a link pointing out of the root is caught even when the final
//! file does not exist yet.

use std::path::{Component, Path, PathBuf};
use tracing::warn;

/// Error returned when path validation fails.
#[derive(Debug, thiserror::Error)]
pub enum PathValidationError {
    #[error("Path '{path}' is outside the task root")]
    OutsideRoot { path: String },

    #[error("Path traversal detected in '{path}'")]
    PathTraversal { path: String },

    #[error("Failed to canonicalize path '{path}': {reason}")]
    CanonicalizeFailed { path: String, reason: String },
}

/// Resolve `requested` inside `root`.
///
/// Returns the absolute path with symlinks in its existing prefix resolved.
pub fn resolve_in_root(root: &Path, requested: &str) -> Result<PathBuf, PathValidationError> {
    let canonical_root =
        root.canonicalize()
            .map_err(|e| PathValidationError::CanonicalizeFailed {
                path: root.display().to_string(),
                reason: e.to_string(),
            })?;

    let requested_path = Path::new(requested);
    let joined = if requested_path.is_absolute() {
        requested_path.to_path_buf()
    } else {
        canonical_root.join(requested_path)
    };
    let normalized = normalize(&joined).ok_or_else(|| PathValidationError::PathTraversal {
        path: requested.into(),
    })?;

    // Walk up to the deepest ancestor that exists and canonicalize it.
    let mut existing = normalized.as_path();
    let mut rest = Vec::new();
    while !existing.exists() {
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => break,
        }
    }
    let mut resolved =
        existing
            .canonicalize()
            .map_err(|e| PathValidationError::CanonicalizeFailed {
                path: requested.into(),
                reason: e.to_string(),
            })?;
    for name in rest.into_iter().rev() {
        resolved.push(name);
    }

    if !resolved.starts_with(&canonical_root) {
        warn!(
            root = %canonical_root.display(),
            requested,
            "Rejected path outside task root"
        );
        return Err(PathValidationError::OutsideRoot {
            path: requested.into(),
        });
    }
    Ok(resolved)
}

/// Lexically remove `.` and `..`. `None` if `..` climbs past the top.
fn normalize(path: &Path) -> Option<PathBuf> {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Prefix(_) | Component::RootDir => out.push(component.as_os_str()),
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() || out.as_os_str().is_empty() {
                    return None;
                }
            }
            Component::Normal(name) => out.push(name),
        }
    }
    Some(out)
}
