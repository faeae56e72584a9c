use std::path::{Component, Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Resolve an output file name under `dir`: no absolute paths, no `..`, and
/// no symlinks unless `follow_symlinks`, in which case the resolved target
/// must stay under `dir`.
pub fn resolve_output(dir: &Path, name: &Path, policy: PathPolicy) -> Result<PathBuf> {
    if name.as_os_str().is_empty() {
        return Err(Error::UnsafePath("empty file name".into()));
    }
    if name.is_absolute() || name.has_root() {
        return Err(Error::UnsafePath(format!("absolute paths are not allowed: {}", name.display())));
    }
    for comp in name.components() {
        if matches!(comp, Component::ParentDir | Component::Prefix(_)) {
            return Err(Error::UnsafePath(format!("parent traversal not allowed: {}", name.display())));
        }
    }
    let candidate = dir.join(name);
    if !policy.follow_symlinks {
        let mut cur = dir.to_path_buf();
        for comp in name.components() {
            cur.push(comp);
            if std::fs::symlink_metadata(&cur).is_ok_and(|m| m.file_type().is_symlink()) {
                return Err(Error::UnsafePath(format!(
                    "symlink in path (not following): {}",
                    cur.display()
                )));
            }
        }
        return Ok(candidate);
    }

    let dir_can = std::fs::canonicalize(dir)
        .map_err(|e| Error::io(format!("canonicalize {}", dir.display()), e))?;
    // The file itself may not exist yet; its parent must.
    let (resolved, tail) = match std::fs::canonicalize(&candidate) {
        Ok(p) => (p, None),
        Err(_) => {
            let parent = candidate.parent().unwrap_or(dir);
            let p = std::fs::canonicalize(parent)
                .map_err(|e| Error::io(format!("canonicalize {}", parent.display()), e))?;
            (p, candidate.file_name().map(PathBuf::from))
        }
    };
    if !resolved.starts_with(&dir_can) {
        return Err(Error::UnsafePath(format!("path escapes {}: {}", dir.display(), name.display())));
    }
    Ok(match tail {
        Some(t) => resolved.join(t),
        None => resolved,
    })
}
