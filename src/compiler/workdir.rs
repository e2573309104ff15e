//! Disposable per-compile working directories.

use crate::error::CompileError;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

/// Exclusive working directory for one compile; removed on drop.
#[derive(Debug)]
pub struct CompileWorkdir {
    dir: TempDir,
}

impl CompileWorkdir {
    /// Create a fresh directory (under `work_root` when given) and copy each support
    /// directory into it by name.
    pub fn create(work_root: Option<&Path>, support_dirs: &[PathBuf]) -> Result<Self, CompileError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("docforge-");
        let dir = match work_root {
            Some(root) => {
                std::fs::create_dir_all(root)?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| CompileError::Workdir(format!("Failed to create working directory: {}", e)))?;

        for support in support_dirs {
            let Some(name) = support.file_name() else {
                continue;
            };
            copy_tree(support, &dir.path().join(name))?;
        }

        Ok(Self { dir })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn copy_tree(source: &Path, target: &Path) -> Result<(), CompileError> {
    for entry in WalkDir::new(source).follow_links(true) {
        let entry = entry.map_err(|e| {
            CompileError::Workdir(format!("Failed to read {}: {}", source.display(), e))
        })?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|e| CompileError::Workdir(e.to_string()))?;
        let destination = target.join(relative);
        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&destination)?;
        } else {
            std::fs::copy(entry.path(), &destination)?;
        }
    }
    Ok(())
}
