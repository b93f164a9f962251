//! User code written to a temporary host file.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tempfile::TempDir;

use crate::language::Language;

/// A code file in its own temporary directory. The directory and file are
/// deleted when this is dropped, on every exit path.
pub struct CodeFile {
    dir: TempDir,
    path: PathBuf,
}

impl CodeFile {
    pub fn write(code: &str, language: Language) -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("faas-code-")
            .tempdir()
            .context("Failed to create temporary code directory")?;
        let path = dir.path().join(language.code_file_name());
        std::fs::write(&path, code)
            .with_context(|| format!("Failed to write code to {}", path.display()))?;
        Ok(Self { dir, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// Docker bind mounting the file read-only at `container_path`.
    pub fn read_only_bind(&self, container_path: &str) -> String {
        format!("{}:{}:ro", self.path.display(), container_path)
    }
}
