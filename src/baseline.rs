use std::{
    fs, io,
    io::Write,
    path::{Path, PathBuf},
};
use tracing::debug;

use crate::{compare, toolchain::ToolchainId};

/// Known good disassemblies, one file per (case, toolchain):
/// `<root>/<case>/<toolchain>.txt`.
///
/// Only this type writes baselines. Writes are atomic (temp file + rename) so
/// a killed run never leaves a half-written baseline behind.
#[derive(Clone, Debug)]
pub struct BaselineStore {
    root: PathBuf,
}

impl BaselineStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path(&self, case: &str, toolchain: &ToolchainId) -> PathBuf {
        self.root.join(case).join(format!("{toolchain}.txt"))
    }

    /// `Ok(None)` when no baseline has been made yet
    pub fn read(&self, case: &str, toolchain: &ToolchainId) -> io::Result<Option<String>> {
        match fs::read_to_string(self.path(case, toolchain)) {
            Ok(text) => Ok(Some(text)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Stores the normalized form of `text`, replacing any previous baseline.
    pub fn write(&self, case: &str, toolchain: &ToolchainId, text: &str) -> io::Result<PathBuf> {
        let path = self.path(case, toolchain);
        let dir = path
            .parent()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "baseline has no parent"))?;
        fs::create_dir_all(dir)?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(compare::normalize(text).as_bytes())?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        debug!("wrote {}", path.display());
        Ok(path)
    }
}
