//! The per-job scratch directory on local fast storage.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rand::Rng;

/// A uniquely named directory owned by this job. Renderers write frames here;
/// the offloader drains it; it is removed (best effort) when the job ends.
#[derive(Debug)]
pub struct ScratchDir {
    path: PathBuf,
}

impl ScratchDir {
    /// Create `<root>/job_<8 hex digits>`.
    pub fn create(root: &Path) -> anyhow::Result<ScratchDir> {
        let suffix: u32 = rand::thread_rng().gen();
        let path = root.join(format!("job_{suffix:08x}"));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("creating scratch directory {}", path.display()))?;
        log::info!("scratch directory: {}", path.display());
        Ok(ScratchDir { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and anything left in it. Failures are logged, not
    /// fatal — a leftover scratch dir is an inconvenience, not a bad render.
    pub fn remove(&self) {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => log::debug!("removed scratch directory {}", self.path.display()),
            Err(e) => log::warn!(
                "could not remove scratch directory {}: {e}",
                self.path.display()
            ),
        }
    }
}
