//! Managed scratch directories under the repository's `tmpdir/`.
//!
//! Dir-tasks run in a scratch directory. With this plugin installed the
//! directory lives under a stable root and is retained when the task fails,
//! so the user can inspect STDOUT/STDERR and partial outputs in place.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use crate::{error::Error, plugins::SessionPlugin, session::Session};

#[derive(Clone)]
pub struct TmpdirManager {
    root: Utf8PathBuf,
}

impl TmpdirManager {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Arc<TmpdirManager> {
        Arc::new(TmpdirManager { root: root.into() })
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// A fresh prefixed scratch directory under the managed root.
    pub fn tempdir(&self) -> Result<Scratch, Error> {
        std::fs::create_dir_all(&self.root)?;
        let dir = tempfile::Builder::new()
            .prefix("mona_")
            .tempdir_in(&self.root)?;
        Scratch::from_tempdir(dir)
    }
}

impl SessionPlugin for TmpdirManager {
    fn name(&self) -> &'static str {
        "tmpdir_manager"
    }

    fn post_enter(&self, sess: &Arc<Session>) -> Result<(), Error> {
        sess.set_tmpdir_manager(Arc::new(self.clone()));
        Ok(())
    }
}

/// A scratch directory, deleted on drop unless explicitly retained.
pub struct Scratch {
    dir: Option<tempfile::TempDir>,
    path: Utf8PathBuf,
}

impl Scratch {
    pub(crate) fn from_tempdir(dir: tempfile::TempDir) -> Result<Scratch, Error> {
        let path = Utf8PathBuf::from_path_buf(dir.path().to_path_buf())
            .map_err(|p| Error::InvalidInput(format!("non-utf8 tmpdir: {}", p.display())))?;
        Ok(Scratch {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Keep the directory on disk and return its path.
    pub fn retain(mut self) -> Utf8PathBuf {
        if let Some(dir) = self.dir.take() {
            let kept = dir.into_path();
            warn!("keeping scratch directory: {}", kept.display());
        }
        self.path.clone()
    }
}
