use std::io;
use std::path::{Path, PathBuf};

use crate::types::Volume;

/// Creates and destroys the mount backing each volume directory.
///
/// `path` is a pure function of the id and the root: it does not imply that
/// anything exists there.
pub trait Mounter: Send + Sync {
    /// Mount a filesystem over the volume's (already created) directory.
    fn mount(&self, volume: &Volume) -> io::Result<()>;

    fn unmount(&self, id: &str) -> io::Result<()>;

    /// Parent directory of every volume.
    fn root(&self) -> &Path;

    fn path(&self, id: &str) -> PathBuf {
        self.root().join(id)
    }
}

/// Mounts nothing. Volumes are plain directories under the root.
#[derive(Debug, Clone)]
pub struct NoopMounter {
    root: PathBuf,
}

impl NoopMounter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Mounter for NoopMounter {
    fn mount(&self, volume: &Volume) -> io::Result<()> {
        tracing::debug!(id = %volume.id, "skipping mount");
        Ok(())
    }

    fn unmount(&self, id: &str) -> io::Result<()> {
        tracing::debug!(id = %id, "skipping unmount");
        Ok(())
    }

    fn root(&self) -> &Path {
        &self.root
    }
}
