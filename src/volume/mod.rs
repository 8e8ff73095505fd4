//! Secret volume lifecycle.
//!
//! A volume is a directory named after its id under the mounter's root,
//! optionally backed by its own tmpfs mount, holding the files of a secret
//! bundle plus a metadata file. The directory's existence is the only record
//! that a volume exists.

mod fs;
mod locks;
mod manager;
mod mounter;
#[cfg(target_os = "linux")]
mod tmpfs;

pub use fs::{MemoryFs, OsFs, VolumeFs};
pub use locks::{IdGuard, IdLocks};
pub use manager::{VolumeManager, DEFAULT_DIR_MODE, DEFAULT_FILE_MODE, DEFAULT_METADATA_FILE};
pub use mounter::{Mounter, NoopMounter};
#[cfg(target_os = "linux")]
pub use tmpfs::{TmpfsMounter, DEFAULT_MAX_SIZE_MB, DEFAULT_MOUNT_FLAGS, DEFAULT_MOUNT_MODE};

use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::error::ErrorKind;
use crate::secrets::SecretsError;
use crate::types::SecretSource;

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("volume {0} already exists")]
    AlreadyExists(String),

    #[error("volume {0} does not exist")]
    NotFound(String),

    #[error("no secret producer handles source {0}")]
    UnhandledSource(SecretSource),

    #[error("invalid volume id {0:?}: {1}")]
    InvalidId(String, &'static str),

    #[error("volume root {} does not exist", .0.display())]
    RootUnavailable(PathBuf),

    #[error("cannot read metadata of volume {id}: {source}")]
    MetadataUnreadable {
        id: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupt metadata in volume {id}: {source}")]
    MetadataCorrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Secrets(#[from] SecretsError),

    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl VolumeError {
    pub(crate) fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        Self::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::AlreadyExists(_) => ErrorKind::Conflict,
            Self::NotFound(_) | Self::UnhandledSource(_) => ErrorKind::NotFound,
            Self::InvalidId(..) => ErrorKind::Invalid,
            Self::RootUnavailable(_) => ErrorKind::Unavailable,
            Self::MetadataUnreadable { .. } | Self::MetadataCorrupt { .. } => {
                ErrorKind::DecodeFailure
            }
            Self::Secrets(e) => e.kind(),
            Self::Io { .. } => ErrorKind::IoFailure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_map_to_kinds() {
        assert_eq!(
            VolumeError::AlreadyExists("a".into()).kind(),
            ErrorKind::Conflict
        );
        assert_eq!(
            VolumeError::UnhandledSource(SecretSource::Unknown).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            VolumeError::RootUnavailable("/secrets".into()).kind(),
            ErrorKind::Unavailable
        );
        let transport = VolumeError::from(SecretsError::Discovery("none".into()));
        assert_eq!(transport.kind(), ErrorKind::TransportFailure);
        let io = VolumeError::io("mount", Path::new("/secrets/a"), io::Error::other("EPERM"));
        assert_eq!(io.kind(), ErrorKind::IoFailure);
        assert_eq!(io.to_string(), "mount /secrets/a: EPERM");
    }
}
