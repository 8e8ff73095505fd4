//! Secret bundles backed by a gzip compressed tarball.

use std::io::Read;
use std::path::Path;

use flate2::read::GzDecoder;
use tar::Archive;

use super::{EntryKind, SecretBundle, SecretEntries, SecretEntry, SecretsError, SecretsHeader, StopOnError};
use crate::types::{SecretType, Volume};
use crate::volume::VolumeFs;

/// A bundle decoded lazily from a `.tar.gz` stream.
///
/// Only regular files and directories are yielded. Symlinks, devices and
/// other special entries are logged and skipped.
pub struct ArchiveBundle<R: Read> {
    volume: Volume,
    archive: Archive<GzDecoder<R>>,
    secret_type: SecretType,
    consumed: bool,
}

impl<R: Read> ArchiveBundle<R> {
    /// Wrap a gzipped tarball stream. The gzip header is read immediately, so
    /// a stream that is not gzip fails here rather than on first read.
    pub fn new(volume: Volume, reader: R) -> Result<Self, SecretsError> {
        let decoder = GzDecoder::new(reader);
        if decoder.header().is_none() {
            return Err(SecretsError::decode(
                "cannot read gzip header",
                std::io::Error::new(std::io::ErrorKind::InvalidData, "not a gzip stream"),
            ));
        }
        Ok(Self {
            volume,
            archive: Archive::new(decoder),
            secret_type: SecretType::Unknown,
            consumed: false,
        })
    }

    /// Declare the format of the files within the archive.
    pub fn with_secret_type(mut self, secret_type: SecretType) -> Self {
        self.secret_type = secret_type;
        self
    }
}

impl ArchiveBundle<Box<dyn Read + Send>> {
    /// Open a tarball stored on a volume filesystem.
    pub fn open(volume: Volume, fs: &dyn VolumeFs, path: &Path) -> Result<Self, SecretsError> {
        let file = fs.open(path).map_err(|source| SecretsError::Io {
            context: "cannot open secrets archive",
            source,
        })?;
        Self::new(volume, file)
    }
}

impl<R: Read + Send + 'static> SecretBundle for ArchiveBundle<R> {
    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn entries(&mut self) -> Result<SecretEntries<'_>, SecretsError> {
        if self.consumed {
            return Err(SecretsError::Consumed);
        }
        self.consumed = true;

        let secret_type = self.secret_type;
        let volume_id = self.volume.id.clone();
        let entries = self
            .archive
            .entries()
            .map_err(|e| SecretsError::decode("cannot iterate tarball", e))?;

        let iter = entries.filter_map(move |entry| {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    return Some(Err(SecretsError::decode(
                        "cannot iterate to next file in tarball",
                        e,
                    )))
                }
            };
            let path = match entry.path() {
                Ok(path) => path.into_owned(),
                Err(e) => return Some(Err(SecretsError::decode("cannot read entry path", e))),
            };

            let entry_type = entry.header().entry_type();
            let kind = if entry_type.is_dir() {
                EntryKind::Directory
            } else if entry_type.is_file() {
                EntryKind::File
            } else {
                tracing::debug!(
                    volume = %volume_id,
                    path = %path.display(),
                    entry_type = ?entry_type,
                    "ignoring strange file"
                );
                return None;
            };

            tracing::debug!(volume = %volume_id, path = %path.display(), "found file");
            let header = SecretsHeader {
                path,
                kind,
                mode: entry.header().mode().unwrap_or(0),
                size: entry.size(),
                secret_type,
            };
            Some(Ok(SecretEntry::new(header, Box::new(entry))))
        });

        Ok(Box::new(StopOnError::new(iter)))
    }
}
