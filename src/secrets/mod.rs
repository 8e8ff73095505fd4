//! Secret bundles and the producers that fetch them.
//!
//! A [`SecretBundle`] is a single-pass, lazily decoded sequence of files and
//! directories produced for one volume. It mirrors the shape of a tar
//! archive: [`SecretBundle::entries`] yields one [`SecretEntry`] per file or
//! directory (`None` marks the end of the sequence), and each entry is a
//! [`Read`] over that file's bytes only (`Ok(0)` marks the end of the entry).
//!
//! ```text
//! SecretProducer::produce(volume) ──► Box<dyn SecretBundle>
//!                                        │ entries()
//!                                        ▼
//!                           SecretEntry { header, bytes } ...
//! ```
//!
//! Bundles are consumed at most once. Dropping a bundle, or calling
//! [`SecretBundle::close`], releases the decoder and any transport behind it.

mod archive;
pub mod merge;
mod producer;
mod remote;
mod single;

pub use archive::ArchiveBundle;
pub use merge::{merge, write_json, Merger};
pub use producer::{ProducerRegistry, SecretProducer};
pub use remote::{
    LoadBalancer, RemoteProducer, SrvLoadBalancer, StaticLoadBalancer, DEFAULT_FETCH_TIMEOUT,
};
pub use single::SingleFileBundle;

use std::fmt;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::error::ErrorKind;
use crate::types::{SecretType, Volume};

#[derive(Debug, Error)]
pub enum SecretsError {
    #[error("secret bundle has already been consumed")]
    Consumed,

    #[error("{context}: {source}")]
    Decode {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("refusing unsafe secret path {}", .0.display())]
    UnsafePath(PathBuf),

    #[error("cannot resolve secret service endpoint: {0}")]
    Discovery(String),

    #[error("volume {0} has no credential")]
    MissingCredential(String),

    #[error("cannot build HTTP client for volume {id}: {source}")]
    Credential {
        id: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("cannot fetch secrets from {url}: {source}")]
    Fetch {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("secret service at {url} responded with status {status}")]
    Status { url: String, status: u16 },

    #[error("fetching secrets from {url} timed out after {timeout:?}")]
    Timeout { url: String, timeout: Duration },

    #[error("fetching secrets from {url} was cancelled")]
    Cancelled { url: String },

    #[error("{context}: {source}")]
    Io {
        context: &'static str,
        #[source]
        source: io::Error,
    },
}

impl SecretsError {
    pub(crate) fn decode(context: &'static str, source: io::Error) -> Self {
        Self::Decode { context, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Consumed | Self::Decode { .. } | Self::UnsafePath(_) => ErrorKind::DecodeFailure,
            Self::Discovery(_)
            | Self::MissingCredential(_)
            | Self::Credential { .. }
            | Self::Fetch { .. }
            | Self::Status { .. }
            | Self::Timeout { .. }
            | Self::Cancelled { .. } => ErrorKind::TransportFailure,
            Self::Io { .. } => ErrorKind::IoFailure,
        }
    }
}

/// Whether an entry is a regular file or a directory. Anything else never
/// leaves a bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
}

/// Describes one file or directory within a bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecretsHeader {
    /// Path relative to the volume root; may contain subdirectories.
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Permission bits as recorded by the producer, 0 when it has none.
    pub mode: u32,
    /// Size in bytes when known up front, 0 otherwise.
    pub size: u64,
    pub secret_type: SecretType,
}

impl SecretsHeader {
    pub fn file(path: impl Into<PathBuf>, secret_type: SecretType) -> Self {
        Self {
            path: path.into(),
            kind: EntryKind::File,
            mode: 0,
            size: 0,
            secret_type,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// The entry path with `.` components removed, refusing anything that
    /// could escape the volume root. An empty result names the root itself.
    pub fn relative_path(&self) -> Result<PathBuf, SecretsError> {
        sanitize_entry_path(&self.path)
    }
}

/// One file or directory in a bundle. Reading yields the file's bytes and
/// then `Ok(0)`; directories read as empty.
pub struct SecretEntry<'a> {
    header: SecretsHeader,
    reader: Box<dyn Read + 'a>,
}

impl<'a> SecretEntry<'a> {
    pub fn new(header: SecretsHeader, reader: Box<dyn Read + 'a>) -> Self {
        Self { header, reader }
    }

    pub fn header(&self) -> &SecretsHeader {
        &self.header
    }
}

impl Read for SecretEntry<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.header.is_dir() {
            return Ok(0);
        }
        self.reader.read(buf)
    }
}

impl fmt::Debug for SecretEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretEntry")
            .field("header", &self.header)
            .finish_non_exhaustive()
    }
}

/// Lazy sequence of entries borrowed from a bundle.
pub type SecretEntries<'a> = Box<dyn Iterator<Item = Result<SecretEntry<'a>, SecretsError>> + 'a>;

/// A set of secret files produced for a volume.
pub trait SecretBundle: Send {
    /// The volume these secrets were produced for.
    fn volume(&self) -> &Volume;

    /// Start the single pass over the bundle's entries. Calling this a second
    /// time fails with [`SecretsError::Consumed`]. The first error yielded
    /// ends the sequence.
    fn entries(&mut self) -> Result<SecretEntries<'_>, SecretsError>;

    /// Release the decoder and any transport behind the bundle.
    fn close(self: Box<Self>) {}
}

/// Ends an entry iterator after the first error it yields.
pub(crate) struct StopOnError<I> {
    inner: I,
    failed: bool,
}

impl<I> StopOnError<I> {
    pub(crate) fn new(inner: I) -> Self {
        Self {
            inner,
            failed: false,
        }
    }
}

impl<T, I> Iterator for StopOnError<I>
where
    I: Iterator<Item = Result<T, SecretsError>>,
{
    type Item = Result<T, SecretsError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        let item = self.inner.next()?;
        if item.is_err() {
            self.failed = true;
        }
        Some(item)
    }
}

fn sanitize_entry_path(path: &Path) -> Result<PathBuf, SecretsError> {
    let mut clean = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(SecretsError::UnsafePath(path.to_path_buf()));
            }
        }
    }
    Ok(clean)
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_current_dir_components() {
        assert_eq!(
            sanitize_entry_path(Path::new("./a/./b.yaml")).unwrap(),
            PathBuf::from("a/b.yaml")
        );
        assert_eq!(sanitize_entry_path(Path::new("./")).unwrap(), PathBuf::new());
    }

    #[test]
    fn sanitize_rejects_escapes() {
        assert!(matches!(
            sanitize_entry_path(Path::new("../etc/passwd")),
            Err(SecretsError::UnsafePath(_))
        ));
        assert!(matches!(
            sanitize_entry_path(Path::new("/etc/passwd")),
            Err(SecretsError::UnsafePath(_))
        ));
        assert!(matches!(
            sanitize_entry_path(Path::new("a/../../b")),
            Err(SecretsError::UnsafePath(_))
        ));
    }

    #[test]
    fn stop_on_error_ends_sequence() {
        let items: Vec<Result<u8, SecretsError>> = vec![
            Ok(1),
            Err(SecretsError::Consumed),
            Ok(2),
        ];
        let collected: Vec<_> = StopOnError::new(items.into_iter()).collect();
        assert_eq!(collected.len(), 2);
        assert!(collected[1].is_err());
    }

    #[test]
    fn transport_and_decode_errors_are_classified() {
        let timeout = SecretsError::Timeout {
            url: "https://x".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert_eq!(timeout.kind(), ErrorKind::TransportFailure);
        let decode = SecretsError::decode("bad", io::Error::other("x"));
        assert_eq!(decode.kind(), ErrorKind::DecodeFailure);
    }
}
