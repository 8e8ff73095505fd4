//! A bundle of exactly one file, for producers that do not serve archives.

use std::io::Read;
use std::path::PathBuf;

use super::{SecretBundle, SecretEntries, SecretEntry, SecretsError, SecretsHeader};
use crate::types::{SecretType, Volume};

pub struct SingleFileBundle<R> {
    volume: Volume,
    name: PathBuf,
    reader: R,
    secret_type: SecretType,
    consumed: bool,
}

impl<R: Read> SingleFileBundle<R> {
    /// Expose `reader` as a bundle holding a single file called `name`.
    pub fn new(volume: Volume, name: impl Into<PathBuf>, reader: R, secret_type: SecretType) -> Self {
        Self {
            volume,
            name: name.into(),
            reader,
            secret_type,
            consumed: false,
        }
    }
}

impl<R: Read + Send> SecretBundle for SingleFileBundle<R> {
    fn volume(&self) -> &Volume {
        &self.volume
    }

    fn entries(&mut self) -> Result<SecretEntries<'_>, SecretsError> {
        if self.consumed {
            return Err(SecretsError::Consumed);
        }
        self.consumed = true;

        let header = SecretsHeader::file(self.name.clone(), self.secret_type);
        let entry = SecretEntry::new(header, Box::new(&mut self.reader));
        Ok(Box::new(std::iter::once(Ok(entry))))
    }
}
