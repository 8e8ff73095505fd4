//! Flattening a bundle into a single key/value map.
//!
//! Each file is decoded according to its [`SecretType`] as a flat map of
//! string values. When the same key appears in several files the first file
//! seen wins. Files of any other shape are logged and skipped whole: a JSON
//! number or bool is not a string, so it disqualifies its file.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use super::{SecretBundle, SecretsError, SecretsHeader};
use crate::types::SecretType;

/// Accumulates secret files into one map.
#[derive(Debug, Default)]
pub struct Merger {
    merged: BTreeMap<String, String>,
}

impl Merger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one file. Returns false if the file was skipped.
    pub fn add<R: Read>(&mut self, header: &SecretsHeader, reader: R) -> bool {
        if header.is_dir() {
            return false;
        }
        let chunk = match decode_flat_map(reader, header.secret_type) {
            Ok(chunk) => chunk,
            Err(reason) => {
                tracing::debug!(
                    path = %header.path.display(),
                    secret_type = %header.secret_type,
                    "cannot parse secret file: {}",
                    reason
                );
                return false;
            }
        };
        for (key, value) in chunk {
            // Keys seen in an earlier file stay intact.
            self.merged.entry(key).or_insert(value);
        }
        true
    }

    pub fn len(&self) -> usize {
        self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.merged.is_empty()
    }

    pub fn into_map(self) -> BTreeMap<String, String> {
        self.merged
    }

    /// Write the merged map as a JSON object followed by a newline.
    pub fn write_json<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        serde_json::to_writer(&mut writer, &self.merged)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }
}

/// Merge every file in a bundle.
pub fn merge(bundle: &mut dyn SecretBundle) -> Result<BTreeMap<String, String>, SecretsError> {
    let mut merger = Merger::new();
    for entry in bundle.entries()? {
        let mut entry = entry?;
        let header = entry.header().clone();
        merger.add(&header, &mut entry);
    }
    Ok(merger.into_map())
}

/// Merge every file in a bundle and write the result as JSON.
pub fn write_json<W: Write>(bundle: &mut dyn SecretBundle, writer: W) -> Result<(), SecretsError> {
    let merged = Merger {
        merged: merge(bundle)?,
    };
    merged.write_json(writer).map_err(|source| SecretsError::Io {
        context: "cannot encode merged secrets as JSON",
        source,
    })
}

fn decode_flat_map<R: Read>(
    reader: R,
    secret_type: SecretType,
) -> Result<BTreeMap<String, String>, String> {
    match secret_type {
        SecretType::Json => serde_json::from_reader(reader).map_err(|e| e.to_string()),
        SecretType::Yaml => serde_yaml::from_reader(reader).map_err(|e| e.to_string()),
        SecretType::Unknown => Err("unknown secret file type".to_string()),
    }
}
