//! Value types for secret volumes and their wire representation.
//!
//! The JSON shape is shared by the metadata file written at each volume's root
//! and by the HTTP API:
//!
//! ```json
//! {"ID": "hash", "Source": "Talos", "Tags": {"tag": ["awesome"]}}
//! ```
//!
//! A volume's credential is only ever accepted on creation (see
//! [`CreateVolumeRequest`]) and is never serialized.

use std::collections::BTreeMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Ordered multi-valued tag map, passed opaquely to secret producers.
pub type Tags = BTreeMap<String, Vec<String>>;

/// Which secret producer should populate a volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum SecretSource {
    /// Volumes with an unknown source are never handled.
    #[default]
    Unknown,
    /// The Talos secret service.
    Talos,
}

impl SecretSource {
    /// Parse a source token. Matching is case-insensitive and anything
    /// unrecognised maps to `Unknown`.
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "talos" => Self::Talos,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::Talos => "Talos",
        }
    }
}

impl fmt::Display for SecretSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SecretSource {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for SecretSource {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

/// Format of the files inside a secret bundle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SecretType {
    #[default]
    Unknown,
    Json,
    Yaml,
}

impl fmt::Display for SecretType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Json => "json",
            Self::Yaml => "yaml",
        };
        f.write_str(s)
    }
}

/// PEM encoded text.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Pem(pub String);

impl Pem {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Pem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Pem({} bytes)", self.0.len())
    }
}

impl From<&str> for Pem {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Client certificate and private key used to authenticate to a remote
/// secret producer while a volume is being created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct KeyPair {
    #[serde(rename = "Certificate")]
    pub certificate: Pem,
    #[serde(rename = "PrivateKey")]
    pub private_key: Pem,
}

impl KeyPair {
    pub fn new(certificate: impl Into<String>, private_key: impl Into<String>) -> Self {
        Self {
            certificate: Pem(certificate.into()),
            private_key: Pem(private_key.into()),
        }
    }

    /// Read a key pair from PEM files on disk.
    pub fn from_files(certificate: &Path, private_key: &Path) -> std::io::Result<Self> {
        Ok(Self::new(
            std::fs::read_to_string(certificate)?,
            std::fs::read_to_string(private_key)?,
        ))
    }

    pub fn is_empty(&self) -> bool {
        self.certificate.is_empty() && self.private_key.is_empty()
    }

    /// Build a TLS client identity from the key pair.
    pub fn identity(&self) -> reqwest::Result<reqwest::Identity> {
        let mut pem = Vec::with_capacity(self.private_key.0.len() + self.certificate.0.len() + 1);
        pem.extend_from_slice(self.private_key.as_bytes());
        pem.push(b'\n');
        pem.extend_from_slice(self.certificate.as_bytes());
        reqwest::Identity::from_pem(&pem)
    }
}

/// A secret volume: a directory in which secrets for one resource (i.e. a
/// container) are stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    /// Unique identifier, also the name of the volume's directory.
    #[serde(rename = "ID")]
    pub id: String,
    /// Which producer fills this volume.
    #[serde(rename = "Source", default)]
    pub source: SecretSource,
    /// Passed to the producer to select or filter secrets.
    #[serde(rename = "Tags", default, deserialize_with = "null_as_default")]
    pub tags: Tags,
    /// Only present while the volume is being created.
    #[serde(skip)]
    pub key_pair: Option<KeyPair>,
}

impl Volume {
    pub fn new(id: impl Into<String>, source: SecretSource) -> Self {
        Self {
            id: id.into(),
            source,
            tags: Tags::new(),
            key_pair: None,
        }
    }

    /// Append a value to a tag.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.entry(key.into()).or_default().push(value.into());
        self
    }

    pub fn with_key_pair(mut self, key_pair: KeyPair) -> Self {
        self.key_pair = Some(key_pair);
        self
    }

    /// A copy of this volume with the credential removed.
    pub fn without_credential(&self) -> Self {
        Self {
            id: self.id.clone(),
            source: self.source,
            tags: self.tags.clone(),
            key_pair: None,
        }
    }

    /// Encode the tags as a URL query string, keys in order.
    pub fn tags_query(&self) -> String {
        let mut pairs = Vec::new();
        for (key, values) in &self.tags {
            for value in values {
                pairs.push(format!(
                    "{}={}",
                    urlencoding::encode(key),
                    urlencoding::encode(value)
                ));
            }
        }
        pairs.join("&")
    }

    /// Write the volume as a single line of JSON.
    pub fn to_json_writer<W: Write>(&self, mut writer: W) -> std::io::Result<()> {
        serde_json::to_writer(&mut writer, self)?;
        writer.write_all(b"\n")?;
        writer.flush()
    }

    pub fn from_json_reader<R: Read>(reader: R) -> serde_json::Result<Self> {
        serde_json::from_reader(reader)
    }
}

impl fmt::Display for Volume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "volume id={} source={} tags={:?}",
            self.id, self.source, self.tags
        )
    }
}

/// Body of a create request: a volume plus the credential used to fetch its
/// secrets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVolumeRequest {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Source", default)]
    pub source: SecretSource,
    #[serde(rename = "Tags", default, deserialize_with = "null_as_default")]
    pub tags: Tags,
    #[serde(rename = "KeyPair", default)]
    pub key_pair: Option<KeyPair>,
}

impl CreateVolumeRequest {
    pub fn into_volume(self) -> Volume {
        Volume {
            id: self.id,
            source: self.source,
            tags: self.tags,
            key_pair: self.key_pair.filter(|kp| !kp.is_empty()),
        }
    }
}

impl From<&Volume> for CreateVolumeRequest {
    fn from(volume: &Volume) -> Self {
        Self {
            id: volume.id.clone(),
            source: volume.source,
            tags: volume.tags.clone(),
            key_pair: volume.key_pair.clone(),
        }
    }
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
