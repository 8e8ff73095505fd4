//! Configuration management for the secret volume service.
//!
//! Configuration is read from environment variables:
//! - `SECRET_VOLUME_SRV` - SRV record naming the secret service endpoints.
//! - `SECRET_VOLUME_NAMESERVER` - Optional. DNS server (`ip:port`) for SRV lookups. Defaults to the system resolver.
//! - `SECRET_VOLUME_BACKENDS` - Comma-separated `host:port` list of secret service endpoints, used when
//!   `SECRET_VOLUME_SRV` is unset. One of the two is required.
//! - `SECRET_VOLUME_HOST` - Optional. Server host. Defaults to `0.0.0.0`.
//! - `SECRET_VOLUME_PORT` - Optional. Server port. Defaults to `10002`.
//! - `SECRET_VOLUME_ROOT` - Optional. Parent directory of all volumes. Defaults to `/secrets`.
//! - `SECRET_VOLUME_VIRTUAL` - Optional. Keep volumes in memory and skip mounting. Defaults to `false`.
//! - `SECRET_VOLUME_TLS_VERIFY` - Optional. Verify the secret service's certificate. Defaults to `false`.
//! - `SECRET_VOLUME_FETCH_TIMEOUT_SECS` - Optional. Secret fetch timeout. Defaults to `15`.
//! - `SECRET_VOLUME_MAX_SIZE_MB` - Optional. Size limit of each tmpfs mount. Defaults to `100`.
//! - `SECRET_VOLUME_MOUNT_MODE` - Optional. Octal mode of each tmpfs mount. Defaults to `700`.
//! - `SECRET_VOLUME_DIR_MODE` - Optional. Octal mode of directories inside a volume. Defaults to `700`.
//! - `SECRET_VOLUME_FILE_MODE` - Optional. Octal mode of files inside a volume. Defaults to `600`.
//! - `SECRET_VOLUME_METADATA_FILE` - Optional. Metadata file name. Defaults to `.meta`.
//! - `SECRET_VOLUME_MERGED_SECRETS_FILE` - Optional. Also write all secrets merged into this JSON file.
//! - `SECRET_VOLUME_SHUTDOWN_GRACE_SECS` - Optional. Graceful shutdown limit. Defaults to `60`.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::util::parse_bool;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Service configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Parent directory of all volumes
    pub root: PathBuf,

    /// In-memory filesystem and no mounts
    pub virtual_fs: bool,

    /// SRV record to discover secret service endpoints from
    pub srv: Option<String>,

    /// DNS server for SRV lookups, instead of the system resolver
    pub nameserver: Option<SocketAddr>,

    /// Static secret service endpoints (`host:port`), when no SRV record is set
    pub backends: Vec<String>,

    pub tls_verify: bool,

    pub fetch_timeout: Duration,

    /// tmpfs size limit, in megabytes
    pub max_size_mb: u64,

    /// tmpfs root directory mode
    pub mount_mode: u32,

    /// Mode of directories created inside a volume
    pub dir_mode: u32,

    /// Mode of files created inside a volume
    pub file_mode: u32,

    pub metadata_file: String,

    pub merged_secrets_file: Option<String>,

    pub shutdown_grace: Duration,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from any variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let srv = var("SECRET_VOLUME_SRV").map(|v| v.trim().to_string());

        let nameserver = match var("SECRET_VOLUME_NAMESERVER") {
            Some(raw) => Some(raw.trim().parse::<SocketAddr>().map_err(|e| {
                ConfigError::InvalidValue("SECRET_VOLUME_NAMESERVER".to_string(), format!("{}", e))
            })?),
            None => None,
        };

        let backends: Vec<String> = var("SECRET_VOLUME_BACKENDS")
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        if srv.is_none() && backends.is_empty() {
            return Err(match var("SECRET_VOLUME_BACKENDS") {
                Some(_) => ConfigError::InvalidValue(
                    "SECRET_VOLUME_BACKENDS".to_string(),
                    "no endpoints listed".to_string(),
                ),
                None => ConfigError::MissingEnvVar(
                    "SECRET_VOLUME_SRV or SECRET_VOLUME_BACKENDS".to_string(),
                ),
            });
        }

        let host = var("SECRET_VOLUME_HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = parse_var(&var, "SECRET_VOLUME_PORT", 10002u16)?;

        let root = var("SECRET_VOLUME_ROOT")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("/secrets"));

        // Real mounts only exist on Linux.
        let virtual_fs = !cfg!(target_os = "linux")
            || var("SECRET_VOLUME_VIRTUAL")
                .map(|v| parse_bool(&v))
                .unwrap_or(false);

        let tls_verify = var("SECRET_VOLUME_TLS_VERIFY")
            .map(|v| parse_bool(&v))
            .unwrap_or(false);

        let fetch_timeout =
            Duration::from_secs(parse_var(&var, "SECRET_VOLUME_FETCH_TIMEOUT_SECS", 15u64)?);

        let max_size_mb = parse_var(&var, "SECRET_VOLUME_MAX_SIZE_MB", 100u64)?;

        let mount_mode = parse_mode(&var, "SECRET_VOLUME_MOUNT_MODE", 0o700)?;
        let dir_mode = parse_mode(&var, "SECRET_VOLUME_DIR_MODE", 0o700)?;
        let file_mode = parse_mode(&var, "SECRET_VOLUME_FILE_MODE", 0o600)?;

        let metadata_file = var("SECRET_VOLUME_METADATA_FILE").unwrap_or_else(|| ".meta".to_string());
        if metadata_file.contains('/') {
            return Err(ConfigError::InvalidValue(
                "SECRET_VOLUME_METADATA_FILE".to_string(),
                "must be a file name, not a path".to_string(),
            ));
        }

        let merged_secrets_file = var("SECRET_VOLUME_MERGED_SECRETS_FILE");

        let shutdown_grace =
            Duration::from_secs(parse_var(&var, "SECRET_VOLUME_SHUTDOWN_GRACE_SECS", 60u64)?);

        Ok(Self {
            host,
            port,
            root,
            virtual_fs,
            srv,
            nameserver,
            backends,
            tls_verify,
            fetch_timeout,
            max_size_mb,
            mount_mode,
            dir_mode,
            file_mode,
            metadata_file,
            merged_secrets_file,
            shutdown_grace,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(root: PathBuf, backends: Vec<String>) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 10002,
            root,
            virtual_fs: true,
            srv: None,
            nameserver: None,
            backends,
            tls_verify: false,
            fetch_timeout: Duration::from_secs(15),
            max_size_mb: 100,
            mount_mode: 0o700,
            dir_mode: 0o700,
            file_mode: 0o600,
            metadata_file: ".meta".to_string(),
            merged_secrets_file: None,
            shutdown_grace: Duration::from_secs(60),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_var<T, V>(var: &V, name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        None => Ok(default),
    }
}

/// Octal permission bits, with or without a leading `0` or `0o`.
fn parse_mode<V>(var: &V, name: &str, default: u32) -> Result<u32, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        Some(raw) => u32::from_str_radix(raw.trim().trim_start_matches("0o"), 8)
            .ok()
            .filter(|mode| *mode <= 0o7777)
            .ok_or_else(|| {
                ConfigError::InvalidValue(name.to_string(), format!("{} is not an octal file mode", raw))
            }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_apply() {
        let config = load(&[("SECRET_VOLUME_BACKENDS", "talos-a:4443, talos-b:4443")]).unwrap();
        assert_eq!(config.backends, vec!["talos-a:4443", "talos-b:4443"]);
        assert_eq!(config.bind_addr(), "0.0.0.0:10002");
        assert_eq!(config.root, PathBuf::from("/secrets"));
        assert_eq!(config.fetch_timeout, Duration::from_secs(15));
        assert_eq!(config.max_size_mb, 100);
        assert_eq!(config.mount_mode, 0o700);
        assert_eq!(config.dir_mode, 0o700);
        assert_eq!(config.file_mode, 0o600);
        assert!(config.srv.is_none());
        assert!(config.nameserver.is_none());
        assert_eq!(config.metadata_file, ".meta");
        assert!(config.merged_secrets_file.is_none());
        assert!(!config.tls_verify);
    }

    #[test]
    fn backends_are_required() {
        assert!(matches!(load(&[]), Err(ConfigError::MissingEnvVar(_))));
        assert!(matches!(
            load(&[("SECRET_VOLUME_BACKENDS", " , ")]),
            Err(ConfigError::InvalidValue(..))
        ));
    }

    #[test]
    fn srv_record_replaces_static_backends() {
        let config = load(&[
            ("SECRET_VOLUME_SRV", "_talos._tcp.example.com"),
            ("SECRET_VOLUME_NAMESERVER", "10.0.0.53:53"),
        ])
        .unwrap();
        assert_eq!(config.srv.as_deref(), Some("_talos._tcp.example.com"));
        assert_eq!(config.nameserver, Some("10.0.0.53:53".parse().unwrap()));
        assert!(config.backends.is_empty());

        let err = load(&[
            ("SECRET_VOLUME_SRV", "_talos._tcp.example.com"),
            ("SECRET_VOLUME_NAMESERVER", "dns.example.com"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref name, _) if name == "SECRET_VOLUME_NAMESERVER"));
    }

    #[test]
    fn overrides_are_parsed() {
        let config = load(&[
            ("SECRET_VOLUME_BACKENDS", "talos:4443"),
            ("SECRET_VOLUME_PORT", "8080"),
            ("SECRET_VOLUME_VIRTUAL", "yes"),
            ("SECRET_VOLUME_TLS_VERIFY", "1"),
            ("SECRET_VOLUME_MOUNT_MODE", "0750"),
            ("SECRET_VOLUME_DIR_MODE", "0o750"),
            ("SECRET_VOLUME_FILE_MODE", "640"),
            ("SECRET_VOLUME_MERGED_SECRETS_FILE", "secrets.json"),
        ])
        .unwrap();
        assert_eq!(config.dir_mode, 0o750);
        assert_eq!(config.file_mode, 0o640);
        assert_eq!(config.port, 8080);
        assert!(config.virtual_fs);
        assert!(config.tls_verify);
        assert_eq!(config.mount_mode, 0o750);
        assert_eq!(config.merged_secrets_file.as_deref(), Some("secrets.json"));
    }

    #[test]
    fn bad_numbers_are_rejected() {
        let err = load(&[
            ("SECRET_VOLUME_BACKENDS", "talos:4443"),
            ("SECRET_VOLUME_PORT", "eighty"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(ref name, _) if name == "SECRET_VOLUME_PORT"));

        let err = load(&[
            ("SECRET_VOLUME_BACKENDS", "talos:4443"),
            ("SECRET_VOLUME_MOUNT_MODE", "999"),
        ])
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(..)));
    }
}
