//! Secret producer backed by a remote HTTPS secret service (Talos).
//!
//! ```text
//! LoadBalancer::next_endpoint() ──► GET https://{endpoint}?{tags}
//!                                   (client cert = volume key pair)
//!                                        │
//!                                        ▼
//!                 response body ──► gzip ──► tar ──► ArchiveBundle
//! ```
//!
//! Endpoints come from a [`LoadBalancer`]: an SRV record looked up per fetch,
//! or a fixed list.
//!
//! The whole exchange, body included, is bounded by a timeout. A
//! cancellation token aborts the request while it is in flight and truncates
//! the body afterwards; either way the connection is dropped. The body is
//! decoded lazily as the volume manager consumes the bundle.
//!
//! Server certificates are not verified by default: endpoints come from
//! trusted internal discovery rather than public PKI. Verification can be
//! enabled with [`RemoteProducer::with_tls_verification`].

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use rand::seq::SliceRandom;
use tokio_util::io::{StreamReader, SyncIoBridge};
use tokio_util::sync::CancellationToken;

use super::{ArchiveBundle, SecretBundle, SecretProducer, SecretsError};
use crate::types::{SecretType, Volume};

/// Upper bound on how long a fetch may take to produce a response.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

type BodyStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Resolves the address of a secret service backend.
#[async_trait]
pub trait LoadBalancer: Send + Sync {
    /// The `host:port` to send the next request to.
    async fn next_endpoint(&self) -> Result<String, SecretsError>;
}

/// Picks uniformly at random from a fixed set of endpoints.
#[derive(Debug, Clone)]
pub struct StaticLoadBalancer {
    endpoints: Vec<String>,
}

impl StaticLoadBalancer {
    pub fn new<I, S>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            endpoints: endpoints.into_iter().map(Into::into).collect(),
        }
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }
}

#[async_trait]
impl LoadBalancer for StaticLoadBalancer {
    async fn next_endpoint(&self) -> Result<String, SecretsError> {
        self.endpoints
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| SecretsError::Discovery("no secret service endpoints configured".into()))
    }
}

/// Looks up an SRV record on every call and picks one of its targets at
/// random. Priorities and weights are ignored.
pub struct SrvLoadBalancer {
    name: String,
    resolver: TokioAsyncResolver,
}

impl SrvLoadBalancer {
    /// Resolve `name` with the system resolver, or with `nameserver` alone
    /// when one is given.
    pub fn new(name: impl Into<String>, nameserver: Option<SocketAddr>) -> Result<Self, SecretsError> {
        let resolver = match nameserver {
            Some(addr) => {
                let servers = NameServerConfigGroup::from_ips_clear(&[addr.ip()], addr.port(), true);
                TokioAsyncResolver::tokio(
                    ResolverConfig::from_parts(None, vec![], servers),
                    ResolverOpts::default(),
                )
            }
            None => TokioAsyncResolver::tokio_from_system_conf().map_err(|e| {
                SecretsError::Discovery(format!("cannot read system resolver configuration: {}", e))
            })?,
        };
        Ok(Self {
            name: name.into(),
            resolver,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for SrvLoadBalancer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SrvLoadBalancer")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl LoadBalancer for SrvLoadBalancer {
    async fn next_endpoint(&self) -> Result<String, SecretsError> {
        let lookup = self
            .resolver
            .srv_lookup(self.name.as_str())
            .await
            .map_err(|e| SecretsError::Discovery(format!("SRV lookup of {} failed: {}", self.name, e)))?;
        let endpoints: Vec<String> = lookup
            .iter()
            .map(|srv| {
                let target = srv.target().to_utf8();
                format!("{}:{}", target.trim_end_matches('.'), srv.port())
            })
            .collect();
        tracing::debug!(name = %self.name, count = endpoints.len(), "resolved secret service endpoints");
        endpoints
            .choose(&mut rand::thread_rng())
            .cloned()
            .ok_or_else(|| SecretsError::Discovery(format!("SRV record {} has no targets", self.name)))
    }
}

pub struct RemoteProducer {
    balancer: Arc<dyn LoadBalancer>,
    timeout: Duration,
    verify_tls: bool,
    cancel: CancellationToken,
    secret_type: SecretType,
}

impl RemoteProducer {
    pub fn new(balancer: Arc<dyn LoadBalancer>) -> Self {
        Self {
            balancer,
            timeout: DEFAULT_FETCH_TIMEOUT,
            verify_tls: false,
            cancel: CancellationToken::new(),
            secret_type: SecretType::Unknown,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Verify the secret service's certificate against the system roots.
    pub fn with_tls_verification(mut self, verify: bool) -> Self {
        self.verify_tls = verify;
        self
    }

    /// Parent token for every fetch. Cancelling it aborts in-flight requests
    /// and truncates bodies still being streamed.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Format of the files the service returns.
    pub fn with_secret_type(mut self, secret_type: SecretType) -> Self {
        self.secret_type = secret_type;
        self
    }

    async fn url(&self, volume: &Volume) -> Result<String, SecretsError> {
        let endpoint = self.balancer.next_endpoint().await?;
        Ok(format!("https://{}?{}", endpoint, volume.tags_query()))
    }

    fn client_for(&self, volume: &Volume) -> Result<reqwest::Client, SecretsError> {
        let key_pair = volume
            .key_pair
            .as_ref()
            .ok_or_else(|| SecretsError::MissingCredential(volume.id.clone()))?;
        let credential = |source| SecretsError::Credential {
            id: volume.id.clone(),
            source,
        };

        let identity = key_pair.identity().map_err(credential)?;
        reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .danger_accept_invalid_certs(!self.verify_tls)
            .timeout(self.timeout)
            .build()
            .map_err(credential)
    }
}

#[async_trait]
impl SecretProducer for RemoteProducer {
    async fn produce(&self, volume: &Volume) -> Result<Box<dyn SecretBundle>, SecretsError> {
        let url = self.url(volume).await?;
        tracing::debug!(id = %volume.id, url = %url, "fetching secrets");
        let client = self.client_for(volume)?;

        let cancel = self.cancel.child_token();
        let send = tokio::time::timeout(self.timeout, client.get(url.as_str()).send());
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = send => Some(result),
        };
        let response = match outcome {
            None => return Err(SecretsError::Cancelled { url }),
            Some(Err(_)) => {
                return Err(SecretsError::Timeout {
                    url,
                    timeout: self.timeout,
                })
            }
            Some(Ok(Err(source))) if source.is_timeout() => {
                return Err(SecretsError::Timeout {
                    url,
                    timeout: self.timeout,
                })
            }
            Some(Ok(Err(source))) => return Err(SecretsError::Fetch { url, source }),
            Some(Ok(Ok(response))) => response,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(SecretsError::Status {
                url,
                status: status.as_u16(),
            });
        }

        let body: BodyStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other))
                .take_until(cancel.cancelled_owned()),
        );
        let reader = SyncIoBridge::new(StreamReader::new(body));
        let owner = volume.without_credential();
        let secret_type = self.secret_type;

        // Reading the gzip header blocks on the body, so it runs off the
        // async workers.
        let bundle = tokio::task::spawn_blocking(move || {
            ArchiveBundle::new(owner, reader).map(|bundle| bundle.with_secret_type(secret_type))
        })
        .await
        .map_err(|e| SecretsError::Io {
            context: "secrets decoder task failed",
            source: io::Error::other(e),
        })??;

        tracing::debug!(id = %volume.id, url = %url, "opened secrets archive");
        Ok(Box::new(bundle))
    }
}
