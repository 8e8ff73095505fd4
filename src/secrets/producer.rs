use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use super::{SecretBundle, SecretsError};
use crate::types::{SecretSource, Volume};

/// Produces the secret files for a volume.
#[async_trait]
pub trait SecretProducer: Send + Sync {
    /// Fetch the bundle for `volume`. Failures to reach, authenticate to or
    /// decode the source are reported here, before any entry is read.
    async fn produce(&self, volume: &Volume) -> Result<Box<dyn SecretBundle>, SecretsError>;
}

/// Maps each secret source to the producer that handles it. Built once at
/// start-up and never modified afterwards.
#[derive(Clone, Default)]
pub struct ProducerRegistry {
    producers: HashMap<SecretSource, Arc<dyn SecretProducer>>,
}

impl ProducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, source: SecretSource, producer: Arc<dyn SecretProducer>) -> Self {
        self.producers.insert(source, producer);
        self
    }

    pub fn get(&self, source: SecretSource) -> Option<Arc<dyn SecretProducer>> {
        self.producers.get(&source).cloned()
    }

    /// Registered sources, in order.
    pub fn sources(&self) -> Vec<SecretSource> {
        let mut sources: Vec<_> = self.producers.keys().copied().collect();
        sources.sort();
        sources
    }
}

impl std::fmt::Debug for ProducerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProducerRegistry")
            .field("sources", &self.sources())
            .finish()
    }
}
