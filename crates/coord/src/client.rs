use std::sync::Arc;

use stormsync_storage::KeyValueStore;

use crate::cache::Cache;
use crate::codec::{Codec, JsonCodec};
use crate::config::{CacheConfig, ClientConfig, LockConfig, QueueConfig};
use crate::lock::Lock;
use crate::marker::Markers;
use crate::names::{self, Kind};
use crate::queue::Queue;

/// Ponto de entrada: um store compartilhado e o prefixo das chaves.
///
/// Clonar é barato; todas as estruturas criadas a partir de um `Client`
/// usam o mesmo store.
#[derive(Clone)]
pub struct Client {
    store: Arc<dyn KeyValueStore>,
    config: Arc<ClientConfig>,
}

impl Client {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::with_config(store, ClientConfig::default())
    }

    pub fn with_config(store: Arc<dyn KeyValueStore>, config: ClientConfig) -> Self {
        Self {
            store,
            config: Arc::new(config),
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Nome completo da chave de uma estrutura.
    pub fn name(&self, kind: Kind, name: &str) -> String {
        names::build(&self.config.prefix, kind, name)
    }

    pub fn lock(&self, name: &str, config: LockConfig) -> Lock {
        Lock::new(self.store.clone(), name, self.name(Kind::Lock, name), config)
    }

    /// Cache tipado com [`JsonCodec`].
    pub fn cache<T>(&self, name: &str, config: CacheConfig) -> Cache<T>
    where
        T: Send + Sync + 'static,
        JsonCodec: Codec<T>,
    {
        self.cache_with_codec(name, config)
    }

    pub fn cache_with_codec<T, C>(&self, name: &str, config: CacheConfig) -> Cache<T, C>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
    {
        Cache::new(
            self.store.clone(),
            name,
            self.name(Kind::Cache, name),
            self.markers(),
            config,
        )
    }

    /// Fila tipada com [`JsonCodec`].
    pub fn queue<T>(&self, name: &str, config: QueueConfig<T>) -> Queue<T>
    where
        T: Send + Sync + 'static,
        JsonCodec: Codec<T>,
    {
        self.queue_with_codec(name, config)
    }

    pub fn queue_with_codec<T, C>(&self, name: &str, config: QueueConfig<T>) -> Queue<T, C>
    where
        T: Send + Sync + 'static,
        C: Codec<T>,
    {
        Queue::new(self.store.clone(), name, self.name(Kind::Queue, name), config)
    }

    /// Marcadores de último uso (debounce).
    pub fn markers(&self) -> Markers {
        Markers::new(
            self.store.clone(),
            self.name(Kind::SafeTypeMap, &self.config.marker_map),
        )
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::RawCodec;
    use stormsync_storage::MemoryStore;

    #[tokio::test]
    async fn structures_share_prefix() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let config = ClientConfig::default().with_prefix("app:");
        let client = Client::with_config(store.clone(), config);

        assert_eq!(client.lock("job", LockConfig::default()).key(), "app:lock:job");
        assert_eq!(
            client.queue::<String>("mail", QueueConfig::default()).key(),
            "app:queue:mail"
        );
        assert_eq!(client.markers().key(), "app:safetypemap:__SafeTypeMap__");

        let cache = client.cache::<u32>("hits", CacheConfig::default().with_sweep_probability(0.0));
        cache.set("a", &1, None).await.unwrap();
        assert!(store.hexists("app:cache:hits:data", "a").await.unwrap());
    }

    #[tokio::test]
    async fn raw_codec_stores_strings_verbatim() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let client = Client::new(store.clone());
        let queue = client.queue_with_codec::<String, RawCodec>("raw", QueueConfig::default());

        queue.enqueue(&"hello".to_string()).await.unwrap();
        assert_eq!(
            store.lrange("queue:raw", 0, -1).await.unwrap(),
            vec![bytes::Bytes::from("hello")]
        );
    }
}
