//! Cache com TTL sobre um hash de dados e um sorted set de expirações.
//!
//! `<name>:data` guarda os valores; `<name>:expire` guarda, por chave, o
//! epoch ms de expiração. Chaves sem score nunca expiram. A expiração é
//! preguiçosa na leitura e complementada por varreduras ocasionais.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rand::{Rng, rng};
use tracing::{debug, warn};

use stormsync_common::{SyncError, SyncResult};
use stormsync_storage::KeyValueStore;

use crate::codec::{Codec, JsonCodec};
use crate::config::CacheConfig;
use crate::marker::Markers;
use crate::time::{millis_from_now, now_millis};

struct CacheInner {
    store: Arc<dyn KeyValueStore>,
    name: String,
    data_key: String,
    expire_key: String,
    sweep_marker: String,
    markers: Markers,
    config: CacheConfig,
}

pub struct Cache<T, C = JsonCodec> {
    inner: Arc<CacheInner>,
    _types: PhantomData<fn() -> (T, C)>,
}

impl<T, C> Clone for Cache<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _types: PhantomData,
        }
    }
}

impl<T, C> Cache<T, C>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
{
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        name: &str,
        base_key: String,
        markers: Markers,
        config: CacheConfig,
    ) -> Self {
        let data_key = format!("{base_key}:data");
        Self {
            inner: Arc::new(CacheInner {
                store,
                name: name.to_string(),
                sweep_marker: format!("{data_key}:cleanup"),
                expire_key: format!("{base_key}:expire"),
                data_key,
                markers,
                config,
            }),
            _types: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Grava o valor. `ttl` `None` ou zero usa `default_expire`; sem nenhum
    /// dos dois a chave nunca expira.
    pub async fn set(&self, key: &str, value: &T, ttl: Option<Duration>) -> SyncResult<()> {
        let data = C::encode(value)?;
        let store = &self.inner.store;
        store.hset(&self.inner.data_key, key, data).await?;

        let member = Bytes::copy_from_slice(key.as_bytes());
        match self.effective_ttl(ttl) {
            Some(ttl) => {
                let expires_at = millis_from_now(ttl);
                store
                    .zadd(&self.inner.expire_key, expires_at as f64, member)
                    .await?;
            }
            None => {
                store.zrem(&self.inner.expire_key, &[member]).await?;
            }
        }

        self.maybe_sweep();
        Ok(())
    }

    /// Lê o valor. Chaves vencidas são apagadas e contam como ausentes.
    pub async fn get(&self, key: &str) -> SyncResult<Option<T>> {
        if self.evict_if_expired(key).await? {
            return Ok(None);
        }
        match self.inner.store.hget(&self.inner.data_key, key).await? {
            Some(data) => Ok(Some(C::decode(&data)?)),
            None => Ok(None),
        }
    }

    /// Lê o valor ou, na ausência, produz com `factory` e grava.
    ///
    /// Não há coordenação entre chamadores concorrentes: todos podem rodar a
    /// factory e o último `set` prevalece.
    pub async fn get_or_set<F, Fut, E>(&self, key: &str, factory: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(T, Option<Duration>), E>>,
        E: From<SyncError>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }
        let (value, ttl) = factory().await?;
        self.set(key, &value, ttl).await?;
        Ok(value)
    }

    pub async fn delete(&self, keys: &[&str]) -> SyncResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        let fields: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let members: Vec<Bytes> = keys
            .iter()
            .map(|k| Bytes::copy_from_slice(k.as_bytes()))
            .collect();

        let removed = self.inner.store.hdel(&self.inner.data_key, &fields).await?;
        self.inner
            .store
            .zrem(&self.inner.expire_key, &members)
            .await?;
        Ok(removed)
    }

    pub async fn exists(&self, key: &str) -> SyncResult<bool> {
        if self.evict_if_expired(key).await? {
            return Ok(false);
        }
        Ok(self.inner.store.hexists(&self.inner.data_key, key).await?)
    }

    /// Remove todas as entradas.
    pub async fn clear(&self) -> SyncResult<()> {
        self.inner
            .store
            .del(&[self.inner.data_key.clone(), self.inner.expire_key.clone()])
            .await?;
        Ok(())
    }

    /// Remove as entradas vencidas. Devolve quantas havia.
    pub async fn clear_expired(&self) -> SyncResult<usize> {
        let expired = self
            .inner
            .store
            .zrange_by_score(&self.inner.expire_key, f64::NEG_INFINITY, now_millis() as f64)
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let fields: Vec<String> = expired
            .iter()
            .map(|member| String::from_utf8_lossy(member).into_owned())
            .collect();
        self.inner.store.hdel(&self.inner.data_key, &fields).await?;
        self.inner
            .store
            .zrem(&self.inner.expire_key, &expired)
            .await?;

        debug!(cache = %self.inner.name, count = expired.len(), "entradas expiradas removidas");
        Ok(expired.len())
    }

    /// Número de entradas vivas.
    pub async fn len(&self) -> SyncResult<usize> {
        self.clear_expired().await?;
        Ok(self.inner.store.hlen(&self.inner.data_key).await?)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn keys(&self) -> SyncResult<Vec<String>> {
        self.clear_expired().await?;
        Ok(self.inner.store.hkeys(&self.inner.data_key).await?)
    }

    /// Tempo restante. `None` para chave sem expiração, ausente ou vencida.
    pub async fn ttl(&self, key: &str) -> SyncResult<Option<Duration>> {
        let score = self
            .inner
            .store
            .zscore(&self.inner.expire_key, key.as_bytes())
            .await?;
        Ok(score.and_then(|expires_at| {
            let remaining = (expires_at as i64).saturating_sub(now_millis());
            (remaining > 0).then(|| Duration::from_millis(remaining as u64))
        }))
    }

    /// Redefine a expiração de uma chave existente; chave ausente é no-op.
    /// TTL zero vence a chave imediatamente.
    pub async fn set_ttl(&self, key: &str, ttl: Duration) -> SyncResult<()> {
        if !self.exists(key).await? {
            return Ok(());
        }
        let expires_at = millis_from_now(ttl);
        self.inner
            .store
            .zadd(
                &self.inner.expire_key,
                expires_at as f64,
                Bytes::copy_from_slice(key.as_bytes()),
            )
            .await?;
        Ok(())
    }

    fn effective_ttl(&self, ttl: Option<Duration>) -> Option<Duration> {
        ttl.filter(|d| !d.is_zero())
            .or(self.inner.config.default_expire)
            .filter(|d| !d.is_zero())
    }

    /// true se a chave estava vencida (e foi apagada agora).
    async fn evict_if_expired(&self, key: &str) -> SyncResult<bool> {
        let score = self
            .inner
            .store
            .zscore(&self.inner.expire_key, key.as_bytes())
            .await?;
        let expired = score.is_some_and(|expires_at| expires_at <= now_millis() as f64);
        if expired {
            self.delete(&[key]).await?;
        }
        Ok(expired)
    }

    /// Com a probabilidade configurada, agenda uma varredura limitada pelo
    /// marcador `<data>:cleanup`.
    fn maybe_sweep(&self) {
        let probability = self.inner.config.sweep_probability;
        if probability.is_nan() || probability <= 0.0 {
            return;
        }
        if !rng().random_bool(probability.min(1.0)) {
            return;
        }

        let cache = self.clone();
        tokio::spawn(async move {
            let inner = &cache.inner;
            let due = match inner
                .markers
                .across(&inner.sweep_marker, inner.config.sweep_interval)
                .await
            {
                Ok(due) => due,
                Err(e) => {
                    warn!(cache = %inner.name, error = %e, "falha ao consultar marcador");
                    return;
                }
            };
            if due && let Err(e) = cache.clear_expired().await {
                warn!(cache = %inner.name, error = %e, "falha na varredura de expirados");
            }
        });
    }
}

impl<T, C> std::fmt::Debug for Cache<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("name", &self.inner.name)
            .field("data_key", &self.inner.data_key)
            .field("config", &self.inner.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use stormsync_storage::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Profile {
        name: String,
        age: u32,
    }

    fn cache_on<T>(store: &Arc<dyn KeyValueStore>, config: CacheConfig) -> Cache<T>
    where
        T: Send + Sync + 'static,
        JsonCodec: Codec<T>,
    {
        let markers = Markers::new(store.clone(), "safetypemap:__SafeTypeMap__".into());
        Cache::new(store.clone(), "users", "cache:users".into(), markers, config)
    }

    fn no_sweep() -> CacheConfig {
        CacheConfig::default().with_sweep_probability(0.0)
    }

    #[tokio::test]
    async fn set_and_get_typed_value() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<Profile>(&store, no_sweep());
        let profile = Profile {
            name: "ana".into(),
            age: 31,
        };

        cache.set("u1", &profile, None).await.unwrap();
        assert_eq!(cache.get("u1").await.unwrap(), Some(profile));
        assert_eq!(cache.get("u2").await.unwrap(), None);
        assert!(store.hexists("cache:users:data", "u1").await.unwrap());
    }

    #[tokio::test]
    async fn entry_expires_lazily() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<String>(&store, no_sweep());

        cache
            .set("k", &"v".to_string(), Some(Duration::from_millis(40)))
            .await
            .unwrap();
        assert!(cache.exists("k").await.unwrap());

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(cache.get("k").await.unwrap(), None);
        // A leitura apagou os dois lados
        assert!(!store.hexists("cache:users:data", "k").await.unwrap());
        assert_eq!(store.zcard("cache:users:expire").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_without_ttl_clears_stale_expiry() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        cache.set("k", &1, Some(Duration::from_millis(30))).await.unwrap();
        cache.set("k", &2, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(cache.get("k").await.unwrap(), Some(2));
        assert_eq!(cache.ttl("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn default_expire_applies() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(
            &store,
            no_sweep().with_default_expire(Duration::from_secs(60)),
        );

        cache.set("k", &1, None).await.unwrap();
        let ttl = cache.ttl("k").await.unwrap().unwrap();
        assert!(ttl > Duration::from_secs(59));

        // TTL zero explícito também cai no default
        cache.set("z", &1, Some(Duration::ZERO)).await.unwrap();
        assert!(cache.ttl("z").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn decode_failure_is_an_error() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<Profile>(&store, no_sweep());
        store
            .hset("cache:users:data", "bad", Bytes::from("{not json"))
            .await
            .unwrap();

        assert!(matches!(
            cache.get("bad").await,
            Err(SyncError::Serialization(_))
        ));
    }

    #[tokio::test]
    async fn get_or_set_runs_factory_on_miss() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        let value: anyhow::Result<u32> = cache
            .get_or_set("k", || async { Ok((7, None)) })
            .await;
        assert_eq!(value.unwrap(), 7);

        let value: anyhow::Result<u32> = cache
            .get_or_set("k", || async { anyhow::bail!("factory não deveria rodar") })
            .await;
        assert_eq!(value.unwrap(), 7);
    }

    #[tokio::test]
    async fn clear_expired_len_and_keys() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        cache.set("a", &1, Some(Duration::from_millis(20))).await.unwrap();
        cache.set("b", &2, Some(Duration::from_millis(20))).await.unwrap();
        cache.set("c", &3, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        assert_eq!(cache.keys().await.unwrap(), vec!["c".to_string()]);
        assert_eq!(cache.len().await.unwrap(), 1);
        assert_eq!(cache.clear_expired().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn set_ttl_only_touches_existing_keys() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        cache.set_ttl("missing", Duration::from_secs(5)).await.unwrap();
        assert_eq!(store.zcard("cache:users:expire").await.unwrap(), 0);

        cache.set("k", &1, None).await.unwrap();
        cache.set_ttl("k", Duration::ZERO).await.unwrap();
        assert!(!cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn unbounded_ttl_keeps_entry() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        cache.set("k", &1, Some(Duration::MAX)).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap(), Some(1));
        assert!(cache.ttl("k").await.unwrap().is_some());

        cache.set_ttl("k", Duration::MAX).await.unwrap();
        assert!(cache.exists("k").await.unwrap());
    }

    #[tokio::test]
    async fn delete_and_clear() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(&store, no_sweep());

        cache.set("a", &1, Some(Duration::from_secs(5))).await.unwrap();
        cache.set("b", &2, None).await.unwrap();
        assert_eq!(cache.delete(&["a", "x"]).await.unwrap(), 1);
        assert_eq!(store.zcard("cache:users:expire").await.unwrap(), 0);

        cache.clear().await.unwrap();
        assert!(cache.is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn sweep_runs_in_background() {
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let cache = cache_on::<u32>(
            &store,
            CacheConfig::default()
                .with_sweep_probability(1.0)
                .with_sweep_interval(Duration::from_millis(1)),
        );

        cache.set("old", &1, Some(Duration::from_millis(10))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        // Intervalo de 1ms: este set cai num intervalo novo e varre
        cache.set("new", &2, None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!store.hexists("cache:users:data", "old").await.unwrap());
        assert!(
            store
                .hexists("safetypemap:__SafeTypeMap__", "cache:users:data:cleanup")
                .await
                .unwrap()
        );
    }
}
