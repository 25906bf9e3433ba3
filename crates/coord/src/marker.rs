//! Marcadores de último uso para debounce entre processos.
//!
//! Cada marcador é um campo do hash de marcadores com o epoch em ms do
//! último toque.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use stormsync_common::SyncResult;
use stormsync_storage::{HashScan, KeyValueStore, Txn, TxnOp};

use crate::time::{duration_millis, now_millis};

#[derive(Clone)]
pub struct Markers {
    store: Arc<dyn KeyValueStore>,
    key: String,
}

impl Markers {
    pub(crate) fn new(store: Arc<dyn KeyValueStore>, key: String) -> Self {
        Self { store, key }
    }

    /// Chave do hash no store.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Último uso em epoch ms, sem tocar o marcador.
    pub async fn last_use(&self, key: &str) -> SyncResult<Option<i64>> {
        Ok(parse_millis(self.store.hget(&self.key, key).await?))
    }

    /// Marca o uso agora e devolve o valor anterior, atomicamente.
    pub async fn touch(&self, key: &str) -> SyncResult<Option<i64>> {
        self.swap(key, now_millis()).await
    }

    /// true se `key` nunca foi tocada ou se o instante atual cai num
    /// intervalo posterior ao do último toque. Apenas um chamador por
    /// intervalo recebe true.
    pub async fn across(&self, key: &str, interval: Duration) -> SyncResult<bool> {
        let interval_ms = duration_millis(interval).max(1);
        let now = now_millis();
        let bucket = now / interval_ms;

        if let Some(last) = self.last_use(key).await?
            && last / interval_ms >= bucket
        {
            return Ok(false);
        }

        // Confirmar com o swap: se outro chamador marcou este intervalo
        // entre a leitura e aqui, ele venceu.
        let previous = self.swap(key, now).await?;
        Ok(previous.is_none_or(|last| last / interval_ms < bucket))
    }

    pub async fn across_minute(&self, key: &str) -> SyncResult<bool> {
        self.across(key, Duration::from_secs(60)).await
    }

    pub async fn across_second(&self, key: &str) -> SyncResult<bool> {
        self.across(key, Duration::from_secs(1)).await
    }

    pub async fn set_last_use(&self, key: &str, at_millis: i64) -> SyncResult<()> {
        self.store
            .hset(&self.key, key, Bytes::from(at_millis.to_string()))
            .await?;
        Ok(())
    }

    pub async fn delete(&self, keys: &[&str]) -> SyncResult<usize> {
        let fields: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        Ok(self.store.hdel(&self.key, &fields).await?)
    }

    /// Remove marcadores sem uso há mais de `older_than`. Devolve quantos.
    pub async fn clean(&self, older_than: Duration) -> SyncResult<usize> {
        let cutoff = now_millis().saturating_sub(duration_millis(older_than));
        let mut scan = HashScan::new(self.store.clone(), self.key.clone());
        let mut stale = Vec::new();
        while let Some((field, value)) = scan.next().await? {
            if parse_millis(Some(value)).is_none_or(|at| at < cutoff) {
                stale.push(field);
            }
        }

        if stale.is_empty() {
            return Ok(0);
        }
        let removed = self.store.hdel(&self.key, &stale).await?;
        debug!(map = %self.key, removed, "marcadores antigos removidos");
        Ok(removed)
    }

    async fn swap(&self, key: &str, at_millis: i64) -> SyncResult<Option<i64>> {
        let txn = Txn::new().then(TxnOp::HashSwap {
            key: self.key.clone(),
            field: key.to_string(),
            value: Bytes::from(at_millis.to_string()),
        });
        let response = self.store.txn(txn).await?;
        Ok(parse_millis(response.into_first_value()))
    }
}

/// Valores ilegíveis ou não positivos contam como "nunca usado".
fn parse_millis(value: Option<Bytes>) -> Option<i64> {
    value
        .and_then(|data| std::str::from_utf8(&data).ok()?.parse::<i64>().ok())
        .filter(|ms| *ms > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stormsync_storage::MemoryStore;

    fn markers() -> Markers {
        Markers::new(
            Arc::new(MemoryStore::new()),
            "safetypemap:__SafeTypeMap__".into(),
        )
    }

    #[tokio::test]
    async fn touch_returns_previous_value() {
        let markers = markers();
        assert_eq!(markers.touch("job").await.unwrap(), None);
        let first = markers.last_use("job").await.unwrap().unwrap();
        let previous = markers.touch("job").await.unwrap();
        assert_eq!(previous, Some(first));
    }

    #[tokio::test]
    async fn across_fires_once_per_bucket() {
        let markers = markers();
        let hour = Duration::from_secs(3600);
        assert!(markers.across("report", hour).await.unwrap());
        assert!(!markers.across("report", hour).await.unwrap());

        // Último uso num intervalo anterior
        markers
            .set_last_use("report", now_millis() - 2 * 3_600_000)
            .await
            .unwrap();
        assert!(markers.across("report", hour).await.unwrap());
        assert!(!markers.across("report", hour).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_across_has_single_winner() {
        let markers = markers();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let markers = markers.clone();
            handles.push(tokio::spawn(async move {
                markers.across("tick", Duration::from_secs(3600)).await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn clean_removes_only_stale_markers() {
        let markers = markers();
        markers.touch("fresh").await.unwrap();
        markers
            .set_last_use("stale", now_millis() - 10 * 60_000)
            .await
            .unwrap();

        let removed = markers.clean(Duration::from_secs(60)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(markers.last_use("fresh").await.unwrap().is_some());
        assert_eq!(markers.last_use("stale").await.unwrap(), None);
    }

    #[tokio::test]
    async fn delete_markers() {
        let markers = markers();
        markers.touch("a").await.unwrap();
        markers.touch("b").await.unwrap();
        assert_eq!(markers.delete(&["a", "b", "c"]).await.unwrap(), 2);
    }

    #[test]
    fn parse_ignores_garbage() {
        assert_eq!(parse_millis(Some(Bytes::from("abc"))), None);
        assert_eq!(parse_millis(Some(Bytes::from("0"))), None);
        assert_eq!(parse_millis(Some(Bytes::from("1700000000000"))), Some(1_700_000_000_000));
    }
}
