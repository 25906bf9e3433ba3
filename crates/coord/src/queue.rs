//! Fila de trabalho com itens atrasados e retentativas.
//!
//! Chaves, a partir do nome base `<key>`:
//! - `<key>`: lista pronta (FIFO);
//! - `<key>:delayed`: sorted set, score = epoch ms em que o item fica pronto;
//! - `<key>:processing`: itens entregues e ainda não confirmados;
//! - `<key>:retry`: tentativas por payload.
//!
//! As duas últimas só são usadas com `max_retry > 0`.
//!
//! A entrega é at-least-once: a promoção dos atrasados e o pop são chamadas
//! separadas ao store.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use stormsync_common::{SyncError, SyncResult};
use stormsync_storage::{KeyValueStore, Txn, TxnOp};

use crate::codec::{Codec, JsonCodec};
use crate::config::{QueueConfig, Retry};
use crate::task::{WorkerHandle, idle, shutdown_channel, stop_requested};
use crate::time::{millis_from_now, now_millis};

struct QueueInner<T> {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    delayed_key: String,
    processing_key: String,
    retry_key: String,
    config: QueueConfig<T>,
}

pub struct Queue<T, C = JsonCodec> {
    inner: Arc<QueueInner<T>>,
    _codec: PhantomData<fn() -> C>,
}

impl<T, C> Clone for Queue<T, C> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            _codec: PhantomData,
        }
    }
}

impl<T, C> Queue<T, C>
where
    T: Send + Sync + 'static,
    C: Codec<T>,
{
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        name: &str,
        key: String,
        config: QueueConfig<T>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                store,
                name: name.to_string(),
                delayed_key: format!("{key}:delayed"),
                processing_key: format!("{key}:processing"),
                retry_key: format!("{key}:retry"),
                key,
                config,
            }),
            _codec: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Chave da lista pronta.
    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn config(&self) -> &QueueConfig<T> {
        &self.inner.config
    }

    /// Coloca o item no fim da lista pronta.
    pub async fn enqueue(&self, value: &T) -> SyncResult<()> {
        self.push_ready(C::encode(value)?).await
    }

    /// Agenda o item para ficar pronto daqui a `delay`.
    pub async fn enqueue_delayed(&self, value: &T, delay: Duration) -> SyncResult<()> {
        self.push_delayed(C::encode(value)?, delay).await
    }

    /// Move para a lista pronta, em ordem de score, os atrasados já vencidos.
    pub async fn promote_due(&self) -> SyncResult<usize> {
        let txn = Txn::new().then(TxnOp::MoveDue {
            from: self.inner.delayed_key.clone(),
            to: self.inner.key.clone(),
            max_score: now_millis() as f64,
        });
        let moved = self.inner.store.txn(txn).await?.first_count().max(0) as usize;
        if moved > 0 {
            debug!(queue = %self.inner.name, moved, "itens atrasados promovidos");
        }
        Ok(moved)
    }

    /// Retira o próximo item. Com `max_wait` não zero, bloqueia até esse
    /// tempo no store.
    pub async fn dequeue(&self) -> SyncResult<Option<T>> {
        self.promote_due().await?;

        let store = &self.inner.store;
        let max_wait = self.inner.config.max_wait;
        let popped = if max_wait.is_zero() {
            store.lpop(&self.inner.key).await?
        } else {
            store.blpop(&self.inner.key, max_wait).await?
        };
        let Some(data) = popped else {
            return Ok(None);
        };

        let value = match C::decode(&data) {
            Ok(value) => value,
            Err(err) => {
                warn!(queue = %self.inner.name, error = %err, "item ilegível descartado");
                return Err(err.into());
            }
        };
        if self.tracking() {
            store
                .zadd(&self.inner.processing_key, now_millis() as f64, data)
                .await?;
        }
        Ok(Some(value))
    }

    /// Confirma o processamento. Sem rastreio de retentativas é no-op.
    pub async fn ack(&self, value: &T) -> SyncResult<()> {
        if !self.tracking() {
            return Ok(());
        }
        self.forget(C::encode(value)?).await
    }

    /// Trata uma falha de processamento conforme o error handler.
    ///
    /// Sem handler o item é confirmado. Com `max_retry > 0`, cada falha conta
    /// uma tentativa e o item é descartado quando passa de `max_retry`.
    pub async fn fail(&self, mut value: T, error: &anyhow::Error) -> SyncResult<()> {
        let Some(handler) = self.inner.config.error_handler.clone() else {
            return self.ack(&value).await;
        };

        let store = &self.inner.store;
        let tracking = self.tracking();
        let original = C::encode(&value)?;
        let mut attempts = 0.0;
        if tracking {
            attempts = store
                .zincr_by(&self.inner.retry_key, 1.0, original.clone())
                .await?;
            if attempts > f64::from(self.inner.config.max_retry) {
                warn!(
                    queue = %self.inner.name,
                    attempts,
                    error = %error,
                    "item descartado: limite de tentativas atingido"
                );
                return self.forget(original).await;
            }
        }

        let decision = handler(&mut value, error);
        if decision == Retry::Drop {
            debug!(queue = %self.inner.name, "item descartado pelo error handler");
            return if tracking { self.forget(original).await } else { Ok(()) };
        }

        let data = C::encode(&value)?;
        // Recoloca antes de limpar o rastreio
        match decision {
            Retry::After(delay) => self.push_delayed(data.clone(), delay).await?,
            _ => match self.push_ready(data.clone()).await {
                Err(SyncError::QueueFull(max_length)) => {
                    warn!(
                        queue = %self.inner.name,
                        max_length,
                        "fila cheia: retentativa adiada"
                    );
                    self.push_delayed(data.clone(), self.inner.config.idle_backoff)
                        .await?
                }
                other => other?,
            },
        }

        if tracking {
            store
                .zrem(&self.inner.processing_key, &[original.clone()])
                .await?;
            // Payload reescrito: o contador acompanha o novo membro
            if data != original {
                store.zrem(&self.inner.retry_key, &[original]).await?;
                store.zadd(&self.inner.retry_key, attempts, data).await?;
            }
        }
        Ok(())
    }

    /// Itens na lista pronta.
    pub async fn len(&self) -> SyncResult<usize> {
        Ok(self.inner.store.llen(&self.inner.key).await?)
    }

    pub async fn is_empty(&self) -> SyncResult<bool> {
        Ok(self.len().await? == 0)
    }

    pub async fn delayed_len(&self) -> SyncResult<usize> {
        Ok(self.inner.store.zcard(&self.inner.delayed_key).await?)
    }

    pub async fn processing_len(&self) -> SyncResult<usize> {
        Ok(self.inner.store.zcard(&self.inner.processing_key).await?)
    }

    /// Apaga as quatro chaves da fila.
    pub async fn clear(&self) -> SyncResult<()> {
        let inner = &self.inner;
        inner
            .store
            .del(&[
                inner.key.clone(),
                inner.delayed_key.clone(),
                inner.processing_key.clone(),
                inner.retry_key.clone(),
            ])
            .await?;
        Ok(())
    }

    pub fn start_worker<F, Fut>(&self, handler: F) -> WorkerHandle
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.start_workers(1, handler)
    }

    /// Inicia `count` workers: dequeue → handler → ack/fail, até o handle
    /// ser parado ou dropado. Erros do handler e do store são logados e o
    /// loop continua.
    pub fn start_workers<F, Fut>(&self, count: usize, handler: F) -> WorkerHandle
    where
        T: Clone,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let (shutdown_tx, _) = shutdown_channel();
        let handler = Arc::new(handler);
        let tasks = (0..count)
            .map(|worker| {
                let queue = self.clone();
                let handler = handler.clone();
                let shutdown = shutdown_tx.subscribe();
                tokio::spawn(async move { queue.work(worker, handler, shutdown).await })
            })
            .collect();

        info!(queue = %self.inner.name, workers = count, "workers iniciados");
        WorkerHandle::new(shutdown_tx, tasks)
    }

    async fn work<F, Fut>(
        self,
        worker: usize,
        handler: Arc<F>,
        mut shutdown: broadcast::Receiver<()>,
    ) where
        T: Clone,
        F: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let backoff = self.inner.config.idle_backoff;
        while !stop_requested(&mut shutdown) {
            let value = match self.dequeue().await {
                Ok(Some(value)) => value,
                Ok(None) => {
                    if idle(&mut shutdown, backoff).await {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    warn!(queue = %self.inner.name, worker, error = %e, "falha ao retirar item");
                    if idle(&mut shutdown, backoff).await {
                        break;
                    }
                    continue;
                }
            };

            let settled = match handler(value.clone()).await {
                Ok(()) => self.ack(&value).await,
                Err(e) => {
                    warn!(queue = %self.inner.name, worker, error = %e, "handler falhou");
                    self.fail(value, &e).await
                }
            };
            if let Err(e) = settled {
                warn!(queue = %self.inner.name, worker, error = %e, "falha ao finalizar item");
            }
        }
        debug!(queue = %self.inner.name, worker, "worker encerrado");
    }

    fn tracking(&self) -> bool {
        self.inner.config.max_retry > 0
    }

    async fn push_ready(&self, data: Bytes) -> SyncResult<()> {
        let max_length = self.inner.config.max_length;
        if max_length > 0 && self.inner.store.llen(&self.inner.key).await? >= max_length {
            return Err(SyncError::QueueFull(max_length));
        }
        self.inner.store.rpush(&self.inner.key, &[data]).await?;
        Ok(())
    }

    async fn push_delayed(&self, data: Bytes, delay: Duration) -> SyncResult<()> {
        let ready_at = millis_from_now(delay);
        self.inner
            .store
            .zadd(&self.inner.delayed_key, ready_at as f64, data)
            .await?;
        Ok(())
    }

    async fn forget(&self, data: Bytes) -> SyncResult<()> {
        let members = [data];
        self.inner
            .store
            .zrem(&self.inner.processing_key, &members)
            .await?;
        self.inner.store.zrem(&self.inner.retry_key, &members).await?;
        Ok(())
    }
}

impl<T, C> std::fmt::Debug for Queue<T, C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .field("config", &self.inner.config)
            .finish()
    }
}
