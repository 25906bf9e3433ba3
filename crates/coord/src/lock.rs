//! Lock distribuído baseado em lease.
//!
//! A posse é um `SET NX PX` com o token da instância. Liberação e renovação
//! são transações "se o valor ainda é meu token": um lease vencido e tomado
//! por outro processo nunca é apagado ou estendido por engano.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use stormsync_common::{SyncError, SyncResult};
use stormsync_storage::{Compare, KeyValueStore, SetOptions, Txn, TxnOp};

use crate::config::LockConfig;
use crate::task::{RefreshHandle, shutdown_channel};

struct LockInner {
    store: Arc<dyn KeyValueStore>,
    name: String,
    key: String,
    token: String,
    config: LockConfig,
    held: AtomicBool,
}

/// Handle de um lock. Clones compartilham o mesmo token e estado.
#[derive(Clone)]
pub struct Lock {
    inner: Arc<LockInner>,
}

impl Lock {
    pub(crate) fn new(
        store: Arc<dyn KeyValueStore>,
        name: &str,
        key: String,
        config: LockConfig,
    ) -> Self {
        Self {
            inner: Arc::new(LockInner {
                store,
                name: name.to_string(),
                key,
                token: Uuid::new_v4().to_string(),
                config,
                held: AtomicBool::new(false),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn key(&self) -> &str {
        &self.inner.key
    }

    pub fn token(&self) -> &str {
        &self.inner.token
    }

    pub fn config(&self) -> &LockConfig {
        &self.inner.config
    }

    /// Se esta instância acredita deter o lock. O lease pode ter vencido no
    /// store sem que ela saiba.
    pub fn is_held(&self) -> bool {
        self.inner.held.load(Ordering::Acquire)
    }

    /// Uma única tentativa de aquisição.
    pub async fn try_acquire(&self) -> SyncResult<bool> {
        let acquired = self
            .inner
            .store
            .set(
                &self.inner.key,
                Bytes::copy_from_slice(self.inner.token.as_bytes()),
                SetOptions::if_absent_with_lease(self.inner.config.lease()),
            )
            .await?;
        if acquired {
            self.inner.held.store(true, Ordering::Release);
            debug!(lock = %self.inner.name, "lock obtido");
        }
        Ok(acquired)
    }

    /// Tenta até obter o lock ou estourar `max_wait`.
    pub async fn acquire(&self) -> SyncResult<()> {
        let start = Instant::now();
        let deadline = start + self.inner.config.max_wait;
        loop {
            if self.try_acquire().await? {
                return Ok(());
            }

            let now = Instant::now();
            if now >= deadline {
                debug!(lock = %self.inner.name, "timeout aguardando lock");
                return Err(SyncError::LockTimeout {
                    name: self.inner.name.clone(),
                    waited: now - start,
                });
            }
            tokio::time::sleep(self.inner.config.retry_time.min(deadline - now)).await;
        }
    }

    /// Apaga a chave se ela ainda guarda o token desta instância.
    ///
    /// Sem posse local é um no-op. Se a chave sumiu ou pertence a outro
    /// token retorna `LockNotHeld`; o estado local é limpo nos dois casos.
    pub async fn release(&self) -> SyncResult<()> {
        if !self.is_held() {
            return Ok(());
        }

        let txn = Txn::new()
            .when(self.owned())
            .then(TxnOp::Del {
                key: self.inner.key.clone(),
            });
        let response = self.inner.store.txn(txn).await?;
        self.inner.held.store(false, Ordering::Release);

        if response.succeeded {
            debug!(lock = %self.inner.name, "lock liberado");
            Ok(())
        } else {
            Err(SyncError::LockNotHeld(self.inner.name.clone()))
        }
    }

    /// Renova o lease para `wait_time` se o token ainda é o nosso.
    pub async fn refresh(&self) -> SyncResult<()> {
        if !self.is_held() {
            return Err(SyncError::LockNotHeld(self.inner.name.clone()));
        }

        let txn = Txn::new().when(self.owned()).then(TxnOp::PExpire {
            key: self.inner.key.clone(),
            ttl: self.inner.config.lease(),
        });
        let response = self.inner.store.txn(txn).await?;
        if response.succeeded {
            Ok(())
        } else {
            self.inner.held.store(false, Ordering::Release);
            Err(SyncError::LockNotHeld(self.inner.name.clone()))
        }
    }

    /// Adquire (bloqueando), executa `f` e libera em qualquer saída.
    pub async fn run_exclusive<F, Fut, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        self.acquire().await?;
        self.run_held(f).await
    }

    /// Como [`Lock::run_exclusive`], mas com uma única tentativa. `None`
    /// quando o lock estava ocupado e `f` não rodou.
    pub async fn try_run_exclusive<F, Fut, R>(&self, f: F) -> SyncResult<Option<R>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        if !self.try_acquire().await? {
            return Ok(None);
        }
        self.run_held(f).await.map(Some)
    }

    async fn run_held<F, Fut, R>(&self, f: F) -> SyncResult<R>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = R>,
    {
        let guard = ReleaseGuard { lock: Some(self) };
        let output = f().await;
        guard.disarm();
        self.release().await?;
        Ok(output)
    }

    /// Inicia a task que renova o lease a cada `wait_time / 2` enquanto o
    /// lock estiver em posse.
    pub fn start_refresh_loop(&self) -> RefreshHandle {
        let (shutdown_tx, mut shutdown_rx) = shutdown_channel();
        let lock = self.clone();
        let period = (self.inner.config.lease() / 2).max(Duration::from_millis(1));

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.recv() => {
                        debug!(lock = %lock.inner.name, "renovação encerrada");
                        return;
                    }
                }

                if !lock.is_held() {
                    return;
                }
                if let Err(e) = lock.refresh().await {
                    warn!(lock = %lock.inner.name, error = %e, "falha ao renovar lease");
                    return;
                }
            }
        });

        RefreshHandle::new(shutdown_tx, task)
    }

    fn owned(&self) -> Compare {
        Compare::value_equals(
            self.inner.key.clone(),
            Bytes::copy_from_slice(self.inner.token.as_bytes()),
        )
    }
}

impl std::fmt::Debug for Lock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lock")
            .field("name", &self.inner.name)
            .field("key", &self.inner.key)
            .field("held", &self.is_held())
            .finish()
    }
}

/// Libera o lock se a seção crítica entrar em pânico ou for cancelada.
struct ReleaseGuard<'a> {
    lock: Option<&'a Lock>,
}

impl ReleaseGuard<'_> {
    fn disarm(mut self) {
        self.lock = None;
    }
}

impl Drop for ReleaseGuard<'_> {
    fn drop(&mut self) {
        let Some(lock) = self.lock.take() else {
            return;
        };
        if !lock.is_held() {
            return;
        }
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let lock = lock.clone();
        runtime.spawn(async move {
            if let Err(e) = lock.release().await {
                warn!(lock = %lock.inner.name, error = %e, "falha ao liberar lock abandonado");
            }
        });
    }
}
