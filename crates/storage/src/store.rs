use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use stormsync_common::StoreResult;

use crate::txn::{Txn, TxnResponse};

/// Condição para SET (NX ou XX).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetCondition {
    /// Só seta se a chave não existir.
    Nx,
    /// Só seta se a chave já existir.
    Xx,
}

/// Opções do comando SET.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SetOptions {
    pub expire: Option<Duration>,
    pub condition: Option<SetCondition>,
}

impl SetOptions {
    /// `SET ... NX PX <lease>`: set-if-absent com lease.
    pub fn if_absent_with_lease(lease: Duration) -> Self {
        Self {
            expire: Some(lease),
            condition: Some(SetCondition::Nx),
        }
    }
}

/// Maior TTL enviado ao servidor. O servidor soma o TTL ao relógio e
/// rejeita a soma que estoura `i64`.
const MAX_EXPIRE_MS: u64 = i64::MAX as u64 / 2;

/// TTL em ms para PX/PEXPIRE, saturando em [`MAX_EXPIRE_MS`].
pub(crate) fn expire_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis())
        .unwrap_or(u64::MAX)
        .min(MAX_EXPIRE_MS)
}

/// Operações de store consumidas pelas primitivas de coordenação.
///
/// Cada chamada é uma ida ao store. Sequências que precisam ser indivisíveis
/// passam por [`KeyValueStore::txn`].
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn ping(&self) -> StoreResult<()>;

    // --- String operations ---

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Retorna false quando a condição NX/XX não foi satisfeita.
    async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> StoreResult<bool>;

    async fn del(&self, keys: &[String]) -> StoreResult<usize>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    async fn pexpire(&self, key: &str, ttl: Duration) -> StoreResult<bool>;

    // --- Hash operations ---

    /// Retorna true se o campo é novo.
    async fn hset(&self, key: &str, field: &str, value: Bytes) -> StoreResult<bool>;

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>>;

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<usize>;

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool>;

    async fn hlen(&self, key: &str) -> StoreResult<usize>;

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>>;

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64>;

    /// Uma página de `HSCAN`. Cursor 0 inicia; cursor 0 na resposta encerra.
    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<(String, Bytes)>)>;

    // --- Sorted set operations ---

    /// Retorna true se o membro é novo.
    async fn zadd(&self, key: &str, score: f64, member: Bytes) -> StoreResult<bool>;

    async fn zrem(&self, key: &str, members: &[Bytes]) -> StoreResult<usize>;

    async fn zscore(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>>;

    async fn zincr_by(&self, key: &str, delta: f64, member: Bytes) -> StoreResult<f64>;

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<Bytes>>;

    async fn zcard(&self, key: &str) -> StoreResult<usize>;

    // --- List operations ---

    async fn lpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize>;

    async fn rpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize>;

    async fn lpop(&self, key: &str) -> StoreResult<Option<Bytes>>;

    /// Pop bloqueante. `timeout` zero bloqueia indefinidamente.
    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<Bytes>>;

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>>;

    async fn llen(&self, key: &str) -> StoreResult<usize>;

    // --- Atomic execution ---

    /// Executa a transação de forma indivisível.
    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse>;
}
