use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry as Slot;
use tokio::sync::{Mutex, Notify, RwLock, RwLockReadGuard};
use tokio::time::{Duration, Instant};
use tracing::debug;

use stormsync_common::{StoreError, StoreResult};

use crate::entry::{Entry, Value};
use crate::store::{KeyValueStore, SetCondition, SetOptions};
use crate::txn::{Compare, Txn, TxnOp, TxnOutput, TxnResponse};

/// Intervalo máximo entre duas checagens da task de purga. Limita quanto
/// tempo a task sobrevive ao store.
const PURGE_IDLE: Duration = Duration::from_secs(1);

/// Item no BTreeSet de expiração: (instante, chave).
/// Ordenado por instante para purga eficiente.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
struct ExpiryEntry(Instant, String);

/// Estado compartilhado entre todos os handles.
struct Shared {
    data: DashMap<String, Entry>,
    expiry: Mutex<BTreeSet<ExpiryEntry>>,
    /// Operações simples pegam leitura; transações pegam escrita.
    gate: RwLock<()>,
    notify_expiry: Notify,
    /// Acordado a cada push, para o BLPOP.
    pushed: Notify,
}

/// Store in-memory com a mesma semântica do Redis para as operações do trait.
///
/// Clonar o handle compartilha o mesmo estado. A task de purga termina
/// sozinha depois que o último handle é dropado.
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Cria o store. Precisa ser chamado dentro de um runtime tokio.
    pub fn new() -> Self {
        let store = MemoryStore {
            shared: Arc::new(Shared {
                data: DashMap::new(),
                expiry: Mutex::new(BTreeSet::new()),
                gate: RwLock::new(()),
                notify_expiry: Notify::new(),
                pushed: Notify::new(),
            }),
        };

        // Spawn background task para purgar keys expiradas
        let shared = Arc::downgrade(&store.shared);
        tokio::spawn(async move {
            purge_expired_keys(shared).await;
        });

        store
    }

    /// Número de chaves vivas ou ainda não purgadas.
    pub fn key_count(&self) -> usize {
        self.shared.data.len()
    }

    async fn read_gate(&self) -> RwLockReadGuard<'_, ()> {
        self.shared.gate.read().await
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn evict_expired(&self, key: &str) {
        self.data.remove_if(key, |_, entry| entry.is_expired());
    }

    /// Lê a entrada viva da chave.
    fn read<R>(
        &self,
        key: &str,
        f: impl FnOnce(&Value) -> StoreResult<R>,
    ) -> StoreResult<Option<R>> {
        self.evict_expired(key);
        match self.data.get(key) {
            Some(entry) if !entry.is_expired() => f(&entry.value).map(Some),
            _ => Ok(None),
        }
    }

    /// Muta a coleção da chave, criando-a com `init` quando ausente.
    fn modify<R>(
        &self,
        key: &str,
        init: fn() -> Value,
        f: impl FnOnce(&mut Value) -> StoreResult<R>,
    ) -> StoreResult<R> {
        self.evict_expired(key);
        let result = {
            let mut entry = self
                .data
                .entry(key.to_string())
                .or_insert_with(|| Entry::new(init(), None));
            f(&mut entry.value)
        };
        self.remove_if_empty(key);
        result
    }

    /// Muta a coleção da chave somente se ela existir.
    fn modify_existing<R>(
        &self,
        key: &str,
        f: impl FnOnce(&mut Value) -> StoreResult<R>,
    ) -> StoreResult<Option<R>> {
        self.evict_expired(key);
        let result = match self.data.get_mut(key) {
            Some(mut entry) => f(&mut entry.value).map(Some),
            None => Ok(None),
        };
        self.remove_if_empty(key);
        result
    }

    // Coleções vazias deixam de existir
    fn remove_if_empty(&self, key: &str) {
        self.data.remove_if(key, |_, entry| entry.value.is_empty());
    }

    async fn schedule_expiry(&self, at: Instant, key: &str) {
        let mut expiry = self.expiry.lock().await;
        expiry.insert(ExpiryEntry(at, key.to_string()));
        drop(expiry);
        self.notify_expiry.notify_one();
    }

    // --- String operations ---

    fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.read(key, |value| match value {
            Value::String(data) => Ok(data.clone()),
            _ => Err(StoreError::WrongType),
        })
    }

    async fn set(&self, key: &str, value: Bytes, options: &SetOptions) -> bool {
        self.evict_expired(key);
        // TTL além do alcance do relógio equivale a nunca expirar
        let expires_at = options.expire.and_then(|ttl| Instant::now().checked_add(ttl));

        let written = match self.data.entry(key.to_string()) {
            Slot::Occupied(mut occupied) => {
                if options.condition == Some(SetCondition::Nx) {
                    false
                } else {
                    occupied.insert(Entry::new(Value::String(value), expires_at));
                    true
                }
            }
            Slot::Vacant(vacant) => {
                if options.condition == Some(SetCondition::Xx) {
                    false
                } else {
                    vacant.insert(Entry::new(Value::String(value), expires_at));
                    true
                }
            }
        };

        if written && let Some(at) = expires_at {
            self.schedule_expiry(at, key).await;
        }
        written
    }

    fn del(&self, keys: &[String]) -> usize {
        keys.iter()
            .filter(|key| {
                self.data
                    .remove(key.as_str())
                    .is_some_and(|(_, entry)| !entry.is_expired())
            })
            .count()
    }

    fn exists(&self, key: &str) -> bool {
        self.evict_expired(key);
        self.data.contains_key(key)
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> bool {
        self.evict_expired(key);
        let at = Instant::now().checked_add(ttl);
        let found = match self.data.get_mut(key) {
            Some(mut entry) => {
                entry.expires_at = at;
                true
            }
            None => false,
        };
        if found && let Some(at) = at {
            self.schedule_expiry(at, key).await;
        }
        found
    }

    // --- Hash operations ---

    /// Grava o campo e devolve o valor anterior.
    fn hswap(&self, key: &str, field: &str, value: Bytes) -> StoreResult<Option<Bytes>> {
        self.modify(key, Value::empty_hash, |v| match v {
            Value::Hash(hash) => Ok(hash.insert(field.to_string(), value)),
            _ => Err(StoreError::WrongType),
        })
    }

    fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        self.read(key, |value| match value {
            Value::Hash(hash) => Ok(hash.get(field).cloned()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::flatten)
    }

    fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<usize> {
        self.modify_existing(key, |value| match value {
            Value::Hash(hash) => Ok(fields.iter().filter(|f| hash.remove(*f).is_some()).count()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.read(key, |value| match value {
            Value::Hash(hash) => Ok(hash.len()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        self.read(key, |value| match value {
            Value::Hash(hash) => Ok(hash.keys().cloned().collect()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        self.modify(key, Value::empty_hash, |value| match value {
            Value::Hash(hash) => {
                let current = match hash.get(field) {
                    Some(data) => std::str::from_utf8(data)
                        .ok()
                        .and_then(|s| s.parse::<i64>().ok())
                        .ok_or(StoreError::NotAnInteger)?,
                    None => 0,
                };
                let next = current.checked_add(delta).ok_or(StoreError::NotAnInteger)?;
                hash.insert(field.to_string(), Bytes::from(next.to_string()));
                Ok(next)
            }
            _ => Err(StoreError::WrongType),
        })
    }

    /// Cursor = deslocamento na ordem lexicográfica dos campos.
    fn hscan(&self, key: &str, cursor: u64, count: usize) -> StoreResult<(u64, Vec<(String, Bytes)>)> {
        let page = self.read(key, |value| match value {
            Value::Hash(hash) => {
                let mut fields: Vec<_> = hash.iter().collect();
                fields.sort_by(|a, b| a.0.cmp(b.0));
                let start = usize::try_from(cursor).unwrap_or(usize::MAX);
                let end = start.saturating_add(count.max(1));
                let next = if end >= fields.len() { 0 } else { end as u64 };
                let items = fields
                    .into_iter()
                    .skip(start)
                    .take(end - start)
                    .map(|(f, v)| (f.clone(), v.clone()))
                    .collect();
                Ok((next, items))
            }
            _ => Err(StoreError::WrongType),
        })?;
        Ok(page.unwrap_or_default())
    }

    // --- Sorted set operations ---

    fn zadd(&self, key: &str, score: f64, member: Bytes) -> StoreResult<bool> {
        self.modify(key, Value::empty_zset, |value| match value {
            Value::ZSet(zset) => Ok(zset.insert(member, score)),
            _ => Err(StoreError::WrongType),
        })
    }

    fn zrem(&self, key: &str, members: &[Bytes]) -> StoreResult<usize> {
        self.modify_existing(key, |value| match value {
            Value::ZSet(zset) => Ok(members.iter().filter(|m| zset.remove(m)).count()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn zscore(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>> {
        self.read(key, |value| match value {
            Value::ZSet(zset) => Ok(zset.score(member)),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::flatten)
    }

    fn zincr_by(&self, key: &str, delta: f64, member: Bytes) -> StoreResult<f64> {
        self.modify(key, Value::empty_zset, |value| match value {
            Value::ZSet(zset) => {
                let score = zset.score(&member).unwrap_or(0.0) + delta;
                zset.insert(member, score);
                Ok(score)
            }
            _ => Err(StoreError::WrongType),
        })
    }

    fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<Bytes>> {
        self.read(key, |value| match value {
            Value::ZSet(zset) => Ok(zset.range_by_score(min, max)),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.read(key, |value| match value {
            Value::ZSet(zset) => Ok(zset.len()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    // --- List operations ---

    fn push(&self, key: &str, values: &[Bytes], front: bool) -> StoreResult<usize> {
        let len = self.modify(key, Value::empty_list, |value| match value {
            Value::List(list) => {
                for v in values {
                    if front {
                        list.push_front(v.clone());
                    } else {
                        list.push_back(v.clone());
                    }
                }
                Ok(list.len())
            }
            _ => Err(StoreError::WrongType),
        })?;
        self.pushed.notify_waiters();
        Ok(len)
    }

    fn lpop(&self, key: &str) -> StoreResult<Option<Bytes>> {
        self.modify_existing(key, |value| match value {
            Value::List(list) => Ok(list.pop_front()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::flatten)
    }

    fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        self.read(key, |value| match value {
            Value::List(list) => {
                let len = list.len() as i64;
                // Normalizar índices negativos (estilo Redis)
                let s = if start < 0 { (len + start).max(0) } else { start };
                let e = if stop < 0 { len + stop } else { stop.min(len - 1) };
                if s > e || s >= len {
                    return Ok(vec![]);
                }
                Ok(list.range(s as usize..=e as usize).cloned().collect())
            }
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    fn llen(&self, key: &str) -> StoreResult<usize> {
        self.read(key, |value| match value {
            Value::List(list) => Ok(list.len()),
            _ => Err(StoreError::WrongType),
        })
        .map(Option::unwrap_or_default)
    }

    // --- Transactions ---

    async fn apply(&self, txn: &Txn) -> StoreResult<TxnResponse> {
        let mut succeeded = true;
        for compare in &txn.compare {
            match compare {
                Compare::ValueEquals { key, value } => {
                    if self.get(key)?.as_ref() != Some(value) {
                        succeeded = false;
                    }
                }
            }
        }

        let mut outputs = Vec::new();
        for op in txn.branch(succeeded) {
            let output = match op {
                TxnOp::Del { key } => TxnOutput::Count(self.del(std::slice::from_ref(key)) as i64),
                TxnOp::PExpire { key, ttl } => TxnOutput::Count(self.pexpire(key, *ttl).await as i64),
                TxnOp::HashSwap { key, field, value } => {
                    TxnOutput::Value(self.hswap(key, field, value.clone())?)
                }
                TxnOp::MoveDue {
                    from,
                    to,
                    max_score,
                } => {
                    let due = self.zrange_by_score(from, f64::NEG_INFINITY, *max_score)?;
                    if !due.is_empty() {
                        self.zrem(from, &due)?;
                        self.push(to, &due, false)?;
                    }
                    TxnOutput::Count(due.len() as i64)
                }
            };
            outputs.push(output);
        }

        Ok(TxnResponse { succeeded, outputs })
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let _gate = self.read_gate().await;
        self.shared.get(key)
    }

    async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        Ok(self.shared.set(key, value, &options).await)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        Ok(self.shared.del(keys))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        Ok(self.shared.exists(key))
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        Ok(self.shared.pexpire(key, ttl).await)
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        Ok(self.shared.hswap(key, field, value)?.is_none())
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        let _gate = self.read_gate().await;
        self.shared.hget(key, field)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.hdel(key, fields)
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        Ok(self.shared.hget(key, field)?.is_some())
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.hlen(key)
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        let _gate = self.read_gate().await;
        self.shared.hkeys(key)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        let _gate = self.read_gate().await;
        self.shared.hincr_by(key, field, delta)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<(String, Bytes)>)> {
        let _gate = self.read_gate().await;
        self.shared.hscan(key, cursor, count)
    }

    async fn zadd(&self, key: &str, score: f64, member: Bytes) -> StoreResult<bool> {
        let _gate = self.read_gate().await;
        self.shared.zadd(key, score, member)
    }

    async fn zrem(&self, key: &str, members: &[Bytes]) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.zrem(key, members)
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>> {
        let _gate = self.read_gate().await;
        self.shared.zscore(key, member)
    }

    async fn zincr_by(&self, key: &str, delta: f64, member: Bytes) -> StoreResult<f64> {
        let _gate = self.read_gate().await;
        self.shared.zincr_by(key, delta, member)
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<Bytes>> {
        let _gate = self.read_gate().await;
        self.shared.zrange_by_score(key, min, max)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.zcard(key)
    }

    async fn lpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.push(key, values, true)
    }

    async fn rpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.push(key, values, false)
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<Bytes>> {
        let _gate = self.read_gate().await;
        self.shared.lpop(key)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<Bytes>> {
        let deadline = (!timeout.is_zero())
            .then(|| Instant::now().checked_add(timeout))
            .flatten();
        loop {
            // Registrar interesse antes de checar a lista, senão um push entre
            // o pop vazio e a espera seria perdido.
            let notified = self.shared.pushed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.lpop(key).await? {
                return Ok(Some(value));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Ok(None);
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        let _gate = self.read_gate().await;
        self.shared.lrange(key, start, stop)
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        let _gate = self.read_gate().await;
        self.shared.llen(key)
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        let _gate = self.shared.gate.write().await;
        self.shared.apply(&txn).await
    }
}

/// Background task que purga chaves expiradas.
async fn purge_expired_keys(shared: Weak<Shared>) {
    loop {
        let Some(state) = shared.upgrade() else {
            debug!("store dropado, encerrando purga");
            return;
        };

        let next_expiry = {
            let expiry = state.expiry.lock().await;
            expiry.iter().next().map(|e| e.0)
        };
        let idle_until = Instant::now() + PURGE_IDLE;
        let wake_at = next_expiry.map_or(idle_until, |when| when.min(idle_until));

        tokio::select! {
            _ = tokio::time::sleep_until(wake_at) => {}
            _ = state.notify_expiry.notified() => { continue; }
        }

        // Purgar todas as chaves que expiraram
        let now = Instant::now();
        let mut expiry = state.expiry.lock().await;
        let mut to_remove = Vec::new();

        for entry in expiry.iter() {
            if entry.0 <= now {
                to_remove.push(entry.clone());
            } else {
                break; // BTreeSet é ordenado, os próximos são todos futuros
            }
        }

        for entry in &to_remove {
            expiry.remove(entry);
            // Só remove se realmente expirou (pode ter sido re-setado)
            if state
                .data
                .remove_if(&entry.1, |_, e| e.is_expired())
                .is_some()
            {
                debug!("key expirada removida: {}", entry.1);
            }
        }
    }
}
