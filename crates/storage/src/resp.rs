//! Store remoto que fala RESP2 com servidores compatíveis com Redis.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use stormsync_common::{
    DEFAULT_HOST, DEFAULT_PORT, MAX_CONNECTIONS, ProtocolError, StoreError, StoreResult,
};
use stormsync_protocol::{Frame, Request};

use crate::connection::Connection;
use crate::store::{KeyValueStore, SetCondition, SetOptions, expire_millis};
use crate::txn::{Txn, TxnResponse};

/// Configuração do [`RespStore`].
#[derive(Debug, Clone)]
pub struct RespConfig {
    /// `host:port` do servidor.
    pub addr: String,
    pub password: Option<String>,
    /// Máximo de conexões simultâneas (e ociosas) no pool.
    pub max_connections: usize,
    pub connect_timeout: Duration,
}

impl Default for RespConfig {
    fn default() -> Self {
        Self {
            addr: format!("{DEFAULT_HOST}:{DEFAULT_PORT}"),
            password: None,
            max_connections: MAX_CONNECTIONS,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

impl RespConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Default::default()
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max.max(1);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

struct Pool {
    permits: Semaphore,
    idle: Mutex<Vec<Connection>>,
}

/// Handle para o store remoto. Clonar compartilha o pool.
#[derive(Clone)]
pub struct RespStore {
    config: Arc<RespConfig>,
    pool: Arc<Pool>,
}

impl RespStore {
    /// Cria o store sem abrir conexões; a primeira é aberta sob demanda.
    pub fn new(config: RespConfig) -> Self {
        Self {
            pool: Arc::new(Pool {
                permits: Semaphore::new(config.max_connections),
                idle: Mutex::new(Vec::new()),
            }),
            config: Arc::new(config),
        }
    }

    /// Cria o store e valida o acesso com `PING`.
    pub async fn connect(config: RespConfig) -> StoreResult<Self> {
        let store = Self::new(config);
        store.ping().await?;
        info!(addr = %store.config.addr, "conectado ao store");
        Ok(store)
    }

    pub fn config(&self) -> &RespConfig {
        &self.config
    }

    async fn dial(&self) -> StoreResult<Connection> {
        let addr = self.config.addr.as_str();
        let stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| StoreError::ConnectTimeout(addr.to_string()))??;
        stream.set_nodelay(true)?;

        let mut conn = Connection::new(stream);
        if let Some(password) = &self.config.password {
            conn.round_trip(Request::new("AUTH").arg(password)).await?;
        }
        debug!(addr, "nova conexão aberta");
        Ok(conn)
    }

    /// Executa um comando numa conexão do pool.
    ///
    /// Conexões que sofreram erro de transporte são descartadas; erros
    /// reportados pelo servidor mantêm a conexão utilizável.
    async fn execute(&self, request: Request) -> StoreResult<Frame> {
        let _permit = self
            .pool
            .permits
            .acquire()
            .await
            .map_err(|_| StoreError::PoolClosed)?;

        let idle = self.pool.idle.lock().await.pop();
        let mut conn = match idle {
            Some(conn) => conn,
            None => self.dial().await?,
        };

        let command = request.name();
        let result = conn.round_trip(request).await;
        match &result {
            Ok(_) | Err(StoreError::Server(_) | StoreError::WrongType) => {
                self.pool.idle.lock().await.push(conn);
            }
            Err(err) => {
                debug!(command, error = %err, "conexão descartada");
            }
        }
        result
    }

    async fn count(&self, request: Request) -> StoreResult<usize> {
        let n = self.execute(request).await?.into_integer()?;
        usize::try_from(n).map_err(|_| {
            StoreError::Protocol(ProtocolError::UnexpectedReply {
                expected: "contagem não negativa",
                got: n.to_string(),
            })
        })
    }

    async fn flag(&self, request: Request) -> StoreResult<bool> {
        Ok(self.execute(request).await?.into_integer()? == 1)
    }
}

#[async_trait]
impl KeyValueStore for RespStore {
    async fn ping(&self) -> StoreResult<()> {
        match self.execute(Request::new("PING")).await? {
            Frame::Simple(pong) if pong == "PONG" => Ok(()),
            other => Err(ProtocolError::UnexpectedReply {
                expected: "PONG",
                got: other.kind().to_string(),
            }
            .into()),
        }
    }

    async fn get(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self
            .execute(Request::new("GET").arg(key))
            .await?
            .into_optional_bulk()?)
    }

    async fn set(&self, key: &str, value: Bytes, options: SetOptions) -> StoreResult<bool> {
        let mut request = Request::new("SET").arg(key).arg(value);
        if let Some(ttl) = options.expire {
            request = request.arg("PX").arg(expire_millis(ttl));
        }
        request = match options.condition {
            Some(SetCondition::Nx) => request.arg("NX"),
            Some(SetCondition::Xx) => request.arg("XX"),
            None => request,
        };
        Ok(self.execute(request).await?.into_ok_or_nil()?)
    }

    async fn del(&self, keys: &[String]) -> StoreResult<usize> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.count(Request::new("DEL").args(keys)).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.flag(Request::new("EXISTS").arg(key)).await
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.flag(
            Request::new("PEXPIRE")
                .arg(key)
                .arg(expire_millis(ttl)),
        )
        .await
    }

    async fn hset(&self, key: &str, field: &str, value: Bytes) -> StoreResult<bool> {
        self.flag(Request::new("HSET").arg(key).arg(field).arg(value))
            .await
    }

    async fn hget(&self, key: &str, field: &str) -> StoreResult<Option<Bytes>> {
        Ok(self
            .execute(Request::new("HGET").arg(key).arg(field))
            .await?
            .into_optional_bulk()?)
    }

    async fn hdel(&self, key: &str, fields: &[String]) -> StoreResult<usize> {
        if fields.is_empty() {
            return Ok(0);
        }
        self.count(Request::new("HDEL").arg(key).args(fields)).await
    }

    async fn hexists(&self, key: &str, field: &str) -> StoreResult<bool> {
        self.flag(Request::new("HEXISTS").arg(key).arg(field)).await
    }

    async fn hlen(&self, key: &str) -> StoreResult<usize> {
        self.count(Request::new("HLEN").arg(key)).await
    }

    async fn hkeys(&self, key: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .execute(Request::new("HKEYS").arg(key))
            .await?
            .into_string_array()?)
    }

    async fn hincr_by(&self, key: &str, field: &str, delta: i64) -> StoreResult<i64> {
        Ok(self
            .execute(Request::new("HINCRBY").arg(key).arg(field).arg(delta))
            .await?
            .into_integer()?)
    }

    async fn hscan(
        &self,
        key: &str,
        cursor: u64,
        count: usize,
    ) -> StoreResult<(u64, Vec<(String, Bytes)>)> {
        let reply = self
            .execute(
                Request::new("HSCAN")
                    .arg(key)
                    .arg(cursor)
                    .arg("COUNT")
                    .arg(count),
            )
            .await?;
        Ok(parse_hscan(reply)?)
    }

    async fn zadd(&self, key: &str, score: f64, member: Bytes) -> StoreResult<bool> {
        self.flag(Request::new("ZADD").arg(key).arg(score).arg(member))
            .await
    }

    async fn zrem(&self, key: &str, members: &[Bytes]) -> StoreResult<usize> {
        if members.is_empty() {
            return Ok(0);
        }
        self.count(Request::new("ZREM").arg(key).args(members)).await
    }

    async fn zscore(&self, key: &str, member: &[u8]) -> StoreResult<Option<f64>> {
        Ok(self
            .execute(Request::new("ZSCORE").arg(key).arg(member))
            .await?
            .into_optional_score()?)
    }

    async fn zincr_by(&self, key: &str, delta: f64, member: Bytes) -> StoreResult<f64> {
        let score = self
            .execute(Request::new("ZINCRBY").arg(key).arg(delta).arg(member))
            .await?
            .into_optional_score()?;
        score.ok_or_else(|| {
            StoreError::Protocol(ProtocolError::UnexpectedReply {
                expected: "score",
                got: "null".into(),
            })
        })
    }

    async fn zrange_by_score(&self, key: &str, min: f64, max: f64) -> StoreResult<Vec<Bytes>> {
        Ok(self
            .execute(Request::new("ZRANGEBYSCORE").arg(key).arg(min).arg(max))
            .await?
            .into_bulk_array()?)
    }

    async fn zcard(&self, key: &str) -> StoreResult<usize> {
        self.count(Request::new("ZCARD").arg(key)).await
    }

    async fn lpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        self.count(Request::new("LPUSH").arg(key).args(values)).await
    }

    async fn rpush(&self, key: &str, values: &[Bytes]) -> StoreResult<usize> {
        if values.is_empty() {
            return self.llen(key).await;
        }
        self.count(Request::new("RPUSH").arg(key).args(values)).await
    }

    async fn lpop(&self, key: &str) -> StoreResult<Option<Bytes>> {
        Ok(self
            .execute(Request::new("LPOP").arg(key))
            .await?
            .into_optional_bulk()?)
    }

    async fn blpop(&self, key: &str, timeout: Duration) -> StoreResult<Option<Bytes>> {
        let reply = self
            .execute(Request::new("BLPOP").arg(key).arg(timeout.as_secs_f64()))
            .await?;
        // Resposta: nil no timeout, ou [chave, valor]
        let mut items = reply.into_bulk_array()?;
        Ok(items.pop().filter(|_| items.len() == 1))
    }

    async fn lrange(&self, key: &str, start: i64, stop: i64) -> StoreResult<Vec<Bytes>> {
        Ok(self
            .execute(Request::new("LRANGE").arg(key).arg(start).arg(stop))
            .await?
            .into_bulk_array()?)
    }

    async fn llen(&self, key: &str) -> StoreResult<usize> {
        self.count(Request::new("LLEN").arg(key)).await
    }

    async fn txn(&self, txn: Txn) -> StoreResult<TxnResponse> {
        let script = txn.to_script();
        let request = Request::new("EVAL")
            .arg(script.source)
            .arg(script.keys.len())
            .args(script.keys)
            .args(script.args);
        let reply = self.execute(request).await?;
        Ok(txn.parse_reply(reply)?)
    }
}

/// Resposta do HSCAN: `[cursor, [campo, valor, campo, valor, ...]]`.
fn parse_hscan(reply: Frame) -> Result<(u64, Vec<(String, Bytes)>), ProtocolError> {
    let mut parts = reply.into_array()?.into_iter();
    let (Some(cursor), Some(items), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(ProtocolError::UnexpectedReply {
            expected: "array [cursor, itens]",
            got: "array de outro tamanho".into(),
        });
    };

    let cursor = cursor
        .into_string()?
        .parse::<u64>()
        .map_err(|e| ProtocolError::InvalidInteger(e.to_string()))?;

    let mut flat = items.into_bulk_array()?.into_iter();
    let mut pairs = Vec::with_capacity(flat.len() / 2);
    while let Some(field) = flat.next() {
        let value = flat.next().ok_or(ProtocolError::UnexpectedReply {
            expected: "pares campo/valor",
            got: "número ímpar de itens".into(),
        })?;
        let field = String::from_utf8(field.to_vec())
            .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))?;
        pairs.push((field, value));
    }

    Ok((cursor, pairs))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builders() {
        let config = RespConfig::new("10.0.0.1:6380")
            .with_password("secret")
            .with_max_connections(0)
            .with_connect_timeout(Duration::from_millis(250));
        assert_eq!(config.addr, "10.0.0.1:6380");
        assert_eq!(config.password.as_deref(), Some("secret"));
        assert_eq!(config.max_connections, 1);
        assert_eq!(config.connect_timeout, Duration::from_millis(250));
    }

    #[test]
    fn default_config_points_at_localhost() {
        let config = RespConfig::default();
        assert_eq!(config.addr, "127.0.0.1:6379");
        assert_eq!(config.max_connections, MAX_CONNECTIONS);
    }

    #[test]
    fn hscan_reply_parsing() {
        let reply = Frame::Array(vec![
            Frame::bulk("17"),
            Frame::Array(vec![
                Frame::bulk("a"),
                Frame::bulk("1"),
                Frame::bulk("b"),
                Frame::bulk("2"),
            ]),
        ]);
        let (cursor, pairs) = parse_hscan(reply).unwrap();
        assert_eq!(cursor, 17);
        assert_eq!(
            pairs,
            vec![
                ("a".to_string(), Bytes::from("1")),
                ("b".to_string(), Bytes::from("2")),
            ]
        );
    }

    #[test]
    fn hscan_reply_rejects_odd_items() {
        let reply = Frame::Array(vec![
            Frame::bulk("0"),
            Frame::Array(vec![Frame::bulk("a")]),
        ]);
        assert!(parse_hscan(reply).is_err());
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let result = RespStore::connect(RespConfig::new(addr.to_string())).await;
        assert!(result.is_err());
    }
}
