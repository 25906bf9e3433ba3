use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Nome padrão do hash de marcadores de uso.
pub const DEFAULT_MARKER_MAP: &str = "__SafeTypeMap__";

/// Configuração do [`Client`](crate::Client).
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Prefixo aplicado a todas as chaves.
    pub prefix: String,
    /// Nome do hash de marcadores (debounce).
    pub marker_map: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            prefix: String::new(),
            marker_map: DEFAULT_MARKER_MAP.to_string(),
        }
    }
}

impl ClientConfig {
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_marker_map(mut self, name: impl Into<String>) -> Self {
        self.marker_map = name.into();
        self
    }
}

/// Configuração de [`Lock`](crate::Lock).
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Duração do lease gravado no store.
    pub wait_time: Duration,
    /// Intervalo entre tentativas de aquisição.
    pub retry_time: Duration,
    /// Espera total máxima de `acquire`. Zero falha na primeira recusa.
    pub max_wait: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_time: Duration::from_secs(5),
            retry_time: Duration::from_secs(1),
            max_wait: Duration::from_secs(30),
        }
    }
}

impl LockConfig {
    pub fn with_wait_time(mut self, lease: Duration) -> Self {
        self.wait_time = lease;
        self
    }

    pub fn with_retry_time(mut self, interval: Duration) -> Self {
        self.retry_time = interval;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Lease efetivo: o store rejeita TTL zero.
    pub(crate) fn lease(&self) -> Duration {
        self.wait_time.max(Duration::from_millis(1))
    }
}

/// Configuração de [`Cache`](crate::Cache).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// TTL aplicado quando `set` não recebe um. `None` nunca expira.
    pub default_expire: Option<Duration>,
    /// Chance de um `set` disparar a varredura de expirados.
    pub sweep_probability: f64,
    /// Intervalo mínimo entre duas varreduras.
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_expire: None,
            sweep_probability: 0.1,
            sweep_interval: Duration::from_secs(60),
        }
    }
}

impl CacheConfig {
    pub fn with_default_expire(mut self, ttl: Duration) -> Self {
        self.default_expire = Some(ttl);
        self
    }

    pub fn with_sweep_probability(mut self, probability: f64) -> Self {
        self.sweep_probability = probability;
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Decisão do error handler de uma fila para um item que falhou.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Descarta o item.
    Drop,
    /// Recoloca no fim da fila.
    Now,
    /// Reagenda na fila atrasada.
    After(Duration),
}

/// Recebe o item (pode reescrevê-lo) e o erro do handler.
pub type ErrorHandler<T> = Arc<dyn Fn(&mut T, &anyhow::Error) -> Retry + Send + Sync>;

/// Configuração de [`Queue`](crate::Queue).
pub struct QueueConfig<T> {
    /// Limite da lista pronta. Zero é ilimitado.
    pub max_length: usize,
    /// Timeout do pop bloqueante. Zero usa pop não bloqueante.
    pub max_wait: Duration,
    /// Falhas toleradas por item. Zero desliga o rastreio de processamento.
    pub max_retry: u32,
    /// Pausa do worker quando a fila está vazia ou o store falhou.
    pub idle_backoff: Duration,
    pub error_handler: Option<ErrorHandler<T>>,
}

impl<T> Default for QueueConfig<T> {
    fn default() -> Self {
        Self {
            max_length: 0,
            max_wait: Duration::ZERO,
            max_retry: 0,
            idle_backoff: Duration::from_secs(1),
            error_handler: None,
        }
    }
}

impl<T> Clone for QueueConfig<T> {
    fn clone(&self) -> Self {
        Self {
            max_length: self.max_length,
            max_wait: self.max_wait,
            max_retry: self.max_retry,
            idle_backoff: self.idle_backoff,
            error_handler: self.error_handler.clone(),
        }
    }
}

impl<T> fmt::Debug for QueueConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueConfig")
            .field("max_length", &self.max_length)
            .field("max_wait", &self.max_wait)
            .field("max_retry", &self.max_retry)
            .field("idle_backoff", &self.idle_backoff)
            .field("error_handler", &self.error_handler.is_some())
            .finish()
    }
}

impl<T> QueueConfig<T> {
    pub fn with_max_length(mut self, max: usize) -> Self {
        self.max_length = max;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_max_retry(mut self, max_retry: u32) -> Self {
        self.max_retry = max_retry;
        self
    }

    pub fn with_idle_backoff(mut self, backoff: Duration) -> Self {
        self.idle_backoff = backoff;
        self
    }

    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&mut T, &anyhow::Error) -> Retry + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }
}
