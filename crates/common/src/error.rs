use std::time::Duration;

/// Erros de parsing do protocolo RESP e de formato de resposta.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame incompleto")]
    Incomplete,
    #[error("byte de tipo inválido: {0:#x}")]
    InvalidFrameType(u8),
    #[error("inteiro inválido: {0}")]
    InvalidInteger(String),
    #[error("comprimento de bulk inválido: {0}")]
    InvalidBulkLength(i64),
    #[error("frame excede tamanho máximo ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("encoding inválido: {0}")]
    InvalidEncoding(String),
    #[error("resposta inesperada: esperado {expected}, recebido {got}")]
    UnexpectedReply { expected: &'static str, got: String },
}

/// Erros do store remoto ou in-memory. Todos caem na classe "store indisponível":
/// são repassados ao chamador e nunca re-tentados internamente.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("conexão resetada pelo peer")]
    ConnectionReset,
    #[error("timeout ao conectar em {0}")]
    ConnectTimeout(String),
    #[error("pool de conexões fechado")]
    PoolClosed,
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("erro do servidor: {0}")]
    Server(String),
    #[error("operação contra chave com tipo errado")]
    WrongType,
    #[error("valor não é um inteiro válido ou está fora do intervalo")]
    NotAnInteger,
}

/// Erros de (de)serialização de valores.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("falha ao serializar: {0}")]
    Encode(String),
    #[error("falha ao desserializar: {0}")]
    Decode(String),
}

/// Erro top-level das primitivas de coordenação.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("lock '{name}' não obtido em {waited:?}")]
    LockTimeout { name: String, waited: Duration },
    #[error("lock '{0}' não pertence a esta instância")]
    LockNotHeld(String),
    #[error(transparent)]
    Serialization(#[from] CodecError),
    #[error("fila cheia (máximo {0} itens)")]
    QueueFull(usize),
}

/// Result type alias.
pub type SyncResult<T> = Result<T, SyncError>;

/// Result type alias para operações de store.
pub type StoreResult<T> = Result<T, StoreError>;

// Conversão implícita de io::Error → SyncError (via StoreError)
impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Store(StoreError::Io(e))
    }
}

impl From<ProtocolError> for SyncError {
    fn from(e: ProtocolError) -> Self {
        SyncError::Store(StoreError::Protocol(e))
    }
}
