//! Serialização dos valores guardados em caches e filas.
//!
//! O codec é escolhido em tempo de compilação pelo parâmetro `C` de
//! [`Cache`](crate::Cache) e [`Queue`](crate::Queue). O ack de filas
//! re-encoda o valor para encontrá-lo no set de processamento, então o
//! encoding precisa ser determinístico.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use stormsync_common::CodecError;

pub trait Codec<T>: Send + Sync + 'static {
    fn encode(value: &T) -> Result<Bytes, CodecError>;

    fn decode(data: &[u8]) -> Result<T, CodecError>;
}

/// JSON via `serde_json`, para qualquer tipo serde.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl<T> Codec<T> for JsonCodec
where
    T: Serialize + DeserializeOwned,
{
    fn encode(value: &T) -> Result<Bytes, CodecError> {
        serde_json::to_vec(value)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(data: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// Bytes gravados como estão. `String` exige UTF-8 na leitura.
#[derive(Debug, Clone, Copy, Default)]
pub struct RawCodec;

impl Codec<Bytes> for RawCodec {
    fn encode(value: &Bytes) -> Result<Bytes, CodecError> {
        Ok(value.clone())
    }

    fn decode(data: &[u8]) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(data))
    }
}

impl Codec<String> for RawCodec {
    fn encode(value: &String) -> Result<Bytes, CodecError> {
        Ok(Bytes::copy_from_slice(value.as_bytes()))
    }

    fn decode(data: &[u8]) -> Result<String, CodecError> {
        String::from_utf8(data.to_vec()).map_err(|e| CodecError::Decode(e.to_string()))
    }
}
