use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::TcpStream;

use stormsync_common::{INITIAL_BUFFER_CAPACITY, StoreError, StoreResult};
use stormsync_protocol::{Frame, Request};

/// Wrapper sobre TcpStream com buffer para leitura/escrita de frames RESP.
pub struct Connection {
    stream: BufWriter<TcpStream>,
    buffer: BytesMut,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream: BufWriter::new(stream),
            buffer: BytesMut::with_capacity(INITIAL_BUFFER_CAPACITY),
        }
    }

    /// Lê um frame completo do stream. Retorna None no EOF.
    pub async fn read_frame(&mut self) -> StoreResult<Option<Frame>> {
        loop {
            if let Some(frame) = Frame::decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            let n = self.stream.read_buf(&mut self.buffer).await?;
            if n == 0 {
                if self.buffer.is_empty() {
                    return Ok(None);
                }
                return Err(StoreError::ConnectionReset);
            }
        }
    }

    /// Escreve um frame no stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> StoreResult<()> {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        self.stream.write_all(&buf).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Envia o comando e espera a resposta. Respostas de erro viram
    /// `StoreError`.
    pub async fn round_trip(&mut self, request: Request) -> StoreResult<Frame> {
        self.write_frame(&request.into_frame()).await?;
        match self.read_frame().await? {
            Some(Frame::Error(message)) => Err(server_error(message)),
            Some(frame) => Ok(frame),
            None => Err(StoreError::ConnectionReset),
        }
    }
}

fn server_error(message: String) -> StoreError {
    if message.starts_with("WRONGTYPE") {
        StoreError::WrongType
    } else {
        StoreError::Server(message)
    }
}
