use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;
use stormsync_common::{MAX_FRAME_SIZE, ProtocolError};

/// Representação de um frame RESP2.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Simple(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    Null,
    Array(Vec<Frame>),
}

impl Frame {
    /// Tenta decodificar um frame completo do início do buffer.
    ///
    /// Retorna `Ok(None)` quando faltam bytes; nesse caso o buffer fica intacto.
    /// Em caso de sucesso os bytes do frame são consumidos.
    pub fn decode(buf: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let mut cursor = Cursor::new(&buf[..]);
        match read_frame(&mut cursor) {
            Ok(frame) => {
                let consumed = cursor.position() as usize;
                buf.advance(consumed);
                Ok(Some(frame))
            }
            Err(ProtocolError::Incomplete) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encoda o frame no buffer de saída em formato RESP2.
    pub fn encode(&self, dst: &mut BytesMut) {
        match self {
            Frame::Simple(s) => put_line(dst, b'+', s.as_bytes()),
            Frame::Error(s) => put_line(dst, b'-', s.as_bytes()),
            Frame::Integer(n) => put_line(dst, b':', n.to_string().as_bytes()),
            Frame::Bulk(data) => {
                put_line(dst, b'$', data.len().to_string().as_bytes());
                dst.put(data.as_ref());
                dst.put(&b"\r\n"[..]);
            }
            Frame::Null => dst.put(&b"$-1\r\n"[..]),
            Frame::Array(frames) => {
                put_line(dst, b'*', frames.len().to_string().as_bytes());
                for frame in frames {
                    frame.encode(dst);
                }
            }
        }
    }

    /// Helper: cria um Frame::Bulk a partir de &str.
    pub fn bulk(s: &str) -> Frame {
        Frame::Bulk(Bytes::copy_from_slice(s.as_bytes()))
    }

    /// Nome curto do tipo do frame, usado em mensagens de erro.
    pub fn kind(&self) -> &'static str {
        match self {
            Frame::Simple(_) => "simple",
            Frame::Error(_) => "error",
            Frame::Integer(_) => "integer",
            Frame::Bulk(_) => "bulk",
            Frame::Null => "null",
            Frame::Array(_) => "array",
        }
    }
}

fn put_line(dst: &mut BytesMut, tag: u8, body: &[u8]) {
    dst.put_u8(tag);
    dst.put(body);
    dst.put(&b"\r\n"[..]);
}

fn read_frame(src: &mut Cursor<&[u8]>) -> Result<Frame, ProtocolError> {
    match get_u8(src)? {
        b'+' => Ok(Frame::Simple(read_text(src)?)),
        b'-' => Ok(Frame::Error(read_text(src)?)),
        b':' => Ok(Frame::Integer(get_decimal(src)?)),
        b'$' => {
            let len = get_decimal(src)?;
            if len == -1 {
                return Ok(Frame::Null);
            }
            if len < 0 {
                return Err(ProtocolError::InvalidBulkLength(len));
            }
            let len = len as usize;
            if len > MAX_FRAME_SIZE {
                return Err(ProtocolError::FrameTooLarge(len));
            }
            if src.remaining() < len + 2 {
                return Err(ProtocolError::Incomplete);
            }
            let start = src.position() as usize;
            let data = Bytes::copy_from_slice(&src.get_ref()[start..start + len]);
            src.advance(len + 2); // data + \r\n
            Ok(Frame::Bulk(data))
        }
        b'*' => {
            let count = get_decimal(src)?;
            if count == -1 {
                return Ok(Frame::Null);
            }
            if count < 0 {
                return Err(ProtocolError::InvalidBulkLength(count));
            }
            // Não confiar no count para pré-alocar: vem da rede.
            let mut frames = Vec::new();
            for _ in 0..count {
                frames.push(read_frame(src)?);
            }
            Ok(Frame::Array(frames))
        }
        byte => Err(ProtocolError::InvalidFrameType(byte)),
    }
}

fn get_u8(src: &mut Cursor<&[u8]>) -> Result<u8, ProtocolError> {
    if !src.has_remaining() {
        return Err(ProtocolError::Incomplete);
    }
    Ok(src.get_u8())
}

fn get_line<'a>(src: &mut Cursor<&'a [u8]>) -> Result<&'a [u8], ProtocolError> {
    let start = src.position() as usize;
    let buf: &'a [u8] = *src.get_ref();

    match buf[start..].windows(2).position(|w| w == b"\r\n") {
        Some(offset) => {
            src.set_position((start + offset + 2) as u64);
            Ok(&buf[start..start + offset])
        }
        None => Err(ProtocolError::Incomplete),
    }
}

fn read_text(src: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let line = get_line(src)?;
    String::from_utf8(line.to_vec()).map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
}

fn get_decimal(src: &mut Cursor<&[u8]>) -> Result<i64, ProtocolError> {
    let line = get_line(src)?;
    let s = std::str::from_utf8(line).map_err(|e| ProtocolError::InvalidInteger(e.to_string()))?;
    s.parse::<i64>()
        .map_err(|e| ProtocolError::InvalidInteger(e.to_string()))
}
