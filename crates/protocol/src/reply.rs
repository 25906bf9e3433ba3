use bytes::Bytes;
use stormsync_common::ProtocolError;

use crate::Frame;

fn unexpected(expected: &'static str, got: &Frame) -> ProtocolError {
    ProtocolError::UnexpectedReply {
        expected,
        got: got.kind().to_string(),
    }
}

/// Conversões de respostas do servidor para tipos Rust.
///
/// Frames de erro devem ser tratados antes (a conexão os converte em
/// `StoreError::Server`); aqui eles contam como resposta inesperada.
impl Frame {
    pub fn into_integer(self) -> Result<i64, ProtocolError> {
        match self {
            Frame::Integer(n) => Ok(n),
            other => Err(unexpected("integer", &other)),
        }
    }

    /// Resposta `+OK` (true) ou nil (false), como em `SET ... NX`.
    pub fn into_ok_or_nil(self) -> Result<bool, ProtocolError> {
        match self {
            Frame::Simple(s) if s == "OK" => Ok(true),
            Frame::Null => Ok(false),
            other => Err(unexpected("OK ou nil", &other)),
        }
    }

    pub fn into_optional_bulk(self) -> Result<Option<Bytes>, ProtocolError> {
        match self {
            Frame::Bulk(data) => Ok(Some(data)),
            Frame::Simple(s) => Ok(Some(Bytes::from(s))),
            Frame::Null => Ok(None),
            other => Err(unexpected("bulk", &other)),
        }
    }

    pub fn into_array(self) -> Result<Vec<Frame>, ProtocolError> {
        match self {
            Frame::Array(items) => Ok(items),
            Frame::Null => Ok(Vec::new()),
            other => Err(unexpected("array", &other)),
        }
    }

    pub fn into_bulk_array(self) -> Result<Vec<Bytes>, ProtocolError> {
        self.into_array()?
            .into_iter()
            .map(|item| item.into_optional_bulk()?.ok_or(ProtocolError::UnexpectedReply {
                expected: "bulk",
                got: "null".into(),
            }))
            .collect()
    }

    pub fn into_string_array(self) -> Result<Vec<String>, ProtocolError> {
        self.into_bulk_array()?
            .into_iter()
            .map(|b| {
                String::from_utf8(b.to_vec())
                    .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
            })
            .collect()
    }

    pub fn into_string(self) -> Result<String, ProtocolError> {
        let data = self
            .into_optional_bulk()?
            .ok_or(ProtocolError::UnexpectedReply {
                expected: "bulk",
                got: "null".into(),
            })?;
        String::from_utf8(data.to_vec()).map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))
    }

    /// Scores chegam como bulk strings (`"1.5"`, `"inf"`).
    pub fn into_optional_score(self) -> Result<Option<f64>, ProtocolError> {
        match self.into_optional_bulk()? {
            Some(data) => {
                let s = std::str::from_utf8(&data)
                    .map_err(|e| ProtocolError::InvalidEncoding(e.to_string()))?;
                s.parse::<f64>()
                    .map(Some)
                    .map_err(|e| ProtocolError::InvalidInteger(e.to_string()))
            }
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_or_nil() {
        assert!(Frame::Simple("OK".into()).into_ok_or_nil().unwrap());
        assert!(!Frame::Null.into_ok_or_nil().unwrap());
        assert!(Frame::Integer(1).into_ok_or_nil().is_err());
    }

    #[test]
    fn bulk_array_rejects_nil_members() {
        let frame = Frame::Array(vec![Frame::bulk("a"), Frame::Null]);
        assert!(frame.into_bulk_array().is_err());
    }

    #[test]
    fn null_array_is_empty() {
        assert!(Frame::Null.into_bulk_array().unwrap().is_empty());
    }

    #[test]
    fn scores() {
        assert_eq!(
            Frame::bulk("1700000000123").into_optional_score().unwrap(),
            Some(1_700_000_000_123.0)
        );
        assert_eq!(
            Frame::bulk("-inf").into_optional_score().unwrap(),
            Some(f64::NEG_INFINITY)
        );
        assert_eq!(Frame::Null.into_optional_score().unwrap(), None);
    }

    #[test]
    fn integer_mismatch_names_kind() {
        let err = Frame::Null.into_integer().unwrap_err();
        assert_eq!(
            err.to_string(),
            "resposta inesperada: esperado integer, recebido null"
        );
    }
}
