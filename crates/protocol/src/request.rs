use bytes::Bytes;

use crate::Frame;

/// Conversão de argumentos de comando para bulk strings.
pub trait IntoArg {
    fn into_arg(self) -> Bytes;
}

impl IntoArg for Bytes {
    fn into_arg(self) -> Bytes {
        self
    }
}

impl IntoArg for &Bytes {
    fn into_arg(self) -> Bytes {
        self.clone()
    }
}

impl IntoArg for &[u8] {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self)
    }
}

impl IntoArg for Vec<u8> {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &str {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for String {
    fn into_arg(self) -> Bytes {
        Bytes::from(self)
    }
}

impl IntoArg for &String {
    fn into_arg(self) -> Bytes {
        Bytes::copy_from_slice(self.as_bytes())
    }
}

impl IntoArg for i64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for u64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

impl IntoArg for usize {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

/// Scores usam a sintaxe do Redis: `inf`/`-inf` para os extremos.
impl IntoArg for f64 {
    fn into_arg(self) -> Bytes {
        Bytes::from(self.to_string())
    }
}

/// Comando a ser enviado ao servidor, montado argumento a argumento.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    name: &'static str,
    args: Vec<Bytes>,
}

impl Request {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl IntoArg) -> Self {
        self.args.push(arg.into_arg());
        self
    }

    pub fn args<A: IntoArg>(mut self, args: impl IntoIterator<Item = A>) -> Self {
        self.args.extend(args.into_iter().map(IntoArg::into_arg));
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn into_frame(self) -> Frame {
        let mut frames = Vec::with_capacity(self.args.len() + 1);
        frames.push(Frame::bulk(self.name));
        frames.extend(self.args.into_iter().map(Frame::Bulk));
        Frame::Array(frames)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_nx_px_frame() {
        let frame = Request::new("SET")
            .arg("lock:job:1")
            .arg("token")
            .arg("NX")
            .arg("PX")
            .arg(5000u64)
            .into_frame();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("SET"),
                Frame::bulk("lock:job:1"),
                Frame::bulk("token"),
                Frame::bulk("NX"),
                Frame::bulk("PX"),
                Frame::bulk("5000"),
            ])
        );
    }

    #[test]
    fn scores_use_redis_syntax() {
        let frame = Request::new("ZRANGEBYSCORE")
            .arg("q:delayed")
            .arg(f64::NEG_INFINITY)
            .arg(1_700_000_000_123.0f64)
            .into_frame();
        assert_eq!(
            frame,
            Frame::Array(vec![
                Frame::bulk("ZRANGEBYSCORE"),
                Frame::bulk("q:delayed"),
                Frame::bulk("-inf"),
                Frame::bulk("1700000000123"),
            ])
        );
    }

    #[test]
    fn variadic_args() {
        let request = Request::new("HDEL").arg("h").args(["a", "b"]);
        assert_eq!(request.name(), "HDEL");
        assert_eq!(
            request.into_frame(),
            Frame::Array(vec![
                Frame::bulk("HDEL"),
                Frame::bulk("h"),
                Frame::bulk("a"),
                Frame::bulk("b"),
            ])
        );
    }
}
