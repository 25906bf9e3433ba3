//! Transação atômica agnóstica de store.
//!
//! Uma lista ordenada de comparações e mutações executada de forma
//! indivisível: se todas as comparações passam roda `success`, senão
//! `failure`. O `MemoryStore` executa sob um gate exclusivo; o `RespStore`
//! compila a transação num único script Lua.

use std::fmt::Write;
use std::time::Duration;

use bytes::Bytes;
use stormsync_common::ProtocolError;
use stormsync_protocol::Frame;

use crate::store::expire_millis;

/// Predicado avaliado antes das operações.
#[derive(Debug, Clone, PartialEq)]
pub enum Compare {
    /// O valor string da chave é exatamente `value` (chave ausente falha).
    ValueEquals { key: String, value: Bytes },
}

impl Compare {
    pub fn value_equals(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Compare::ValueEquals {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Mutação executada dentro da transação.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOp {
    /// Remove a chave. Saída: número de chaves removidas.
    Del { key: String },
    /// Redefine o TTL da chave. Saída: 1 se a chave existia, 0 senão.
    PExpire { key: String, ttl: Duration },
    /// Grava o campo do hash. Saída: valor anterior do campo.
    HashSwap {
        key: String,
        field: String,
        value: Bytes,
    },
    /// Move os membros de `from` (sorted set) com score <= `max_score` para o
    /// fim da lista `to`, em ordem de score. Saída: quantos foram movidos.
    MoveDue {
        from: String,
        to: String,
        max_score: f64,
    },
}

/// Resultado de uma operação.
#[derive(Debug, Clone, PartialEq)]
pub enum TxnOutput {
    Count(i64),
    Value(Option<Bytes>),
}

impl TxnOutput {
    pub fn count(&self) -> i64 {
        match self {
            TxnOutput::Count(n) => *n,
            TxnOutput::Value(_) => 0,
        }
    }

    pub fn into_value(self) -> Option<Bytes> {
        match self {
            TxnOutput::Value(v) => v,
            TxnOutput::Count(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Txn {
    pub compare: Vec<Compare>,
    pub success: Vec<TxnOp>,
    pub failure: Vec<TxnOp>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TxnResponse {
    /// Se todas as comparações passaram.
    pub succeeded: bool,
    /// Saídas das operações do ramo executado, na ordem.
    pub outputs: Vec<TxnOutput>,
}

impl TxnResponse {
    pub fn first_count(&self) -> i64 {
        self.outputs.first().map(TxnOutput::count).unwrap_or(0)
    }

    pub fn into_first_value(self) -> Option<Bytes> {
        self.outputs.into_iter().next().and_then(TxnOutput::into_value)
    }
}

impl Txn {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn when(mut self, compare: Compare) -> Self {
        self.compare.push(compare);
        self
    }

    pub fn then(mut self, op: TxnOp) -> Self {
        self.success.push(op);
        self
    }

    pub fn or_else(mut self, op: TxnOp) -> Self {
        self.failure.push(op);
        self
    }

    /// Operações do ramo escolhido.
    pub fn branch(&self, succeeded: bool) -> &[TxnOp] {
        if succeeded {
            &self.success
        } else {
            &self.failure
        }
    }

    /// Compila a transação num script Lua com KEYS/ARGV posicionais.
    ///
    /// O script devolve `{ok, {saida1, saida2, ...}}`; nil vira `false` no Lua
    /// e volta como bulk nulo.
    pub fn to_script(&self) -> Script {
        let mut script = Script::default();
        let mut src = String::from("local ok = true\n");

        for compare in &self.compare {
            match compare {
                Compare::ValueEquals { key, value } => {
                    let k = script.key(key);
                    let a = script.arg(value.clone());
                    let _ = writeln!(
                        src,
                        "if redis.call('GET', KEYS[{k}]) ~= ARGV[{a}] then ok = false end"
                    );
                }
            }
        }

        src.push_str("local out = {}\nif ok then\n");
        emit_ops(&mut script, &mut src, &self.success);
        src.push_str("else\n");
        emit_ops(&mut script, &mut src, &self.failure);
        src.push_str("end\nreturn {ok and 1 or 0, out}\n");

        script.source = src;
        script
    }

    /// Interpreta a resposta do script gerado por [`Txn::to_script`].
    pub fn parse_reply(&self, reply: Frame) -> Result<TxnResponse, ProtocolError> {
        let mut parts = reply.into_array()?.into_iter();
        let (Some(flag), Some(outputs), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(ProtocolError::UnexpectedReply {
                expected: "array {ok, outputs}",
                got: "array de outro tamanho".into(),
            });
        };

        let succeeded = flag.into_integer()? == 1;
        let ops = self.branch(succeeded);
        let raw = outputs.into_array()?;
        if raw.len() != ops.len() {
            return Err(ProtocolError::UnexpectedReply {
                expected: "uma saída por operação",
                got: format!("{} saídas para {} operações", raw.len(), ops.len()),
            });
        }

        let outputs = ops
            .iter()
            .zip(raw)
            .map(|(op, frame)| match op {
                TxnOp::HashSwap { .. } => frame.into_optional_bulk().map(TxnOutput::Value),
                _ => frame.into_integer().map(TxnOutput::Count),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(TxnResponse { succeeded, outputs })
    }
}

fn emit_ops(script: &mut Script, src: &mut String, ops: &[TxnOp]) {
    for op in ops {
        match op {
            TxnOp::Del { key } => {
                let k = script.key(key);
                let _ = writeln!(src, "  out[#out + 1] = redis.call('DEL', KEYS[{k}])");
            }
            TxnOp::PExpire { key, ttl } => {
                let k = script.key(key);
                let a = script.arg(Bytes::from(expire_millis(*ttl).to_string()));
                let _ = writeln!(
                    src,
                    "  out[#out + 1] = redis.call('PEXPIRE', KEYS[{k}], ARGV[{a}])"
                );
            }
            TxnOp::HashSwap { key, field, value } => {
                let k = script.key(key);
                let f = script.arg(Bytes::copy_from_slice(field.as_bytes()));
                let v = script.arg(value.clone());
                let _ = writeln!(
                    src,
                    "  do\n    local prev = redis.call('HGET', KEYS[{k}], ARGV[{f}])\n    \
                     redis.call('HSET', KEYS[{k}], ARGV[{f}], ARGV[{v}])\n    \
                     out[#out + 1] = prev\n  end"
                );
            }
            TxnOp::MoveDue {
                from,
                to,
                max_score,
            } => {
                let f = script.key(from);
                let t = script.key(to);
                let m = script.arg(Bytes::from(max_score.to_string()));
                let _ = writeln!(
                    src,
                    "  do\n    local items = redis.call('ZRANGEBYSCORE', KEYS[{f}], '-inf', ARGV[{m}])\n    \
                     for _, item in ipairs(items) do\n      \
                     redis.call('ZREM', KEYS[{f}], item)\n      \
                     redis.call('RPUSH', KEYS[{t}], item)\n    \
                     end\n    \
                     out[#out + 1] = #items\n  end"
                );
            }
        }
    }
}

/// Script Lua pronto para `EVAL`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Script {
    pub source: String,
    pub keys: Vec<String>,
    pub args: Vec<Bytes>,
}

impl Script {
    /// Registra uma chave e devolve seu índice (base 1, como no Lua).
    fn key(&mut self, key: &str) -> usize {
        self.keys.push(key.to_string());
        self.keys.len()
    }

    fn arg(&mut self, arg: Bytes) -> usize {
        self.args.push(arg);
        self.args.len()
    }
}
