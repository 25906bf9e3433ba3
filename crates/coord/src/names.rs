/// Tipo de estrutura, usado no nome das chaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Lock,
    Cache,
    Queue,
    SafeTypeMap,
}

impl Kind {
    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Lock => "lock",
            Kind::Cache => "cache",
            Kind::Queue => "queue",
            Kind::SafeTypeMap => "safetypemap",
        }
    }
}

/// `<prefix><kind>:<name>`
pub(crate) fn build(prefix: &str, kind: Kind, name: &str) -> String {
    format!("{prefix}{}:{name}", kind.as_str())
}
