use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Epoch atual em milissegundos. Relógio antes de 1970 conta como zero.
pub(crate) fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(duration_millis)
        .unwrap_or_default()
}

/// Duração em ms, saturando em `i64::MAX`.
pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Epoch ms daqui a `duration`, saturando.
pub(crate) fn millis_from_now(duration: Duration) -> i64 {
    now_millis().saturating_add(duration_millis(duration))
}
