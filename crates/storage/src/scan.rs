use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use stormsync_common::StoreResult;

use crate::store::KeyValueStore;

const DEFAULT_PAGE: usize = 100;

/// Iteração preguiçosa sobre os campos de um hash via `HSCAN`.
///
/// Cada página é buscada quando a anterior se esgota. Campos alterados
/// durante a varredura podem ou não aparecer; para recomeçar, crie outro scan.
pub struct HashScan {
    store: Arc<dyn KeyValueStore>,
    key: String,
    page_size: usize,
    cursor: u64,
    buffered: VecDeque<(String, Bytes)>,
    finished: bool,
}

impl HashScan {
    pub fn new(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            page_size: DEFAULT_PAGE,
            cursor: 0,
            buffered: VecDeque::new(),
            finished: false,
        }
    }

    /// Dica de tamanho de página repassada ao `COUNT`.
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Próximo par `(campo, valor)`, ou `None` quando o hash foi percorrido.
    pub async fn next(&mut self) -> StoreResult<Option<(String, Bytes)>> {
        loop {
            if let Some(item) = self.buffered.pop_front() {
                return Ok(Some(item));
            }
            if self.finished {
                return Ok(None);
            }

            let (cursor, items) = self
                .store
                .hscan(&self.key, self.cursor, self.page_size)
                .await?;
            self.cursor = cursor;
            self.finished = cursor == 0;
            self.buffered.extend(items);
        }
    }

    /// Consome o scan acumulando todos os pares restantes.
    pub async fn collect(mut self) -> StoreResult<Vec<(String, Bytes)>> {
        let mut all = Vec::new();
        while let Some(item) = self.next().await? {
            all.push(item);
        }
        Ok(all)
    }
}
