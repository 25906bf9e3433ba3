use bytes::Bytes;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use tokio::time::Instant;

/// Tipo do valor armazenado.
#[derive(Debug, Clone)]
pub enum Value {
    String(Bytes),
    List(VecDeque<Bytes>),
    Hash(HashMap<String, Bytes>),
    ZSet(SortedSet),
}

impl Value {
    pub fn empty_list() -> Self {
        Value::List(VecDeque::new())
    }

    pub fn empty_hash() -> Self {
        Value::Hash(HashMap::new())
    }

    pub fn empty_zset() -> Self {
        Value::ZSet(SortedSet::default())
    }

    /// Coleções vazias deixam de existir, como no Redis.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::String(_) => false,
            Value::List(list) => list.is_empty(),
            Value::Hash(hash) => hash.is_empty(),
            Value::ZSet(zset) => zset.is_empty(),
        }
    }
}

/// Entrada no store: valor + TTL opcional.
#[derive(Debug, Clone)]
pub struct Entry {
    pub value: Value,
    pub expires_at: Option<Instant>,
}

impl Entry {
    pub fn new(value: Value, expires_at: Option<Instant>) -> Self {
        Self { value, expires_at }
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|t| Instant::now() >= t)
            .unwrap_or(false)
    }
}

/// Score com ordem total, para poder viver num BTreeSet.
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set: índice por membro + ordem (score, membro).
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<Bytes, f64>,
    order: BTreeSet<(Score, Bytes)>,
}

impl SortedSet {
    /// Insere ou atualiza o score. Retorna true se o membro é novo.
    pub fn insert(&mut self, member: Bytes, score: f64) -> bool {
        let is_new = match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.order.remove(&(Score(old), member.clone()));
                false
            }
            None => true,
        };
        self.order.insert((Score(score), member));
        is_new
    }

    pub fn remove(&mut self, member: &[u8]) -> bool {
        match self.scores.remove_entry(member) {
            Some((member, score)) => {
                self.order.remove(&(Score(score), member));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &[u8]) -> Option<f64> {
        self.scores.get(member).copied()
    }

    /// Membros com `min <= score <= max`, em ordem de score.
    pub fn range_by_score(&self, min: f64, max: f64) -> Vec<Bytes> {
        self.order
            .range((Score(min), Bytes::new())..)
            .take_while(|(score, _)| score.0 <= max)
            .map(|(_, member)| member.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }
}
