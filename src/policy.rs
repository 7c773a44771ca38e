use serde::{Deserialize, Serialize};

use crate::buffer::entity::EvictionMeta;
use crate::storage::entity::BlockId;

// Clock-sweep による追い出し
pub mod clocksweep;

// LRU による追い出し
pub mod lru;

/// An eviction-eligible buffer: unpinned, cached, clean and not being written back.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub block_id: BlockId,
    pub meta: &'a EvictionMeta,
}

pub trait ReplacementPolicy {
    // バッファがキャッシュに登録された
    fn on_insert(&mut self, meta: &EvictionMeta, tick: u64);
    // バッファが再びピンされた
    fn touch(&mut self, meta: &EvictionMeta, tick: u64);
    // 追い出すバッファを選ぶ。`candidates` はブロック ID 順に並んでいる
    fn choose_victim(&mut self, candidates: &[Candidate<'_>]) -> Option<BlockId>;
}

impl<P: ReplacementPolicy + ?Sized> ReplacementPolicy for Box<P> {
    fn on_insert(&mut self, meta: &EvictionMeta, tick: u64) {
        (**self).on_insert(meta, tick)
    }
    fn touch(&mut self, meta: &EvictionMeta, tick: u64) {
        (**self).touch(meta, tick)
    }
    fn choose_victim(&mut self, candidates: &[Candidate<'_>]) -> Option<BlockId> {
        (**self).choose_victim(candidates)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PolicyKind {
    #[default]
    ClockSweep,
    Lru,
}

pub fn build(kind: PolicyKind) -> Box<dyn ReplacementPolicy> {
    match kind {
        PolicyKind::ClockSweep => Box::new(clocksweep::ClockSweep::new()),
        PolicyKind::Lru => Box::new(lru::Lru),
    }
}
