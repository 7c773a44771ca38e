use super::{Candidate, ReplacementPolicy};
use crate::buffer::entity::EvictionMeta;
use crate::storage::entity::BlockId;

/// Evicts the candidate touched longest ago.
#[derive(Debug, Default, Clone, Copy)]
pub struct Lru;

impl ReplacementPolicy for Lru {
    fn on_insert(&mut self, meta: &EvictionMeta, tick: u64) {
        meta.set_last_access(tick);
    }

    fn touch(&mut self, meta: &EvictionMeta, tick: u64) {
        meta.set_last_access(tick);
    }

    fn choose_victim(&mut self, candidates: &[Candidate<'_>]) -> Option<BlockId> {
        candidates
            .iter()
            .min_by_key(|candidate| candidate.meta.last_access())
            .map(|candidate| candidate.block_id)
    }
}
