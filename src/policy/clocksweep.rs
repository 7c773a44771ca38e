use super::{Candidate, ReplacementPolicy};
use crate::buffer::entity::EvictionMeta;
use crate::storage::entity::BlockId;

/// Usage counts saturate here so that one sweep is bounded.
pub const MAX_USAGE_COUNT: u32 = 5;

/// Clock-sweep over usage counts. The hand remembers the last victim and the next sweep starts
/// just past it, wrapping around the candidates in block id order.
#[derive(Debug, Default)]
pub struct ClockSweep {
    hand: Option<BlockId>,
}

impl ClockSweep {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReplacementPolicy for ClockSweep {
    fn on_insert(&mut self, meta: &EvictionMeta, _tick: u64) {
        meta.set_usage(1);
    }

    fn touch(&mut self, meta: &EvictionMeta, _tick: u64) {
        meta.set_usage((meta.usage() + 1).min(MAX_USAGE_COUNT));
    }

    // Clock-sweep
    fn choose_victim(&mut self, candidates: &[Candidate<'_>]) -> Option<BlockId> {
        if candidates.is_empty() {
            return None;
        }
        let mut next_victim = match self.hand {
            Some(hand) => candidates
                .iter()
                .position(|candidate| candidate.block_id > hand)
                .unwrap_or(0),
            None => 0,
        };
        let victim = loop {
            let candidate = &candidates[next_victim];
            let usage_count = candidate.meta.usage();
            if usage_count == 0 {
                break candidate.block_id;
            }
            candidate.meta.set_usage(usage_count - 1);
            next_victim = (next_victim + 1) % candidates.len();
        };
        self.hand = Some(victim);
        Some(victim)
    }
}
