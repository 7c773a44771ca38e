use super::entity::{BlockData, BlockId};

use futures::channel::mpsc::UnboundedSender;
use std::io;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum IoKind {
    Read,
    Write,
}

/// Correlates one outstanding disk operation with the cache that issued it.
///
/// A context is handed to the serializer together with the operation and must be consumed by
/// exactly one call to [`CompletionContext::complete`]. It is deliberately not `Clone`.
#[derive(Debug)]
pub struct CompletionContext {
    pub(crate) id: u64,
    pub(crate) block_id: BlockId,
    pub(crate) kind: IoKind,
    pub(crate) sink: UnboundedSender<IoCompletion>,
}

impl CompletionContext {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn kind(&self) -> IoKind {
        self.kind
    }

    /// Report the outcome of the operation back to the owning cache.
    ///
    /// For reads `result` carries the filled destination, for writes the source handed to
    /// `do_write`. If the cache has already been dropped the completion is discarded.
    pub fn complete(self, result: io::Result<BlockData>) {
        let sink = self.sink.clone();
        // a closed channel means the cache is gone
        let _ = sink.unbounded_send(IoCompletion { ctx: self, result });
    }
}

#[derive(Debug)]
pub struct IoCompletion {
    pub ctx: CompletionContext,
    pub result: io::Result<BlockData>,
}

pub trait Serializer {
    // ブロックのバイト数
    fn block_size(&self) -> usize;
    // 既にストレージ上に存在するブロック数
    fn block_count(&self) -> u64;
    // ブロックを非同期に読み出す。完了は ctx 経由で通知する
    fn do_read(&mut self, block_id: BlockId, dest: BlockData, ctx: CompletionContext);
    // ブロックを非同期に書き出す。完了は ctx 経由で通知する
    fn do_write(&mut self, block_id: BlockId, src: BlockData, ctx: CompletionContext);
}
