use std::io;
use std::sync::Arc;

use crate::storage::entity::BlockId;
use crate::transaction::TxId;

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("no evictable buffer available in cache")]
    NoFreeBuffer,
    #[error("block id allocator exhausted")]
    AllocatorExhausted,
    #[error("failed to read block {block_id}")]
    ReadFailed {
        block_id: BlockId,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("failed to write block {block_id}")]
    WriteFailed {
        block_id: BlockId,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("load of block {0} was abandoned before it completed")]
    LoadAbandoned(BlockId),
    #[error("transaction {id} aborted")]
    TransactionAborted {
        id: TxId,
        #[source]
        cause: Box<Error>,
    },
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
