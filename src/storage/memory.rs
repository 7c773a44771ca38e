use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::rc::Rc;

use super::entity::{BlockData, BlockId};
use super::manager::{CompletionContext, IoKind, Serializer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Read(BlockId),
    Write(BlockId),
}

struct PendingOp {
    block_id: BlockId,
    data: BlockData,
    ctx: CompletionContext,
}

struct MemoryState {
    block_size: usize,
    heap: HashMap<BlockId, BlockData>,
    pending: VecDeque<PendingOp>,
    history: Vec<Op>,
}

/// An in-memory block store that completes operations only when told to.
///
/// Every `do_read`/`do_write` is queued and stays in flight until [`MemoryDisk::complete_next`],
/// [`MemoryDisk::complete_all`] or [`MemoryDisk::fail_next`] is called, which makes the
/// interleaving of submissions and completions fully controllable. Clones share the same store.
#[derive(Clone)]
pub struct MemoryDisk {
    state: Rc<RefCell<MemoryState>>,
}

impl MemoryDisk {
    pub fn new(block_size: usize) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                block_size,
                heap: HashMap::new(),
                pending: VecDeque::new(),
                history: vec![],
            })),
        }
    }

    /// Store `bytes` as the on-disk image of `block_id`, bypassing the queue.
    pub fn put(&self, block_id: BlockId, bytes: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let mut block = BlockData::zeroed(state.block_size);
        let mut row: &mut [u8] = &mut block;
        row.write_all(bytes)?;
        state.heap.insert(block_id, block);
        Ok(())
    }

    /// The on-disk image of `block_id`, if it was ever written.
    pub fn contents(&self, block_id: BlockId) -> Option<Vec<u8>> {
        self.state
            .borrow()
            .heap
            .get(&block_id)
            .map(|block| block.to_vec())
    }

    pub fn history(&self) -> Vec<Op> {
        self.state.borrow().history.clone()
    }

    pub fn reads_of(&self, block_id: BlockId) -> usize {
        self.state
            .borrow()
            .history
            .iter()
            .filter(|&&op| op == Op::Read(block_id))
            .count()
    }

    pub fn pending(&self) -> usize {
        self.state.borrow().pending.len()
    }

    /// Complete the oldest queued operation. Returns `false` when nothing is in flight.
    pub fn complete_next(&self) -> bool {
        let op = self.state.borrow_mut().pending.pop_front();
        let Some(PendingOp {
            block_id,
            mut data,
            ctx,
        }) = op
        else {
            return false;
        };
        let result = match ctx.kind() {
            IoKind::Read => self.read_block(block_id, &mut data).map(|_| data),
            IoKind::Write => self.write_block(block_id, &data).map(|_| data),
        };
        ctx.complete(result);
        true
    }

    pub fn complete_all(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Fail the oldest queued operation with an I/O error instead of performing it.
    pub fn fail_next(&self) -> bool {
        let op = self.state.borrow_mut().pending.pop_front();
        let Some(PendingOp { block_id, ctx, .. }) = op else {
            return false;
        };
        ctx.complete(Err(io::Error::new(
            io::ErrorKind::Other,
            format!("injected failure on block {}", block_id),
        )));
        true
    }

    fn read_block(&self, block_id: BlockId, data: &mut [u8]) -> io::Result<()> {
        let state = self.state.borrow();
        let block = state.heap.get(&block_id).ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("block {} was never written", block_id),
            )
        })?;
        let mut row: &[u8] = block;
        row.read_exact(data)
    }

    fn write_block(&self, block_id: BlockId, data: &[u8]) -> io::Result<()> {
        let mut state = self.state.borrow_mut();
        let mut block = BlockData::zeroed(state.block_size);
        let mut row: &mut [u8] = &mut block;
        row.write_all(data)?;
        state.heap.insert(block_id, block);
        Ok(())
    }
}

impl Serializer for MemoryDisk {
    fn block_size(&self) -> usize {
        self.state.borrow().block_size
    }

    fn block_count(&self) -> u64 {
        self.state
            .borrow()
            .heap
            .keys()
            .map(|id| id.to_u64() + 1)
            .max()
            .unwrap_or(0)
    }

    fn do_read(&mut self, block_id: BlockId, dest: BlockData, ctx: CompletionContext) {
        let mut state = self.state.borrow_mut();
        state.history.push(Op::Read(block_id));
        state.pending.push_back(PendingOp {
            block_id,
            data: dest,
            ctx,
        });
    }

    fn do_write(&mut self, block_id: BlockId, src: BlockData, ctx: CompletionContext) {
        let mut state = self.state.borrow_mut();
        state.history.push(Op::Write(block_id));
        state.pending.push_back(PendingOp {
            block_id,
            data: src,
            ctx,
        });
    }
}
