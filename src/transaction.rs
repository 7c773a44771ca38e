use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::Rc;

use tracing::{debug, warn};

use crate::buffer::entity::{Buffer, PreImage};
use crate::buffer::handle::{BufferGuard, PendingBuffer};
use crate::cache::Cache;
use crate::error::Error;
use crate::policy::ReplacementPolicy;
use crate::storage::entity::BlockId;
use crate::storage::manager::Serializer;

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct TxId(pub u64);

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx{}", self.0)
    }
}

/// Buffers a transaction mutated, each with the image it first found.
pub(crate) type Mutations = Vec<(Rc<Buffer>, PreImage)>;

/// State shared between a transaction and the guards it handed out.
pub(crate) struct TxState {
    id: TxId,
    open: Cell<bool>,
    failure: RefCell<Option<Error>>,
    mutated: RefCell<Mutations>,
}

impl TxState {
    fn new(id: TxId) -> Self {
        Self {
            id,
            open: Cell::new(true),
            failure: RefCell::new(None),
            mutated: RefCell::new(vec![]),
        }
    }

    pub(crate) fn id(&self) -> TxId {
        self.id
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.get()
    }

    /// Remember the first I/O failure seen by this transaction; it can no longer commit.
    pub(crate) fn record_failure(&self, err: Error) {
        let mut failure = self.failure.borrow_mut();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    /// Register a mutation stamped `stamp`. The first one per buffer saves its pre-image.
    pub(crate) fn record_mutation(&self, buffer: &Rc<Buffer>, stamp: u64) {
        let mut mutated = self.mutated.borrow_mut();
        if !mutated.iter().any(|(seen, _)| Rc::ptr_eq(seen, buffer)) {
            let pre_image = buffer.pre_image(stamp);
            buffer.add_writer();
            mutated.push((Rc::clone(buffer), pre_image));
        }
    }

    fn close(&self) -> Mutations {
        self.open.set(false);
        let mutated: Mutations = self.mutated.borrow_mut().drain(..).collect();
        for (buffer, _) in &mutated {
            buffer.remove_writer();
        }
        mutated
    }
}

/// Outcome of [`Transaction::acquire`].
pub enum Acquired<'c> {
    /// The block was resident and loaded.
    Ready(BufferGuard<'c>),
    /// The block is being loaded; await the handle to get the buffer.
    Pending(PendingBuffer<'c>),
}

impl<'c> Acquired<'c> {
    pub fn is_ready(&self) -> bool {
        matches!(self, Acquired::Ready(_))
    }

    pub async fn wait(self) -> Result<BufferGuard<'c>, Error> {
        match self {
            Acquired::Ready(guard) => Ok(guard),
            Acquired::Pending(pending) => pending.await,
        }
    }
}

/// A unit of work against one [`Cache`].
///
/// Buffers are pinned through the guards the transaction hands out. On [`Transaction::commit`]
/// every buffer mutated under it is queued for write-back; [`Transaction::abort`] (or dropping
/// an open transaction) puts back the images the transaction started from instead.
pub struct Transaction<'c, S: Serializer, P: ReplacementPolicy> {
    cache: &'c Cache<S, P>,
    state: Rc<TxState>,
}

impl<'c, S: Serializer, P: ReplacementPolicy> Transaction<'c, S, P> {
    pub(crate) fn new(cache: &'c Cache<S, P>, id: TxId) -> Self {
        Self {
            cache,
            state: Rc::new(TxState::new(id)),
        }
    }

    pub fn id(&self) -> TxId {
        self.state.id()
    }

    pub fn is_open(&self) -> bool {
        self.state.is_open()
    }

    /// The I/O failure that doomed this transaction, if any.
    pub fn failure(&self) -> Option<Error> {
        self.state.failure.borrow().clone()
    }

    fn assert_open(&self, operation: &str) {
        assert!(
            self.state.is_open(),
            "{} on closed transaction {}",
            operation,
            self.state.id()
        );
    }

    /// Create a new block. The returned buffer is pinned, zeroed and already cached.
    pub fn allocate(&mut self) -> Result<(BlockId, BufferGuard<'c>), Error> {
        self.assert_open("allocate");
        self.cache.allocate(&self.state)
    }

    /// Pin `block_id`, loading it from disk if it is not resident.
    pub fn acquire(&mut self, block_id: BlockId) -> Result<Acquired<'c>, Error> {
        self.assert_open("acquire");
        self.cache.acquire(&self.state, block_id)
    }

    /// Pin `block_id` and wait until it is loaded.
    pub async fn get(&mut self, block_id: BlockId) -> Result<BufferGuard<'c>, Error> {
        self.acquire(block_id)?.wait().await
    }

    pub fn commit(self) -> Result<(), Error> {
        self.assert_open("commit");
        let mutated = self.state.close();
        if let Some(cause) = self.failure() {
            warn!(tx = %self.id(), error = %cause, "commit refused after I/O failure");
            self.cache.roll_back(mutated);
            return Err(Error::TransactionAborted {
                id: self.id(),
                cause: Box::new(cause),
            });
        }
        debug!(tx = %self.id(), mutated = mutated.len(), "commit");
        self.cache.schedule_writeback(mutated);
        Ok(())
    }

    pub fn abort(self) {
        self.assert_open("abort");
        let mutated = self.state.close();
        debug!(tx = %self.id(), mutated = mutated.len(), "abort");
        self.cache.roll_back(mutated);
    }
}

impl<S: Serializer, P: ReplacementPolicy> Drop for Transaction<'_, S, P> {
    fn drop(&mut self) {
        if self.state.is_open() {
            let mutated = self.state.close();
            warn!(tx = %self.id(), mutated = mutated.len(), "transaction dropped without commit");
            self.cache.roll_back(mutated);
        }
    }
}
