use std::cell::{Ref, RefMut};
use std::future::Future;
use std::marker::PhantomData;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use tracing::trace;

use super::entity::{Buffer, BufferState, LoadResult, Ticker};
use crate::error::Error;
use crate::storage::entity::BlockId;
use crate::transaction::TxState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OnDrop {
    Release,
    Unpin,
}

/// A pin on a cached buffer, taken on behalf of one transaction.
///
/// Dropping the guard releases the pin: a clean buffer becomes evictable once its last guard is
/// gone, a dirty one keeps a pin for the write-back path.
pub struct BufferGuard<'c> {
    buffer: Rc<Buffer>,
    tx: Rc<TxState>,
    ticker: Rc<Ticker>,
    on_drop: OnDrop,
    _cache: PhantomData<&'c ()>,
}

impl<'c> BufferGuard<'c> {
    /// Wrap a pin the caller already took on `buffer`.
    pub(crate) fn adopt(buffer: Rc<Buffer>, tx: Rc<TxState>, ticker: Rc<Ticker>) -> Self {
        Self {
            buffer,
            tx,
            ticker,
            on_drop: OnDrop::Release,
            _cache: PhantomData,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.buffer.block_id()
    }

    pub fn read(&self) -> Ref<'_, [u8]> {
        self.buffer.read()
    }

    /// Borrow the image for mutation, marking the buffer dirty under this guard's transaction.
    ///
    /// # Panics
    ///
    /// Panics if the transaction has already been committed or aborted.
    pub fn write(&self) -> RefMut<'_, [u8]> {
        assert!(
            self.tx.is_open(),
            "mutation of buffer {} outside an open transaction",
            self.block_id()
        );
        let stamp = self.ticker.tick();
        self.buffer.set_owner(&self.tx);
        self.tx.record_mutation(&self.buffer, stamp);
        trace!(block_id = %self.block_id(), stamp, "buffer mutated");
        self.buffer.write(stamp)
    }

    pub fn is_dirty(&self) -> bool {
        self.buffer.is_dirty()
    }

    pub fn state(&self) -> BufferState {
        self.buffer.state()
    }

    pub fn pin_count(&self) -> usize {
        self.buffer.pin_count()
    }

    /// Whether both guards pin the very same in-memory buffer.
    pub fn same_buffer(&self, other: &BufferGuard<'_>) -> bool {
        Rc::ptr_eq(&self.buffer, &other.buffer)
    }

    /// Give up the pin outright, even if the buffer is dirty.
    pub fn unpin(mut self) {
        self.on_drop = OnDrop::Unpin;
    }
}

impl Drop for BufferGuard<'_> {
    fn drop(&mut self) {
        match self.on_drop {
            OnDrop::Release => self.buffer.release(),
            OnDrop::Unpin => self.buffer.unpin(),
        }
        trace!(block_id = %self.block_id(), pins = self.buffer.pin_count(), "buffer released");
    }
}

/// An acquisition waiting for its block to be loaded.
///
/// The pin is taken as soon as the acquisition is made and is handed to the resulting
/// [`BufferGuard`] once the load completes. Dropping the handle gives the pin back.
pub struct PendingBuffer<'c> {
    guard: Option<BufferGuard<'c>>,
    block_id: BlockId,
    loaded: oneshot::Receiver<LoadResult>,
}

impl<'c> PendingBuffer<'c> {
    pub(crate) fn new(guard: BufferGuard<'c>, loaded: oneshot::Receiver<LoadResult>) -> Self {
        Self {
            block_id: guard.block_id(),
            guard: Some(guard),
            loaded,
        }
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }
}

impl<'c> Future for PendingBuffer<'c> {
    type Output = Result<BufferGuard<'c>, Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let outcome = match Pin::new(&mut this.loaded).poll(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(outcome) => outcome,
        };
        let guard = match this.guard.take() {
            Some(guard) => guard,
            None => panic!("PendingBuffer for {} polled after completion", this.block_id),
        };
        match outcome {
            Ok(Ok(())) => {
                debug_assert!(guard.buffer.is_cached());
                Poll::Ready(Ok(guard))
            }
            Ok(Err(err)) => {
                guard.tx.record_failure(err.clone());
                Poll::Ready(Err(err))
            }
            Err(oneshot::Canceled) => {
                let err = Error::LoadAbandoned(this.block_id);
                guard.tx.record_failure(err.clone());
                Poll::Ready(Err(err))
            }
        }
    }
}
