//! The block cache: owns the block table, issues disk I/O, and applies eviction.
//!
//! Everything here runs on one cooperative thread. Disk operations are submitted to a
//! [`Serializer`] together with a [`CompletionContext`]; the serializer reports back through
//! that context, and the owning thread feeds the completions to [`Cache::on_io_complete`],
//! either by draining them with [`Cache::process_completions`] or by running its work inside
//! [`Cache::run`].

use std::cell::{Cell, Ref, RefCell};
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::future::{self, Future};
use std::io;
use std::rc::Rc;
use std::sync::Arc;

use futures::channel::mpsc::{self, UnboundedReceiver, UnboundedSender};
use futures::future::{select, Either};
use futures::{pin_mut, FutureExt, StreamExt};
use tracing::{debug, error, trace, warn};

use crate::allocator::BlockIdAllocator;
use crate::buffer::entity::{Buffer, BufferState, Ticker};
use crate::buffer::handle::{BufferGuard, PendingBuffer};
use crate::config::CacheConfig;
use crate::error::Error;
use crate::policy::{Candidate, ReplacementPolicy};
use crate::storage::entity::{BlockData, BlockId};
use crate::storage::manager::{CompletionContext, IoCompletion, IoKind, Serializer};
use crate::transaction::{Acquired, Mutations, Transaction, TxId, TxState};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Acquisitions that joined a load already in flight.
    pub shared_loads: u64,
    pub reads_issued: u64,
    pub writes_issued: u64,
    pub evictions: u64,
    pub failed_io: u64,
}

struct InFlight {
    buffer: Rc<Buffer>,
    kind: IoKind,
    // mutation stamp reflected by a write
    stamp: u64,
}

struct CacheInner<S, P> {
    config: CacheConfig,
    serializer: S,
    policy: P,
    table: HashMap<BlockId, Rc<Buffer>>,
    allocator: BlockIdAllocator,
    in_flight: HashMap<u64, InFlight>,
    next_ctx_id: u64,
    writeback_queue: VecDeque<BlockId>,
    stats: CacheStats,
}

pub struct Cache<S: Serializer, P: ReplacementPolicy> {
    inner: RefCell<CacheInner<S, P>>,
    ticker: Rc<Ticker>,
    next_tx_id: Cell<u64>,
    sink: UnboundedSender<IoCompletion>,
    source: RefCell<UnboundedReceiver<IoCompletion>>,
}

impl<S: Serializer, P: ReplacementPolicy> Cache<S, P> {
    pub fn new(config: CacheConfig, serializer: S, policy: P) -> Result<Self, Error> {
        config.validate()?;
        if serializer.block_size() != config.block_size {
            return Err(Error::InvalidConfig(format!(
                "serializer block size {} does not match configured {}",
                serializer.block_size(),
                config.block_size
            )));
        }
        let allocator = BlockIdAllocator::new(serializer.block_count());
        let (sink, source) = mpsc::unbounded();
        debug!(
            block_size = config.block_size,
            capacity = config.capacity,
            next_block_id = %allocator.peek(),
            "cache created"
        );
        Ok(Self {
            inner: RefCell::new(CacheInner {
                config,
                serializer,
                policy,
                table: HashMap::new(),
                allocator,
                in_flight: HashMap::new(),
                next_ctx_id: 0,
                writeback_queue: VecDeque::new(),
                stats: CacheStats::default(),
            }),
            ticker: Rc::new(Ticker::default()),
            next_tx_id: Cell::new(0),
            sink,
            source: RefCell::new(source),
        })
    }

    pub fn begin_transaction(&self) -> Transaction<'_, S, P> {
        let id = self.next_tx_id.get();
        self.next_tx_id.set(id + 1);
        Transaction::new(self, TxId(id))
    }

    pub(crate) fn allocate(&self, tx: &Rc<TxState>) -> Result<(BlockId, BufferGuard<'_>), Error> {
        let mut inner = self.inner.borrow_mut();
        inner.make_room()?;
        let block_id = inner.allocator.allocate()?;
        let buffer = Rc::new(Buffer::allocated(
            block_id,
            BlockData::zeroed(inner.config.block_size),
        ));
        buffer.set_owner(tx);
        buffer.pin();
        // an aborted allocation rolls back to this zeroed, never-written image
        tx.record_mutation(&buffer, self.ticker.tick());
        inner
            .policy
            .on_insert(buffer.eviction_meta(), self.ticker.tick());
        let previous = inner.table.insert(block_id, Rc::clone(&buffer));
        assert!(
            previous.is_none(),
            "allocated block {} is already resident",
            block_id
        );
        debug!(tx = %tx.id(), block_id = %block_id, "block allocated");
        Ok((
            block_id,
            BufferGuard::adopt(buffer, Rc::clone(tx), Rc::clone(&self.ticker)),
        ))
    }

    pub(crate) fn acquire(&self, tx: &Rc<TxState>, block_id: BlockId) -> Result<Acquired<'_>, Error> {
        let mut inner = self.inner.borrow_mut();
        if let Some(buffer) = inner.table.get(&block_id).cloned() {
            buffer.pin();
            inner
                .policy
                .touch(buffer.eviction_meta(), self.ticker.tick());
            let guard = BufferGuard::adopt(Rc::clone(&buffer), Rc::clone(tx), Rc::clone(&self.ticker));
            if buffer.is_cached() {
                inner.stats.hits += 1;
                trace!(tx = %tx.id(), block_id = %block_id, "cache hit");
                return Ok(Acquired::Ready(guard));
            }
            // the block is already on its way; share that load
            inner.stats.shared_loads += 1;
            trace!(tx = %tx.id(), block_id = %block_id, "joined in-flight load");
            let loaded = buffer.add_waiter();
            return Ok(Acquired::Pending(PendingBuffer::new(guard, loaded)));
        }

        inner.make_room()?;
        let buffer = Rc::new(Buffer::loading(block_id));
        buffer.pin();
        inner
            .policy
            .on_insert(buffer.eviction_meta(), self.ticker.tick());
        inner.table.insert(block_id, Rc::clone(&buffer));
        let loaded = buffer.add_waiter();
        let guard = BufferGuard::adopt(Rc::clone(&buffer), Rc::clone(tx), Rc::clone(&self.ticker));

        inner.stats.misses += 1;
        self.do_read(&mut inner, buffer);
        debug!(tx = %tx.id(), block_id = %block_id, "cache miss, read issued");
        Ok(Acquired::Pending(PendingBuffer::new(guard, loaded)))
    }

    fn context(&self, inner: &mut CacheInner<S, P>, block_id: BlockId, kind: IoKind) -> CompletionContext {
        let id = inner.next_ctx_id;
        inner.next_ctx_id += 1;
        CompletionContext {
            id,
            block_id,
            kind,
            sink: self.sink.clone(),
        }
    }

    fn do_read(&self, inner: &mut CacheInner<S, P>, buffer: Rc<Buffer>) {
        let block_id = buffer.block_id();
        let ctx = self.context(inner, block_id, IoKind::Read);
        let dest = BlockData::zeroed(inner.config.block_size);
        inner.in_flight.insert(
            ctx.id,
            InFlight {
                buffer,
                kind: IoKind::Read,
                stamp: 0,
            },
        );
        inner.stats.reads_issued += 1;
        inner.serializer.do_read(block_id, dest, ctx);
    }

    /// Start writing back `block_id` if it is resident, dirty and not already being written.
    /// Returns whether a write was issued.
    pub fn flush(&self, block_id: BlockId) -> bool {
        let mut inner = self.inner.borrow_mut();
        let buffer = match inner.table.get(&block_id) {
            Some(buffer) if buffer.is_dirty() && !buffer.dirty_tracker().is_flushing() => {
                Rc::clone(buffer)
            }
            _ => return false,
        };
        let (image, stamp) = buffer.begin_flush();
        let ctx = self.context(&mut inner, block_id, IoKind::Write);
        inner.in_flight.insert(
            ctx.id,
            InFlight {
                buffer,
                kind: IoKind::Write,
                stamp,
            },
        );
        inner.stats.writes_issued += 1;
        inner.serializer.do_write(block_id, image, ctx);
        debug!(block_id = %block_id, stamp, "write-back issued");
        true
    }

    /// Start writing back every block queued by committed transactions. A block whose
    /// previous write is still in flight stays queued.
    pub fn flush_committed(&self) -> usize {
        let queued: Vec<BlockId> = self.inner.borrow_mut().writeback_queue.drain(..).collect();
        let mut issued = 0;
        for block_id in queued {
            if self.flush(block_id) {
                issued += 1;
            } else if self.buffer_state(block_id) == Some(BufferState::WritingBack) {
                self.inner.borrow_mut().requeue(block_id);
            }
        }
        issued
    }

    /// Start writing back every dirty block, committed or not.
    pub fn flush_all(&self) -> usize {
        let dirty: Vec<BlockId> = self
            .dirty_blocks()
            .into_iter()
            .map(|(block_id, _)| block_id)
            .collect();
        self.inner.borrow_mut().writeback_queue.clear();
        dirty
            .into_iter()
            .filter(|&block_id| self.flush(block_id))
            .count()
    }

    /// Dirty resident blocks with their last mutation stamp, oldest mutation first.
    pub fn dirty_blocks(&self) -> Vec<(BlockId, u64)> {
        let inner = self.inner.borrow();
        let mut dirty: Vec<_> = inner
            .table
            .values()
            .filter(|buffer| buffer.is_dirty())
            .map(|buffer| (buffer.block_id(), buffer.dirty_tracker().last_mutation()))
            .collect();
        dirty.sort_by_key(|&(block_id, stamp)| (stamp, block_id));
        dirty
    }

    pub fn writeback_queue_len(&self) -> usize {
        self.inner.borrow().writeback_queue.len()
    }

    /// Queue the buffers of a committed transaction for write-back. A block allocated by it
    /// and never written is queued too, so that its zeroed image reaches disk.
    pub(crate) fn schedule_writeback(&self, mutated: Mutations) {
        let mut inner = self.inner.borrow_mut();
        for (buffer, _) in mutated {
            let block_id = buffer.block_id();
            if !inner.is_current(&buffer) {
                continue;
            }
            if buffer.is_fresh() && !buffer.is_dirty() {
                buffer.mark_dirty(self.ticker.tick());
            }
            if buffer.is_dirty() {
                inner.requeue(block_id);
            }
        }
    }

    /// Put back the images an aborted transaction started from. Buffers stay resident, so
    /// other pins and committed but unwritten content survive; only an aborted allocation
    /// that nobody pins any more leaves the table.
    pub(crate) fn roll_back(&self, mutated: Mutations) {
        let mut inner = self.inner.borrow_mut();
        for (buffer, pre_image) in mutated {
            let block_id = buffer.block_id();
            if !inner.is_current(&buffer) {
                continue;
            }
            let dirty = buffer.restore(pre_image, self.ticker.tick());
            if dirty {
                inner.requeue(block_id);
            } else if buffer.is_fresh() && buffer.pin_count() == 0 {
                inner.table.remove(&block_id);
                inner.writeback_queue.retain(|&queued| queued != block_id);
                buffer.mark_evicted();
            }
            debug!(block_id = %block_id, dirty, "uncommitted image rolled back");
        }
    }

    /// Deliver one disk completion.
    ///
    /// A successful read makes the buffer cached and resumes every acquisition waiting on it;
    /// each of them already holds its pin. A successful write cleans the buffer unless it was
    /// mutated after the write was issued. Failures are returned, and also delivered to the
    /// waiting acquisitions (reads) or the owning transaction (writes).
    ///
    /// # Panics
    ///
    /// Panics if the completion was already delivered.
    pub fn on_io_complete(&self, completion: IoCompletion) -> Result<(), Error> {
        let IoCompletion { ctx, result } = completion;
        let mut inner = self.inner.borrow_mut();
        let InFlight { buffer, kind, stamp } = match inner.in_flight.remove(&ctx.id) {
            Some(op) => op,
            None => panic!(
                "completion {} for block {} delivered more than once",
                ctx.id, ctx.block_id
            ),
        };
        assert_eq!(kind, ctx.kind);
        assert_eq!(buffer.block_id(), ctx.block_id);
        let block_id = ctx.block_id;
        let block_size = inner.config.block_size;
        let result = match (kind, result) {
            (IoKind::Read, Ok(data)) if data.len() != block_size => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("image of {} bytes, expected {}", data.len(), block_size),
            )),
            (_, result) => result,
        };

        match (kind, result) {
            (IoKind::Read, Ok(data)) => {
                drop(inner);
                buffer.install(data);
                buffer.mark_cached();
                let woken = buffer.wake_waiters(Ok(()));
                debug!(block_id = %block_id, woken, "read completed");
                Ok(())
            }
            (IoKind::Read, Err(source)) => {
                let err = Error::ReadFailed {
                    block_id,
                    source: Arc::new(source),
                };
                inner.stats.failed_io += 1;
                if inner.is_current(&buffer) {
                    inner.table.remove(&block_id);
                }
                drop(inner);
                buffer.mark_evicted();
                error!(block_id = %block_id, error = %err, "read failed");
                buffer.wake_waiters(Err(err.clone()));
                Err(err)
            }
            (IoKind::Write, Ok(_)) => {
                drop(inner);
                let clean = buffer.finish_flush(stamp, true);
                debug!(block_id = %block_id, stamp, clean, "write-back completed");
                Ok(())
            }
            (IoKind::Write, Err(source)) => {
                let err = Error::WriteFailed {
                    block_id,
                    source: Arc::new(source),
                };
                inner.stats.failed_io += 1;
                if inner.is_current(&buffer) {
                    inner.requeue(block_id);
                }
                drop(inner);
                buffer.finish_flush(stamp, false);
                error!(block_id = %block_id, error = %err, "write-back failed");
                if let Some(owner) = buffer.owner().filter(|owner| owner.is_open()) {
                    owner.record_failure(err.clone());
                }
                Err(err)
            }
        }
    }

    /// Deliver every completion that has already arrived, without waiting. Stops at the first
    /// failed operation and returns its error; later completions stay queued.
    pub fn process_completions(&self) -> Result<usize, Error> {
        let mut delivered = 0;
        loop {
            let next = self.source.borrow_mut().next().now_or_never();
            match next {
                Some(Some(completion)) => {
                    delivered += 1;
                    self.on_io_complete(completion)?;
                }
                // the cache holds a sender, so the stream never ends while it lives
                Some(None) | None => return Ok(delivered),
            }
        }
    }

    /// Drive `work` to completion while delivering disk completions as they arrive.
    ///
    /// Failed operations are logged here; they already reached the affected acquisitions and
    /// transactions.
    pub async fn run<F: Future>(&self, work: F) -> F::Output {
        let pump = self.pump();
        pin_mut!(work);
        pin_mut!(pump);
        match select(work, pump).await {
            Either::Left((output, _)) => output,
            Either::Right((never, _)) => match never {},
        }
    }

    async fn pump(&self) -> Infallible {
        loop {
            let next = future::poll_fn(|cx| self.source.borrow_mut().poll_next_unpin(cx)).await;
            match next {
                Some(completion) => {
                    if let Err(err) = self.on_io_complete(completion) {
                        warn!(error = %err, "disk operation failed");
                    }
                }
                None => future::pending::<()>().await,
            }
        }
    }

    /// Deliver completions until no disk operation is in flight, waiting for them as needed.
    /// Stops at the first failed operation. Not meant to run alongside [`Cache::run`].
    pub async fn drain(&self) -> Result<(), Error> {
        while self.in_flight() > 0 {
            let next = future::poll_fn(|cx| self.source.borrow_mut().poll_next_unpin(cx)).await;
            if let Some(completion) = next {
                self.on_io_complete(completion)?;
            }
        }
        Ok(())
    }

    /// Evict one eligible buffer chosen by the replacement policy, if there is one.
    pub fn evict(&self) -> Option<BlockId> {
        self.inner.borrow_mut().evict_candidate_if_needed()
    }

    pub fn is_resident(&self, block_id: BlockId) -> bool {
        self.inner.borrow().table.contains_key(&block_id)
    }

    pub fn buffer_state(&self, block_id: BlockId) -> Option<BufferState> {
        self.inner
            .borrow()
            .table
            .get(&block_id)
            .map(|buffer| buffer.state())
    }

    pub fn pin_count(&self, block_id: BlockId) -> Option<usize> {
        self.inner
            .borrow()
            .table
            .get(&block_id)
            .map(|buffer| buffer.pin_count())
    }

    pub fn len(&self) -> usize {
        self.inner.borrow().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn in_flight(&self) -> usize {
        self.inner.borrow().in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.borrow().stats
    }

    pub fn config(&self) -> Ref<'_, CacheConfig> {
        Ref::map(self.inner.borrow(), |inner| &inner.config)
    }

    pub fn serializer(&self) -> Ref<'_, S> {
        Ref::map(self.inner.borrow(), |inner| &inner.serializer)
    }
}

impl<S, P: ReplacementPolicy> CacheInner<S, P> {
    fn is_current(&self, buffer: &Rc<Buffer>) -> bool {
        self.table
            .get(&buffer.block_id())
            .map_or(false, |current| Rc::ptr_eq(current, buffer))
    }

    fn requeue(&mut self, block_id: BlockId) {
        if !self.writeback_queue.contains(&block_id) {
            self.writeback_queue.push_back(block_id);
        }
    }

    fn make_room(&mut self) -> Result<(), Error> {
        while self.table.len() >= self.config.capacity {
            if self.evict_candidate_if_needed().is_none() {
                return Err(Error::NoFreeBuffer);
            }
        }
        Ok(())
    }

    fn evict_candidate_if_needed(&mut self) -> Option<BlockId> {
        let victim = {
            let mut candidates: Vec<Candidate<'_>> = self
                .table
                .values()
                .filter(|buffer| buffer.is_evictable())
                .map(|buffer| Candidate {
                    block_id: buffer.block_id(),
                    meta: buffer.eviction_meta(),
                })
                .collect();
            candidates.sort_by_key(|candidate| candidate.block_id);
            self.policy.choose_victim(&candidates)?
        };
        let buffer = match self.table.remove(&victim) {
            Some(buffer) => buffer,
            None => panic!("replacement policy chose non-resident block {}", victim),
        };
        assert!(
            buffer.is_evictable(),
            "replacement policy chose ineligible block {}",
            victim
        );
        buffer.mark_evicted();
        self.writeback_queue.retain(|&queued| queued != victim);
        self.stats.evictions += 1;
        debug!(block_id = %victim, "buffer evicted");
        Some(victim)
    }
}

impl<S: Serializer, P: ReplacementPolicy> Drop for Cache<S, P> {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let dirty = inner.table.values().filter(|buffer| buffer.is_dirty()).count();
        if dirty > 0 || !inner.in_flight.is_empty() {
            warn!(
                dirty,
                in_flight = inner.in_flight.len(),
                "cache dropped with unwritten state"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{clocksweep::ClockSweep, lru::Lru};
    use crate::storage::memory::{MemoryDisk, Op};
    use futures::executor::block_on;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    const BLOCK_SIZE: usize = 4096;

    fn config(capacity: usize) -> CacheConfig {
        CacheConfig {
            block_size: BLOCK_SIZE,
            capacity,
            ..Default::default()
        }
    }

    fn cache(capacity: usize) -> (MemoryDisk, Cache<MemoryDisk, ClockSweep>) {
        let disk = MemoryDisk::new(BLOCK_SIZE);
        let cache = Cache::new(config(capacity), disk.clone(), ClockSweep::new()).unwrap();
        (disk, cache)
    }

    fn page(prefix: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(BLOCK_SIZE);
        bytes.extend_from_slice(prefix);
        bytes.resize(BLOCK_SIZE, 0);
        bytes
    }

    #[test]
    fn rejects_mismatched_block_size() {
        let disk = MemoryDisk::new(512);
        assert!(matches!(
            Cache::new(config(4), disk, ClockSweep::new()),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn allocator_starts_after_existing_blocks() {
        let disk = MemoryDisk::new(BLOCK_SIZE);
        disk.put(BlockId(0), b"a").unwrap();
        disk.put(BlockId(1), b"b").unwrap();
        let cache = Cache::new(config(4), disk, ClockSweep::new()).unwrap();
        let mut tx = cache.begin_transaction();
        let (block_id, _buffer) = tx.allocate().unwrap();
        assert_eq!(BlockId(2), block_id);
    }

    #[test]
    fn fetch_hits_after_load() {
        let (disk, cache) = cache(4);
        disk.put(BlockId(1), b"hello").unwrap();
        let mut tx = cache.begin_transaction();

        let first = tx.acquire(BlockId(1)).unwrap();
        assert!(!first.is_ready());
        assert_eq!(Some(BufferState::Loading), cache.buffer_state(BlockId(1)));
        assert_eq!(1, disk.complete_all());
        assert_eq!(1, cache.process_completions().unwrap());
        let first = block_on(first.wait()).unwrap();
        assert_eq!(&page(b"hello")[..], &*first.read());

        // no storage access (hit the cache)
        let second = tx.acquire(BlockId(1)).unwrap();
        assert!(second.is_ready());
        assert_eq!(vec![Op::Read(BlockId(1))], disk.history());
        assert_eq!(2, cache.pin_count(BlockId(1)).unwrap());
        drop(second);
        drop(first);
        assert_eq!(0, cache.pin_count(BlockId(1)).unwrap());

        let stats = cache.stats();
        assert_eq!(1, stats.misses);
        assert_eq!(1, stats.hits);
        assert_eq!(1, stats.reads_issued);
    }

    #[test]
    fn two_transactions_share_one_read() {
        let (disk, cache) = cache(4);
        disk.put(BlockId(7), b"shared").unwrap();
        let mut tx1 = cache.begin_transaction();
        let mut tx2 = cache.begin_transaction();

        let a = tx1.acquire(BlockId(7)).unwrap();
        let b = tx2.acquire(BlockId(7)).unwrap();
        assert!(!a.is_ready());
        assert!(!b.is_ready());
        assert_eq!(1, disk.reads_of(BlockId(7)));
        assert_eq!(1, cache.in_flight());
        assert_eq!(Some(2), cache.pin_count(BlockId(7)));

        disk.complete_all();
        cache.process_completions().unwrap();
        let a = block_on(a.wait()).unwrap();
        let b = block_on(b.wait()).unwrap();
        assert!(a.same_buffer(&b));
        // the pins taken at acquire time were handed over, not duplicated
        assert_eq!(2, a.pin_count());
        assert_eq!(1, disk.reads_of(BlockId(7)));
        assert_eq!(1, cache.stats().shared_loads);
    }

    #[test]
    fn many_acquirers_resume_on_one_completion() {
        let (disk, cache) = cache(4);
        disk.put(BlockId(2), b"fan-out").unwrap();
        let mut tx = cache.begin_transaction();
        let mut pendings: Vec<PendingBuffer<'_>> = (0..5)
            .map(|_| match tx.acquire(BlockId(2)).unwrap() {
                Acquired::Pending(pending) => pending,
                Acquired::Ready(_) => panic!("block became ready before its load"),
            })
            .collect();
        assert_eq!(1, disk.reads_of(BlockId(2)));

        // nobody resumes before the completion is delivered
        block_on(async {
            for pending in pendings.iter_mut() {
                assert!(futures::poll!(pending).is_pending());
            }
        });
        assert_eq!(0, cache.process_completions().unwrap());

        disk.complete_all();
        let guards = block_on(cache.run(futures::future::join_all(pendings)));
        let guards: Vec<BufferGuard<'_>> = guards.into_iter().map(Result::unwrap).collect();
        assert_eq!(5, guards.len());
        assert!(guards.iter().all(|guard| guard.same_buffer(&guards[0])));
        assert_eq!(5, guards[0].pin_count());
        assert_eq!(&page(b"fan-out")[..], &*guards[4].read());
        assert_eq!(1, disk.reads_of(BlockId(2)));
    }

    #[test]
    fn allocate_round_trip() {
        let (disk, cache) = cache(2);
        let pattern = [0xAAu8; BLOCK_SIZE];

        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write().copy_from_slice(&pattern);
        drop(buffer);
        tx.commit().unwrap();
        assert_eq!(0, disk.reads_of(block_id));

        // the write-back pin keeps the buffer resident however often it is cycled
        for _ in 0..3 {
            assert_eq!(None, cache.evict());
            let mut tx = cache.begin_transaction();
            let buffer = block_on(tx.get(block_id)).unwrap();
            assert_eq!(&pattern[..], &*buffer.read());
            drop(buffer);
            tx.commit().unwrap();
        }
        assert_eq!(0, disk.reads_of(block_id));

        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(pattern.to_vec()), disk.contents(block_id));
        assert_eq!(Some(BufferState::Clean), cache.buffer_state(block_id));

        assert_eq!(Some(block_id), cache.evict());
        let mut tx = cache.begin_transaction();
        let pending = tx.acquire(block_id).unwrap();
        disk.complete_all();
        let buffer = block_on(cache.run(pending.wait())).unwrap();
        assert_eq!(&pattern[..], &*buffer.read());
        assert_eq!(1, disk.reads_of(block_id));
    }

    #[test]
    fn drain_with_file_disk() {
        use crate::storage::disk::FileDisk;

        let disk = FileDisk::new(tempfile::tempfile().unwrap(), BLOCK_SIZE).unwrap();
        let cache = Cache::new(config(4), disk, ClockSweep::new()).unwrap();
        let mut tx = cache.begin_transaction();
        let mut ids = vec![];
        for i in 0..3u8 {
            let (block_id, buffer) = tx.allocate().unwrap();
            buffer.write().fill(i + 1);
            ids.push(block_id);
        }
        tx.commit().unwrap();
        assert_eq!(3, cache.flush_committed());
        block_on(cache.drain()).unwrap();
        assert!(cache.dirty_blocks().is_empty());
        while cache.evict().is_some() {}
        assert!(cache.is_empty());

        let mut tx = cache.begin_transaction();
        let guards = block_on(cache.run(async {
            let mut guards = vec![];
            for &block_id in &ids {
                guards.push(tx.get(block_id).await.unwrap());
            }
            guards
        }));
        for (i, guard) in guards.iter().enumerate() {
            assert!(guard.read().iter().all(|&byte| byte == i as u8 + 1));
        }
        assert_eq!(3, cache.stats().reads_issued);
    }

    #[test]
    fn dirty_buffer_is_never_evicted() {
        let (disk, cache) = cache(1);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write()[0] = 1;
        drop(buffer);
        tx.commit().unwrap();

        assert_eq!(Some(BufferState::Dirty), cache.buffer_state(block_id));
        assert_eq!(None, cache.evict());
        let mut tx = cache.begin_transaction();
        assert!(matches!(tx.allocate(), Err(Error::NoFreeBuffer)));
        assert!(matches!(tx.acquire(BlockId(99)), Err(Error::NoFreeBuffer)));

        // in flight is not evictable either
        assert!(cache.flush(block_id));
        assert_eq!(Some(BufferState::WritingBack), cache.buffer_state(block_id));
        assert_eq!(None, cache.evict());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(block_id), cache.evict());
        assert!(tx.allocate().is_ok());
    }

    #[test]
    fn mutation_during_writeback_stays_dirty() {
        let (disk, cache) = cache(2);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write()[0] = 1;
        assert!(cache.flush(block_id));
        assert!(!cache.flush(block_id));
        buffer.write()[0] = 2;
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(BufferState::Dirty), cache.buffer_state(block_id));
        assert_eq!(Some(page(&[1]).to_vec()), disk.contents(block_id));
        drop(buffer);
        tx.commit().unwrap();

        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(BufferState::Clean), cache.buffer_state(block_id));
        assert_eq!(Some(page(&[2]).to_vec()), disk.contents(block_id));
        assert_eq!(Some(0), cache.pin_count(block_id));
    }

    #[test]
    fn write_failure_keeps_buffer_dirty() {
        let (disk, cache) = cache(2);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write()[0] = 5;
        assert!(cache.flush(block_id));
        assert!(disk.fail_next());
        assert!(matches!(
            cache.process_completions(),
            Err(Error::WriteFailed { .. })
        ));
        assert_eq!(Some(BufferState::Dirty), cache.buffer_state(block_id));
        assert!(matches!(tx.failure(), Some(Error::WriteFailed { .. })));
        drop(buffer);
        assert!(tx.commit().is_err());
        assert_eq!(1, cache.stats().failed_io);
    }

    #[test]
    fn dirty_blocks_in_mutation_order() {
        let (_disk, cache) = cache(4);
        let mut tx = cache.begin_transaction();
        let (a, buffer_a) = tx.allocate().unwrap();
        let (b, buffer_b) = tx.allocate().unwrap();
        buffer_b.write()[0] = 1;
        buffer_a.write()[0] = 1;
        let order: Vec<BlockId> = cache.dirty_blocks().into_iter().map(|(id, _)| id).collect();
        assert_eq!(vec![b, a], order);
    }

    // allocate a block and wait until its image is on disk
    fn create<P: ReplacementPolicy>(disk: &MemoryDisk, cache: &Cache<MemoryDisk, P>) -> BlockId {
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        drop(buffer);
        tx.commit().unwrap();
        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        block_id
    }

    #[test]
    fn lru_policy_evicts_coldest() {
        let disk = MemoryDisk::new(BLOCK_SIZE);
        let cache = Cache::new(config(2), disk.clone(), Lru).unwrap();
        let a = create(&disk, &cache);
        let b = create(&disk, &cache);
        let mut tx = cache.begin_transaction();
        drop(block_on(tx.get(a)).unwrap());
        let c = create(&disk, &cache);
        assert!(cache.is_resident(a));
        assert!(!cache.is_resident(b));
        assert!(cache.is_resident(c));
    }

    #[test]
    fn boxed_policy_from_config() {
        let disk = MemoryDisk::new(BLOCK_SIZE);
        let config = config(2);
        let policy = crate::policy::build(config.policy);
        let cache = Cache::new(config, disk.clone(), policy).unwrap();
        for _ in 0..5 {
            create(&disk, &cache);
        }
        assert_eq!(2, cache.len());
        assert_eq!(3, cache.stats().evictions);
    }

    #[test]
    fn uncommitted_allocation_is_not_evicted() {
        let (_disk, cache) = cache(1);
        let mut tx = cache.begin_transaction();
        let (_, buffer) = tx.allocate().unwrap();
        drop(buffer);
        assert_eq!(None, cache.evict());
        assert!(matches!(tx.allocate(), Err(Error::NoFreeBuffer)));
    }

    #[test]
    fn unwritten_allocation_reaches_disk_on_commit() {
        let (disk, cache) = cache(2);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        drop(buffer);
        tx.commit().unwrap();
        assert_eq!(Some(BufferState::Dirty), cache.buffer_state(block_id));
        assert_eq!(None, cache.evict());

        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(vec![0; BLOCK_SIZE]), disk.contents(block_id));
        assert_eq!(Some(block_id), cache.evict());

        let mut tx = cache.begin_transaction();
        let pending = tx.acquire(block_id).unwrap();
        disk.complete_all();
        let buffer = block_on(cache.run(pending.wait())).unwrap();
        assert!(buffer.read().iter().all(|&byte| byte == 0));
    }

    #[test]
    fn failed_write_is_queued_again() {
        let (disk, cache) = cache(2);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write()[0] = 3;
        drop(buffer);
        tx.commit().unwrap();

        assert_eq!(1, cache.flush_committed());
        assert_eq!(0, cache.writeback_queue_len());
        assert!(disk.fail_next());
        assert!(cache.process_completions().is_err());
        assert_eq!(1, cache.writeback_queue_len());

        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(BufferState::Clean), cache.buffer_state(block_id));
        assert_eq!(Some(page(&[3])), disk.contents(block_id));
    }

    #[test]
    fn in_flight_write_stays_queued() {
        let (disk, cache) = cache(2);
        let mut tx = cache.begin_transaction();
        let (block_id, buffer) = tx.allocate().unwrap();
        buffer.write()[0] = 1;
        assert!(cache.flush(block_id));
        buffer.write()[0] = 2;
        drop(buffer);
        tx.commit().unwrap();

        assert_eq!(0, cache.flush_committed());
        assert_eq!(1, cache.writeback_queue_len());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(1, cache.flush_committed());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(page(&[2])), disk.contents(block_id));
    }

    // hands back images of the wrong size
    struct ShortReads;

    impl Serializer for ShortReads {
        fn block_size(&self) -> usize {
            BLOCK_SIZE
        }

        fn block_count(&self) -> u64 {
            1
        }

        fn do_read(&mut self, _block_id: BlockId, _dest: BlockData, ctx: CompletionContext) {
            ctx.complete(Ok(BlockData::zeroed(BLOCK_SIZE / 2)));
        }

        fn do_write(&mut self, _block_id: BlockId, src: BlockData, ctx: CompletionContext) {
            ctx.complete(Ok(src));
        }
    }

    #[test]
    fn short_image_fails_the_read() {
        let cache = Cache::new(config(2), ShortReads, ClockSweep::new()).unwrap();
        let mut tx = cache.begin_transaction();
        let pending = tx.acquire(BlockId(0)).unwrap();
        match cache.process_completions() {
            Err(Error::ReadFailed { block_id, source }) => {
                assert_eq!(BlockId(0), block_id);
                assert_eq!(io::ErrorKind::InvalidData, source.kind());
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!cache.is_resident(BlockId(0)));
        assert!(block_on(pending.wait()).is_err());
        assert!(tx.failure().is_some());
    }

    #[test]
    #[should_panic(expected = "delivered more than once")]
    fn double_completion_is_rejected() {
        let (disk, cache) = cache(2);
        disk.put(BlockId(0), b"x").unwrap();
        let mut tx = cache.begin_transaction();
        let _pending = tx.acquire(BlockId(0)).unwrap();
        disk.complete_all();
        let completion = block_on(cache.source.borrow_mut().next()).unwrap();
        let duplicate = IoCompletion {
            ctx: CompletionContext {
                id: completion.ctx.id,
                block_id: completion.ctx.block_id,
                kind: completion.ctx.kind,
                sink: cache.sink.clone(),
            },
            result: Ok(BlockData::from(page(b"x"))),
        };
        cache.on_io_complete(completion).unwrap();
        let _ = cache.on_io_complete(duplicate);
    }

    #[test]
    fn read_failure_frees_the_slot() {
        let (disk, cache) = cache(1);
        let mut tx = cache.begin_transaction();
        let pending = tx.acquire(BlockId(4)).unwrap();
        disk.fail_next();
        assert!(cache.process_completions().is_err());
        assert!(!cache.is_resident(BlockId(4)));
        assert!(block_on(pending.wait()).is_err());

        disk.put(BlockId(4), b"later").unwrap();
        let mut tx = cache.begin_transaction();
        let pending = tx.acquire(BlockId(4)).unwrap();
        disk.complete_all();
        let buffer = block_on(cache.run(pending.wait())).unwrap();
        assert_eq!(&page(b"later")[..], &*buffer.read());
    }

    #[test]
    fn abandoned_acquisition_releases_its_pin() {
        let (disk, cache) = cache(2);
        disk.put(BlockId(1), b"y").unwrap();
        let mut tx = cache.begin_transaction();
        drop(tx.acquire(BlockId(1)).unwrap());
        assert_eq!(Some(0), cache.pin_count(BlockId(1)));
        // still loading, so still not evictable
        assert_eq!(None, cache.evict());
        disk.complete_all();
        cache.process_completions().unwrap();
        assert_eq!(Some(BufferState::Clean), cache.buffer_state(BlockId(1)));
        assert_eq!(Some(BlockId(1)), cache.evict());
    }

    #[test]
    fn random_pins_never_evict_pinned_buffers() {
        const BLOCKS: u64 = 16;
        let disk = MemoryDisk::new(BLOCK_SIZE);
        for id in 0..BLOCKS {
            disk.put(BlockId(id), &id.to_le_bytes()).unwrap();
        }
        let cache = Cache::new(config(6), disk.clone(), ClockSweep::new()).unwrap();
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut tx = cache.begin_transaction();
        let mut held: Vec<BufferGuard<'_>> = vec![];
        let mut waiting: Vec<PendingBuffer<'_>> = vec![];

        for _ in 0..2000 {
            match rng.gen_range(0..5) {
                0 | 1 => {
                    let block_id = BlockId(rng.gen_range(0..BLOCKS));
                    match tx.acquire(block_id) {
                        Ok(Acquired::Ready(guard)) => held.push(guard),
                        Ok(Acquired::Pending(pending)) => waiting.push(pending),
                        Err(Error::NoFreeBuffer) => {}
                        Err(err) => panic!("unexpected error: {}", err),
                    }
                }
                2 => {
                    if !held.is_empty() {
                        let index = rng.gen_range(0..held.len());
                        held.swap_remove(index);
                    }
                }
                3 => {
                    disk.complete_all();
                    cache.process_completions().unwrap();
                    for pending in waiting.drain(..) {
                        held.push(block_on(pending).unwrap());
                    }
                }
                _ => {
                    if let Some(victim) = cache.evict() {
                        assert!(held.iter().all(|guard| guard.block_id() != victim));
                        assert!(waiting.iter().all(|pending| pending.block_id() != victim));
                    }
                }
            }
            for guard in &held {
                assert!(cache.is_resident(guard.block_id()));
                assert_eq!(
                    &guard.block_id().to_u64().to_le_bytes()[..],
                    &guard.read()[..8]
                );
            }
            assert!(cache.len() <= 6);
        }
    }
}
