use std::cell::{Cell, Ref, RefCell, RefMut};
use std::rc::{Rc, Weak};

use futures::channel::oneshot;

use crate::error::Error;
use crate::storage::entity::{BlockData, BlockId};
use crate::transaction::TxState;

/// Monotonic logical clock shared by a cache and its handles. Orders mutations and accesses.
#[derive(Debug, Default)]
pub struct Ticker(Cell<u64>);

impl Ticker {
    pub fn tick(&self) -> u64 {
        let now = self.0.get() + 1;
        self.0.set(now);
        now
    }
}

/// Write-back bookkeeping of one buffer.
#[derive(Debug, Default)]
pub struct DirtyTracker {
    dirty: Cell<bool>,
    last_mutation: Cell<u64>,
    // mutation stamp captured when the in-flight write was issued
    flushing: Cell<Option<u64>>,
    // mutation stamp of the most recently issued write
    last_flushed: Cell<u64>,
    writeback_pin: Cell<bool>,
}

impl DirtyTracker {
    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    pub fn last_mutation(&self) -> u64 {
        self.last_mutation.get()
    }

    pub fn is_flushing(&self) -> bool {
        self.flushing.get().is_some()
    }

    pub fn has_writeback_pin(&self) -> bool {
        self.writeback_pin.get()
    }

    fn mark_dirty(&self, stamp: u64) {
        self.dirty.set(true);
        self.last_mutation.set(stamp);
    }
}

/// Replacement-policy state of one buffer. The cache never interprets it.
#[derive(Debug, Default)]
pub struct EvictionMeta {
    usage: Cell<u32>,
    last_access: Cell<u64>,
}

impl EvictionMeta {
    pub fn usage(&self) -> u32 {
        self.usage.get()
    }

    pub fn set_usage(&self, usage: u32) {
        self.usage.set(usage);
    }

    pub fn last_access(&self) -> u64 {
        self.last_access.get()
    }

    pub fn set_last_access(&self, tick: u64) {
        self.last_access.set(tick);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Loading,
    Clean,
    Dirty,
    WritingBack,
    Evicted,
}

pub(crate) type LoadResult = Result<(), Error>;

/// The image and write-back state of a buffer as one transaction first found it.
pub(crate) struct PreImage {
    data: BlockData,
    dirty: bool,
    last_mutation: u64,
    // stamp of the transaction's first mutation
    taken_at: u64,
}

/// The in-memory image of one block plus its cache bookkeeping.
///
/// # Invariants
///
/// - `data` is `None` exactly while the block is loading; its storage is lent to the serializer.
/// - The buffer is evictable only when unpinned, cached, clean, not being written back and
///   free of uncommitted mutations.
pub struct Buffer {
    block_id: BlockId,
    data: RefCell<Option<BlockData>>,
    pin_count: Cell<usize>,
    cached: Cell<bool>,
    evicted: Cell<bool>,
    // allocated and never written to disk
    fresh: Cell<bool>,
    // open transactions holding uncommitted mutations
    writers: Cell<usize>,
    dirty: DirtyTracker,
    eviction: EvictionMeta,
    owner: RefCell<Weak<TxState>>,
    waiters: RefCell<Vec<oneshot::Sender<LoadResult>>>,
}

impl Buffer {
    fn new(block_id: BlockId, data: Option<BlockData>) -> Self {
        Self {
            block_id,
            cached: Cell::new(data.is_some()),
            data: RefCell::new(data),
            pin_count: Cell::new(0),
            evicted: Cell::new(false),
            fresh: Cell::new(false),
            writers: Cell::new(0),
            dirty: DirtyTracker::default(),
            eviction: EvictionMeta::default(),
            owner: RefCell::new(Weak::new()),
            waiters: RefCell::new(vec![]),
        }
    }

    /// A buffer whose image is still on its way from disk.
    pub(crate) fn loading(block_id: BlockId) -> Self {
        Self::new(block_id, None)
    }

    /// A buffer for a freshly allocated block; its content is synthesized, so it starts cached.
    pub(crate) fn allocated(block_id: BlockId, data: BlockData) -> Self {
        let buffer = Self::new(block_id, Some(data));
        buffer.fresh.set(true);
        buffer
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    pub fn pin_count(&self) -> usize {
        self.pin_count.get()
    }

    pub fn is_cached(&self) -> bool {
        self.cached.get()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.is_dirty()
    }

    /// Whether the block was allocated here and no write of it has been issued yet.
    pub fn is_fresh(&self) -> bool {
        self.fresh.get()
    }

    pub fn has_uncommitted_writers(&self) -> bool {
        self.writers.get() > 0
    }

    pub fn dirty_tracker(&self) -> &DirtyTracker {
        &self.dirty
    }

    pub fn eviction_meta(&self) -> &EvictionMeta {
        &self.eviction
    }

    pub fn is_evictable(&self) -> bool {
        self.pin_count() == 0
            && self.is_cached()
            && !self.dirty.is_dirty()
            && !self.dirty.is_flushing()
            && !self.has_uncommitted_writers()
            && !self.evicted.get()
    }

    pub fn state(&self) -> BufferState {
        if self.evicted.get() {
            BufferState::Evicted
        } else if !self.is_cached() {
            BufferState::Loading
        } else if self.dirty.is_flushing() {
            BufferState::WritingBack
        } else if self.dirty.is_dirty() {
            BufferState::Dirty
        } else {
            BufferState::Clean
        }
    }

    pub(crate) fn pin(&self) {
        self.pin_count.set(self.pin_count.get() + 1);
    }

    pub(crate) fn unpin(&self) {
        let pins = self.pin_count.get();
        assert!(pins > 0, "unpin of unpinned buffer {}", self.block_id);
        self.pin_count.set(pins - 1);
    }

    /// Drop a caller's pin. A dirty buffer keeps it as its write-back pin so the write-back
    /// path can still reach it; a buffer holds at most one such pin.
    pub(crate) fn release(&self) {
        if self.dirty.is_dirty() && !self.dirty.has_writeback_pin() {
            self.dirty.writeback_pin.set(true);
        } else {
            self.unpin();
        }
    }

    pub(crate) fn mark_cached(&self) {
        assert!(
            !self.is_cached(),
            "buffer {} marked cached twice",
            self.block_id
        );
        assert!(
            self.data.borrow().is_some(),
            "buffer {} marked cached without an image",
            self.block_id
        );
        self.cached.set(true);
    }

    pub(crate) fn install(&self, data: BlockData) {
        let mut slot = self.data.borrow_mut();
        assert!(slot.is_none(), "buffer {} already has an image", self.block_id);
        *slot = Some(data);
    }

    pub(crate) fn mark_evicted(&self) {
        self.evicted.set(true);
    }

    pub fn read(&self) -> Ref<'_, [u8]> {
        assert!(
            self.is_cached(),
            "read of buffer {} before its load completed",
            self.block_id
        );
        Ref::map(self.data.borrow(), |data| match data {
            Some(data) => &data[..],
            None => panic!("cached buffer {} has no image", self.block_id),
        })
    }

    /// Mark the current image as needing a write without changing it.
    pub(crate) fn mark_dirty(&self, stamp: u64) {
        self.dirty.mark_dirty(stamp);
    }

    pub(crate) fn write(&self, stamp: u64) -> RefMut<'_, [u8]> {
        assert!(
            self.is_cached(),
            "write to buffer {} before its load completed",
            self.block_id
        );
        self.dirty.mark_dirty(stamp);
        RefMut::map(self.data.borrow_mut(), |data| match data {
            Some(data) => &mut data[..],
            None => panic!("cached buffer {} has no image", self.block_id),
        })
    }

    /// Start a write-back: take the write-back pin if the buffer does not hold one yet, and
    /// return a copy of the image together with the mutation stamp it reflects.
    pub(crate) fn begin_flush(&self) -> (BlockData, u64) {
        assert!(
            !self.dirty.is_flushing(),
            "buffer {} already being written back",
            self.block_id
        );
        if !self.dirty.has_writeback_pin() {
            self.pin();
            self.dirty.writeback_pin.set(true);
        }
        let stamp = self.dirty.last_mutation();
        self.dirty.flushing.set(Some(stamp));
        self.dirty.last_flushed.set(stamp);
        self.fresh.set(false);
        let image = match &*self.data.borrow() {
            Some(data) => data.clone(),
            None => panic!("flush of buffer {} without an image", self.block_id),
        };
        (image, stamp)
    }

    /// Finish a write-back. On success the buffer becomes clean unless it was mutated after
    /// the write was issued; a clean buffer gives up its write-back pin. Returns whether the
    /// buffer is clean afterwards.
    pub(crate) fn finish_flush(&self, stamp: u64, written: bool) -> bool {
        self.dirty.flushing.set(None);
        if written && self.dirty.last_mutation() == stamp {
            self.dirty.dirty.set(false);
        }
        if !self.dirty.is_dirty() && self.dirty.has_writeback_pin() {
            self.dirty.writeback_pin.set(false);
            self.unpin();
        }
        !self.dirty.is_dirty()
    }

    pub(crate) fn pre_image(&self, taken_at: u64) -> PreImage {
        assert!(
            self.is_cached(),
            "write to buffer {} before its load completed",
            self.block_id
        );
        let data = match &*self.data.borrow() {
            Some(data) => data.clone(),
            None => panic!("cached buffer {} has no image", self.block_id),
        };
        PreImage {
            data,
            dirty: self.dirty.is_dirty(),
            last_mutation: self.dirty.last_mutation(),
            taken_at,
        }
    }

    /// Put back the image a transaction started from.
    ///
    /// If a write issued since then may have carried the discarded content to disk, the
    /// restored image is marked dirty under `stamp` so that it gets written again. A buffer
    /// left clean gives up its write-back pin. Returns whether the buffer is dirty afterwards.
    pub(crate) fn restore(&self, pre_image: PreImage, stamp: u64) -> bool {
        let PreImage {
            data,
            dirty,
            last_mutation,
            taken_at,
        } = pre_image;
        *self.data.borrow_mut() = Some(data);
        if self.dirty.last_flushed.get() >= taken_at {
            self.dirty.mark_dirty(stamp);
        } else {
            self.dirty.dirty.set(dirty);
            self.dirty.last_mutation.set(last_mutation);
        }
        if !self.dirty.is_dirty() && !self.dirty.is_flushing() && self.dirty.has_writeback_pin() {
            self.dirty.writeback_pin.set(false);
            self.unpin();
        }
        self.dirty.is_dirty()
    }

    pub(crate) fn add_writer(&self) {
        self.writers.set(self.writers.get() + 1);
    }

    pub(crate) fn remove_writer(&self) {
        let writers = self.writers.get();
        assert!(writers > 0, "buffer {} has no uncommitted writer", self.block_id);
        self.writers.set(writers - 1);
    }

    pub(crate) fn owner(&self) -> Option<Rc<TxState>> {
        self.owner.borrow().upgrade()
    }

    pub(crate) fn set_owner(&self, tx: &Rc<TxState>) {
        *self.owner.borrow_mut() = Rc::downgrade(tx);
    }

    pub(crate) fn add_waiter(&self) -> oneshot::Receiver<LoadResult> {
        let (tx, rx) = oneshot::channel();
        self.waiters.borrow_mut().push(tx);
        rx
    }

    pub(crate) fn wake_waiters(&self, result: LoadResult) -> usize {
        let waiters: Vec<_> = self.waiters.borrow_mut().drain(..).collect();
        let woken = waiters.len();
        for waiter in waiters {
            // a dropped receiver means that acquisition was abandoned
            let _ = waiter.send(result.clone());
        }
        woken
    }
}
