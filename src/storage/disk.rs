use std::fs::{File, OpenOptions};
use std::io::{prelude::*, Result, SeekFrom};
use std::path::Path;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, error};

use super::entity::{BlockData, BlockId};
use super::manager::{CompletionContext, IoKind, Serializer};

enum Request {
    Read {
        block_id: BlockId,
        dest: BlockData,
        ctx: CompletionContext,
    },
    Write {
        block_id: BlockId,
        src: BlockData,
        ctx: CompletionContext,
    },
}

/// A file-backed block store. Reads and writes run on a dedicated I/O thread so that the
/// submitting thread never blocks on the file.
pub struct FileDisk {
    block_size: usize,
    // 起動時点でファイル上に存在するブロック数
    block_count: u64,
    requests: Option<Sender<Request>>,
    worker: Option<JoinHandle<()>>,
}

impl FileDisk {
    pub fn new(heap_file: File, block_size: usize) -> Result<Self> {
        let heap_file_size = heap_file.metadata()?.len();
        let block_count = heap_file_size / block_size as u64;
        let (requests, inbox) = crossbeam_channel::unbounded();
        let worker = thread::Builder::new()
            .name("blockcache-io".into())
            .spawn(move || serve(heap_file, block_size, inbox))?;
        Ok(Self {
            block_size,
            block_count,
            requests: Some(requests),
            worker: Some(worker),
        })
    }

    pub fn open(heap_file_path: impl AsRef<Path>, block_size: usize) -> Result<Self> {
        let heap_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(heap_file_path)?;
        Self::new(heap_file, block_size)
    }

    fn submit(&self, request: Request) {
        let Some(requests) = &self.requests else {
            return;
        };
        if let Err(crossbeam_channel::SendError(request)) = requests.send(request) {
            // the worker is gone; report the operation as failed rather than losing it
            let ctx = match request {
                Request::Read { ctx, .. } | Request::Write { ctx, .. } => ctx,
            };
            ctx.complete(Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "I/O worker has stopped",
            )));
        }
    }
}

impl Serializer for FileDisk {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn block_count(&self) -> u64 {
        self.block_count
    }

    fn do_read(&mut self, block_id: BlockId, dest: BlockData, ctx: CompletionContext) {
        self.submit(Request::Read {
            block_id,
            dest,
            ctx,
        });
    }

    fn do_write(&mut self, block_id: BlockId, src: BlockData, ctx: CompletionContext) {
        self.submit(Request::Write { block_id, src, ctx });
    }
}

impl Drop for FileDisk {
    fn drop(&mut self) {
        // closing the channel lets the worker drain its queue and exit
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("I/O worker panicked");
            }
        }
    }
}

fn serve(mut heap_file: File, block_size: usize, inbox: Receiver<Request>) {
    for request in inbox {
        match request {
            Request::Read {
                block_id,
                mut dest,
                ctx,
            } => {
                debug_assert_eq!(IoKind::Read, ctx.kind());
                let result = read_block(&mut heap_file, block_size, block_id, &mut dest);
                ctx.complete(result.map(|_| dest));
            }
            Request::Write { block_id, src, ctx } => {
                debug_assert_eq!(IoKind::Write, ctx.kind());
                let result = write_block(&mut heap_file, block_size, block_id, &src);
                ctx.complete(result.map(|_| src));
            }
        }
    }
    debug!("I/O worker exiting");
}

fn read_block(heap_file: &mut File, block_size: usize, block_id: BlockId, data: &mut [u8]) -> Result<()> {
    // オフセットを計算
    let offset = block_size as u64 * block_id.to_u64();
    // ブロック先頭へシーク
    heap_file.seek(SeekFrom::Start(offset))?;
    // データを読み出す
    heap_file.read_exact(data)
}

fn write_block(heap_file: &mut File, block_size: usize, block_id: BlockId, data: &[u8]) -> Result<()> {
    // オフセットを計算
    let offset = block_size as u64 * block_id.to_u64();
    // ブロック先頭へシーク
    heap_file.seek(SeekFrom::Start(offset))?;
    // データを書きこむ
    heap_file.write_all(data)?;
    heap_file.sync_data()
}
