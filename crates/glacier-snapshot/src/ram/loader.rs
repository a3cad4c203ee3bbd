//! The demand-paging RAM restore engine.
//!
//! `RamLoader` owns the global page table for one load and drives three
//! cooperating actors:
//!
//! - a single background reader thread pulling page indices off a bounded
//!   to-read queue and issuing the disk reads;
//! - an optional decompressor pool that inflates pages off the reader's
//!   critical path;
//! - the VM threads themselves, which trap into [`FaultHandler::on_fault`]
//!   when they touch a page that is not resident yet.
//!
//! Every page moves through `Empty -> Reading -> Read -> Filling ->
//! Filled` by compare-and-swap only. The first CAS guarantees a page is
//! read from disk at most once no matter how prefetch and faults race;
//! the second guarantees a single writer into guest memory. In eager mode
//! none of the machinery above runs: pages are sorted by file position
//! and streamed in on the calling thread.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::channel::{BoundedChannel, TrySendError};
use crate::config::SnapshotConfig;
use crate::error::{Result, SnapshotError};
use crate::fault::{FaultHandler, FaultWatch, IdleOutcome};
use crate::index::{self, BlockEntry};
use crate::ram::{HostPtr, PageState, RamBlock};
use crate::zero;

/// Queue sentinel: no further to-read work will ever be enqueued.
const END_MARKER: usize = usize::MAX;
/// Fault-path staging buffer; pages at or under this size avoid the heap.
const STACK_PAGE: usize = 4096;
/// A page stuck in `Reading`/`Filling` longer than this is a failed load,
/// not something to wait out forever.
const FAULT_SPIN_TIMEOUT: Duration = Duration::from_secs(10);
const SPIN_YIELD_EVERY: u32 = 64;

struct PrefetchCursor {
    next: usize,
    end_sent: bool,
}

struct LoaderInner {
    blocks: Vec<BlockEntry>,
    pages: Vec<crate::ram::Page>,
    compressed: bool,
    file: Mutex<File>,
    read_queue: BoundedChannel<usize>,
    filled_queue: BoundedChannel<usize>,
    cursor: Mutex<PrefetchCursor>,
    /// Pages not yet `Filled` (or failed); `join` waits for zero.
    remaining: AtomicUsize,
    has_error: AtomicBool,
    interrupted: AtomicBool,
    first_error: Mutex<Option<SnapshotError>>,
    /// Every disk read issued, in order. Instrumentation for the
    /// at-most-once and sequential-ordering contracts.
    read_offsets: Mutex<Vec<u64>>,
    /// Present only while an on-demand load is active; cleared on stop.
    watch: Mutex<Option<Arc<dyn FaultWatch>>>,
    progress_lock: Mutex<()>,
    progress_cv: Condvar,
}

impl LoaderInner {
    fn block_of(&self, page_index: usize) -> (&BlockEntry, usize) {
        let entry = &self.blocks[self.pages[page_index].block_index as usize];
        (entry, page_index - entry.pages_begin)
    }

    fn page_len(&self, page_index: usize) -> usize {
        let (entry, rel) = self.block_of(page_index);
        entry.block.page_len(rel)
    }

    fn page_for_addr(&self, addr: usize) -> Option<usize> {
        // Address-to-page is a block lookup plus arithmetic; blocks are
        // few (a handful of regions), pages are millions.
        let entry = self.blocks.iter().find(|e| e.block.contains(addr))?;
        Some(entry.pages_begin + entry.block.page_index_of(addr))
    }

    fn read_page_into(&self, page_index: usize, buf: &mut [u8]) -> Result<()> {
        let page = &self.pages[page_index];
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page.file_pos))?;
        let result = file.read_exact(buf);
        drop(file);
        self.read_offsets.lock().push(page.file_pos);
        result.map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                SnapshotError::ShortRead {
                    file_pos: page.file_pos,
                    expected: page.size_on_disk,
                }
            } else {
                SnapshotError::Io(e)
            }
        })
    }

    fn read_page_bytes(&self, page_index: usize) -> Result<Box<[u8]>> {
        let size = self.pages[page_index].size_on_disk as usize;
        let mut buf = vec![0u8; size].into_boxed_slice();
        self.read_page_into(page_index, &mut buf)?;
        Ok(buf)
    }

    /// Inflates raw on-disk bytes to the page's in-memory length.
    fn inflate(&self, page_index: usize, raw: &[u8]) -> Result<Box<[u8]>> {
        let page_len = self.page_len(page_index);
        if !self.compressed {
            return Ok(raw.into());
        }
        let bytes = lz4_flex::block::decompress(raw, page_len)
            .map_err(|e| SnapshotError::Decompression(e.to_string()))?;
        if bytes.len() != page_len {
            return Err(SnapshotError::Decompression(format!(
                "expected {page_len} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(bytes.into_boxed_slice())
    }

    fn unprotect_page(&self, page_index: usize) {
        let watch = self.watch.lock().clone();
        if let Some(watch) = watch {
            let (entry, rel) = self.block_of(page_index);
            watch.unprotect(HostPtr(entry.block.page_base(rel)), entry.block.page_len(rel));
        }
    }

    /// Finishes a decompressed (or raw) read: parks the bytes and hands
    /// the page to the fill side via the filled queue.
    fn complete_read(&self, page_index: usize, raw: Box<[u8]>) {
        let page = &self.pages[page_index];
        match self.inflate(page_index, &raw) {
            Ok(bytes) => {
                page.put_data(bytes);
                page.transition(PageState::Reading, PageState::Read);
                // A stopped queue means interruption; the page simply
                // stays at Read and join() reports the outcome.
                let _ = self.filled_queue.send(page_index);
            }
            Err(err) => self.fail_page(page_index, err),
        }
    }

    /// Brings a `Read` page to `Filled`. Returns `false` when another
    /// thread owns the fill; the caller may spin on the state instead.
    fn try_fill(&self, page_index: usize) -> bool {
        let page = &self.pages[page_index];
        if !page.transition(PageState::Read, PageState::Filling) {
            return false;
        }
        // Unprotect first: the copy below writes through the same mapping
        // the watcher guards, and the faulting thread is paused in the
        // handler until we return anyway.
        self.unprotect_page(page_index);
        let (entry, rel) = self.block_of(page_index);
        // SAFETY: the Filling CAS above makes this thread the only one
        // touching this page's guest memory.
        let dst = unsafe { entry.block.page_slice_mut(rel) };
        if page.is_zero() {
            zero::fill_zero(dst);
        } else {
            match page.take_data() {
                Some(bytes) if bytes.len() == dst.len() => dst.copy_from_slice(&bytes),
                _ => {
                    self.fail_page(
                        page_index,
                        SnapshotError::CorruptIndex("page buffer lost or mis-sized"),
                    );
                    return true;
                }
            }
        }
        page.transition(PageState::Filling, PageState::Filled);
        self.finish_page();
        true
    }

    fn finish_page(&self) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.notify_progress();
        }
    }

    fn fail_page(&self, page_index: usize, err: SnapshotError) {
        tracing::error!(page_index, error = %err, "ram page load failed");
        self.pages[page_index].set_error();
        let mut first = self.first_error.lock();
        if first.is_none() {
            *first = Some(err);
        }
        drop(first);
        self.has_error.store(true, Ordering::Release);
        // Errors are sticky: no point reading further pages.
        self.stop_pipeline();
    }

    fn stop_pipeline(&self) {
        self.read_queue.stop();
        self.filled_queue.stop();
        self.notify_progress();
    }

    fn notify_progress(&self) {
        let _guard = self.progress_lock.lock();
        self.progress_cv.notify_all();
    }

    fn loading_done(&self) -> bool {
        self.remaining.load(Ordering::Acquire) == 0
            || self.has_error.load(Ordering::Acquire)
            || self.interrupted.load(Ordering::Acquire)
    }

    /// Fault-path read: this thread already owns the `Reading` state.
    /// Small pages stage through an on-stack buffer to keep the guest's
    /// stall as short as possible.
    fn read_and_fill_now(&self, page_index: usize) {
        let page = &self.pages[page_index];
        let size = page.size_on_disk as usize;
        let mut stack_buf = [0u8; STACK_PAGE];
        let mut heap_buf;
        let raw: &[u8] = if size <= STACK_PAGE {
            let buf = &mut stack_buf[..size];
            if let Err(err) = self.read_page_into(page_index, buf) {
                self.fail_page(page_index, err);
                return;
            }
            buf
        } else {
            heap_buf = vec![0u8; size];
            if let Err(err) = self.read_page_into(page_index, &mut heap_buf) {
                self.fail_page(page_index, err);
                return;
            }
            &heap_buf
        };

        let bytes = match self.inflate(page_index, raw) {
            Ok(bytes) => bytes,
            Err(err) => {
                self.fail_page(page_index, err);
                return;
            }
        };

        // Park the bytes before publishing Read: a concurrent faulter
        // spinning on this page may win the Read -> Filling CAS the
        // instant the state lands, and must find the buffer there.
        page.put_data(bytes);
        page.transition(PageState::Reading, PageState::Read);
        if !self.try_fill(page_index) {
            // Another faulter won the fill; wait for it to land.
            self.spin_until_resident(page_index);
        }
    }

    fn spin_until_resident(&self, page_index: usize) {
        let page = &self.pages[page_index];
        let deadline = Instant::now() + FAULT_SPIN_TIMEOUT;
        let mut spins: u32 = 0;
        loop {
            match page.state() {
                PageState::Filled | PageState::Error => return,
                PageState::Read => {
                    if self.try_fill(page_index) {
                        return;
                    }
                }
                _ => {}
            }
            std::hint::spin_loop();
            spins = spins.wrapping_add(1);
            if spins % SPIN_YIELD_EVERY == 0 {
                thread::yield_now();
                if Instant::now() > deadline {
                    self.fail_page(
                        page_index,
                        SnapshotError::Io(std::io::Error::other("page load stalled")),
                    );
                    return;
                }
            }
        }
    }
}

impl FaultHandler for LoaderInner {
    fn on_fault(&self, addr: usize) {
        let Some(page_index) = self.page_for_addr(addr) else {
            return;
        };
        let page = &self.pages[page_index];
        match page.state() {
            PageState::Filled => return,
            PageState::Error => {
                // The load is already lost; let the guest proceed so it
                // does not fault-loop while teardown runs.
                self.unprotect_page(page_index);
                return;
            }
            PageState::Empty => {
                if page.transition(PageState::Empty, PageState::Reading) {
                    self.read_and_fill_now(page_index);
                    return;
                }
            }
            _ => {}
        }
        self.spin_until_resident(page_index);
    }

    fn on_idle(&self) -> IdleOutcome {
        if self.has_error.load(Ordering::Acquire) || self.interrupted.load(Ordering::Acquire) {
            return IdleOutcome::AllDone;
        }

        // Priority one: land pages the pipeline has already read.
        if let Some(page_index) = self.filled_queue.try_recv() {
            self.try_fill(page_index);
            return IdleOutcome::RunAgain;
        }

        // Priority two: feed the reader the next unread page.
        let mut cursor = self.cursor.lock();
        while cursor.next < self.pages.len() {
            let page_index = cursor.next;
            let page = &self.pages[page_index];
            match page.state() {
                PageState::Read if page.is_zero() => {
                    cursor.next += 1;
                    drop(cursor);
                    self.try_fill(page_index);
                    return IdleOutcome::RunAgain;
                }
                PageState::Empty => {
                    return match self.read_queue.try_send(page_index) {
                        Ok(()) => {
                            cursor.next += 1;
                            IdleOutcome::RunAgain
                        }
                        Err(TrySendError::Full(_)) => IdleOutcome::Wait,
                        Err(TrySendError::Stopped(_)) => IdleOutcome::AllDone,
                    };
                }
                _ => cursor.next += 1,
            }
        }

        // Priority three: one end marker once the table is exhausted.
        if !cursor.end_sent {
            match self.read_queue.try_send(END_MARKER) {
                Ok(()) => {
                    cursor.end_sent = true;
                    return IdleOutcome::RunAgain;
                }
                Err(TrySendError::Full(_)) => return IdleOutcome::Wait,
                Err(TrySendError::Stopped(_)) => cursor.end_sent = true,
            }
        }
        drop(cursor);

        if self.remaining.load(Ordering::Acquire) == 0 {
            self.notify_progress();
            IdleOutcome::AllDone
        } else {
            IdleOutcome::Wait
        }
    }
}

struct DecompressJob {
    page_index: usize,
    raw: Box<[u8]>,
}

/// Fixed-size worker pool inflating pages off the reader's critical path.
struct DecompressPool {
    tx: Mutex<Option<crossbeam_channel::Sender<DecompressJob>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl DecompressPool {
    fn start(inner: &Arc<LoaderInner>, worker_count: usize) -> Self {
        let (tx, rx) = crossbeam_channel::bounded::<DecompressJob>(worker_count * 2);
        let mut workers = Vec::with_capacity(worker_count);
        for n in 0..worker_count {
            let rx = rx.clone();
            let inner = Arc::clone(inner);
            workers.push(
                thread::Builder::new()
                    .name(format!("snap-inflate-{n}"))
                    .spawn(move || {
                        for job in rx.iter() {
                            inner.complete_read(job.page_index, job.raw);
                        }
                    })
                    .expect("spawn decompressor"),
            );
        }
        Self {
            tx: Mutex::new(Some(tx)),
            workers: Mutex::new(workers),
        }
    }

    /// Blocking hand-off; drops the job if the pool already shut down.
    fn submit(&self, job: DecompressJob) {
        let tx = self.tx.lock().clone();
        if let Some(tx) = tx {
            let _ = tx.send(job);
        }
    }

    fn try_submit(&self, job: DecompressJob) -> std::result::Result<(), DecompressJob> {
        let tx = self.tx.lock().clone();
        match tx {
            Some(tx) => tx.try_send(job).map_err(|e| match e {
                crossbeam_channel::TrySendError::Full(job)
                | crossbeam_channel::TrySendError::Disconnected(job) => job,
            }),
            None => Err(job),
        }
    }

    /// Disconnects the work channel and joins every worker.
    fn shutdown(&self) {
        self.tx.lock().take();
        let workers = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

/// Demand-paging loader for one snapshot's `ram.bin`.
pub struct RamLoader {
    path: PathBuf,
    config: SnapshotConfig,
    registered: Vec<RamBlock>,
    watch: Option<Arc<dyn FaultWatch>>,
    inner: Option<Arc<LoaderInner>>,
    reader: Option<JoinHandle<()>>,
    pool: Option<Arc<DecompressPool>>,
    on_demand_active: bool,
    was_on_demand: bool,
    started_at: Option<Instant>,
    duration: Option<Duration>,
    index_failed: bool,
}

impl RamLoader {
    /// `watch` is the platform fault watcher, or `None` on hosts without
    /// one (on-demand requests then fall back to the eager path).
    pub fn new(
        path: impl Into<PathBuf>,
        config: SnapshotConfig,
        watch: Option<Arc<dyn FaultWatch>>,
    ) -> Self {
        Self {
            path: path.into(),
            config,
            registered: Vec::new(),
            watch,
            inner: None,
            reader: None,
            pool: None,
            on_demand_active: false,
            was_on_demand: false,
            started_at: None,
            duration: None,
            index_failed: false,
        }
    }

    /// Must be called for every guest region before [`start`](Self::start).
    pub fn register_block(&mut self, block: RamBlock) {
        debug_assert!(
            self.inner.is_none(),
            "blocks must be registered before start"
        );
        self.registered.push(block);
    }

    /// Reads the index and either loads everything now (eager) or arms
    /// the fault watcher and returns immediately (on demand). An index
    /// failure is reported before any guest memory is touched.
    pub fn start(&mut self, use_on_demand: bool) -> Result<()> {
        if self.inner.is_some() {
            return Err(SnapshotError::InvalidOperation("ram loader already started"));
        }
        self.started_at = Some(Instant::now());

        let mut file = File::open(&self.path)?;
        let parsed = match index::read_index(&mut file, &self.registered) {
            Ok(parsed) => parsed,
            Err(err) => {
                self.index_failed = true;
                return Err(err);
            }
        };

        let page_count = parsed.pages.len();
        let inner = Arc::new(LoaderInner {
            blocks: parsed.blocks,
            pages: parsed.pages,
            compressed: parsed.compressed,
            file: Mutex::new(file),
            read_queue: BoundedChannel::new(self.config.read_queue_capacity),
            filled_queue: BoundedChannel::new(self.config.filled_queue_capacity),
            cursor: Mutex::new(PrefetchCursor {
                next: 0,
                end_sent: false,
            }),
            remaining: AtomicUsize::new(page_count),
            has_error: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            first_error: Mutex::new(None),
            read_offsets: Mutex::new(Vec::new()),
            watch: Mutex::new(None),
            progress_lock: Mutex::new(()),
            progress_cv: Condvar::new(),
        });
        self.inner = Some(Arc::clone(&inner));

        if use_on_demand && self.watch.is_some() && self.arm_watch(&inner) {
            tracing::info!(
                pages = page_count,
                compressed = inner.compressed,
                "ram load started on demand"
            );
            self.on_demand_active = true;
            self.was_on_demand = true;
            return Ok(());
        }

        let result = self.load_eager(&inner);
        self.duration = self.started_at.map(|t| t.elapsed());
        result
    }

    /// Protects every registered block and starts callback delivery.
    /// Returns `false` (after cleaning up) when the platform refuses,
    /// so the caller can fall back to eager loading.
    fn arm_watch(&mut self, inner: &Arc<LoaderInner>) -> bool {
        let Some(watch) = self.watch.clone() else {
            return false;
        };
        *inner.watch.lock() = Some(Arc::clone(&watch));

        let all_registered = inner
            .blocks
            .iter()
            .all(|entry| watch.register_range(entry.block.host_ptr, entry.block.size));
        if !all_registered {
            watch.stop();
            *inner.watch.lock() = None;
            return false;
        }

        if inner.compressed && self.config.decompress_workers > 0 {
            self.pool = Some(Arc::new(DecompressPool::start(
                inner,
                self.config.decompress_workers,
            )));
        }

        let reader_inner = Arc::clone(inner);
        let reader_pool = self.pool.clone();
        self.reader = Some(
            thread::Builder::new()
                .name("snap-reader".into())
                .spawn(move || reader_loop(reader_inner, reader_pool))
                .expect("spawn snapshot reader"),
        );

        if !watch.start(Arc::clone(inner) as Arc<dyn FaultHandler>) {
            watch.stop();
            *inner.watch.lock() = None;
            // Retire the pipeline without poisoning the queues; the
            // eager fallback still runs through them.
            let _ = inner.read_queue.send(END_MARKER);
            if let Some(reader) = self.reader.take() {
                let _ = reader.join();
            }
            if let Some(pool) = self.pool.take() {
                pool.shutdown();
            }
            return false;
        }
        true
    }

    /// Zero-fills empty pages, then streams the rest in ascending file
    /// position: sequential disk access beats the guest's layout order.
    fn load_eager(&mut self, inner: &Arc<LoaderInner>) -> Result<()> {
        let mut nonzero: Vec<usize> = Vec::new();
        for page_index in 0..inner.pages.len() {
            if inner.pages[page_index].is_zero() {
                inner.try_fill(page_index);
            } else {
                nonzero.push(page_index);
            }
        }
        nonzero.sort_by_key(|&i| inner.pages[i].file_pos);

        let pool = if inner.compressed && self.config.decompress_workers > 0 {
            Some(Arc::new(DecompressPool::start(
                inner,
                self.config.decompress_workers,
            )))
        } else {
            None
        };

        'pages: for page_index in nonzero {
            if inner.has_error.load(Ordering::Acquire)
                || inner.interrupted.load(Ordering::Acquire)
            {
                break;
            }
            let page = &inner.pages[page_index];
            if !page.transition(PageState::Empty, PageState::Reading) {
                continue;
            }
            let raw = match inner.read_page_bytes(page_index) {
                Ok(raw) => raw,
                Err(err) => {
                    inner.fail_page(page_index, err);
                    break;
                }
            };
            match &pool {
                Some(pool) => {
                    let mut job = DecompressJob { page_index, raw };
                    // Keep draining while the pool is saturated so its
                    // workers never deadlock against a full filled queue.
                    loop {
                        match pool.try_submit(job) {
                            Ok(()) => break,
                            Err(returned) => job = returned,
                        }
                        while let Some(done) = inner.filled_queue.try_recv() {
                            inner.try_fill(done);
                        }
                        if inner.has_error.load(Ordering::Acquire)
                            || inner.interrupted.load(Ordering::Acquire)
                        {
                            break 'pages;
                        }
                        thread::yield_now();
                    }
                }
                None => {
                    let page = &inner.pages[page_index];
                    match inner.inflate(page_index, &raw) {
                        Ok(bytes) => {
                            page.put_data(bytes);
                            page.transition(PageState::Reading, PageState::Read);
                            inner.try_fill(page_index);
                        }
                        Err(err) => {
                            inner.fail_page(page_index, err);
                            break;
                        }
                    }
                }
            }
        }

        // Land whatever the pool is still inflating.
        while inner.remaining.load(Ordering::Acquire) > 0 && !inner.loading_done() {
            match inner.filled_queue.try_recv() {
                Some(page_index) => {
                    inner.try_fill(page_index);
                }
                None => thread::yield_now(),
            }
        }
        if let Some(pool) = pool {
            pool.shutdown();
        }

        if inner.interrupted.load(Ordering::Acquire) {
            return Err(SnapshotError::Interrupted);
        }
        if inner.has_error.load(Ordering::Acquire) {
            return Err(self.take_error(inner));
        }
        Ok(())
    }

    fn take_error(&self, inner: &LoaderInner) -> SnapshotError {
        inner
            .first_error
            .lock()
            .take()
            .unwrap_or_else(|| SnapshotError::Io(std::io::Error::other("ram load failed")))
    }

    /// Stops both queues; in-flight background work unwinds promptly.
    pub fn interrupt_reading(&self) {
        if let Some(inner) = &self.inner {
            inner.interrupted.store(true, Ordering::Release);
            inner.stop_pipeline();
        }
    }

    /// Blocks until every page is resident (or the load failed), then
    /// tears down the watcher and pipeline threads.
    pub fn join(&mut self) -> Result<()> {
        let Some(inner) = self.inner.clone() else {
            return if self.index_failed {
                // The precise failure was already reported by start();
                // this keeps the outcome snapshot-poisoning.
                Err(SnapshotError::CorruptIndex("ram index rejected at start"))
            } else {
                Ok(())
            };
        };

        if self.on_demand_active {
            let mut guard = inner.progress_lock.lock();
            while !inner.loading_done() {
                inner
                    .progress_cv
                    .wait_for(&mut guard, Duration::from_millis(50));
            }
            drop(guard);
        }
        self.teardown(&inner);

        if inner.interrupted.load(Ordering::Acquire) {
            return Err(SnapshotError::Interrupted);
        }
        if inner.has_error.load(Ordering::Acquire) {
            return Err(self.take_error(&inner));
        }
        Ok(())
    }

    fn teardown(&mut self, inner: &Arc<LoaderInner>) {
        let watch = inner.watch.lock().take();
        if let Some(watch) = watch {
            watch.stop();
        }
        inner.read_queue.stop();
        inner.filled_queue.stop();
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Some(pool) = self.pool.take() {
            pool.shutdown();
        }
        self.on_demand_active = false;
        if self.duration.is_none() {
            self.duration = self.started_at.map(|t| t.elapsed());
        }
    }

    pub fn has_error(&self) -> bool {
        self.index_failed
            || self
                .inner
                .as_ref()
                .is_some_and(|inner| inner.has_error.load(Ordering::Acquire))
    }

    /// Whether this load actually armed the fault watcher (an on-demand
    /// request may have fallen back to eager).
    pub fn on_demand(&self) -> bool {
        self.was_on_demand
    }

    pub fn compressed(&self) -> bool {
        self.inner.as_ref().is_some_and(|inner| inner.compressed)
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration
    }

    /// Number of disk reads issued so far. At most one per non-empty page.
    pub fn disk_read_count(&self) -> usize {
        self.inner
            .as_ref()
            .map_or(0, |inner| inner.read_offsets.lock().len())
    }

    /// File offsets of every disk read, in issue order.
    pub fn read_offsets(&self) -> Vec<u64> {
        self.inner
            .as_ref()
            .map_or_else(Vec::new, |inner| inner.read_offsets.lock().clone())
    }
}

impl Drop for RamLoader {
    fn drop(&mut self) {
        // Background threads hold references into the page table; they
        // must be gone before it is.
        if let Some(inner) = self.inner.clone() {
            self.interrupt_reading();
            self.teardown(&inner);
        }
    }
}

fn reader_loop(inner: Arc<LoaderInner>, pool: Option<Arc<DecompressPool>>) {
    while let Some(page_index) = inner.read_queue.recv() {
        if page_index == END_MARKER {
            break;
        }
        let page = &inner.pages[page_index];
        // The fault path may have claimed this page after it was queued;
        // losing the CAS here is the no-duplicate-read guarantee at work.
        if !page.transition(PageState::Empty, PageState::Reading) {
            continue;
        }
        match inner.read_page_bytes(page_index) {
            Ok(raw) => match &pool {
                Some(pool) => pool.submit(DecompressJob { page_index, raw }),
                None => inner.complete_read(page_index, raw),
            },
            Err(err) => {
                inner.fail_page(page_index, err);
                break;
            }
        }
    }
    tracing::debug!("snapshot reader thread exiting");
}
