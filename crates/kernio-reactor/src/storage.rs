//! The storage-AIO engine.
//!
//! Batched submission out of the runtime's storage sink, completion
//! reaping, and the out-of-thread retry path for submissions that are not
//! allowed to block the reactor. Shared by the READY and AIO backends; the
//! URING backend submits storage on its ring directly.
//!
//! Pool accounting invariant: `outstanding() == MAX_AIO - free blocks` is
//! exactly the number of control blocks committed to the kernel or parked
//! on a retry list. Every completed or aborted request returns its block
//! to the pool exactly once.

use crate::aio_abi::{
    self, io_destroy, io_getevents, io_setup, io_submit, set_eventfd_notification, set_nowait,
    set_user_data, AioContext, IoEvent, Iocb,
};
use crossbeam_queue::ArrayQueue;
use kernio_core::completion::{CompletionKey, CompletionKind, StorageCompletion};
use kernio_core::request::{IoRequest, Opcode};
use kernio_core::sink::{IoSink, PendingIo};
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Control-block pool size. Must cover the worst case of every I/O queue
/// bursting at once.
pub const MAX_AIO: usize = 1024;
pub const MAX_QUEUES: usize = 32;
const _: () = assert!(MAX_AIO >= MAX_QUEUES * MAX_QUEUES);

struct IocbPool {
    blocks: Box<[Iocb]>,
    completions: Box<[Option<StorageCompletion>]>,
    free: Vec<u16>,
}

impl IocbPool {
    fn new() -> Self {
        Self {
            blocks: vec![Iocb::zeroed(); MAX_AIO].into_boxed_slice(),
            completions: (0..MAX_AIO).map(|_| None).collect(),
            free: (0..MAX_AIO as u16).rev().collect(),
        }
    }

    #[inline]
    fn has_capacity(&self) -> bool {
        !self.free.is_empty()
    }

    #[inline]
    fn outstanding(&self) -> usize {
        MAX_AIO - self.free.len()
    }

    fn get_one(&mut self) -> u16 {
        self.free.pop().expect("iocb pool exhausted")
    }

    fn put_one(&mut self, slot: u16) {
        debug_assert!(self.completions[slot as usize].is_none());
        self.free.push(slot);
    }

    fn block_mut(&mut self, slot: u16) -> &mut Iocb {
        &mut self.blocks[slot as usize]
    }

    fn block_ptr(&mut self, slot: u16) -> *mut Iocb {
        // Boxed slice: stable for the pool's lifetime.
        unsafe { self.blocks.as_mut_ptr().add(slot as usize) }
    }

    fn set_completion(&mut self, slot: u16, completion: StorageCompletion) {
        self.completions[slot as usize] = Some(completion);
    }

    fn take_completion(&mut self, slot: u16) -> StorageCompletion {
        self.completions[slot as usize]
            .take()
            .expect("storage completion fired twice")
    }
}

fn prepare_iocb(req: &IoRequest, key: CompletionKey) -> Iocb {
    let mut io = match req.opcode {
        Opcode::Read => aio_abi::make_read_iocb(req.fd, req.pos, req.addr, req.len),
        Opcode::Write => aio_abi::make_write_iocb(req.fd, req.pos, req.addr, req.len),
        Opcode::Readv => aio_abi::make_readv_iocb(req.fd, req.pos, req.addr, req.len),
        Opcode::Writev => aio_abi::make_writev_iocb(req.fd, req.pos, req.addr, req.len),
        Opcode::Fdatasync => aio_abi::make_fdsync_iocb(req.fd),
    };
    if req.nowait && req.opcode != Opcode::Fdatasync {
        set_nowait(&mut io, true);
    }
    set_user_data(&mut io, key);
    io
}

// ── Retry worker ─────────────────────────────────────────────────────

/// A batch of control-block addresses handed to the worker for one
/// blocking submit. Addresses are plain words; the loop thread keeps the
/// pool alive and does not touch the batch while it is out.
struct RetryBatch {
    ctx: AioContext,
    iocbs: Vec<usize>,
}

struct RetryWorker {
    requests: Arc<ArrayQueue<RetryBatch>>,
    results: Arc<ArrayQueue<Result<usize, i32>>>,
    shutdown: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl RetryWorker {
    fn spawn() -> Self {
        let requests = Arc::new(ArrayQueue::new(1));
        let results = Arc::new(ArrayQueue::new(1));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reqs = Arc::clone(&requests);
        let ress = Arc::clone(&results);
        let dying = Arc::clone(&shutdown);
        let handle = thread::Builder::new()
            .name("kernio-aio-retry".into())
            .spawn(move || retry_worker_loop(reqs, ress, dying))
            .expect("failed to spawn storage retry worker");

        Self {
            requests,
            results,
            shutdown,
            handle: Some(handle),
        }
    }

    /// One batch at a time; the caller serializes with `retry_in_flight`.
    fn send(&self, batch: RetryBatch) {
        self.requests
            .push(batch)
            .unwrap_or_else(|_| panic!("retry batch already in flight"));
    }

    fn try_result(&self) -> Option<Result<usize, i32>> {
        self.results.pop()
    }
}

impl Drop for RetryWorker {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            handle.thread().unpark();
            let _ = handle.join();
        }
    }
}

fn retry_worker_loop(
    requests: Arc<ArrayQueue<RetryBatch>>,
    results: Arc<ArrayQueue<Result<usize, i32>>>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            break;
        }
        match requests.pop() {
            Some(batch) => {
                // This submit MAY block; that is the point of the worker.
                let r = io_submit(
                    batch.ctx,
                    batch.iocbs.as_ptr() as *const *mut Iocb,
                    batch.iocbs.len(),
                );
                // One-slot queue, and the loop thread consumes before
                // sending the next batch.
                let _ = results.push(r);
            }
            None => {
                thread::park_timeout(Duration::from_millis(1));
            }
        }
    }
}

// ── Storage context ──────────────────────────────────────────────────

pub struct StorageContext {
    ctx: AioContext,
    pool: IocbPool,
    submission_queue: Vec<u16>,
    /// Blocks waiting for the next worker batch.
    pending_retry: Vec<u16>,
    /// The batch currently (or about to be) at the worker.
    active_retry: Vec<u16>,
    retry_in_flight: bool,
    worker: RetryWorker,
    /// Reactor-polled eventfd wired into every submission so completions
    /// wake a sleeping loop (READY backend).
    eventfd: Option<RawFd>,
    kernel_page_cache: bool,
    /// Request popped from the sink when the pool had no block for it.
    overflow: Option<PendingIo>,
    ev_buffer: Box<[IoEvent]>,
}

impl StorageContext {
    pub fn new(kernel_page_cache: bool, eventfd: Option<RawFd>) -> kernio_core::Result<Self> {
        Ok(Self {
            ctx: io_setup(MAX_AIO)?,
            pool: IocbPool::new(),
            submission_queue: Vec::with_capacity(MAX_AIO),
            pending_retry: Vec::new(),
            active_retry: Vec::new(),
            retry_in_flight: false,
            worker: RetryWorker::spawn(),
            eventfd,
            kernel_page_cache,
            overflow: None,
            ev_buffer: vec![IoEvent::zeroed(); MAX_AIO].into_boxed_slice(),
        })
    }

    #[inline]
    pub fn outstanding(&self) -> usize {
        self.pool.outstanding()
    }

    /// Sleep is safe when nothing is committed, or when completions are
    /// wired to an eventfd the reactor polls.
    pub fn can_sleep(&self) -> bool {
        self.pool.outstanding() == 0 || self.eventfd.is_some()
    }

    fn need_to_retry(&self) -> bool {
        !self.pending_retry.is_empty() || !self.active_retry.is_empty()
    }

    /// Drain the sink into staged control blocks and push them at the
    /// kernel. Returns true if any submission work happened.
    pub fn submit_work(&mut self, sink: &IoSink) -> bool {
        self.advance_retry();

        let mut did_work = false;
        self.submission_queue.clear();

        loop {
            let pending = match self.overflow.take().or_else(|| sink.pop()) {
                Some(p) => p,
                None => break,
            };
            // The sink hands requests out in FIFO order and cannot take
            // one back, so a request popped against a drained pool parks
            // in the overflow slot and is staged first next time.
            if !self.pool.has_capacity() {
                self.overflow = Some(pending);
                break;
            }
            let slot = self.pool.get_one();
            let key = CompletionKey::new(CompletionKind::Storage, slot as u32);
            let mut io = prepare_iocb(&pending.req, key);
            if let Some(efd) = self.eventfd {
                set_eventfd_notification(&mut io, efd);
            }
            *self.pool.block_mut(slot) = io;
            self.pool.set_completion(slot, pending.completion);
            self.submission_queue.push(slot);
        }

        if self.kernel_page_cache {
            // Through the page cache io_submit is effectively synchronous,
            // so it must not run on the loop thread. Treat the whole batch
            // as if it had failed with EAGAIN and push it to the worker.
            did_work = !self.submission_queue.is_empty();
            for i in 0..self.submission_queue.len() {
                let slot = self.submission_queue[i];
                set_nowait(self.pool.block_mut(slot), false);
                self.pending_retry.push(slot);
            }
            self.submission_queue.clear();
        } else {
            let to_submit = self.submission_queue.len();
            let mut ptrs: Vec<*mut Iocb> = Vec::with_capacity(to_submit);
            for i in 0..to_submit {
                let slot = self.submission_queue[i];
                ptrs.push(self.pool.block_ptr(slot));
            }

            let mut submitted = 0;
            while submitted < to_submit {
                match io_submit(self.ctx, ptrs[submitted..].as_ptr(), to_submit - submitted) {
                    Ok(n) => {
                        submitted += n;
                        did_work = true;
                    }
                    Err(e) if e == libc::EAGAIN => {
                        // The kernel has no submission room; defer the rest
                        // of the batch to the worker.
                        for i in submitted..to_submit {
                            let slot = self.submission_queue[i];
                            set_nowait(self.pool.block_mut(slot), false);
                            self.pending_retry.push(slot);
                        }
                        did_work = true;
                        break;
                    }
                    Err(e) if e == libc::EBADF => {
                        // The head request carries a bad fd: complete it
                        // with -EBADF and keep going with the rest.
                        let slot = self.submission_queue[submitted];
                        let completion = self.pool.take_completion(slot);
                        self.pool.put_one(slot);
                        completion(-(libc::EBADF as i64));
                        submitted += 1;
                        did_work = true;
                    }
                    Err(e) => {
                        log::error!("storage io_submit failed: errno {}", e);
                        panic!("io_submit: errno {}", e);
                    }
                }
            }
        }

        if self.need_to_retry() && !self.retry_in_flight {
            self.advance_retry();
        }

        did_work
    }

    /// Drive the retry state machine: consume the worker's last result,
    /// swap a fresh pending batch in, and hand it over. Both lists must be
    /// empty before the retry cycle is considered complete.
    fn advance_retry(&mut self) {
        if self.retry_in_flight {
            match self.worker.try_result() {
                None => return,
                Some(Ok(consumed)) => {
                    self.retry_in_flight = false;
                    self.active_retry.drain(..consumed);
                }
                Some(Err(e)) if e == libc::EAGAIN => {
                    // Nothing consumed; the batch is resubmitted below.
                    self.retry_in_flight = false;
                }
                Some(Err(e)) if e == libc::EBADF => {
                    self.retry_in_flight = false;
                    let slot = self.active_retry.remove(0);
                    let completion = self.pool.take_completion(slot);
                    self.pool.put_one(slot);
                    completion(-(libc::EBADF as i64));
                }
                Some(Err(e)) => {
                    self.retry_in_flight = false;
                    log::warn!("storage retry submit failed: errno {}", e);
                    // The retry loop terminates here; the next submit_work
                    // restarts it with the batch intact.
                    return;
                }
            }
        }

        if self.active_retry.is_empty() && !self.pending_retry.is_empty() {
            // Swap so that further EAGAINs can accumulate while this batch
            // is at the worker.
            std::mem::swap(&mut self.active_retry, &mut self.pending_retry);
        }

        if !self.active_retry.is_empty() {
            let mut iocbs = Vec::with_capacity(self.active_retry.len());
            for i in 0..self.active_retry.len() {
                let slot = self.active_retry[i];
                iocbs.push(self.pool.block_ptr(slot) as usize);
            }
            self.worker.send(RetryBatch { ctx: self.ctx, iocbs });
            self.retry_in_flight = true;
        }
    }

    /// Deliver every ready completion. `-EAGAIN` results re-enter the
    /// retry path when allowed; everything else reaches the caller raw.
    pub fn reap_completions(&mut self, allow_retry: bool) -> bool {
        let ts = aio_abi::timespec_zero();
        let n = match io_getevents(self.ctx, 1, &mut self.ev_buffer, Some(&ts)) {
            Ok(n) => n,
            Err(e) if e == libc::EINTR => 0,
            Err(e) => {
                log::error!("storage io_getevents failed: errno {}", e);
                panic!("io_getevents: errno {}", e);
            }
        };

        for i in 0..n {
            let ev = self.ev_buffer[i];
            let key = ev.key();
            debug_assert_eq!(key.kind(), CompletionKind::Storage);
            let slot = key.index() as u16;

            if ev.res == -(libc::EAGAIN as i64) && allow_retry {
                set_nowait(self.pool.block_mut(slot), false);
                self.pending_retry.push(slot);
                continue;
            }

            let completion = self.pool.take_completion(slot);
            self.pool.put_one(slot);
            completion(ev.res);
        }

        n > 0
    }

    /// Shutdown drain: finish the retry cycle and reap until every block
    /// is back in the pool.
    fn stop(&mut self) {
        while self.pool.outstanding() != 0 {
            self.advance_retry();
            self.reap_completions(false);
            thread::yield_now();
        }
    }
}

impl Drop for StorageContext {
    fn drop(&mut self) {
        self.stop();
        io_destroy(self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernio_core::sink::IoSink;
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::sync::atomic::{AtomicI64, AtomicUsize};

    fn aio_available() -> bool {
        match io_setup(1) {
            Ok(ctx) => {
                io_destroy(ctx);
                true
            }
            Err(_) => false,
        }
    }

    fn drain(ctx: &mut StorageContext) {
        for _ in 0..10_000 {
            ctx.reap_completions(true);
            ctx.advance_retry();
            if ctx.outstanding() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
        panic!("storage context failed to drain");
    }

    #[test]
    fn write_then_reap_returns_block_to_pool() {
        if !aio_available() {
            return;
        }
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();

        let sink = IoSink::with_capacity(16);
        let mut ctx = StorageContext::new(false, None).unwrap();
        let result = Arc::new(AtomicI64::new(i64::MIN));
        let result2 = result.clone();

        let buf = vec![7u8; 4096];
        sink.submit(
            IoRequest::write(file.as_raw_fd(), 0, buf.as_ptr(), buf.len(), false),
            Box::new(move |res| result2.store(res, Ordering::Relaxed)),
        )
        .unwrap_or_else(|_| panic!("sink full"));

        assert!(ctx.submit_work(&sink));
        assert_eq!(ctx.outstanding(), 1);
        drain(&mut ctx);
        assert_eq!(result.load(Ordering::Relaxed), 4096);
        drop(buf);
    }

    #[test]
    fn bad_fd_synthesizes_ebadf_without_poisoning_pool() {
        if !aio_available() {
            return;
        }
        let sink = IoSink::with_capacity(16);
        let mut ctx = StorageContext::new(false, None).unwrap();
        let bad = Arc::new(AtomicI64::new(0));
        let bad2 = bad.clone();

        let mut scratch = [0u8; 64];
        sink.submit(
            IoRequest::read(-1, 0, scratch.as_mut_ptr(), scratch.len(), false),
            Box::new(move |res| bad2.store(res, Ordering::Relaxed)),
        )
        .unwrap_or_else(|_| panic!("sink full"));

        assert!(ctx.submit_work(&sink));
        assert_eq!(bad.load(Ordering::Relaxed), -(libc::EBADF as i64));
        assert_eq!(ctx.outstanding(), 0);

        // The pool is unharmed: a good request still flows through.
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[1u8; 512]).unwrap();
        let ok = Arc::new(AtomicI64::new(i64::MIN));
        let ok2 = ok.clone();
        let mut buf = vec![0u8; 512];
        sink.submit(
            IoRequest::read(file.as_raw_fd(), 0, buf.as_mut_ptr(), buf.len(), false),
            Box::new(move |res| ok2.store(res, Ordering::Relaxed)),
        )
        .unwrap_or_else(|_| panic!("sink full"));
        assert!(ctx.submit_work(&sink));
        drain(&mut ctx);
        assert_eq!(ok.load(Ordering::Relaxed), 512);
    }

    #[test]
    fn page_cache_flag_routes_through_retry_worker() {
        if !aio_available() {
            return;
        }
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[3u8; 16 * 512]).unwrap();

        let sink = IoSink::with_capacity(32);
        let mut ctx = StorageContext::new(true, None).unwrap();
        let done = Arc::new(AtomicUsize::new(0));

        let mut bufs: Vec<Vec<u8>> = (0..16).map(|_| vec![0u8; 512]).collect();
        for (i, buf) in bufs.iter_mut().enumerate() {
            let done = done.clone();
            sink.submit(
                IoRequest::read(file.as_raw_fd(), (i * 512) as u64, buf.as_mut_ptr(), 512, true),
                Box::new(move |res| {
                    assert_eq!(res, 512);
                    done.fetch_add(1, Ordering::Relaxed);
                }),
            )
            .unwrap_or_else(|_| panic!("sink full"));
        }

        assert!(ctx.submit_work(&sink));
        // Nothing was submitted inline; all 16 went to the retry lists.
        drain(&mut ctx);
        assert_eq!(done.load(Ordering::Relaxed), 16);
        assert_eq!(ctx.outstanding(), 0);
        for buf in &bufs {
            assert!(buf.iter().all(|b| *b == 3));
        }
    }

    #[test]
    fn pool_exhaustion_stages_and_stops() {
        if !aio_available() {
            return;
        }
        let file = tempfile::tempfile().unwrap();
        let fd = file.as_raw_fd();
        let sink = IoSink::with_capacity(MAX_AIO + 8);
        let mut ctx = StorageContext::new(true, None).unwrap();

        // Overfill the sink past the pool, with the page-cache flag on so
        // nothing reaches the kernel inline and the accounting is
        // deterministic at the staging step.
        for _ in 0..MAX_AIO + 8 {
            sink.submit(IoRequest::fdatasync(fd), Box::new(|_| {}))
                .unwrap_or_else(|_| panic!("sink full"));
        }
        assert!(ctx.submit_work(&sink));
        assert_eq!(ctx.outstanding(), MAX_AIO);
        // The excess stays queued: one popped request parks in the
        // overflow slot, the rest remain in the sink.
        assert_eq!(sink.len(), 7);
        // No eventfd wired: sleeping with blocks in flight would hang.
        assert!(!ctx.can_sleep());
        drain(&mut ctx);
        assert!(ctx.can_sleep());

        // The next round stages the parked request first, then the rest.
        assert!(ctx.submit_work(&sink));
        assert_eq!(ctx.outstanding(), 8);
        assert_eq!(sink.len(), 0);
        drain(&mut ctx);
    }

    #[test]
    fn eventfd_wiring_always_permits_sleep() {
        if !aio_available() {
            return;
        }
        let efd = kernio_core::fd::FileDesc::eventfd(0).unwrap();
        let file = tempfile::tempfile().unwrap();
        let sink = IoSink::with_capacity(4);
        let mut ctx = StorageContext::new(true, Some(efd.get())).unwrap();
        sink.submit(IoRequest::fdatasync(file.as_raw_fd()), Box::new(|_| {}))
            .unwrap_or_else(|_| panic!("sink full"));
        ctx.submit_work(&sink);
        assert!(ctx.outstanding() > 0);
        assert!(ctx.can_sleep());
        drain(&mut ctx);
    }
}
