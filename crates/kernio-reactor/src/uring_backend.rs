//! The URING backend: one unified ring for storage, readiness and timer
//! polls. One submission entry carries one operation; its user-data word
//! is the completion key. Preemption reuses the AIO ring-head context;
//! storage needs no page-cache safety here because uring is non-blocking
//! by contract.

use crate::backend::ReactorBackend;
use crate::fd_slab::{FdSlab, PollableFd};
use crate::preempt_io::PreemptIoContext;
use io_uring::{opcode, squeue, types, IoUring, Probe};
use kernio_core::completion::{CompletionKey, CompletionKind, StorageCompletion};
use kernio_core::error::{Error, Result};
use kernio_core::fd::{read_count_raw, FileDesc};
use kernio_core::poll::{PollFlags, PollableFdState, ReadinessFuture, Speculation};
use kernio_core::request::Opcode;
use kernio_core::shared::ReactorShared;
use std::sync::Arc;

/// More or less arbitrary: small enough to keep locked memory modest, big
/// enough to batch well.
const QUEUE_LEN: u32 = 200;

/// Build a ring and verify the features and opcodes this backend depends
/// on. Used both for construction and for selector probing.
pub(crate) fn try_create_uring(entries: u32) -> Result<IoUring> {
    let ring = IoUring::builder()
        .dontfork()
        .build(entries)
        .map_err(|e| Error::UringSetup(e.raw_os_error().unwrap_or(-1)))?;

    if !ring.params().is_feature_submit_stable() {
        return Err(Error::UringMissingFeature("submit-stable"));
    }
    if !ring.params().is_feature_nodrop() {
        return Err(Error::UringMissingFeature("nodrop"));
    }

    let mut probe = Probe::new();
    ring.submitter()
        .register_probe(&mut probe)
        .map_err(|e| Error::UringSetup(e.raw_os_error().unwrap_or(-1)))?;
    for op in [
        opcode::PollAdd::CODE,
        opcode::Read::CODE,
        opcode::Write::CODE,
        opcode::Readv::CODE,
        opcode::Writev::CODE,
        opcode::Fsync::CODE,
    ] {
        if !probe.is_supported(op) {
            return Err(Error::UringMissingOpcode(op));
        }
    }

    Ok(ring)
}

pub struct UringBackend {
    shared: Arc<ReactorShared>,
    ring: IoUring,
    did_work_while_getting_sqe: bool,
    has_pending_submissions: bool,
    hrtimer_fd: FileDesc,
    preempt: PreemptIoContext,
    hrtimer_armed: bool,
    smp_wakeup_armed: bool,
    states: FdSlab,
    storage_completions: Vec<Option<StorageCompletion>>,
    storage_free: Vec<u32>,
}

impl UringBackend {
    pub fn new(shared: Arc<ReactorShared>) -> Result<Self> {
        let ring = try_create_uring(QUEUE_LEN)?;
        let hrtimer_fd = FileDesc::timerfd()?;
        let preempt = PreemptIoContext::new(shared.clone(), hrtimer_fd.get())?;
        Ok(Self {
            shared,
            ring,
            did_work_while_getting_sqe: false,
            has_pending_submissions: false,
            hrtimer_fd,
            preempt,
            hrtimer_armed: false,
            smp_wakeup_armed: false,
            states: FdSlab::new(),
            storage_completions: Vec::new(),
            storage_free: Vec::new(),
        })
    }

    /// Queue one submission entry. The only chokepoint that can
    /// transiently exhaust: on a full SQ, flush it, drain ready
    /// completions once and retry. Never a busy wait on an empty kernel.
    fn push_sqe(&mut self, entry: squeue::Entry) {
        loop {
            // Safety: every entry built here points at memory the caller
            // keeps alive until its completion is reaped.
            let pushed = unsafe { self.ring.submission().push(&entry).is_ok() };
            if pushed {
                self.has_pending_submissions = true;
                return;
            }
            self.do_flush_submission_ring();
            self.process_completions_step();
            self.did_work_while_getting_sqe = true;
        }
    }

    fn do_flush_submission_ring(&mut self) -> bool {
        if self.has_pending_submissions {
            self.has_pending_submissions = false;
            self.did_work_while_getting_sqe = false;
            let _ = self.ring.submit();
            true
        } else {
            std::mem::take(&mut self.did_work_while_getting_sqe)
        }
    }

    fn process_completions_step(&mut self) -> bool {
        let mut batch: Vec<(u64, i32)> = Vec::with_capacity(QUEUE_LEN as usize);
        {
            let mut cq = self.ring.completion();
            for cqe in &mut cq {
                batch.push((cqe.user_data(), cqe.result()));
                if batch.len() == QUEUE_LEN as usize {
                    break;
                }
            }
        }
        let n = batch.len();
        for (user_data, res) in batch {
            self.dispatch(user_data, res);
        }
        n != 0
    }

    fn process_kernel_completions(&mut self) -> bool {
        let mut did_work = false;
        while self.process_completions_step() {
            did_work = true;
        }
        did_work | std::mem::take(&mut self.did_work_while_getting_sqe)
    }

    fn dispatch(&mut self, user_data: u64, res: i32) {
        let key = CompletionKey(user_data);
        match key.kind() {
            CompletionKind::Storage => {
                let idx = key.index() as usize;
                let completion = self.storage_completions[idx]
                    .take()
                    .expect("storage completion fired twice");
                self.storage_free.push(key.index());
                completion(res as i64);
            }
            CompletionKind::PollIn | CompletionKind::PollOut => {
                let read_side = key.kind() == CompletionKind::PollIn;
                if let Some(state) = self.states.lookup(key.index()) {
                    let slot = if read_side {
                        state.read_slot()
                    } else {
                        state.write_slot()
                    };
                    if res == -libc::ECANCELED {
                        // The descriptor was forgotten, not failed; the
                        // waiter sees an abort, not a spurious result.
                        slot.abort();
                    } else {
                        slot.complete_with(res as i64);
                    }
                }
            }
            CompletionKind::HrTimer => {
                // Spurious wakeups are possible since the fd is waited on
                // by both the preempt ring and this one; the read may be
                // empty.
                read_count_raw(self.hrtimer_fd.get());
                self.hrtimer_armed = false;
                self.shared.service_highres_timer();
            }
            CompletionKind::SmpWakeup => {
                self.shared.notify_eventfd().read_count();
                self.smp_wakeup_armed = false;
            }
            CompletionKind::Cancel => {}
            other => unreachable!("unexpected completion on uring: {:?}", other),
        }
    }

    fn alloc_storage_completion(&mut self, completion: StorageCompletion) -> u32 {
        match self.storage_free.pop() {
            Some(idx) => {
                self.storage_completions[idx as usize] = Some(completion);
                idx
            }
            None => {
                self.storage_completions.push(Some(completion));
                (self.storage_completions.len() - 1) as u32
            }
        }
    }

    fn queue_pending_file_io(&mut self) -> bool {
        let shared = self.shared.clone();
        let mut did_work = false;
        while let Some(pending) = shared.io_sink().pop() {
            let idx = self.alloc_storage_completion(pending.completion);
            let key = CompletionKey::new(CompletionKind::Storage, idx);
            let req = pending.req;
            let fd = types::Fd(req.fd);
            let entry = match req.opcode {
                Opcode::Read => opcode::Read::new(fd, req.addr as *mut u8, req.len as u32)
                    .offset(req.pos)
                    .build(),
                Opcode::Write => opcode::Write::new(fd, req.addr as *const u8, req.len as u32)
                    .offset(req.pos)
                    .build(),
                Opcode::Readv => {
                    opcode::Readv::new(fd, req.addr as *const libc::iovec, req.len as u32)
                        .offset(req.pos)
                        .build()
                }
                Opcode::Writev => {
                    opcode::Writev::new(fd, req.addr as *const libc::iovec, req.len as u32)
                        .offset(req.pos)
                        .build()
                }
                Opcode::Fdatasync => opcode::Fsync::new(fd)
                    .flags(types::FsyncFlags::DATASYNC)
                    .build(),
            }
            .user_data(key.0);
            self.push_sqe(entry);
            did_work = true;
        }
        did_work
    }

    fn poll(&mut self, fd: &PollableFd, events: PollFlags) -> ReadinessFuture {
        let id = fd.id();
        let state = self.states.get_mut(fd);
        if state.events_known.intersects(events) {
            state.events_known &= !events;
            return ReadinessFuture::ready();
        }
        state.events_rw = events == PollFlags::IN | PollFlags::OUT;

        let kind = if events.contains(PollFlags::IN) {
            CompletionKind::PollIn
        } else {
            CompletionKind::PollOut
        };
        let raw = state.fd.get();
        let slot = state.slot(events);
        // A second waiter on an in-flight direction shares the round
        // instead of queueing another poll.
        let already_armed = slot.is_armed();
        slot.arm();
        let fut = ReadinessFuture::from_slot(slot.clone());
        if already_armed {
            return fut;
        }

        let entry = opcode::PollAdd::new(types::Fd(raw), events.bits())
            .build()
            .user_data(CompletionKey::new(kind, id).0);
        self.push_sqe(entry);
        fut
    }

    fn cancel_poll(&mut self, id: u32, kind: CompletionKind) {
        let target = CompletionKey::new(kind, id);
        let entry = opcode::AsyncCancel::new(target.0)
            .build()
            .user_data(CompletionKey::new(CompletionKind::Cancel, 0).0);
        self.push_sqe(entry);
    }

    fn maybe_rearm_hrtimer(&mut self) {
        if !self.hrtimer_armed {
            self.hrtimer_armed = true;
            let entry = opcode::PollAdd::new(types::Fd(self.hrtimer_fd.get()), libc::POLLIN as u32)
                .build()
                .user_data(CompletionKey::new(CompletionKind::HrTimer, 0).0);
            self.push_sqe(entry);
        }
    }

    fn maybe_rearm_smp_wakeup(&mut self) {
        if !self.smp_wakeup_armed {
            self.smp_wakeup_armed = true;
            let entry = opcode::PollAdd::new(
                types::Fd(self.shared.notify_eventfd().get()),
                libc::POLLIN as u32,
            )
            .build()
            .user_data(CompletionKey::new(CompletionKind::SmpWakeup, 0).0);
            self.push_sqe(entry);
        }
    }
}

impl ReactorBackend for UringBackend {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn reap_kernel_completions(&mut self) -> bool {
        self.process_kernel_completions()
    }

    fn kernel_submit_work(&mut self) -> bool {
        let mut did_work = self.preempt.service_preempting_io();
        did_work |= self.queue_pending_file_io();
        match self.ring.submit() {
            Ok(n) => {
                self.has_pending_submissions = false;
                did_work |= n > 0;
            }
            Err(e) => {
                log::error!("io_uring submit failed: {}", e);
                panic!("io_uring_submit: {}", e);
            }
        }
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        // Completions are delivered, not polled: no need to spin while
        // I/O is in flight.
        true
    }

    fn wait_and_process_events(&mut self, sigmask: Option<&libc::sigset_t>) {
        self.maybe_rearm_smp_wakeup();
        self.maybe_rearm_hrtimer();
        let _ = self.ring.submit();
        self.has_pending_submissions = false;

        let mut did_work = self.preempt.service_preempting_io();
        did_work |= std::mem::take(&mut self.did_work_while_getting_sqe);
        if did_work {
            return;
        }

        let wait = match sigmask {
            Some(mask) => {
                let args = types::SubmitArgs::new().sigmask(mask);
                self.ring.submitter().submit_with_args(1, &args)
            }
            None => self.ring.submitter().submit_and_wait(1),
        };
        if let Err(e) = wait {
            if e.raw_os_error() == Some(libc::EINTR) {
                return;
            }
            log::error!("io_uring wait failed: {}", e);
            panic!("io_uring_wait_cqes: {}", e);
        }
        self.process_kernel_completions();
        self.preempt.service_preempting_io();
    }

    fn readable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.poll(fd, PollFlags::IN)
    }

    fn writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.poll(fd, PollFlags::OUT)
    }

    fn readable_or_writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.poll(fd, PollFlags::IN | PollFlags::OUT)
    }

    fn forget(&mut self, fd: PollableFd) {
        let id = fd.id();
        self.cancel_poll(id, CompletionKind::PollIn);
        self.cancel_poll(id, CompletionKind::PollOut);
        self.do_flush_submission_ring();
        self.reap_kernel_completions();
        let state = self.states.remove(fd);
        state.abort_all();
    }

    fn shutdown(&mut self, fd: &PollableFd, how: libc::c_int) {
        let _ = self.states.get(fd).fd.shutdown(how);
    }

    fn arm_highres_timer(&mut self, its: &libc::itimerspec) {
        let _ = self.hrtimer_fd.timerfd_settime_abs(its);
    }

    fn reset_preemption_monitor(&mut self) {
        self.preempt.reset_preemption_monitor();
    }

    fn request_preemption(&mut self) {
        self.preempt.request_preemption();
    }

    fn start_tick(&mut self) {
        self.preempt.start_tick();
    }

    fn stop_tick(&mut self) {
        self.preempt.stop_tick();
    }

    fn start_handling_signal(&mut self) {
        // Nothing special wrt. signals.
    }

    fn signal_received(&self, signo: i32) {
        self.shared.signals().mark_pending(signo);
    }

    fn make_pollable_fd_state(&mut self, fd: FileDesc, speculation: Speculation) -> PollableFd {
        self.states.insert(PollableFdState::new(fd, speculation))
    }

    fn fd_state(&self, fd: &PollableFd) -> &PollableFdState {
        self.states.get(fd)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernio_core::request::IoRequest;
    use kernio_core::shared::SharedConfig;
    use std::future::Future;
    use std::io::Write as _;
    use std::os::unix::io::AsRawFd;
    use std::pin::Pin;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

    fn noop_waker() -> Waker {
        fn clone(_: *const ()) -> RawWaker {
            RawWaker::new(std::ptr::null(), &VTABLE)
        }
        fn noop(_: *const ()) {}
        static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
        unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
    }

    fn poll_once(fut: &mut ReadinessFuture) -> Poll<kernio_core::Result<()>> {
        let waker = noop_waker();
        let mut cx = Context::from_waker(&waker);
        Pin::new(fut).poll(&mut cx)
    }

    fn backend() -> Option<(Arc<ReactorShared>, UringBackend)> {
        if try_create_uring(1).is_err() {
            return None;
        }
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let be = UringBackend::new(shared.clone()).ok()?;
        Some((shared, be))
    }

    #[test]
    fn pipe_readable_resolves_within_one_wait() {
        let Some((_shared, mut be)) = backend() else { return };
        let (r, w) = FileDesc::pipe().unwrap();
        let state = be.make_pollable_fd_state(r, Speculation::default());

        let mut fut = be.readable(&state);
        assert!(poll_once(&mut fut).is_pending());

        w.write_one().unwrap();
        be.wait_and_process_events(None);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(()))));
        be.forget(state);
    }

    #[test]
    fn storage_write_round_trip() {
        let Some((shared, mut be)) = backend() else { return };
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();

        let result = Arc::new(AtomicI64::new(i64::MIN));
        let result2 = result.clone();
        let buf = vec![9u8; 4096];
        shared
            .io_sink()
            .submit(
                IoRequest::write(file.as_raw_fd(), 0, buf.as_ptr(), buf.len(), false),
                Box::new(move |res| result2.store(res, Ordering::Relaxed)),
            )
            .unwrap_or_else(|_| panic!("sink full"));

        assert!(be.kernel_submit_work());
        while result.load(Ordering::Relaxed) == i64::MIN {
            be.wait_and_process_events(None);
            be.reap_kernel_completions();
        }
        assert_eq!(result.load(Ordering::Relaxed), 4096);
        drop(buf);
    }

    #[test]
    fn forget_aborts_with_ecanceled() {
        let Some((_shared, mut be)) = backend() else { return };
        let (r, _w) = FileDesc::pipe().unwrap();
        let state = be.make_pollable_fd_state(r, Speculation::default());

        let mut rd = be.readable(&state);
        let mut wr = be.writeable(&state);
        be.kernel_submit_work();
        assert!(poll_once(&mut rd).is_pending());
        assert!(poll_once(&mut wr).is_pending());

        be.forget(state);
        assert!(matches!(poll_once(&mut rd), Poll::Ready(Err(_))));
        assert!(matches!(poll_once(&mut wr), Poll::Ready(Err(_))));
    }

    #[test]
    fn request_preemption_flags_the_monitor() {
        let Some((_shared, mut be)) = backend() else { return };
        be.start_tick();
        be.reset_preemption_monitor();
        be.request_preemption();
        assert!(kernio_core::preempt::need_preempt());
        be.reset_preemption_monitor();
        be.stop_tick();
        kernio_core::preempt::set_need_preempt_var(std::ptr::null());
    }
}
