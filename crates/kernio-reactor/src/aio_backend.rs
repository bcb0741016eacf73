//! The AIO backend: every kernel interaction goes through linux-aio
//! submission, with readiness expressed as poll-type control blocks on a
//! general-purpose "polling" context. Storage requests ride the shared
//! storage engine on their own ring; the two are never mixed.

use crate::aio_abi::{
    make_poll_iocb, set_user_data, timespec_from_ms, timespec_zero, GeneralAioContext, IoEvent,
    Iocb, io_pgetevents,
};
use crate::backend::ReactorBackend;
use crate::fd_slab::{FdSlab, PollableFd};
use crate::preempt_io::{CompletionWithIocb, PreemptIoContext};
use crate::storage::StorageContext;
use kernio_core::completion::{CompletionKey, CompletionKind};
use kernio_core::fd::{read_count_raw, FileDesc};
use kernio_core::poll::{PollFlags, PollableFdState, ReadinessFuture, Speculation};
use kernio_core::shared::ReactorShared;
use std::sync::Arc;

/// Completion-ring capacity of the polling context. Submission beyond it
/// simply waits for ring space in the flush loop as earlier polls drain.
const POLL_RING_EVENTS: usize = 1024;
const AWAIT_BATCH: usize = 128;

/// One boxed control block per in-flight poll direction. Each descriptor
/// direction owns one block for the duration of its poll, so any number of
/// concurrently polled descriptors works; the slab grows with demand and
/// the boxes pin the blocks while the kernel borrows them.
struct PollIocbPool {
    blocks: Vec<Box<Iocb>>,
    free: Vec<u32>,
}

impl PollIocbPool {
    fn new() -> Self {
        Self {
            blocks: Vec::new(),
            free: Vec::new(),
        }
    }

    fn get(&mut self) -> u32 {
        match self.free.pop() {
            Some(slot) => slot,
            None => {
                let slot = self.blocks.len() as u32;
                self.blocks.push(Box::new(Iocb::zeroed()));
                slot
            }
        }
    }

    fn put(&mut self, slot: u32) {
        self.free.push(slot);
    }

    fn set(&mut self, slot: u32, io: Iocb) {
        *self.blocks[slot as usize] = io;
    }

    fn ptr(&mut self, slot: u32) -> *mut Iocb {
        &mut *self.blocks[slot as usize] as *mut Iocb
    }

    #[cfg(test)]
    fn all_free(&self) -> bool {
        self.free.len() == self.blocks.len()
    }
}

pub struct AioBackend {
    shared: Arc<ReactorShared>,
    hrtimer_fd: FileDesc,
    storage: StorageContext,
    preempt: PreemptIoContext,
    polling: GeneralAioContext,
    hrtimer_poll: CompletionWithIocb,
    smp_wakeup: CompletionWithIocb,
    states: FdSlab,
    poll_iocbs: PollIocbPool,
}

impl AioBackend {
    pub fn new(shared: Arc<ReactorShared>) -> kernio_core::Result<Self> {
        let hrtimer_fd = FileDesc::timerfd()?;
        let storage = StorageContext::new(shared.kernel_page_cache(), None)?;
        let preempt = PreemptIoContext::new(shared.clone(), hrtimer_fd.get())?;
        let polling = GeneralAioContext::new(POLL_RING_EVENTS)?;
        let hrtimer_poll = CompletionWithIocb::new(
            hrtimer_fd.get(),
            CompletionKey::new(CompletionKind::HrTimer, 0),
        );
        let smp_wakeup = CompletionWithIocb::new(
            shared.notify_eventfd().get(),
            CompletionKey::new(CompletionKind::SmpWakeup, 0),
        );
        Ok(Self {
            shared,
            hrtimer_fd,
            storage,
            preempt,
            polling,
            hrtimer_poll,
            smp_wakeup,
            states: FdSlab::new(),
            poll_iocbs: PollIocbPool::new(),
        })
    }

    fn poll(&mut self, fd: &PollableFd, events: PollFlags) -> ReadinessFuture {
        let id = fd.id();

        let read_side = events.contains(PollFlags::IN);
        {
            let state = self.states.get_mut(fd);
            if state.events_known.intersects(events) {
                state.events_known &= !events;
                return ReadinessFuture::ready();
            }
            state.events_rw = events == PollFlags::IN | PollFlags::OUT;

            // A completion for this direction is already in flight; a
            // second waiter joins it rather than queueing another block.
            let in_flight = if read_side {
                state.cb_in.is_some()
            } else {
                state.cb_out.is_some()
            };
            if in_flight {
                let slot = state.slot(events);
                slot.arm();
                return ReadinessFuture::from_slot(slot.clone());
            }
        }

        let kind = if read_side {
            CompletionKind::PollIn
        } else {
            CompletionKind::PollOut
        };

        let cb = self.poll_iocbs.get();
        let raw = self.states.get(fd).fd.get();
        let mut io = make_poll_iocb(raw, events.bits());
        set_user_data(&mut io, CompletionKey::new(kind, id));
        self.poll_iocbs.set(cb, io);
        self.polling.queue(self.poll_iocbs.ptr(cb));

        let state = self.states.get_mut(fd);
        if read_side {
            state.cb_in = Some(cb);
        } else {
            state.cb_out = Some(cb);
        }
        let slot = state.slot(events);
        slot.arm();
        ReadinessFuture::from_slot(slot.clone())
    }

    fn dispatch(&mut self, ev: &IoEvent) {
        let key = ev.key();
        match key.kind() {
            CompletionKind::PollIn | CompletionKind::PollOut => {
                let read_side = key.kind() == CompletionKind::PollIn;
                let mut freed = None;
                let mut fire = None;
                if let Some(state) = self.states.lookup(key.index()) {
                    freed = if read_side {
                        state.cb_in.take()
                    } else {
                        state.cb_out.take()
                    };
                    let slot = if read_side {
                        state.read_slot()
                    } else {
                        state.write_slot()
                    };
                    fire = Some((slot.clone(), state.in_forget));
                }
                if let Some(cb) = freed {
                    self.poll_iocbs.put(cb);
                }
                if let Some((slot, in_forget)) = fire {
                    if in_forget {
                        // Mirrors the READY backend's behaviour on forget.
                        slot.abort();
                    } else {
                        slot.complete_with(ev.res);
                    }
                }
            }
            CompletionKind::HrTimer => {
                let expirations = read_count_raw(self.hrtimer_fd.get());
                if expirations != 0 {
                    self.shared.service_highres_timer();
                }
                self.hrtimer_poll.completed();
            }
            CompletionKind::SmpWakeup => {
                self.shared.notify_eventfd().read_count();
                self.smp_wakeup.completed();
            }
            other => unreachable!("unexpected completion on polling ring: {:?}", other),
        }
    }

    fn await_events(&mut self, timeout_ms: i32, sigmask: Option<&libc::sigset_t>) -> bool {
        let mut timeout = timeout_ms;
        let mut did_work = false;
        loop {
            let ts;
            let tsp = match timeout {
                0 => {
                    ts = timespec_zero();
                    Some(&ts)
                }
                -1 => None,
                ms => {
                    ts = timespec_from_ms(ms as i64);
                    Some(&ts)
                }
            };
            let mut batch = [IoEvent::zeroed(); AWAIT_BATCH];
            let n = match io_pgetevents(self.polling.io_context(), 1, &mut batch, tsp, sigmask) {
                Ok(n) => n,
                Err(e) if e == libc::EINTR => return true,
                Err(e) => {
                    log::error!("io_pgetevents failed: errno {}", e);
                    panic!("io_pgetevents: errno {}", e);
                }
            };
            for ev in &batch[..n] {
                did_work = true;
                self.dispatch(ev);
            }
            if n != AWAIT_BATCH {
                break;
            }
            // A full batch may hide more; drain without waiting again.
            timeout = 0;
        }
        did_work
    }
}

impl ReactorBackend for AioBackend {
    fn name(&self) -> &'static str {
        "linux-aio"
    }

    fn reap_kernel_completions(&mut self) -> bool {
        let mut did_work = self.await_events(0, None);
        did_work |= self.storage.reap_completions(true);
        did_work
    }

    fn kernel_submit_work(&mut self) -> bool {
        self.hrtimer_poll.maybe_queue(&mut self.polling);
        let mut did_work = self.polling.flush() > 0;
        did_work |= self.storage.submit_work(self.shared.io_sink());
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        // aio completions are polled, not delivered: sleeping is only safe
        // with nothing in flight on the storage ring.
        self.storage.can_sleep()
    }

    fn wait_and_process_events(&mut self, sigmask: Option<&libc::sigset_t>) {
        let mut timeout = -1;
        if self.preempt.service_preempting_io() {
            timeout = 0;
        }
        self.hrtimer_poll.maybe_queue(&mut self.polling);
        self.smp_wakeup.maybe_queue(&mut self.polling);
        self.polling.flush();
        self.await_events(timeout, sigmask);
        // Clear the task quota timer.
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
        {
            let state = self.states.get_mut(&fd);
            state.in_forget = true;
        }
        // Anything still queued must reach the kernel before it can be
        // cancelled.
        self.polling.flush();
        let (cb_in, cb_out) = {
            let state = self.states.get(&fd);
            (state.cb_in, state.cb_out)
        };
        if let Some(cb) = cb_in {
            let _ = self.polling.cancel(self.poll_iocbs.ptr(cb));
        }
        if let Some(cb) = cb_out {
            let _ = self.polling.cancel(self.poll_iocbs.ptr(cb));
        }
        self.reap_kernel_completions();

        let state = self.states.remove(fd);
        state.abort_all();
        // Completions that did not arrive during the reap release their
        // blocks here; any late ring event resolves to a stale id.
        if let Some(cb) = state.cb_in {
            self.poll_iocbs.put(cb);
        }
        if let Some(cb) = state.cb_out {
            self.poll_iocbs.put(cb);
        }
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
        // Only termination signals reach this backend; nothing to do
        // before the loop notices them.
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
    use crate::selector;
    use kernio_core::shared::SharedConfig;
    use std::future::Future;
    use std::pin::Pin;
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

    fn backend() -> Option<(Arc<ReactorShared>, AioBackend)> {
        if !selector::detect_aio_poll() {
            return None;
        }
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let be = AioBackend::new(shared.clone()).unwrap();
        Some((shared, be))
    }

    #[test]
    fn pipe_readable_resolves_within_one_wait() {
        let Some((_shared, mut be)) = backend() else { return };
        let (r, w) = FileDesc::pipe().unwrap();
        let state = be.make_pollable_fd_state(r, Speculation::default());

        let mut fut = be.readable(&state);
        assert!(poll_once(&mut fut).is_pending());

        be.kernel_submit_work();
        w.write_one().unwrap();
        be.wait_and_process_events(None);

        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(()))));
        be.forget(state);
    }

    #[test]
    fn forget_aborts_both_pending_directions() {
        let Some((_shared, mut be)) = backend() else { return };
        let (r, _w) = FileDesc::pipe().unwrap();
        let state = be.make_pollable_fd_state(r, Speculation::default());

        // Neither direction of a quiet pipe read end fires.
        let mut rd = be.readable(&state);
        let mut wr = be.writeable(&state);
        be.kernel_submit_work();
        assert!(poll_once(&mut rd).is_pending());
        assert!(poll_once(&mut wr).is_pending());

        be.forget(state);
        assert!(matches!(poll_once(&mut rd), Poll::Ready(Err(_))));
        assert!(matches!(poll_once(&mut wr), Poll::Ready(Err(_))));
        // Both control blocks made it back to the pool.
        assert!(be.poll_iocbs.all_free());
    }

    #[test]
    fn poll_block_slab_grows_with_concurrent_directions() {
        let Some((_shared, mut be)) = backend() else { return };

        // Two in-flight directions per pipe, far past any one allocation
        // round of the slab.
        let mut pipes = Vec::new();
        let mut states = Vec::new();
        let mut futures = Vec::new();
        for _ in 0..150 {
            let (r, w) = FileDesc::pipe().unwrap();
            let state = be.make_pollable_fd_state(r, Speculation::default());
            futures.push(be.readable(&state));
            futures.push(be.writeable(&state));
            states.push(state);
            pipes.push(w);
        }
        assert_eq!(be.poll_iocbs.blocks.len(), 300);
        be.kernel_submit_work();

        for state in states {
            be.forget(state);
        }
        assert!(be.poll_iocbs.all_free());
    }

    #[test]
    fn speculated_edge_skips_the_kernel() {
        let Some((_shared, mut be)) = backend() else { return };
        let (r, _w) = FileDesc::pipe().unwrap();
        let state = be.make_pollable_fd_state(r, Speculation::readable());

        let mut fut = be.readable(&state);
        assert!(matches!(poll_once(&mut fut), Poll::Ready(Ok(()))));
        // The cache is consumed: the next call arms a real poll.
        let mut fut2 = be.readable(&state);
        assert!(poll_once(&mut fut2).is_pending());
        be.forget(state);
    }

    #[test]
    fn hrtimer_deadline_services_within_one_wait() {
        let Some((shared, mut be)) = backend() else { return };
        be.arm_highres_timer(&kernio_core::fd::abs_deadline_after(1_000_000));
        be.kernel_submit_work();
        be.wait_and_process_events(None);
        assert_eq!(shared.highres_serviced(), 1);
    }
}
