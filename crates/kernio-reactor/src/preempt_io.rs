//! The tickless preemption context shared by the AIO and URING backends.
//!
//! Two self-rearming poll completions (the task-quota timer fd and the
//! high-resolution timer fd) live on an isolated 2-slot AIO context. The
//! kernel maintains a completion ring in user-visible memory for every AIO
//! context, and the head/tail pair sits 8 bytes in; pointing `need_preempt`
//! at that pair turns "a preempt event arrived" into a plain load. No
//! syscall on the hot path, and none to arm either.

use crate::aio_abi::{make_poll_iocb, set_user_data, GeneralAioContext, IoEvent, Iocb};
use kernio_core::completion::{CompletionKey, CompletionKind};
use kernio_core::preempt::{need_preempt, set_need_preempt_var, PreemptionMonitor};
use kernio_core::shared::ReactorShared;
use std::os::unix::io::RawFd;
use std::sync::atomic::{compiler_fence, Ordering};
use std::sync::Arc;

/// One poll control block plus its queued-in-context flag, the shape every
/// self-rearming timer/eventfd completion shares. The iocb is boxed so its
/// address survives moves of the owning context.
pub(crate) struct CompletionWithIocb {
    iocb: Box<Iocb>,
    in_context: bool,
}

impl CompletionWithIocb {
    pub(crate) fn new(fd: RawFd, key: CompletionKey) -> Self {
        let mut iocb = Box::new(make_poll_iocb(fd, libc::POLLIN as u32));
        set_user_data(&mut iocb, key);
        Self { iocb, in_context: false }
    }

    pub(crate) fn maybe_queue(&mut self, context: &mut GeneralAioContext) {
        if !self.in_context {
            self.in_context = true;
            context.queue(&mut *self.iocb);
        }
    }

    pub(crate) fn completed(&mut self) {
        self.in_context = false;
    }
}

pub struct PreemptIoContext {
    shared: Arc<ReactorShared>,
    context: GeneralAioContext,
    task_quota: CompletionWithIocb,
    hrtimer: CompletionWithIocb,
    hrtimer_fd: RawFd,
}

impl PreemptIoContext {
    pub fn new(shared: Arc<ReactorShared>, hrtimer_fd: RawFd) -> kernio_core::Result<Self> {
        let quota_fd = shared.task_quota_timer().get();
        Ok(Self {
            shared,
            context: GeneralAioContext::new(2)?,
            task_quota: CompletionWithIocb::new(
                quota_fd,
                CompletionKey::new(CompletionKind::TaskQuota, 0),
            ),
            hrtimer: CompletionWithIocb::new(
                hrtimer_fd,
                CompletionKey::new(CompletionKind::HrTimer, 0),
            ),
            hrtimer_fd,
        })
    }

    /// The kernel's head/tail words inside this context's completion ring.
    fn ring_monitor(&self) -> *const PreemptionMonitor {
        (self.context.io_context() as usize + 8) as *const PreemptionMonitor
    }

    #[inline]
    fn ring_triggered(&self) -> bool {
        // Safety: the ring mapping lives as long as the context.
        let monitor = unsafe { &*self.ring_monitor() };
        let head = monitor.head.load(Ordering::Relaxed);
        let tail = monitor.tail.load(Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        head != tail
    }

    /// Preempt whenever an event (timer tick or preempt request) lands on
    /// the ring. `request_preemption()` writes to the runtime's private
    /// monitor, which is ignored while the ring is installed.
    pub fn start_tick(&mut self) {
        set_need_preempt_var(self.ring_monitor());
    }

    pub fn stop_tick(&mut self) {
        set_need_preempt_var(self.shared.preemption_monitor());
    }

    /// Fire the high-resolution timer immediately and wait for the kernel
    /// to post the event. The wait is bounded: the expiry is already in
    /// the past when the arm call returns.
    pub fn request_preemption(&mut self) {
        let mut expired: libc::itimerspec = unsafe { std::mem::zeroed() };
        expired.it_value.tv_nsec = 1;
        // An absolute deadline of 1ns is long past; the timer fires at
        // arm time.
        let _ = self.arm_hrtimer(&expired);

        // The caller may not have the timerfd queued (e.g. called from the
        // poll path), so make sure its block is on the ring.
        self.hrtimer.maybe_queue(&mut self.context);
        self.context.flush();

        while !(need_preempt() || self.ring_triggered()) {
            compiler_fence(Ordering::SeqCst);
        }
    }

    fn arm_hrtimer(&self, its: &libc::itimerspec) -> i32 {
        unsafe {
            libc::timerfd_settime(
                self.hrtimer_fd,
                libc::TFD_TIMER_ABSTIME,
                its,
                std::ptr::null_mut(),
            )
        }
    }

    /// Drain any already-arrived preempt events and re-arm both
    /// completions.
    pub fn reset_preemption_monitor(&mut self) {
        self.service_preempting_io();
        self.hrtimer.maybe_queue(&mut self.context);
        self.task_quota.maybe_queue(&mut self.context);
        self.context.flush();
    }

    /// Non-blocking drain of the preempt ring; true if anything was
    /// processed.
    pub fn service_preempting_io(&mut self) -> bool {
        let mut events = [IoEvent::zeroed(); 2];
        let n = self.context.getevents_now(0, &mut events);
        for ev in &events[..n] {
            match ev.key().kind() {
                CompletionKind::TaskQuota => {
                    self.shared.task_quota_timer().read_count();
                    self.task_quota.completed();
                }
                CompletionKind::HrTimer => {
                    // The fd may already be drained by another waiter; a
                    // zero read is fine.
                    let expirations = kernio_core::fd::read_count_raw(self.hrtimer_fd);
                    if expirations != 0 {
                        self.shared.service_highres_timer();
                    }
                    self.hrtimer.completed();
                }
                other => unreachable!("unexpected completion on preempt ring: {:?}", other),
            }
        }
        n > 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aio_abi::{io_destroy, io_setup};
    use kernio_core::fd::{abs_deadline_after, FileDesc};
    use kernio_core::shared::SharedConfig;

    fn aio_available() -> bool {
        match io_setup(1) {
            Ok(ctx) => {
                io_destroy(ctx);
                true
            }
            Err(_) => false,
        }
    }

    #[test]
    fn request_preemption_is_observable_before_return() {
        if !aio_available() {
            return;
        }
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let hrtimer = FileDesc::timerfd().unwrap();
        let mut preempt = PreemptIoContext::new(shared.clone(), hrtimer.get()).unwrap();

        preempt.start_tick();
        preempt.reset_preemption_monitor();
        preempt.request_preemption();
        assert!(need_preempt());

        // Draining the event and re-arming clears the condition.
        preempt.reset_preemption_monitor();
        assert!(!need_preempt());
        preempt.stop_tick();
        set_need_preempt_var(std::ptr::null());
        // One hrtimer expiry was serviced along the way.
        assert!(shared.highres_serviced() >= 1);
        drop(hrtimer);
    }

    #[test]
    fn start_stop_tick_are_inverses() {
        if !aio_available() {
            return;
        }
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let hrtimer = FileDesc::timerfd().unwrap();
        let mut preempt = PreemptIoContext::new(shared.clone(), hrtimer.get()).unwrap();

        preempt.start_tick();
        preempt.stop_tick();
        // Back on the private monitor: a signal there is visible again.
        shared.preemption_monitor().signal();
        assert!(need_preempt());
        shared.preemption_monitor().clear();
        assert!(!need_preempt());
        set_need_preempt_var(std::ptr::null());
    }

    #[test]
    fn task_quota_expiry_lands_on_the_ring() {
        if !aio_available() {
            return;
        }
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let hrtimer = FileDesc::timerfd().unwrap();
        let mut preempt = PreemptIoContext::new(shared.clone(), hrtimer.get()).unwrap();

        preempt.reset_preemption_monitor();
        shared
            .task_quota_timer()
            .timerfd_settime_abs(&abs_deadline_after(1_000_000))
            .unwrap();
        let mut serviced = false;
        for _ in 0..1_000 {
            if preempt.service_preempting_io() {
                serviced = true;
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        assert!(serviced);
    }
}
