//! The READY backend: readiness through an epoll interest set, storage
//! through the linux-aio engine, tick through a sibling timer thread.
//!
//! The steady clock uses two timer fds with only one armed at a time:
//! while the reactor sleeps the reactor-thread fd sits on the epoll set so
//! an expiry ends the sleep; while tasks run the timer-thread fd is armed
//! and the sibling thread polls it together with the task-quota timer,
//! setting `highres_timer_pending` and the preemption monitor when either
//! fires.

use crate::backend::ReactorBackend;
use crate::fd_slab::{FdSlab, PollableFd};
use crate::storage::StorageContext;
use kernio_core::completion::{CompletionKey, CompletionKind};
use kernio_core::error::errno;
use kernio_core::fd::{abs_deadline_after, read_count_raw, FileDesc};
use kernio_core::poll::{PollFlags, PollableFdState, ReadinessFuture, Speculation};
use kernio_core::preempt::set_need_preempt_var;
use kernio_core::shared::ReactorShared;
use std::os::unix::io::RawFd;
use std::os::unix::thread::JoinHandleExt;
use std::sync::atomic::{compiler_fence, AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

const WAIT_BATCH: usize = 128;

pub struct ReadyBackend {
    shared: Arc<ReactorShared>,
    epollfd: FileDesc,
    steady_timer_reactor: FileDesc,
    steady_timer_timer_thread: FileDesc,
    steady_deadline: Option<libc::itimerspec>,
    highres_timer_pending: Arc<AtomicBool>,
    storage_eventfd: FileDesc,
    storage: StorageContext,
    states: FdSlab,
    /// At least one descriptor has interest installed, so submit work must
    /// run a zero-timeout wait to collect edges.
    need_epoll_events: bool,
    timer_thread: Option<thread::JoinHandle<()>>,
}

fn epoll_ctl(epfd: RawFd, op: libc::c_int, fd: RawFd, event: Option<&mut libc::epoll_event>) -> i32 {
    let ptr = event.map_or(std::ptr::null_mut(), |e| e as *mut libc::epoll_event);
    unsafe { libc::epoll_ctl(epfd, op, fd, ptr) }
}

impl ReadyBackend {
    pub fn new(shared: Arc<ReactorShared>) -> kernio_core::Result<Self> {
        let epollfd = {
            let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if fd < 0 {
                return Err(kernio_core::Error::ContextSetup(errno()));
            }
            FileDesc::from_raw(fd)
        };
        let steady_timer_reactor = FileDesc::timerfd()?;
        let steady_timer_timer_thread = FileDesc::timerfd()?;
        let storage_eventfd = FileDesc::eventfd(0)?;
        let storage = StorageContext::new(shared.kernel_page_cache(), Some(storage_eventfd.get()))?;

        let backend = Self {
            shared,
            epollfd,
            steady_timer_reactor,
            steady_timer_timer_thread,
            steady_deadline: None,
            highres_timer_pending: Arc::new(AtomicBool::new(false)),
            storage_eventfd,
            storage,
            states: FdSlab::new(),
            need_epoll_events: false,
            timer_thread: None,
        };

        backend.install_special(
            backend.shared.notify_eventfd().get(),
            CompletionKey::new(CompletionKind::SmpWakeup, 0),
        )?;
        backend.install_special(
            backend.steady_timer_reactor.get(),
            CompletionKey::new(CompletionKind::HrTimer, 0),
        )?;
        backend.install_special(
            backend.storage_eventfd.get(),
            CompletionKey::new(CompletionKind::StorageEventfd, 0),
        )?;

        Ok(backend)
    }

    fn install_special(&self, fd: RawFd, key: CompletionKey) -> kernio_core::Result<()> {
        let mut event = libc::epoll_event {
            events: libc::EPOLLIN as u32,
            u64: key.0,
        };
        if epoll_ctl(self.epollfd.get(), libc::EPOLL_CTL_ADD, fd, Some(&mut event)) < 0 {
            return Err(kernio_core::Error::ContextSetup(errno()));
        }
        Ok(())
    }

    fn get_epoll_future(&mut self, fd: &PollableFd, event: PollFlags) -> ReadinessFuture {
        let id = fd.id();
        let epollfd = self.epollfd.get();
        let state = self.states.get_mut(fd);

        if state.events_known.intersects(event) {
            state.events_known &= !event;
            return ReadinessFuture::ready();
        }

        state.events_rw = event == PollFlags::IN | PollFlags::OUT;
        state.events_requested |= event;

        if !state.events_epoll.contains(event) {
            let ctl = if state.events_epoll.is_empty() {
                libc::EPOLL_CTL_ADD
            } else {
                libc::EPOLL_CTL_MOD
            };
            state.events_epoll |= event;
            let mut eevt = libc::epoll_event {
                events: state.events_epoll.bits(),
                u64: CompletionKey::new(CompletionKind::FdState, id).0,
            };
            let r = epoll_ctl(epollfd, ctl, state.fd.get(), Some(&mut eevt));
            assert_eq!(r, 0, "epoll_ctl failed: errno {}", errno());
            self.need_epoll_events = true;
        }

        let slot = state.slot(event);
        slot.arm();
        ReadinessFuture::from_slot(slot.clone())
    }

    fn complete_epoll_event(state: &mut PollableFdState, events: PollFlags, event: PollFlags) {
        if state.events_requested.intersects(events & event) {
            state.events_requested &= !event;
            state.events_known &= !event;
            state.slot(event).complete_with(0);
        }
    }

    /// Arm one steady-clock timer fd with the stored deadline and disarm
    /// the other, enable-then-disable so the hardware timer is not
    /// reprogrammed.
    fn switch_steady_clock_timers(&mut self, to_reactor: bool) {
        let deadline = match self.steady_deadline {
            Some(d) => d,
            None => return,
        };
        let (to, from) = if to_reactor {
            (&self.steady_timer_reactor, &self.steady_timer_timer_thread)
        } else {
            (&self.steady_timer_timer_thread, &self.steady_timer_reactor)
        };
        let _ = to.timerfd_settime_abs(&deadline);
        let _ = from.timerfd_disarm();
    }

    fn wait_and_process(&mut self, timeout_ms: i32, sigmask: Option<&libc::sigset_t>) -> bool {
        // When sleeping, the timer-thread steady clock cannot end the
        // sleep; hand the deadline to the reactor-thread fd for the
        // duration and switch back on every exit path.
        let switch = timeout_ms != 0;
        if switch {
            self.switch_steady_clock_timers(true);
        }
        let did_work = self.do_wait(timeout_ms, sigmask);
        if switch {
            self.switch_steady_clock_timers(false);
        }
        did_work
    }

    fn do_wait(&mut self, timeout_ms: i32, sigmask: Option<&libc::sigset_t>) -> bool {
        let mut events = [libc::epoll_event { events: 0, u64: 0 }; WAIT_BATCH];
        let nr = unsafe {
            libc::epoll_pwait(
                self.epollfd.get(),
                events.as_mut_ptr(),
                WAIT_BATCH as libc::c_int,
                timeout_ms,
                sigmask.map_or(std::ptr::null(), |s| s as *const libc::sigset_t),
            )
        };
        if nr == -1 && errno() == libc::EINTR {
            // A debugger can interrupt the wait.
            return false;
        }
        assert!(nr != -1, "epoll_pwait failed: errno {}", errno());

        for evt in &events[..nr as usize] {
            let key = CompletionKey(evt.u64);
            match key.kind() {
                CompletionKind::SmpWakeup => {
                    self.shared.notify_eventfd().read_count();
                }
                CompletionKind::HrTimer => {
                    self.steady_timer_reactor.read_count();
                    self.highres_timer_pending.store(true, Ordering::Relaxed);
                    self.steady_deadline = None;
                }
                CompletionKind::StorageEventfd => {
                    self.storage_eventfd.read_count();
                }
                CompletionKind::FdState => {
                    let state = match self.states.lookup(key.index()) {
                        Some(s) => s,
                        None => continue,
                    };
                    let mut bits = evt.events;
                    if bits & (libc::EPOLLHUP as u32 | libc::EPOLLERR as u32) != 0 {
                        // Deliver errors as the requested events and let
                        // send/recv/accept/connect observe the errno.
                        bits = state.events_requested.bits();
                    }
                    let got = PollFlags::from_bits_truncate(bits);
                    let to_remove = got & !state.events_requested;
                    if state.events_rw {
                        // accept() signals completion via the read edge
                        // but shutdown errors via the write edge; both
                        // resolve the one shared future.
                        Self::complete_epoll_event(state, got, PollFlags::IN | PollFlags::OUT);
                    } else {
                        Self::complete_epoll_event(state, got, PollFlags::IN);
                        Self::complete_epoll_event(state, got, PollFlags::OUT);
                    }
                    if !to_remove.is_empty() {
                        state.events_epoll &= !to_remove;
                        let op = if state.events_epoll.is_empty() {
                            libc::EPOLL_CTL_DEL
                        } else {
                            libc::EPOLL_CTL_MOD
                        };
                        let raw = state.fd.get();
                        let mut eevt = libc::epoll_event {
                            events: state.events_epoll.bits(),
                            u64: evt.u64,
                        };
                        epoll_ctl(self.epollfd.get(), op, raw, Some(&mut eevt));
                    }
                }
                other => unreachable!("unexpected epoll tag: {:?}", other),
            }
        }
        nr > 0
    }

    fn complete_hrtimer(&mut self) -> bool {
        // Set from the timer thread or from do_wait above.
        if self.highres_timer_pending.load(Ordering::Relaxed) {
            self.highres_timer_pending.store(false, Ordering::Relaxed);
            self.shared.service_highres_timer();
            return true;
        }
        false
    }
}

impl ReactorBackend for ReadyBackend {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn reap_kernel_completions(&mut self) -> bool {
        // epoll has no separate submission stage; readiness collection
        // happens in kernel_submit_work so the loop's two completion
        // pollers do not both call epoll_wait. Only storage reaps here.
        self.storage.reap_completions(true)
    }

    fn kernel_submit_work(&mut self) -> bool {
        let mut did_work = self.storage.submit_work(self.shared.io_sink());
        if self.need_epoll_events {
            did_work |= self.wait_and_process(0, None);
        }
        did_work |= self.complete_hrtimer();
        did_work
    }

    fn kernel_events_can_sleep(&self) -> bool {
        // Storage completions are wired to an eventfd on the epoll set,
        // so they end a sleep by themselves.
        self.storage.can_sleep()
    }

    fn wait_and_process_events(&mut self, sigmask: Option<&libc::sigset_t>) {
        self.wait_and_process(-1, sigmask);
        self.complete_hrtimer();
    }

    fn readable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.get_epoll_future(fd, PollFlags::IN)
    }

    fn writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.get_epoll_future(fd, PollFlags::OUT)
    }

    fn readable_or_writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        self.get_epoll_future(fd, PollFlags::IN | PollFlags::OUT)
    }

    fn forget(&mut self, fd: PollableFd) {
        let state = self.states.get(&fd);
        if !state.events_epoll.is_empty() {
            epoll_ctl(self.epollfd.get(), libc::EPOLL_CTL_DEL, state.fd.get(), None);
        }
        let state = self.states.remove(fd);
        state.abort_all();
    }

    fn shutdown(&mut self, fd: &PollableFd, how: libc::c_int) {
        let _ = self.states.get(fd).fd.shutdown(how);
    }

    fn arm_highres_timer(&mut self, its: &libc::itimerspec) {
        if its.it_value.tv_sec == 0 && its.it_value.tv_nsec == 0 {
            self.steady_deadline = None;
        } else {
            self.steady_deadline = Some(*its);
        }
        let _ = self.steady_timer_timer_thread.timerfd_settime_abs(its);
    }

    fn reset_preemption_monitor(&mut self) {
        self.shared.preemption_monitor().clear();
    }

    fn request_preemption(&mut self) {
        self.shared.preemption_monitor().signal();
    }

    fn start_tick(&mut self) {
        set_need_preempt_var(self.shared.preemption_monitor());
        let shared = self.shared.clone();
        let pending = self.highres_timer_pending.clone();
        let quota_fd = self.shared.task_quota_timer().get();
        let steady_fd = self.steady_timer_timer_thread.get();
        // Safety note on the raw fds: stop_tick joins the thread before
        // either descriptor can be closed.
        let handle = thread::Builder::new()
            .name("kernio-timer".into())
            .spawn(move || timer_thread_loop(shared, quota_fd, steady_fd, pending))
            .expect("failed to spawn timer thread");

        let mut sp: libc::sched_param = unsafe { std::mem::zeroed() };
        sp.sched_priority = 1;
        let r = unsafe { libc::pthread_setschedparam(handle.as_pthread_t(), libc::SCHED_FIFO, &sp) };
        if r != 0 {
            log::warn!(
                "unable to set SCHED_FIFO for the timer thread; latency impact possible (CAP_SYS_NICE?)"
            );
        }
        self.timer_thread = Some(handle);
    }

    fn stop_tick(&mut self) {
        if let Some(handle) = self.timer_thread.take() {
            self.shared.set_dying();
            // Make the quota timer fire immediately so the poll returns
            // and the thread observes the dying flag.
            let _ = self
                .shared
                .task_quota_timer()
                .timerfd_settime_abs(&abs_deadline_after(1));
            let _ = handle.join();
        }
    }

    fn start_handling_signal(&mut self) {
        // The high resolution timer is partly signal driven here, so make
        // the scheduler break out when a signal arrives.
        self.request_preemption();
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

impl Drop for ReadyBackend {
    fn drop(&mut self) {
        self.stop_tick();
        // StorageContext::drop drains outstanding blocks.
    }
}

fn timer_thread_loop(
    shared: Arc<ReactorShared>,
    quota_fd: RawFd,
    steady_fd: RawFd,
    highres_pending: Arc<AtomicBool>,
) {
    while !shared.is_dying() {
        let mut pfds = [
            libc::pollfd { fd: quota_fd, events: libc::POLLIN, revents: 0 },
            libc::pollfd { fd: steady_fd, events: libc::POLLIN, revents: 0 },
        ];
        let r = unsafe { libc::poll(pfds.as_mut_ptr(), 2, -1) };
        if r < 0 {
            if errno() == libc::EINTR {
                continue;
            }
            log::error!("timer thread poll failed: errno {}", errno());
            break;
        }
        if pfds[0].revents & libc::POLLIN != 0 {
            read_count_raw(quota_fd);
        }
        if pfds[1].revents & libc::POLLIN != 0 {
            read_count_raw(steady_fd);
            highres_pending.store(true, Ordering::Relaxed);
        }
        shared.preemption_monitor().signal();
        // Same core as the reactor thread; a signal fence orders the
        // stores well enough for an advisory flag.
        compiler_fence(Ordering::SeqCst);
    }
}
