//! The uniform backend contract and the per-core `Backend` variant.
//!
//! The runtime's loop drives a backend through this surface and nothing
//! else. `kernel_submit_work`, `reap_kernel_completions` and the readiness
//! calls must all return promptly; only `wait_and_process_events` may
//! block, and only after `kernel_events_can_sleep` said it is safe.

use crate::aio_backend::AioBackend;
use crate::fd_slab::PollableFd;
use crate::ready_backend::ReadyBackend;
use crate::socket;
use crate::uring_backend::UringBackend;
use kernio_core::fd::FileDesc;
use kernio_core::poll::{PollableFdState, ReadinessFuture, Speculation};
use kernio_core::Result;
use std::cell::RefCell;

pub trait ReactorBackend {
    fn name(&self) -> &'static str;

    /// Deliver all ready completions without blocking. True iff any were
    /// delivered.
    fn reap_kernel_completions(&mut self) -> bool;

    /// Drain the runtime's pending storage queue into kernel submission
    /// and rearm timer/wakeup interest. True iff any submission occurred.
    fn kernel_submit_work(&mut self) -> bool;

    /// False if in-flight kernel operations could complete without waking
    /// the loop; purely a safety question.
    fn kernel_events_can_sleep(&self) -> bool;

    /// Block until at least one completion, timer, signal or cross-core
    /// wakeup; process everything ready.
    fn wait_and_process_events(&mut self, sigmask: Option<&libc::sigset_t>);

    /// One-shot readiness for the read direction. A completion resolves
    /// exactly when the requested edge was last observed; a fresh call
    /// consults the kernel again unless `events_known` caches the edge.
    fn readable(&mut self, fd: &PollableFd) -> ReadinessFuture;

    /// One-shot readiness for the write direction.
    fn writeable(&mut self, fd: &PollableFd) -> ReadinessFuture;

    /// One future for either edge (accept reports errors on the write
    /// side).
    fn readable_or_writeable(&mut self, fd: &PollableFd) -> ReadinessFuture;

    /// The caller guarantees no new operation on this descriptor. Cancels
    /// or waits out in-flight kernel references, aborts pending readiness
    /// futures, then frees the state.
    fn forget(&mut self, fd: PollableFd);

    fn shutdown(&mut self, fd: &PollableFd, how: libc::c_int);

    /// Program the single high-resolution timer's absolute deadline.
    fn arm_highres_timer(&mut self, its: &libc::itimerspec);

    fn reset_preemption_monitor(&mut self);
    fn request_preemption(&mut self);
    fn start_tick(&mut self);
    fn stop_tick(&mut self);
    fn start_handling_signal(&mut self);

    /// Called from the installed signal handler; async-signal-safe.
    fn signal_received(&self, signo: i32);

    fn make_pollable_fd_state(&mut self, fd: FileDesc, speculation: Speculation) -> PollableFd;

    fn fd_state(&self, fd: &PollableFd) -> &PollableFdState;
}

/// The per-core backend instance. Tagged variant rather than a trait
/// object: the set is closed and the loop calls these methods hot.
pub enum Backend {
    Ready(ReadyBackend),
    Aio(AioBackend),
    Uring(UringBackend),
}

macro_rules! delegate {
    ($self:ident, $b:ident => $e:expr) => {
        match $self {
            Backend::Ready($b) => $e,
            Backend::Aio($b) => $e,
            Backend::Uring($b) => $e,
        }
    };
}

impl ReactorBackend for Backend {
    fn name(&self) -> &'static str {
        delegate!(self, b => b.name())
    }

    fn reap_kernel_completions(&mut self) -> bool {
        delegate!(self, b => b.reap_kernel_completions())
    }

    fn kernel_submit_work(&mut self) -> bool {
        delegate!(self, b => b.kernel_submit_work())
    }

    fn kernel_events_can_sleep(&self) -> bool {
        delegate!(self, b => b.kernel_events_can_sleep())
    }

    fn wait_and_process_events(&mut self, sigmask: Option<&libc::sigset_t>) {
        delegate!(self, b => b.wait_and_process_events(sigmask))
    }

    fn readable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        delegate!(self, b => b.readable(fd))
    }

    fn writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        delegate!(self, b => b.writeable(fd))
    }

    fn readable_or_writeable(&mut self, fd: &PollableFd) -> ReadinessFuture {
        delegate!(self, b => b.readable_or_writeable(fd))
    }

    fn forget(&mut self, fd: PollableFd) {
        delegate!(self, b => b.forget(fd))
    }

    fn shutdown(&mut self, fd: &PollableFd, how: libc::c_int) {
        delegate!(self, b => b.shutdown(fd, how))
    }

    fn arm_highres_timer(&mut self, its: &libc::itimerspec) {
        delegate!(self, b => b.arm_highres_timer(its))
    }

    fn reset_preemption_monitor(&mut self) {
        delegate!(self, b => b.reset_preemption_monitor())
    }

    fn request_preemption(&mut self) {
        delegate!(self, b => b.request_preemption())
    }

    fn start_tick(&mut self) {
        delegate!(self, b => b.start_tick())
    }

    fn stop_tick(&mut self) {
        delegate!(self, b => b.stop_tick())
    }

    fn start_handling_signal(&mut self) {
        delegate!(self, b => b.start_handling_signal())
    }

    fn signal_received(&self, signo: i32) {
        delegate!(self, b => b.signal_received(signo))
    }

    fn make_pollable_fd_state(&mut self, fd: FileDesc, speculation: Speculation) -> PollableFd {
        delegate!(self, b => b.make_pollable_fd_state(fd, speculation))
    }

    fn fd_state(&self, fd: &PollableFd) -> &PollableFdState {
        delegate!(self, b => b.fd_state(fd))
    }
}

/// The per-core handle the runtime and its tasks share. Tasks hold `&`
/// references and take short re-borrows around each backend call, so a
/// suspended socket future never pins the backend while the loop pumps
/// events.
pub struct Reactor {
    inner: RefCell<Backend>,
}

impl Reactor {
    pub fn new(backend: Backend) -> Self {
        Self {
            inner: RefCell::new(backend),
        }
    }

    pub fn with_backend<R>(&self, f: impl FnOnce(&mut Backend) -> R) -> R {
        f(&mut self.inner.borrow_mut())
    }

    pub fn backend_name(&self) -> &'static str {
        self.inner.borrow().name()
    }

    // The loop surface (§"control flow per core").

    pub fn reap_kernel_completions(&self) -> bool {
        self.inner.borrow_mut().reap_kernel_completions()
    }

    pub fn kernel_submit_work(&self) -> bool {
        self.inner.borrow_mut().kernel_submit_work()
    }

    pub fn kernel_events_can_sleep(&self) -> bool {
        self.inner.borrow().kernel_events_can_sleep()
    }

    pub fn wait_and_process_events(&self, sigmask: Option<&libc::sigset_t>) {
        self.inner.borrow_mut().wait_and_process_events(sigmask)
    }

    // Readiness and descriptor lifetime.

    pub fn make_pollable_fd_state(&self, fd: FileDesc, speculation: Speculation) -> PollableFd {
        self.inner.borrow_mut().make_pollable_fd_state(fd, speculation)
    }

    pub fn readable(&self, fd: &PollableFd) -> ReadinessFuture {
        self.inner.borrow_mut().readable(fd)
    }

    pub fn writeable(&self, fd: &PollableFd) -> ReadinessFuture {
        self.inner.borrow_mut().writeable(fd)
    }

    pub fn readable_or_writeable(&self, fd: &PollableFd) -> ReadinessFuture {
        self.inner.borrow_mut().readable_or_writeable(fd)
    }

    pub fn forget(&self, fd: PollableFd) {
        self.inner.borrow_mut().forget(fd)
    }

    pub fn shutdown(&self, fd: &PollableFd, how: libc::c_int) {
        self.inner.borrow_mut().shutdown(fd, how)
    }

    pub fn raw_fd(&self, fd: &PollableFd) -> std::os::unix::io::RawFd {
        self.inner.borrow().fd_state(fd).fd.get()
    }

    // Timers and preemption.

    pub fn arm_highres_timer(&self, its: &libc::itimerspec) {
        self.inner.borrow_mut().arm_highres_timer(its)
    }

    pub fn reset_preemption_monitor(&self) {
        self.inner.borrow_mut().reset_preemption_monitor()
    }

    pub fn request_preemption(&self) {
        self.inner.borrow_mut().request_preemption()
    }

    pub fn start_tick(&self) {
        self.inner.borrow_mut().start_tick()
    }

    pub fn stop_tick(&self) {
        self.inner.borrow_mut().stop_tick()
    }

    pub fn start_handling_signal(&self) {
        self.inner.borrow_mut().start_handling_signal()
    }

    pub fn signal_received(&self, signo: i32) {
        self.inner.borrow().signal_received(signo)
    }

    // Socket-level conveniences, delegated to the shared helpers; the
    // backend contributes only the polling layer. The contiguous-buffer
    // write form comes before the scatter form.

    pub async fn accept(&self, listenfd: &PollableFd) -> Result<(FileDesc, libc::sockaddr_storage)> {
        socket::accept(self, listenfd).await
    }

    pub async fn connect(
        &self,
        fd: &PollableFd,
        addr: &libc::sockaddr_storage,
        addrlen: libc::socklen_t,
    ) -> Result<()> {
        socket::connect(self, fd, addr, addrlen).await
    }

    pub async fn read_some(&self, fd: &PollableFd, buf: &mut [u8]) -> Result<usize> {
        socket::read_some(self, fd, buf).await
    }

    pub async fn write_some(&self, fd: &PollableFd, buf: &[u8]) -> Result<usize> {
        socket::write_some(self, fd, buf).await
    }

    pub async fn write_some_vectored(&self, fd: &PollableFd, iov: &[libc::iovec]) -> Result<usize> {
        socket::write_some_vectored(self, fd, iov).await
    }
}
