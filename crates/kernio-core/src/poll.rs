//! Pollable descriptor state and readiness futures.
//!
//! A `PollableFdState` is the per-descriptor record a backend keeps for
//! readiness polling: the owned fd, the interest bookkeeping flags, and one
//! completion slot per direction. Readiness is one-shot: every resolved
//! future corresponds to exactly one observed edge, and asking again goes
//! back to the kernel unless `events_known` still caches an unconsumed
//! edge.
//!
//! Slots are shared between the state and the futures handed to callers
//! via `Rc`: a backend is pinned to one core, so nothing here is `Send`.

use crate::error::Error;
use crate::fd::FileDesc;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

bitflags::bitflags! {
    /// Direction bits, numerically identical to POLLIN/POLLOUT so they can
    /// be handed to the kernel as-is.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PollFlags: u32 {
        const IN = libc::POLLIN as u32;
        const OUT = libc::POLLOUT as u32;
    }
}

/// Readiness the caller already knows about at state creation, e.g. a
/// freshly accepted socket is speculatively writeable.
#[derive(Debug, Clone, Copy, Default)]
pub struct Speculation(pub u32);

impl Speculation {
    pub fn readable() -> Self {
        Self(PollFlags::IN.bits())
    }

    pub fn writeable() -> Self {
        Self(PollFlags::OUT.bits())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// No waiter and no undelivered outcome.
    Idle,
    /// A future is outstanding for this direction.
    Armed,
    /// The edge arrived; the future will resolve on its next poll.
    Ready,
    /// The descriptor was forgotten; the future resolves to an error.
    Aborted,
}

/// One-shot completion slot for one direction of one descriptor.
#[derive(Debug)]
pub struct CompletionSlot {
    state: Cell<SlotState>,
    waker: RefCell<Option<Waker>>,
}

impl CompletionSlot {
    pub fn new() -> Rc<Self> {
        Rc::new(Self {
            state: Cell::new(SlotState::Idle),
            waker: RefCell::new(None),
        })
    }

    /// Arm the slot for a readiness round. Arming an already-armed slot is
    /// a second waiter joining the in-flight round: the backends guarantee
    /// at most one kernel completion per direction, and every future
    /// handed out for the round resolves on its edge.
    pub fn arm(&self) {
        self.state.set(SlotState::Armed);
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.state.get() == SlotState::Armed
    }

    /// Deliver the observed edge. Readiness carries no payload; the result
    /// word is only meaningful for storage completions.
    pub fn complete_with(&self, _res: i64) {
        if self.state.get() == SlotState::Armed {
            self.state.set(SlotState::Ready);
            self.wake();
        }
    }

    /// Resolve the waiting future with an aborted-descriptor error.
    pub fn abort(&self) {
        if self.state.get() == SlotState::Armed {
            self.state.set(SlotState::Aborted);
            self.wake();
        }
    }

    fn wake(&self) {
        if let Some(w) = self.waker.borrow_mut().take() {
            w.wake();
        }
    }
}

impl Default for CompletionSlot {
    fn default() -> Self {
        Self {
            state: Cell::new(SlotState::Idle),
            waker: RefCell::new(None),
        }
    }
}

enum FutureKind {
    /// The edge was already cached; resolve immediately.
    Now,
    Slot(Rc<CompletionSlot>),
}

/// One-shot readiness future returned by `readable`/`writeable`/
/// `readable_or_writeable`.
pub struct ReadinessFuture(FutureKind);

impl ReadinessFuture {
    pub fn ready() -> Self {
        Self(FutureKind::Now)
    }

    pub fn from_slot(slot: Rc<CompletionSlot>) -> Self {
        Self(FutureKind::Slot(slot))
    }
}

impl Future for ReadinessFuture {
    type Output = crate::error::Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match &self.get_mut().0 {
            FutureKind::Now => Poll::Ready(Ok(())),
            FutureKind::Slot(slot) => match slot.state.get() {
                SlotState::Armed => {
                    *slot.waker.borrow_mut() = Some(cx.waker().clone());
                    Poll::Pending
                }
                SlotState::Ready => {
                    slot.state.set(SlotState::Idle);
                    Poll::Ready(Ok(()))
                }
                SlotState::Aborted => {
                    slot.state.set(SlotState::Idle);
                    Poll::Ready(Err(Error::FdAborted))
                }
                // A slot is armed before the future is handed out; Idle
                // here means the outcome was already consumed.
                SlotState::Idle => Poll::Ready(Ok(())),
            },
        }
    }
}

/// Per-descriptor polling state. Backend-private fields (`events_epoll`,
/// the control-block slots) are unused by backends that do not need them.
pub struct PollableFdState {
    pub fd: FileDesc,
    /// Directions some caller is currently awaiting.
    pub events_requested: PollFlags,
    /// Edges observed by the kernel but not yet consumed by a future.
    pub events_known: PollFlags,
    /// Interests installed in the kernel poller (READY backend).
    pub events_epoll: PollFlags,
    /// Both directions resolve one shared future (accept reports errors on
    /// the write edge).
    pub events_rw: bool,
    /// Set once `forget` starts; remaining completions abort instead of
    /// fulfilling.
    pub in_forget: bool,
    /// Per-direction poll control-block slots (AIO backend).
    pub cb_in: Option<u32>,
    pub cb_out: Option<u32>,
    rd: Rc<CompletionSlot>,
    wr: Rc<CompletionSlot>,
}

impl PollableFdState {
    pub fn new(fd: FileDesc, speculation: Speculation) -> Self {
        Self {
            fd,
            events_requested: PollFlags::empty(),
            events_known: PollFlags::from_bits_truncate(speculation.0),
            events_epoll: PollFlags::empty(),
            events_rw: false,
            in_forget: false,
            cb_in: None,
            cb_out: None,
            rd: CompletionSlot::new(),
            wr: CompletionSlot::new(),
        }
    }

    /// The slot for a direction set. Anything containing the read bit maps
    /// to the read slot; `events_rw` waiters share it too.
    pub fn slot(&self, events: PollFlags) -> &Rc<CompletionSlot> {
        if events.contains(PollFlags::IN) {
            &self.rd
        } else {
            &self.wr
        }
    }

    pub fn read_slot(&self) -> &Rc<CompletionSlot> {
        &self.rd
    }

    pub fn write_slot(&self) -> &Rc<CompletionSlot> {
        &self.wr
    }

    /// Abort both directions (forget path).
    pub fn abort_all(&self) {
        self.rd.abort();
        self.wr.abort();
    }
}
