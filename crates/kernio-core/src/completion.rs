//! Completion keys and storage completions.
//!
//! Every kernel control block carries a `CompletionKey` in its user-data
//! word. The key encodes what kind of completion this is plus a slot index
//! into the owning backend's tables, so reaping never dereferences a raw
//! pointer handed back by the kernel.

/// What a completion event refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionKind {
    /// A storage control block; index = pool slot.
    Storage,
    /// Read-direction readiness for a pollable state; index = state id.
    PollIn,
    /// Write-direction readiness for a pollable state; index = state id.
    PollOut,
    /// A whole pollable state (READY backend; epoll is per-fd, not
    /// per-direction); index = state id.
    FdState,
    /// Task-quota timer expiry.
    TaskQuota,
    /// High-resolution timer expiry.
    HrTimer,
    /// Cross-core wakeup eventfd.
    SmpWakeup,
    /// The storage context's completion eventfd (READY backend).
    StorageEventfd,
    /// Result of a cancellation request; carries nothing.
    Cancel,
}

/// Tagged user-data word: kind in the top byte, slot index below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct CompletionKey(pub u64);

const TAG_SHIFT: u32 = 56;

impl CompletionKey {
    pub fn new(kind: CompletionKind, index: u32) -> Self {
        let tag = match kind {
            CompletionKind::Storage => 1u64,
            CompletionKind::PollIn => 2,
            CompletionKind::PollOut => 3,
            CompletionKind::FdState => 4,
            CompletionKind::TaskQuota => 5,
            CompletionKind::HrTimer => 6,
            CompletionKind::SmpWakeup => 7,
            CompletionKind::StorageEventfd => 8,
            CompletionKind::Cancel => 9,
        };
        Self((tag << TAG_SHIFT) | index as u64)
    }

    pub fn kind(self) -> CompletionKind {
        match self.0 >> TAG_SHIFT {
            1 => CompletionKind::Storage,
            2 => CompletionKind::PollIn,
            3 => CompletionKind::PollOut,
            4 => CompletionKind::FdState,
            5 => CompletionKind::TaskQuota,
            6 => CompletionKind::HrTimer,
            7 => CompletionKind::SmpWakeup,
            8 => CompletionKind::StorageEventfd,
            _ => CompletionKind::Cancel,
        }
    }

    #[inline]
    pub fn index(self) -> u32 {
        self.0 as u32
    }
}

/// One-shot callback delivering a storage result to the scheduler layer.
/// Receives the raw kernel result: a byte count, or a negative errno.
pub type StorageCompletion = Box<dyn FnOnce(i64) + Send>;
