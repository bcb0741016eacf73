//! The preemption monitor.
//!
//! `need_preempt()` is the runtime's hot-path check: the scheduler reads it
//! between task steps to decide whether to break out. It dereferences a
//! thread-local pointer so a backend can repoint it at kernel-owned memory:
//! the AIO and URING backends aim it eight bytes into their preempt ring,
//! where the kernel maintains the completion head/tail pair, turning "a
//! preempt event arrived" into a plain load with no syscall.
//!
//! The monitor layout matches the kernel's aio ring header at that offset:
//! two u32 words; preemption is indicated whenever they differ. The
//! runtime's private monitor reuses the same layout so `request_preemption`
//! can signal it by storing head=1.
//!
//! Accesses are relaxed plus a signal fence: preemption is advisory, and a
//! missed edge is caught on the next wait.

use std::cell::Cell;
use std::sync::atomic::{compiler_fence, AtomicU32, Ordering};

/// Two words the runtime compares on the hot path. When aimed at an AIO
/// completion ring these are the kernel's head and tail.
#[repr(C)]
#[derive(Debug)]
pub struct PreemptionMonitor {
    pub head: AtomicU32,
    pub tail: AtomicU32,
}

impl PreemptionMonitor {
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    /// Make `need_preempt` observe this monitor as triggered.
    pub fn signal(&self) {
        self.head.store(1, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.head.store(0, Ordering::Relaxed);
        self.tail.store(0, Ordering::Relaxed);
    }
}

impl Default for PreemptionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

thread_local! {
    static NEED_PREEMPT_VAR: Cell<*const PreemptionMonitor> = const { Cell::new(std::ptr::null()) };
}

/// Repoint this core's `need_preempt` source. The pointee must stay valid
/// until the next repoint; backends guarantee that by owning both the ring
/// and the private monitor for their whole lifetime.
pub fn set_need_preempt_var(monitor: *const PreemptionMonitor) {
    NEED_PREEMPT_VAR.with(|v| v.set(monitor));
}

/// Hot-path check read by the scheduler between task steps.
#[inline]
pub fn need_preempt() -> bool {
    NEED_PREEMPT_VAR.with(|v| {
        let ptr = v.get();
        if ptr.is_null() {
            return false;
        }
        // Safety: the backend keeps the pointee alive, see
        // set_need_preempt_var.
        let monitor = unsafe { &*ptr };
        let head = monitor.head.load(Ordering::Relaxed);
        let tail = monitor.tail.load(Ordering::Relaxed);
        compiler_fence(Ordering::SeqCst);
        head != tail
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_var_never_preempts() {
        set_need_preempt_var(std::ptr::null());
        assert!(!need_preempt());
    }

    #[test]
    fn signalled_monitor_preempts_until_cleared() {
        let monitor = Box::new(PreemptionMonitor::new());
        set_need_preempt_var(&*monitor);
        assert!(!need_preempt());
        monitor.signal();
        assert!(need_preempt());
        monitor.clear();
        assert!(!need_preempt());
        set_need_preempt_var(std::ptr::null());
    }

    #[test]
    fn repoint_switches_sources() {
        let a = Box::new(PreemptionMonitor::new());
        let b = Box::new(PreemptionMonitor::new());
        a.signal();
        set_need_preempt_var(&*b);
        assert!(!need_preempt());
        set_need_preempt_var(&*a);
        assert!(need_preempt());
        set_need_preempt_var(std::ptr::null());
    }
}
