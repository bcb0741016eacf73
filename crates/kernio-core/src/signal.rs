//! The signal action table.
//!
//! `Backend::signal_received` runs inside the installed signal handler, so
//! all it may do is set a pending bit. The runtime drains the bits and runs
//! the registered actions from its loop.

use std::sync::atomic::{compiler_fence, AtomicU64, Ordering};
use std::sync::Mutex;

type SignalAction = Box<dyn Fn(i32) + Send + Sync>;

pub struct SignalTable {
    pending: AtomicU64,
    actions: Mutex<Vec<(i32, SignalAction)>>,
}

impl SignalTable {
    pub fn new() -> Self {
        Self {
            pending: AtomicU64::new(0),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn register(&self, signo: i32, action: SignalAction) {
        self.actions.lock().unwrap().push((signo, action));
    }

    /// Async-signal-safe: one atomic OR plus a fence.
    pub fn mark_pending(&self, signo: i32) {
        if (0..64).contains(&signo) {
            self.pending.fetch_or(1 << signo, Ordering::Relaxed);
            compiler_fence(Ordering::SeqCst);
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed) != 0
    }

    /// Run the registered actions for every pending signal. Loop-thread
    /// only.
    pub fn dispatch_pending(&self) -> bool {
        let bits = self.pending.swap(0, Ordering::Relaxed);
        if bits == 0 {
            return false;
        }
        let actions = self.actions.lock().unwrap();
        for signo in 0..64 {
            if bits & (1 << signo) != 0 {
                for (registered, action) in actions.iter() {
                    if *registered == signo {
                        action(signo);
                    }
                }
            }
        }
        true
    }
}

impl Default for SignalTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn pending_bits_dispatch_to_registered_actions() {
        let table = SignalTable::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        table.register(
            libc::SIGUSR1,
            Box::new(move |signo| {
                assert_eq!(signo, libc::SIGUSR1);
                hits2.fetch_add(1, Ordering::Relaxed);
            }),
        );

        assert!(!table.dispatch_pending());
        table.mark_pending(libc::SIGUSR1);
        table.mark_pending(libc::SIGUSR1);
        assert!(table.has_pending());
        assert!(table.dispatch_pending());
        // Coalesced: two marks, one dispatch.
        assert_eq!(hits.load(Ordering::Relaxed), 1);
        assert!(!table.has_pending());
    }
}
