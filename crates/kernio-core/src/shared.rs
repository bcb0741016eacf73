//! `ReactorShared` — the collaborator surface a backend consumes.
//!
//! This is the runtime side of the contract: the storage sink, the
//! task-quota timer fd, the cross-core notify eventfd, the private
//! preemption monitor, the high-resolution timer service hook, and the
//! signal table. The backend never reaches deeper into the runtime than
//! this struct.

use crate::fd::FileDesc;
use crate::preempt::PreemptionMonitor;
use crate::signal::SignalTable;
use crate::sink::IoSink;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type HighresHandler = Arc<dyn Fn() + Send + Sync>;

pub struct SharedConfig {
    /// Capacity of the storage sink.
    pub sink_capacity: usize,
    /// The host forces storage I/O through the kernel page cache, so
    /// io_submit may block; route submissions through the retry worker.
    pub kernel_page_cache: bool,
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self {
            sink_capacity: 1024,
            kernel_page_cache: false,
        }
    }
}

pub struct ReactorShared {
    io_sink: IoSink,
    task_quota_timer: FileDesc,
    notify_eventfd: FileDesc,
    preemption_monitor: PreemptionMonitor,
    highres_handler: Mutex<Option<HighresHandler>>,
    signals: SignalTable,
    kernel_page_cache: bool,
    /// Set at shutdown so the READY backend's timer thread exits.
    dying: AtomicBool,
    io_errors: AtomicU64,
    highres_serviced: AtomicU64,
}

impl ReactorShared {
    pub fn new(cfg: SharedConfig) -> crate::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            io_sink: IoSink::with_capacity(cfg.sink_capacity),
            task_quota_timer: FileDesc::timerfd()?,
            notify_eventfd: FileDesc::eventfd(0)?,
            preemption_monitor: PreemptionMonitor::new(),
            highres_handler: Mutex::new(None),
            signals: SignalTable::new(),
            kernel_page_cache: cfg.kernel_page_cache,
            dying: AtomicBool::new(false),
            io_errors: AtomicU64::new(0),
            highres_serviced: AtomicU64::new(0),
        }))
    }

    pub fn io_sink(&self) -> &IoSink {
        &self.io_sink
    }

    pub fn task_quota_timer(&self) -> &FileDesc {
        &self.task_quota_timer
    }

    pub fn notify_eventfd(&self) -> &FileDesc {
        &self.notify_eventfd
    }

    /// The private monitor `need_preempt` falls back to while the preempt
    /// ring is not installed. Address is stable for the shared state's
    /// lifetime.
    pub fn preemption_monitor(&self) -> &PreemptionMonitor {
        &self.preemption_monitor
    }

    pub fn signals(&self) -> &SignalTable {
        &self.signals
    }

    pub fn kernel_page_cache(&self) -> bool {
        self.kernel_page_cache
    }

    /// Wake this core from another core.
    pub fn smp_notify(&self) -> crate::Result<()> {
        self.notify_eventfd.write_one()
    }

    pub fn set_highres_handler(&self, handler: HighresHandler) {
        *self.highres_handler.lock().unwrap() = Some(handler);
    }

    /// The scheduler inbox for high-resolution timer expiry. Called by the
    /// backend whenever the hrtimer edge is observed.
    pub fn service_highres_timer(&self) {
        self.highres_serviced.fetch_add(1, Ordering::Relaxed);
        let handler = self.highres_handler.lock().unwrap().clone();
        if let Some(h) = handler {
            h();
        }
    }

    pub fn highres_serviced(&self) -> u64 {
        self.highres_serviced.load(Ordering::Relaxed)
    }

    pub fn set_dying(&self) {
        self.dying.store(true, Ordering::Relaxed);
    }

    pub fn is_dying(&self) -> bool {
        self.dying.load(Ordering::Relaxed)
    }

    pub fn count_io_error(&self) {
        self.io_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn io_errors(&self) -> u64 {
        self.io_errors.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn highres_service_counts_and_calls_handler() {
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let fired2 = fired.clone();
        shared.set_highres_handler(Arc::new(move || {
            fired2.fetch_add(1, Ordering::Relaxed);
        }));
        shared.service_highres_timer();
        assert_eq!(shared.highres_serviced(), 1);
        assert_eq!(fired.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn smp_notify_bumps_eventfd() {
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        shared.smp_notify().unwrap();
        assert_eq!(shared.notify_eventfd().read_count(), 1);
    }
}
