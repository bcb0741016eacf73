//! Backend selection: probe what the host kernel offers, list the
//! selectable backends in preference order, build one.

use crate::aio_abi::{
    io_destroy, io_pgetevents, io_setup, io_submit, make_poll_iocb, set_user_data, IoEvent, Iocb,
};
use crate::aio_backend::AioBackend;
use crate::backend::Backend;
use crate::ready_backend::ReadyBackend;
use crate::storage::MAX_AIO;
use crate::uring_backend::{try_create_uring, UringBackend};
use kernio_core::completion::{CompletionKey, CompletionKind};
use kernio_core::fd::FileDesc;
use kernio_core::shared::ReactorShared;
use kernio_core::{Error, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorBackendSelector {
    name: &'static str,
}

impl ReactorBackendSelector {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "linux-aio" => Some(Self { name: "linux-aio" }),
            "epoll" => Some(Self { name: "epoll" }),
            "io_uring" => Some(Self { name: "io_uring" }),
            _ => None,
        }
    }

    /// The selectable set on this host, in preference order.
    pub fn available() -> Vec<Self> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self::available_for_workers(workers)
    }

    pub(crate) fn available_for_workers(workers: usize) -> Vec<Self> {
        let mut ret = Vec::new();
        if has_enough_aio_nr(workers) && detect_aio_poll() {
            ret.push(Self { name: "linux-aio" });
        }
        ret.push(Self { name: "epoll" });
        if detect_io_uring() {
            ret.push(Self { name: "io_uring" });
        }
        ret
    }

    pub fn default_backend() -> Self {
        Self::available()[0]
    }

    pub fn create(&self, shared: Arc<ReactorShared>) -> Result<Backend> {
        log::debug!("creating reactor backend: {}", self.name);
        match self.name {
            "linux-aio" => Ok(Backend::Aio(AioBackend::new(shared)?)),
            "epoll" => Ok(Backend::Ready(ReadyBackend::new(shared)?)),
            "io_uring" => Ok(Backend::Uring(UringBackend::new(shared)?)),
            _ => Err(Error::Unavailable("unknown backend name")),
        }
    }
}

fn read_proc_u64(path: &str) -> Option<u64> {
    std::fs::read_to_string(path)
        .ok()?
        .split_whitespace()
        .next()?
        .parse()
        .ok()
}

/// Selection runs before any io_setup and is not per-cpu, so the check is
/// "available AIO reservations on the system minus what all workers will
/// claim".
pub(crate) fn has_enough_aio_nr(workers: usize) -> bool {
    let (Some(aio_max_nr), Some(aio_nr)) = (
        read_proc_u64("/proc/sys/fs/aio-max-nr"),
        read_proc_u64("/proc/sys/fs/aio-nr"),
    ) else {
        return false;
    };
    aio_max_nr.saturating_sub(aio_nr) >= (MAX_AIO * workers) as u64
}

/// Full round trip: submit a POLL block against an eventfd, fire it, and
/// collect it with io_pgetevents. The collection step matters: container
/// seccomp allowlists have been seen to permit IOCB_CMD_POLL but not the
/// io_pgetevents syscall.
pub(crate) fn detect_aio_poll() -> bool {
    let Ok(efd) = FileDesc::eventfd(0) else {
        return false;
    };
    let Ok(ctx) = io_setup(1) else {
        return false;
    };

    let mut iocb = make_poll_iocb(efd.get(), libc::POLLIN as u32 | libc::POLLOUT as u32);
    set_user_data(&mut iocb, CompletionKey::new(CompletionKind::Cancel, 0));
    let ptrs = [&mut iocb as *mut Iocb];
    let submitted = matches!(io_submit(ctx, ptrs.as_ptr(), 1), Ok(1));
    let ok = submitted && {
        let _ = efd.write_one();
        let mut ev = [IoEvent::zeroed(); 1];
        matches!(io_pgetevents(ctx, 1, &mut ev, None, None), Ok(1))
    };
    io_destroy(ctx);
    ok
}

fn have_md_devices() -> bool {
    let Ok(entries) = std::fs::read_dir("/sys/block") else {
        return false;
    };
    for entry in entries.flatten() {
        if entry.path().join("md").exists() {
            return true;
        }
    }
    false
}

fn kernel_at_least(major: u32, minor: u32) -> bool {
    let mut uts: libc::utsname = unsafe { std::mem::zeroed() };
    if unsafe { libc::uname(&mut uts) } != 0 {
        return false;
    }
    let release = unsafe { std::ffi::CStr::from_ptr(uts.release.as_ptr()) };
    let release = release.to_string_lossy();
    let mut parts = release.split(|c: char| !c.is_ascii_digit());
    let got_major: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    let got_minor: u32 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(0);
    (got_major, got_minor) >= (major, minor)
}

pub(crate) fn detect_io_uring() -> bool {
    // Kernels below 5.17 fall back to workqueues for RAID devices, which
    // destroys latency.
    if !kernel_at_least(5, 17) && have_md_devices() {
        return false;
    }
    try_create_uring(1).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernio_core::shared::SharedConfig;

    #[test]
    fn epoll_is_always_selectable() {
        let names: Vec<_> = ReactorBackendSelector::available()
            .iter()
            .map(|s| s.name())
            .collect();
        assert!(names.contains(&"epoll"));
        // Preference order: linux-aio, when selectable, leads.
        if names.contains(&"linux-aio") {
            assert_eq!(names[0], "linux-aio");
        }
    }

    #[test]
    fn default_backend_constructs() {
        use crate::backend::ReactorBackend as _;
        let shared = ReactorShared::new(SharedConfig::default()).unwrap();
        let selector = ReactorBackendSelector::default_backend();
        let backend = selector.create(shared).unwrap();
        assert_eq!(backend.name(), selector.name());
    }

    #[test]
    fn unknown_names_are_rejected() {
        assert!(ReactorBackendSelector::from_name("kqueue").is_none());
        assert!(ReactorBackendSelector::from_name("io_uring").is_some());
    }

    #[test]
    fn capacity_gating_blocks_absurd_worker_counts() {
        // A worker count this large cannot be satisfied by any real
        // aio-max-nr setting, so linux-aio must drop out of the set.
        let names: Vec<_> = ReactorBackendSelector::available_for_workers(usize::MAX / MAX_AIO)
            .iter()
            .map(|s| s.name())
            .collect();
        assert!(!names.contains(&"linux-aio"));
        assert!(names.contains(&"epoll"));
    }
}
