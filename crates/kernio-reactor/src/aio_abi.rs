//! Linux AIO ABI: control-block layout, syscall wrappers, formatters.
//!
//! libc carries no wrappers for the io_* family, so the calls go through
//! `libc::syscall` directly. Layouts match `<linux/aio_abi.h>` on
//! little-endian targets.

use kernio_core::completion::CompletionKey;
use kernio_core::error::{errno, Error, Result};
use std::os::unix::io::RawFd;

pub type AioContext = libc::c_ulong;

// IOCB_CMD_* opcodes.
pub const IOCB_CMD_PREAD: u16 = 0;
pub const IOCB_CMD_PWRITE: u16 = 1;
pub const IOCB_CMD_FDSYNC: u16 = 3;
pub const IOCB_CMD_POLL: u16 = 5;
pub const IOCB_CMD_PREADV: u16 = 7;
pub const IOCB_CMD_PWRITEV: u16 = 8;

pub const IOCB_FLAG_RESFD: u32 = 1;

// RWF_NOWAIT from <linux/fs.h>.
pub const RWF_NOWAIT: u32 = 0x0000_0008;

/// One queued kernel operation. Field order assumes little-endian
/// (`aio_key` precedes `aio_rw_flags` there).
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Iocb {
    pub aio_data: u64,
    pub aio_key: u32,
    pub aio_rw_flags: u32,
    pub aio_lio_opcode: u16,
    pub aio_reqprio: i16,
    pub aio_fildes: u32,
    pub aio_buf: u64,
    pub aio_nbytes: u64,
    pub aio_offset: i64,
    pub aio_reserved2: u64,
    pub aio_flags: u32,
    pub aio_resfd: u32,
}

impl Iocb {
    pub const fn zeroed() -> Self {
        Self {
            aio_data: 0,
            aio_key: 0,
            aio_rw_flags: 0,
            aio_lio_opcode: 0,
            aio_reqprio: 0,
            aio_fildes: 0,
            aio_buf: 0,
            aio_nbytes: 0,
            aio_offset: 0,
            aio_reserved2: 0,
            aio_flags: 0,
            aio_resfd: 0,
        }
    }
}

/// One completion record from the kernel.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct IoEvent {
    pub data: u64,
    pub obj: u64,
    pub res: i64,
    pub res2: i64,
}

impl IoEvent {
    pub const fn zeroed() -> Self {
        Self { data: 0, obj: 0, res: 0, res2: 0 }
    }

    pub fn key(&self) -> CompletionKey {
        CompletionKey(self.data)
    }
}

#[repr(C)]
struct AioSigset {
    sigmask: *const libc::sigset_t,
    sigsetsize: libc::size_t,
}

/// The kernel's sigset is 64 bits regardless of glibc's `sigset_t` size.
const KERNEL_SIGSET_SIZE: libc::size_t = 8;

/// `SYS_io_pgetevents` syscall number. Not exposed by the `libc` crate on
/// the glibc x86_64 target; value matches the kernel's syscall table
/// (same number libc uses for musl x86_64).
#[cfg(target_arch = "x86_64")]
const SYS_IO_PGETEVENTS: libc::c_long = 333;

pub fn io_setup(nr_events: usize) -> Result<AioContext> {
    let mut ctx: AioContext = 0;
    let r = unsafe { libc::syscall(libc::SYS_io_setup, nr_events as libc::c_long, &mut ctx) };
    if r < 0 {
        return Err(Error::ContextSetup(errno()));
    }
    Ok(ctx)
}

pub fn io_destroy(ctx: AioContext) {
    unsafe { libc::syscall(libc::SYS_io_destroy, ctx) };
}

/// Submit `nr` control blocks starting at `iocbs`. Returns the number the
/// kernel accepted, or the raw errno.
pub fn io_submit(ctx: AioContext, iocbs: *const *mut Iocb, nr: usize) -> std::result::Result<usize, i32> {
    let r = unsafe { libc::syscall(libc::SYS_io_submit, ctx, nr as libc::c_long, iocbs) };
    if r < 0 {
        Err(errno())
    } else {
        Ok(r as usize)
    }
}

pub fn io_cancel(ctx: AioContext, iocb: *mut Iocb) -> std::result::Result<(), i32> {
    let mut result = IoEvent::zeroed();
    let r = unsafe { libc::syscall(libc::SYS_io_cancel, ctx, iocb, &mut result) };
    if r < 0 {
        Err(errno())
    } else {
        Ok(())
    }
}

pub fn io_getevents(
    ctx: AioContext,
    min_nr: usize,
    events: &mut [IoEvent],
    timeout: Option<&libc::timespec>,
) -> std::result::Result<usize, i32> {
    let tsp = timeout.map_or(std::ptr::null(), |t| t as *const libc::timespec);
    let r = unsafe {
        libc::syscall(
            libc::SYS_io_getevents,
            ctx,
            min_nr as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            tsp,
        )
    };
    if r < 0 {
        Err(errno())
    } else {
        Ok(r as usize)
    }
}

/// `io_getevents` with a temporary signal mask for the duration of the
/// wait.
pub fn io_pgetevents(
    ctx: AioContext,
    min_nr: usize,
    events: &mut [IoEvent],
    timeout: Option<&libc::timespec>,
    sigmask: Option<&libc::sigset_t>,
) -> std::result::Result<usize, i32> {
    let tsp = timeout.map_or(std::ptr::null(), |t| t as *const libc::timespec);
    let usig = AioSigset {
        sigmask: sigmask.map_or(std::ptr::null(), |s| s as *const libc::sigset_t),
        sigsetsize: KERNEL_SIGSET_SIZE,
    };
    let r = unsafe {
        libc::syscall(
            SYS_IO_PGETEVENTS,
            ctx,
            min_nr as libc::c_long,
            events.len() as libc::c_long,
            events.as_mut_ptr(),
            tsp,
            &usig,
        )
    };
    if r < 0 {
        Err(errno())
    } else {
        Ok(r as usize)
    }
}

// ── iocb formatters ──────────────────────────────────────────────────

pub fn make_poll_iocb(fd: RawFd, events: u32) -> Iocb {
    let mut io = Iocb::zeroed();
    io.aio_lio_opcode = IOCB_CMD_POLL;
    io.aio_fildes = fd as u32;
    io.aio_buf = events as u64;
    io
}

pub fn make_read_iocb(fd: RawFd, pos: u64, buf: u64, len: u64) -> Iocb {
    let mut io = Iocb::zeroed();
    io.aio_lio_opcode = IOCB_CMD_PREAD;
    io.aio_fildes = fd as u32;
    io.aio_buf = buf;
    io.aio_nbytes = len;
    io.aio_offset = pos as i64;
    io
}

pub fn make_write_iocb(fd: RawFd, pos: u64, buf: u64, len: u64) -> Iocb {
    let mut io = Iocb::zeroed();
    io.aio_lio_opcode = IOCB_CMD_PWRITE;
    io.aio_fildes = fd as u32;
    io.aio_buf = buf;
    io.aio_nbytes = len;
    io.aio_offset = pos as i64;
    io
}

pub fn make_readv_iocb(fd: RawFd, pos: u64, iov: u64, iovcnt: u64) -> Iocb {
    let mut io = make_read_iocb(fd, pos, iov, iovcnt);
    io.aio_lio_opcode = IOCB_CMD_PREADV;
    io
}

pub fn make_writev_iocb(fd: RawFd, pos: u64, iov: u64, iovcnt: u64) -> Iocb {
    let mut io = make_write_iocb(fd, pos, iov, iovcnt);
    io.aio_lio_opcode = IOCB_CMD_PWRITEV;
    io
}

pub fn make_fdsync_iocb(fd: RawFd) -> Iocb {
    let mut io = Iocb::zeroed();
    io.aio_lio_opcode = IOCB_CMD_FDSYNC;
    io.aio_fildes = fd as u32;
    io
}

pub fn set_user_data(io: &mut Iocb, key: CompletionKey) {
    io.aio_data = key.0;
}

pub fn set_nowait(io: &mut Iocb, enabled: bool) {
    if enabled {
        io.aio_rw_flags |= RWF_NOWAIT;
    } else {
        io.aio_rw_flags &= !RWF_NOWAIT;
    }
}

/// Route this block's completion through `resfd` as well as the ring.
pub fn set_eventfd_notification(io: &mut Iocb, resfd: RawFd) {
    io.aio_flags |= IOCB_FLAG_RESFD;
    io.aio_resfd = resfd as u32;
}

pub fn timespec_zero() -> libc::timespec {
    libc::timespec { tv_sec: 0, tv_nsec: 0 }
}

pub fn timespec_from_ms(ms: i64) -> libc::timespec {
    libc::timespec {
        tv_sec: (ms / 1000) as libc::time_t,
        tv_nsec: ((ms % 1000) * 1_000_000) as libc::c_long,
    }
}

// ── General-purpose submission context ───────────────────────────────

/// A small AIO context used for polling interest and preemption. Blocks
/// are queued by pointer and submitted in one batch on `flush`; they stay
/// pinned (boxed or pooled) by their owners until the kernel has copied
/// them in.
pub struct GeneralAioContext {
    ctx: AioContext,
    queued: Vec<*mut Iocb>,
}

impl GeneralAioContext {
    pub fn new(nr: usize) -> Result<Self> {
        Ok(Self {
            ctx: io_setup(nr)?,
            queued: Vec::with_capacity(nr),
        })
    }

    #[inline]
    pub fn io_context(&self) -> AioContext {
        self.ctx
    }

    pub fn queue(&mut self, iocb: *mut Iocb) {
        self.queued.push(iocb);
    }

    /// Submit everything queued. EAGAIN is retried in place: the context
    /// is sized for its fixed population of blocks, so the kernel accepts
    /// them as earlier ones drain. Any other errno is a configuration bug.
    pub fn flush(&mut self) -> usize {
        let total = self.queued.len();
        let mut submitted = 0;
        while submitted < total {
            match io_submit(
                self.ctx,
                self.queued[submitted..].as_ptr(),
                total - submitted,
            ) {
                Ok(n) => submitted += n,
                Err(e) if e == libc::EAGAIN => continue,
                Err(e) => {
                    log::error!("general aio context submit failed: errno {}", e);
                    panic!("io_submit: errno {}", e);
                }
            }
        }
        self.queued.clear();
        total
    }

    pub fn cancel(&self, iocb: *mut Iocb) -> std::result::Result<(), i32> {
        io_cancel(self.ctx, iocb)
    }

    /// Non-blocking event drain into `buf`.
    pub fn getevents_now(&self, min_nr: usize, buf: &mut [IoEvent]) -> usize {
        let ts = timespec_zero();
        match io_getevents(self.ctx, min_nr, buf, Some(&ts)) {
            Ok(n) => n,
            Err(e) if e == libc::EINTR => 0,
            Err(e) => {
                log::error!("io_getevents failed: errno {}", e);
                panic!("io_getevents: errno {}", e);
            }
        }
    }
}

impl Drop for GeneralAioContext {
    fn drop(&mut self) {
        io_destroy(self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernio_core::completion::{CompletionKey, CompletionKind};
    use kernio_core::fd::FileDesc;

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
    fn poll_iocb_round_trip_via_getevents() {
        if !aio_available() {
            return;
        }
        let efd = FileDesc::eventfd(0).unwrap();
        let mut ctx = GeneralAioContext::new(4).unwrap();

        let mut io = make_poll_iocb(efd.get(), libc::POLLIN as u32);
        set_user_data(&mut io, CompletionKey::new(CompletionKind::SmpWakeup, 0));
        let mut io = Box::new(io);
        ctx.queue(&mut *io);
        assert_eq!(ctx.flush(), 1);

        efd.write_one().unwrap();

        let mut buf = [IoEvent::zeroed(); 4];
        let mut n = 0;
        for _ in 0..1000 {
            n = ctx.getevents_now(0, &mut buf);
            if n > 0 {
                break;
            }
            std::thread::yield_now();
        }
        assert_eq!(n, 1);
        assert_eq!(buf[0].key().kind(), CompletionKind::SmpWakeup);
        assert!(buf[0].res as u32 & libc::POLLIN as u32 != 0);
    }

    #[test]
    fn nowait_flag_toggles() {
        let mut io = make_read_iocb(3, 0, 0x1000, 4096);
        set_nowait(&mut io, true);
        assert_eq!(io.aio_rw_flags & RWF_NOWAIT, RWF_NOWAIT);
        set_nowait(&mut io, false);
        assert_eq!(io.aio_rw_flags & RWF_NOWAIT, 0);
    }
}
