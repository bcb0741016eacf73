//! Owned file descriptors and the small set of fd constructors the
//! backends need: monotonic timer fds, eventfds, pipes.
//!
//! `FileDesc` closes on drop. Timer and eventfd expiry reads tolerate a
//! zero-byte outcome: the descriptors are nonblocking and several waiters
//! can observe the same edge, so a drained counter is not an error.

use crate::error::{errno, Error, Result};
use std::os::unix::io::RawFd;

#[derive(Debug)]
pub struct FileDesc {
    fd: RawFd,
}

impl FileDesc {
    /// Take ownership of `fd`; it will be closed on drop.
    pub fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }

    #[inline]
    pub fn get(&self) -> RawFd {
        self.fd
    }

    /// Monotonic-clock timer fd, nonblocking, close-on-exec.
    pub fn timerfd() -> Result<Self> {
        let fd = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if fd < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(Self { fd })
    }

    /// Semaphore-less eventfd, nonblocking, close-on-exec.
    pub fn eventfd(init: u32) -> Result<Self> {
        let fd = unsafe { libc::eventfd(init, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(Self { fd })
    }

    /// Nonblocking close-on-exec pipe pair (read end, write end).
    pub fn pipe() -> Result<(Self, Self)> {
        let mut fds = [0 as RawFd; 2];
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) };
        if r < 0 {
            return Err(Error::Os(errno()));
        }
        Ok((Self { fd: fds[0] }, Self { fd: fds[1] }))
    }

    /// Arm the timer fd at an absolute monotonic deadline.
    pub fn timerfd_settime_abs(&self, its: &libc::itimerspec) -> Result<()> {
        let r = unsafe {
            libc::timerfd_settime(self.fd, libc::TFD_TIMER_ABSTIME, its, std::ptr::null_mut())
        };
        if r < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(())
    }

    /// Disarm the timer fd.
    pub fn timerfd_disarm(&self) -> Result<()> {
        let zero: libc::itimerspec = unsafe { std::mem::zeroed() };
        let r = unsafe {
            libc::timerfd_settime(self.fd, libc::TFD_TIMER_ABSTIME, &zero, std::ptr::null_mut())
        };
        if r < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(())
    }

    /// Drain the 8-byte expiry/wakeup counter. Returns the counter value,
    /// or 0 on a spurious wakeup (EAGAIN or short read).
    pub fn read_count(&self) -> u64 {
        read_count_raw(self.fd)
    }

    /// Bump an eventfd counter by one. EAGAIN means the counter is already
    /// saturated, which implies a wakeup is pending anyway.
    pub fn write_one(&self) -> Result<()> {
        let val: u64 = 1;
        let r = unsafe {
            libc::write(self.fd, &val as *const u64 as *const libc::c_void, 8)
        };
        if r < 0 {
            let e = errno();
            if e == libc::EAGAIN {
                return Ok(());
            }
            return Err(Error::Os(e));
        }
        Ok(())
    }

    pub fn set_nonblock(&self) -> Result<()> {
        let flags = unsafe { libc::fcntl(self.fd, libc::F_GETFL) };
        if flags < 0 {
            return Err(Error::Os(errno()));
        }
        let r = unsafe { libc::fcntl(self.fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if r < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(())
    }

    pub fn shutdown(&self, how: libc::c_int) -> Result<()> {
        let r = unsafe { libc::shutdown(self.fd, how) };
        if r < 0 {
            return Err(Error::Os(errno()));
        }
        Ok(())
    }
}

impl Drop for FileDesc {
    fn drop(&mut self) {
        if self.fd >= 0 {
            // Safety: we own the descriptor.
            unsafe { libc::close(self.fd) };
            self.fd = -1;
        }
    }
}

/// `read_count` for a descriptor borrowed by raw fd.
pub fn read_count_raw(fd: RawFd) -> u64 {
    let mut count: u64 = 0;
    let r = unsafe { libc::read(fd, &mut count as *mut u64 as *mut libc::c_void, 8) };
    if r == 8 {
        count
    } else {
        0
    }
}

/// Build an absolute `itimerspec` for `nanos_from_now` nanoseconds ahead
/// on the monotonic clock.
pub fn abs_deadline_after(nanos_from_now: u64) -> libc::itimerspec {
    let mut now: libc::timespec = unsafe { std::mem::zeroed() };
    // Safety: plain clock read into a local.
    unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) };
    let total = now.tv_nsec as u64 + nanos_from_now;
    let mut its: libc::itimerspec = unsafe { std::mem::zeroed() };
    its.it_value.tv_sec = now.tv_sec + (total / 1_000_000_000) as libc::time_t;
    its.it_value.tv_nsec = (total % 1_000_000_000) as libc::c_long;
    its
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eventfd_counter_round_trip() {
        let efd = FileDesc::eventfd(0).unwrap();
        assert_eq!(efd.read_count(), 0);
        efd.write_one().unwrap();
        efd.write_one().unwrap();
        assert_eq!(efd.read_count(), 2);
        assert_eq!(efd.read_count(), 0);
    }

    #[test]
    fn timerfd_fires_on_absolute_deadline() {
        let tfd = FileDesc::timerfd().unwrap();
        tfd.timerfd_settime_abs(&abs_deadline_after(1_000_000)).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(tfd.read_count() >= 1);
    }

    #[test]
    fn timerfd_disarm_suppresses_expiry() {
        let tfd = FileDesc::timerfd().unwrap();
        tfd.timerfd_settime_abs(&abs_deadline_after(5_000_000)).unwrap();
        tfd.timerfd_disarm().unwrap();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert_eq!(tfd.read_count(), 0);
    }
}
