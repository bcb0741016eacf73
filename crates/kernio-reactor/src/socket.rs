//! Shared socket helpers: nonblocking syscall first, then one readiness
//! round per would-block, then try again. The backends delegate their
//! accept/connect/read_some/write_some surface here; protocol-level
//! behavior is owned by the socket module of the runtime, not by the
//! backends.
//!
//! Helpers borrow the `Reactor` shared, taking a short exclusive re-borrow
//! around each backend call, so the loop can pump events while a helper
//! future is suspended.

use crate::backend::Reactor;
use crate::fd_slab::PollableFd;
use kernio_core::error::{errno, Error, Result};
use kernio_core::fd::FileDesc;

pub async fn read_some(r: &Reactor, fd: &PollableFd, buf: &mut [u8]) -> Result<usize> {
    loop {
        let raw = r.raw_fd(fd);
        let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => r.readable(fd).await?,
            libc::EINTR => continue,
            e => return Err(Error::Os(e)),
        }
    }
}

pub async fn write_some(r: &Reactor, fd: &PollableFd, buf: &[u8]) -> Result<usize> {
    loop {
        let raw = r.raw_fd(fd);
        let n = unsafe { libc::write(raw, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => r.writeable(fd).await?,
            libc::EINTR => continue,
            e => return Err(Error::Os(e)),
        }
    }
}

pub async fn write_some_vectored(r: &Reactor, fd: &PollableFd, iov: &[libc::iovec]) -> Result<usize> {
    loop {
        let raw = r.raw_fd(fd);
        let n = unsafe { libc::writev(raw, iov.as_ptr(), iov.len() as libc::c_int) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match errno() {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => r.writeable(fd).await?,
            libc::EINTR => continue,
            e => return Err(Error::Os(e)),
        }
    }
}

/// Accept one connection. Waits on both edges: a listener that was shut
/// down reports its error through the write side.
pub async fn accept(
    r: &Reactor,
    listenfd: &PollableFd,
) -> Result<(FileDesc, libc::sockaddr_storage)> {
    loop {
        let raw = r.raw_fd(listenfd);
        let mut addr: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut addrlen = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        let fd = unsafe {
            libc::accept4(
                raw,
                &mut addr as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut addrlen,
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if fd >= 0 {
            return Ok((FileDesc::from_raw(fd), addr));
        }
        match errno() {
            e if e == libc::EAGAIN || e == libc::EWOULDBLOCK => {
                r.readable_or_writeable(listenfd).await?
            }
            libc::EINTR => continue,
            e => return Err(Error::Os(e)),
        }
    }
}

pub async fn connect(
    r: &Reactor,
    fd: &PollableFd,
    addr: &libc::sockaddr_storage,
    addrlen: libc::socklen_t,
) -> Result<()> {
    let raw = r.raw_fd(fd);
    let rc = unsafe {
        libc::connect(
            raw,
            addr as *const libc::sockaddr_storage as *const libc::sockaddr,
            addrlen,
        )
    };
    if rc == 0 {
        return Ok(());
    }
    match errno() {
        libc::EINPROGRESS => {}
        e => return Err(Error::Os(e)),
    }
    r.writeable(fd).await?;

    // The connection outcome is reported through SO_ERROR.
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut libc::c_int as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(Error::Os(errno()));
    }
    if err != 0 {
        return Err(Error::Os(err));
    }
    Ok(())
}
