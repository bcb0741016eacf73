//! End-to-end scenarios driven through the public loop surface, run
//! against every backend the host kernel can select.

use kernio_core::fd::{abs_deadline_after, FileDesc};
use kernio_core::poll::Speculation;
use kernio_core::request::IoRequest;
use kernio_core::shared::{ReactorShared, SharedConfig};
use kernio_reactor::{Reactor, ReactorBackendSelector};
use std::future::Future;
use std::io::Write as _;
use std::os::unix::io::AsRawFd;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

fn noop_waker() -> Waker {
    fn clone(_: *const ()) -> RawWaker {
        RawWaker::new(std::ptr::null(), &VTABLE)
    }
    fn noop(_: *const ()) {}
    static VTABLE: RawWakerVTable = RawWakerVTable::new(clone, noop, noop, noop);
    unsafe { Waker::from_raw(RawWaker::new(std::ptr::null(), &VTABLE)) }
}

/// One reactor per selectable backend.
fn reactors() -> Vec<(Arc<ReactorShared>, Reactor)> {
    ReactorBackendSelector::available()
        .into_iter()
        .filter_map(|sel| {
            let shared = ReactorShared::new(SharedConfig::default()).ok()?;
            let backend = sel.create(shared.clone()).ok()?;
            Some((shared, Reactor::new(backend)))
        })
        .collect()
}

/// The per-core loop from the runtime, reduced to what a single future
/// needs: poll, submit, reap, and sleep only when no work was found.
fn run_until<F: Future>(reactor: &Reactor, fut: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    for _ in 0..100_000 {
        if let Poll::Ready(out) = Pin::new(&mut fut).as_mut().poll(&mut cx) {
            return out;
        }
        let mut worked = reactor.kernel_submit_work();
        worked |= reactor.reap_kernel_completions();
        if !worked && reactor.kernel_events_can_sleep() {
            reactor.wait_and_process_events(None);
        }
    }
    panic!("future did not resolve");
}

#[test]
fn pipe_readable_resolves_within_one_wait() {
    for (_shared, reactor) in reactors() {
        let (r, w) = FileDesc::pipe().unwrap();
        let state = reactor.make_pollable_fd_state(r, Speculation::default());

        let fut = reactor.readable(&state);
        w.write_one().unwrap();
        run_until(&reactor, fut).unwrap();
        reactor.forget(state);
    }
}

#[test]
fn second_readable_consults_the_kernel_again() {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    for (_shared, reactor) in reactors() {
        let (r, w) = FileDesc::pipe().unwrap();
        let state = reactor.make_pollable_fd_state(r, Speculation::default());

        let fut = reactor.readable(&state);
        w.write_one().unwrap();
        run_until(&reactor, fut).unwrap();

        // Drain the pipe so no level-triggered readiness remains.
        let raw = reactor.raw_fd(&state);
        let mut sink = [0u8; 64];
        unsafe { libc::read(raw, sink.as_mut_ptr() as *mut libc::c_void, sink.len()) };

        // A second future goes back to the kernel: nothing cached, so a
        // submit-and-reap round leaves it pending.
        let mut fut2 = Box::pin(reactor.readable(&state));
        reactor.kernel_submit_work();
        reactor.reap_kernel_completions();
        assert!(
            Pin::new(&mut fut2).as_mut().poll(&mut cx).is_pending(),
            "backend {}",
            reactor.backend_name()
        );

        w.write_one().unwrap();
        run_until(&reactor, fut2).unwrap();
        reactor.forget(state);
    }
}

#[test]
fn storage_write_has_identical_result_semantics_everywhere() {
    for (shared, reactor) in reactors() {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[0u8; 8192]).unwrap();

        let result = Arc::new(AtomicI64::new(i64::MIN));
        let result2 = result.clone();
        let buf = vec![0xabu8; 4096];
        shared
            .io_sink()
            .submit(
                IoRequest::write(file.as_raw_fd(), 0, buf.as_ptr(), buf.len(), false),
                Box::new(move |res| result2.store(res, Ordering::Relaxed)),
            )
            .unwrap_or_else(|_| panic!("sink full"));

        assert!(reactor.kernel_submit_work(), "{}", reactor.backend_name());
        for _ in 0..100_000 {
            if result.load(Ordering::Relaxed) != i64::MIN {
                break;
            }
            let worked = reactor.reap_kernel_completions();
            if !worked && reactor.kernel_events_can_sleep() {
                reactor.wait_and_process_events(None);
            }
        }
        assert_eq!(
            result.load(Ordering::Relaxed),
            4096,
            "backend {}",
            reactor.backend_name()
        );

        // With nothing submitted since, two empty reaps in a row mean no
        // completion can still be pending.
        reactor.reap_kernel_completions();
        assert!(!reactor.reap_kernel_completions());
        drop(buf);
    }
}

#[test]
fn closed_descriptor_surfaces_ebadf_and_pool_survives() {
    for (shared, reactor) in reactors() {
        let bad = Arc::new(AtomicI64::new(i64::MIN));
        let bad2 = bad.clone();
        let mut scratch = [0u8; 64];
        shared
            .io_sink()
            .submit(
                IoRequest::read(-1, 0, scratch.as_mut_ptr(), scratch.len(), false),
                Box::new(move |res| bad2.store(res, Ordering::Relaxed)),
            )
            .unwrap_or_else(|_| panic!("sink full"));

        reactor.kernel_submit_work();
        for _ in 0..100_000 {
            if bad.load(Ordering::Relaxed) != i64::MIN {
                break;
            }
            reactor.reap_kernel_completions();
        }
        assert_eq!(
            bad.load(Ordering::Relaxed),
            -(libc::EBADF as i64),
            "backend {}",
            reactor.backend_name()
        );

        // Subsequent submissions are unaffected.
        let ok = Arc::new(AtomicI64::new(i64::MIN));
        let ok2 = ok.clone();
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(&[5u8; 256]).unwrap();
        let mut buf = vec![0u8; 256];
        shared
            .io_sink()
            .submit(
                IoRequest::read(file.as_raw_fd(), 0, buf.as_mut_ptr(), buf.len(), false),
                Box::new(move |res| ok2.store(res, Ordering::Relaxed)),
            )
            .unwrap_or_else(|_| panic!("sink full"));
        reactor.kernel_submit_work();
        for _ in 0..100_000 {
            if ok.load(Ordering::Relaxed) != i64::MIN {
                break;
            }
            let worked = reactor.reap_kernel_completions();
            if !worked && reactor.kernel_events_can_sleep() {
                reactor.wait_and_process_events(None);
            }
        }
        assert_eq!(ok.load(Ordering::Relaxed), 256);
    }
}

#[test]
fn highres_timer_services_exactly_once_per_sleep_cycle() {
    for (shared, reactor) in reactors() {
        reactor.arm_highres_timer(&abs_deadline_after(1_000_000));
        for _ in 0..100_000 {
            if shared.highres_serviced() != 0 {
                break;
            }
            let mut worked = reactor.kernel_submit_work();
            worked |= reactor.reap_kernel_completions();
            if !worked && reactor.kernel_events_can_sleep() {
                reactor.wait_and_process_events(None);
            }
        }
        assert_eq!(shared.highres_serviced(), 1, "backend {}", reactor.backend_name());
    }
}

#[test]
fn preemption_request_is_promptly_observable() {
    for (shared, reactor) in reactors() {
        reactor.start_tick();
        reactor.reset_preemption_monitor();
        reactor.request_preemption();
        assert!(
            kernio_core::preempt::need_preempt()
                || shared.preemption_monitor().head.load(Ordering::Relaxed) != 0,
            "backend {}",
            reactor.backend_name()
        );
        reactor.stop_tick();
        kernio_core::preempt::set_need_preempt_var(std::ptr::null());
    }
}

#[test]
fn tcp_echo_through_socket_helpers() {
    for (_shared, reactor) in reactors() {
        // Plain loopback listener.
        let listen_raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        assert!(listen_raw >= 0);
        let mut addr: libc::sockaddr_in = unsafe { std::mem::zeroed() };
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = u32::from_be_bytes([127, 0, 0, 1]).to_be();
        addr.sin_port = 0;
        let rc = unsafe {
            libc::bind(
                listen_raw,
                &addr as *const libc::sockaddr_in as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
            )
        };
        assert_eq!(rc, 0);
        assert_eq!(unsafe { libc::listen(listen_raw, 8) }, 0);
        let mut bound: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        let mut bound_len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
        unsafe {
            libc::getsockname(
                listen_raw,
                &mut bound as *mut libc::sockaddr_storage as *mut libc::sockaddr,
                &mut bound_len,
            )
        };

        let listener = reactor.make_pollable_fd_state(
            FileDesc::from_raw(listen_raw),
            Speculation::default(),
        );

        let client_raw = unsafe {
            libc::socket(
                libc::AF_INET,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        assert!(client_raw >= 0);
        let client = reactor.make_pollable_fd_state(
            FileDesc::from_raw(client_raw),
            Speculation::default(),
        );

        run_until(&reactor, reactor.connect(&client, &bound, bound_len)).unwrap();
        let (server_fd, _peer) = run_until(&reactor, reactor.accept(&listener)).unwrap();
        let server = reactor.make_pollable_fd_state(server_fd, Speculation::default());

        let sent = run_until(&reactor, reactor.write_some(&client, b"ping")).unwrap();
        assert_eq!(sent, 4);

        let mut buf = [0u8; 16];
        let got = run_until(&reactor, reactor.read_some(&server, &mut buf)).unwrap();
        assert_eq!(&buf[..got], b"ping");

        reactor.shutdown(&client, libc::SHUT_RDWR);
        reactor.forget(server);
        reactor.forget(client);
        reactor.forget(listener);
    }
}
