//! kernio-smoke — drive one reactor of each selectable backend through
//! the four-step core loop: readiness on a pipe, a storage write, the
//! high-resolution timer, and a preemption request.
//!
//! Usage: kernio-smoke [backend-name ...]
//! With no arguments every selectable backend runs once.

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

/// The core control-flow loop, driving one future to completion: poll,
/// submit, reap, and sleep only when no work was found.
fn run_until<F: Future>(reactor: &Reactor, fut: F) -> F::Output {
    let waker = noop_waker();
    let mut cx = Context::from_waker(&waker);
    let mut fut = Box::pin(fut);
    loop {
        if let Poll::Ready(out) = Pin::new(&mut fut).as_mut().poll(&mut cx) {
            return out;
        }
        let mut worked = reactor.kernel_submit_work();
        worked |= reactor.reap_kernel_completions();
        if !worked && reactor.kernel_events_can_sleep() {
            reactor.wait_and_process_events(None);
        }
    }
}

fn smoke_one(selector: ReactorBackendSelector) {
    let shared = ReactorShared::new(SharedConfig::default()).expect("shared state");
    let backend = match selector.create(shared.clone()) {
        Ok(b) => b,
        Err(e) => {
            log::warn!("{}: not constructible here ({})", selector.name(), e);
            return;
        }
    };
    let reactor = Reactor::new(backend);
    println!("== {} ==", reactor.backend_name());

    // 1. Pipe readiness.
    let (r, w) = FileDesc::pipe().expect("pipe");
    let state = reactor.make_pollable_fd_state(r, Speculation::default());
    let fut = reactor.readable(&state);
    w.write_one().expect("pipe write");
    run_until(&reactor, fut).expect("readable");
    reactor.forget(state);
    println!("   readiness: pipe edge delivered");

    // 2. A 4 KiB storage write through the sink.
    let mut file = tempfile::tempfile().expect("tempfile");
    file.write_all(&[0u8; 8192]).expect("prefill");
    let result = Arc::new(AtomicI64::new(i64::MIN));
    let result2 = result.clone();
    let buf = vec![0x5au8; 4096];
    shared
        .io_sink()
        .submit(
            IoRequest::write(file.as_raw_fd(), 0, buf.as_ptr(), buf.len(), false),
            Box::new(move |res| result2.store(res, Ordering::Relaxed)),
        )
        .unwrap_or_else(|_| panic!("sink full"));
    reactor.kernel_submit_work();
    while result.load(Ordering::Relaxed) == i64::MIN {
        let worked = reactor.reap_kernel_completions();
        if !worked && reactor.kernel_events_can_sleep() {
            reactor.wait_and_process_events(None);
        }
    }
    println!("   storage: write completed with {}", result.load(Ordering::Relaxed));
    drop(buf);

    // 3. High-resolution timer, one sleep cycle.
    reactor.arm_highres_timer(&abs_deadline_after(1_000_000));
    while shared.highres_serviced() == 0 {
        let mut worked = reactor.kernel_submit_work();
        worked |= reactor.reap_kernel_completions();
        if !worked && reactor.kernel_events_can_sleep() {
            reactor.wait_and_process_events(None);
        }
    }
    println!("   hrtimer: serviced {} time(s)", shared.highres_serviced());

    // 4. Preemption request.
    reactor.start_tick();
    reactor.reset_preemption_monitor();
    reactor.request_preemption();
    let observed = kernio_core::preempt::need_preempt()
        || shared.preemption_monitor().head.load(Ordering::Relaxed) != 0;
    reactor.stop_tick();
    kernio_core::preempt::set_need_preempt_var(std::ptr::null());
    println!("   preempt: request observable = {}", observed);
}

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let selectors: Vec<ReactorBackendSelector> = if args.is_empty() {
        ReactorBackendSelector::available()
    } else {
        args.iter()
            .filter_map(|name| {
                let s = ReactorBackendSelector::from_name(name);
                if s.is_none() {
                    log::error!("unknown backend: {}", name);
                }
                s
            })
            .collect()
    };

    println!(
        "selectable: {:?}, default: {}",
        ReactorBackendSelector::available()
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>(),
        ReactorBackendSelector::default_backend().name(),
    );

    for selector in selectors {
        smoke_one(selector);
    }
}
