//! # kernio-reactor — the kernel-facing I/O backends
//!
//! One backend instance runs per core and multiplexes readiness polling,
//! storage AIO and the two steady-clock timers for that core's loop. Three
//! implementations exist behind the `ReactorBackend` contract:
//!
//! - [`ready_backend::ReadyBackend`] — epoll readiness, storage via the
//!   linux-aio engine, tick via a sibling timer thread.
//! - [`aio_backend::AioBackend`] — everything through linux-aio rings;
//!   readiness as poll-type control blocks.
//! - [`uring_backend::UringBackend`] — one io_uring for storage, readiness
//!   and timers.
//!
//! [`selector::ReactorBackendSelector`] probes what the host kernel offers
//! and instantiates one of them. The runtime's loop drives the backend
//! through four entry points per iteration: run tasks, submit kernel work,
//! reap completions, and (only when idle and safe) wait.

pub mod aio_abi;
pub mod aio_backend;
pub mod backend;
pub mod fd_slab;
pub mod preempt_io;
pub mod ready_backend;
pub mod selector;
pub mod socket;
pub mod storage;
pub mod uring_backend;

pub use backend::{Backend, Reactor, ReactorBackend};
pub use fd_slab::PollableFd;
pub use selector::ReactorBackendSelector;
