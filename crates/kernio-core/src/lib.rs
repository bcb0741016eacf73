//! # kernio-core — contracts between the runtime and its I/O backends
//!
//! This crate defines the shared vocabulary of the kernio system: the
//! storage request/completion types, the readiness-future machinery, the
//! preemption monitor, and the `ReactorShared` collaborator surface that a
//! backend consumes. Backends live in `kernio-reactor`; the runtime proper
//! (scheduler, futures, shards) is a consumer of both.
//!
//! Nothing in this crate issues a kernel request on its own. Everything a
//! backend needs from the runtime flows through `ReactorShared`; everything
//! the runtime needs from a backend flows through the trait defined in
//! `kernio-reactor`.

pub mod completion;
pub mod error;
pub mod fd;
pub mod poll;
pub mod preempt;
pub mod request;
pub mod shared;
pub mod signal;
pub mod sink;

pub use error::{Error, Result};
