//! The storage sink: the runtime's pending-request inbox.
//!
//! The scheduler's I/O queues push `(request, completion)` pairs here; the
//! backend drains them from `kernel_submit_work`. The queue is bounded and
//! lock-free; a full sink is backpressure the caller keeps.

use crate::completion::StorageCompletion;
use crate::request::IoRequest;
use crossbeam_queue::ArrayQueue;

pub struct PendingIo {
    pub req: IoRequest,
    pub completion: StorageCompletion,
}

pub struct IoSink {
    queue: ArrayQueue<PendingIo>,
}

impl IoSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
        }
    }

    /// Queue one storage request. On a full sink the pair is handed back so
    /// the caller can retry after the next reap.
    pub fn submit(
        &self,
        req: IoRequest,
        completion: StorageCompletion,
    ) -> Result<(), PendingIo> {
        self.queue.push(PendingIo { req, completion })
    }

    /// Pop the oldest pending request, if any.
    pub fn pop(&self) -> Option<PendingIo> {
        self.queue.pop()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};
    use std::sync::Arc;

    #[test]
    fn sink_is_fifo_and_bounded() {
        let sink = IoSink::with_capacity(2);
        let seen = Arc::new(AtomicI64::new(0));

        for i in 0..2 {
            let seen = seen.clone();
            sink.submit(
                IoRequest::fdatasync(i),
                Box::new(move |res| {
                    seen.store(res, Ordering::Relaxed);
                }),
            )
            .unwrap_or_else(|_| panic!("sink full early"));
        }
        assert!(sink
            .submit(IoRequest::fdatasync(9), Box::new(|_| {}))
            .is_err());

        let first = sink.pop().unwrap();
        assert_eq!(first.req.fd, 0);
        (first.completion)(42);
        assert_eq!(seen.load(Ordering::Relaxed), 42);
        assert_eq!(sink.pop().unwrap().req.fd, 1);
        assert!(sink.pop().is_none());
    }
}
