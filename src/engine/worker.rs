//! # Worker Pool
//!
//! Application handlers run on dedicated OS threads, never on the tokio
//! runtime, so a slow or blocking handler cannot stall the I/O tasks.
//!
//! Workers take requests from the shared [`RequestQueue`] and pass each event
//! to the sink (normally the [`Dispatcher`](crate::protocol::dispatcher::Dispatcher)).
//! A panicking handler is logged and the worker carries on.
//!
//! With more than one worker, events of the same session may be handled
//! concurrently and can complete out of order.

use crate::error::Result;
use crate::protocol::event::EventSink;
use crate::protocol::request::RequestQueue;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

pub struct WorkerPool {
    queue: Arc<RequestQueue>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `count` handler threads (at least one).
    pub fn start(count: usize, queue: Arc<RequestQueue>, sink: Arc<dyn EventSink>) -> Result<Self> {
        let count = count.max(1);
        let workers = (0..count)
            .map(|index| {
                let queue = queue.clone();
                let sink = sink.clone();
                thread::Builder::new()
                    .name(format!("gamewire-handler-{index}"))
                    .spawn(move || run_worker(index, &queue, sink.as_ref()))
            })
            .collect::<std::io::Result<Vec<_>>>()?;

        info!(workers = count, "Handler workers started");
        Ok(Self { queue, workers })
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    /// Close the queue, let workers drain what is left, and join them.
    pub fn shutdown(self) {
        self.queue.close();
        for worker in self.workers {
            let name = worker.thread().name().map(str::to_owned);
            if worker.join().is_err() {
                error!(worker = ?name, "Handler worker terminated abnormally");
            }
        }
        info!("Handler workers stopped");
    }
}

fn run_worker(index: usize, queue: &RequestQueue, sink: &dyn EventSink) {
    debug!(worker = index, "Handler worker started");
    while let Some(request) = queue.take() {
        let kind = request.event().kind();
        let event = request.into_event();
        if catch_unwind(AssertUnwindSafe(|| sink.emit(event))).is_err() {
            error!(worker = index, event = %kind, "Event handler panicked");
        }
    }
    debug!(worker = index, "Handler worker exiting");
}
