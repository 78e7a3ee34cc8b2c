//! Background work scheduled from the audio thread.
//!
//! A plugin that needs disk access or heavy computation hands a small request
//! to [`WorkScheduler::schedule_work`]. A dedicated thread runs the
//! [`WorkHandler`] and may answer through a [`Responder`]; answers are picked
//! up on a later block with [`WorkScheduler::deliver_responses`].
//!
//! Scheduling never blocks: a full request ring is reported as
//! [`WorkStatus::NoSpace`] and retrying is up to the caller.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, Thread};

use tracing::debug;

use crate::config::WorkerConfig;
use crate::error::{fatal, Error, Result};
use crate::ring::{frame_ring, FrameReader, FrameWriter};

const REQUEST: u32 = 1;
const RESPONSE: u32 = 2;

/// Outcome of a schedule or respond call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkStatus {
    Success,
    /// The ring is full right now.
    NoSpace,
    /// The message exceeds the configured maximum size.
    TooLarge,
}

/// Runs on the worker thread; blocking is fine here.
pub trait WorkHandler: Send + 'static {
    fn work(&mut self, request: &[u8], responder: &mut Responder<'_>);
}

impl<F> WorkHandler for F
where
    F: FnMut(&[u8], &mut Responder<'_>) + Send + 'static,
{
    fn work(&mut self, request: &[u8], responder: &mut Responder<'_>) {
        self(request, responder)
    }
}

/// Posts answers back towards the audio thread.
pub struct Responder<'a> {
    responses: &'a mut FrameWriter,
}

impl Responder<'_> {
    pub fn respond(&mut self, response: &[u8]) -> WorkStatus {
        write_status(self.responses.write(RESPONSE, &[], response))
    }
}

/// Audio-thread side of a worker.
pub struct WorkScheduler {
    requests: FrameWriter,
    responses: FrameReader,
    worker: Thread,
}

impl WorkScheduler {
    /// Queue `request` for the worker and wake it.
    pub fn schedule_work(&mut self, request: &[u8]) -> WorkStatus {
        let status = write_status(self.requests.write(REQUEST, &[], request));
        if status == WorkStatus::Success {
            self.worker.unpark();
        }
        status
    }

    /// Pass every response received so far to `f`, in order.
    ///
    /// Errors mean the response ring is corrupted.
    pub fn deliver_responses(&mut self, mut f: impl FnMut(&[u8])) -> Result<usize> {
        let mut count = 0;
        while let Some(frame) = self.responses.read()? {
            f(frame.blob);
            count += 1;
        }
        Ok(count)
    }

    pub fn has_pending_responses(&self) -> bool {
        self.responses.pending() > 0
    }
}

/// Owner of the worker thread. Dropping it stops and joins the thread.
pub struct WorkerThread {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn name(&self) -> Option<&str> {
        self.handle.as_ref().and_then(|handle| handle.thread().name())
    }

    /// Stop the thread after its current request and wait for it.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        self.shutdown.store(true, Ordering::Release);
        handle.thread().unpark();
        if handle.join().is_err() {
            tracing::error!("worker thread panicked");
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start a worker thread running `handler`.
pub fn spawn_worker(
    mut handler: impl WorkHandler,
    config: &WorkerConfig,
) -> Result<(WorkScheduler, WorkerThread)> {
    let (request_tx, mut request_rx) = frame_ring(config.request_capacity, config.max_message_size)?;
    let (mut response_tx, response_rx) =
        frame_ring(config.response_capacity, config.max_message_size)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let stop = shutdown.clone();
    let idle_timeout = config.idle_timeout;
    let name = config.name.clone();

    let handle = thread::Builder::new()
        .name(config.name.clone())
        .spawn(move || {
            debug!(worker = %name, "worker started");
            while !stop.load(Ordering::Acquire) {
                let mut handled = 0usize;
                loop {
                    let frame = match request_rx.read() {
                        Ok(Some(frame)) => frame,
                        Ok(None) => break,
                        Err(err) => fatal(err),
                    };
                    let mut responder = Responder {
                        responses: &mut response_tx,
                    };
                    handler.work(frame.blob, &mut responder);
                    handled += 1;
                }
                if handled == 0 {
                    thread::park_timeout(idle_timeout);
                }
            }
            debug!(worker = %name, "worker stopped");
        })
        .map_err(Error::WorkerSpawn)?;

    let scheduler = WorkScheduler {
        requests: request_tx,
        responses: response_rx,
        worker: handle.thread().clone(),
    };
    let thread = WorkerThread {
        shutdown,
        handle: Some(handle),
    };
    Ok((scheduler, thread))
}

fn write_status(result: Result<()>) -> WorkStatus {
    match result {
        Ok(()) => WorkStatus::Success,
        Err(Error::FrameTooLarge { .. }) => WorkStatus::TooLarge,
        Err(_) => WorkStatus::NoSpace,
    }
}
