use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Mutex, PoisonError, RwLock};
use std::thread;

use flume::{Receiver, Selector, Sender};
use tracing::{debug, error, info};

use crate::errors::{DispatcherError, Result};

/// An opaque unit of work executed on the dispatch thread.
pub type WorkItem = Box<dyn FnOnce() + Send + 'static>;

/// Configuration options for the dispatcher
#[derive(Debug, Clone, Default)]
pub struct DispatcherOptions {
    // When true, the dispatch thread is detached when the Dispatcher is
    // dropped and does not keep the owner waiting; when false, dropping the
    // Dispatcher joins the thread so queued actions finish first.
    // Affects process-exit behavior only, never dispatch semantics.
    pub use_background_threads: bool,
}

/// Dispatcher serializes the execution of consumer actions onto one dedicated
/// thread, so callbacks supplied by producer threads never run concurrently.
///
/// Actions are routed to one of two FIFO queues:
/// - durable actions survive a connection loss and always execute
/// - transient actions are tied to the connection that produced them and are
///   discarded by [`on_disconnected`](Dispatcher::on_disconnected), since the
///   broker redelivers the unacknowledged messages behind them
#[derive(Debug)]
pub struct Dispatcher {
    durable_tx: Sender<WorkItem>,
    transient_tx: Sender<WorkItem>,
    // purge handle for the transient queue, shared with the dispatch thread
    transient_rx: Receiver<WorkItem>,
    // fired once by shutdown to unblock the dispatch thread's wait
    cancel_tx: Sender<()>,
    // guards enqueue acceptance against shutdown: an append holds the read
    // lock, shutdown flips the flag under the write lock before cancelling,
    // so every accepted action is queued before the drain pass can start
    stopping: RwLock<bool>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
    use_background_threads: bool,
}

impl Dispatcher {
    /// Creates the dispatcher and starts its dispatch thread immediately.
    ///
    /// The worker is a plain OS thread, so it inherits no task- or span-local
    /// state from the constructing thread.
    pub fn new(options: DispatcherOptions) -> Result<Self> {
        let (durable_tx, durable_rx) = flume::unbounded();
        let (transient_tx, transient_rx) = flume::unbounded();
        let (cancel_tx, cancel_rx) = flume::bounded(1);

        let worker_transient_rx = transient_rx.clone();
        let worker = thread::Builder::new()
            .name("consumer dispatch".to_string())
            .spawn(move || dispatch_loop(durable_rx, worker_transient_rx, cancel_rx))?;

        Ok(Dispatcher {
            durable_tx,
            transient_tx,
            transient_rx,
            cancel_tx,
            stopping: RwLock::new(false),
            worker: Mutex::new(Some(worker)),
            use_background_threads: options.use_background_threads,
        })
    }

    /// Queues an action for execution on the dispatch thread.
    ///
    /// With `survive_disconnect` set, the action goes to the durable queue and
    /// runs even across a connection interruption; otherwise it goes to the
    /// transient queue and is thrown away by the next
    /// [`on_disconnected`](Dispatcher::on_disconnected) call.
    ///
    /// Enqueueing is fire-and-forget: the caller never observes the outcome of
    /// the action itself.
    ///
    /// # Errors
    /// Returns [`DispatcherError::Stopping`] once shutdown has begun.
    pub fn queue_action<F>(&self, action: F, survive_disconnect: bool) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let stopping = self.stopping.read().unwrap_or_else(PoisonError::into_inner);
        if *stopping {
            return Err(DispatcherError::Stopping);
        }

        let queue = if survive_disconnect {
            &self.durable_tx
        } else {
            &self.transient_tx
        };

        // unbounded send only fails once the dispatch thread has exited, which
        // the stopping flag rules out while the read guard is held
        queue
            .send(Box::new(action))
            .map_err(|_| DispatcherError::Stopping)
    }

    /// Discards every transient action still waiting in the queue and returns
    /// how many were removed.
    ///
    /// The broker redelivers any in-flight messages that were not acked when
    /// the connection was lost, so running their queued delivery callbacks
    /// against the new connection would be incorrect. Durable actions and an
    /// action already mid-execution are unaffected.
    pub fn on_disconnected(&self) -> usize {
        let discarded = self.transient_rx.drain().count();

        if discarded > 0 {
            debug!(discarded, "queued transient actions were thrown away");
        }
        discarded
    }

    /// Stops accepting new actions and signals the dispatch thread to drain
    /// both queues and exit.
    ///
    /// Does not wait for the drain; safe to call from any thread and more than
    /// once. After the first call every `queue_action` fails with
    /// [`DispatcherError::Stopping`].
    pub fn shutdown(&self) {
        {
            let mut stopping = self
                .stopping
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *stopping {
                return;
            }
            *stopping = true;
        }

        let _ = self.cancel_tx.try_send(());
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        self.shutdown();

        if !self.use_background_threads {
            let worker = self
                .worker
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(worker) = worker {
                let _ = worker.join();
            }
        }
    }
}

enum Polled {
    Durable(WorkItem),
    Transient(WorkItem),
    Cancelled,
}

/// Main loop of the dispatch thread: block fairly on both queues, execute one
/// action at a time, and once cancelled drain whatever is left before exiting.
fn dispatch_loop(
    durable_rx: Receiver<WorkItem>,
    transient_rx: Receiver<WorkItem>,
    cancel_rx: Receiver<()>,
) {
    info!("consumer dispatch thread started");

    loop {
        let polled = Selector::new()
            .recv(&durable_rx, |r| r.map_or(Polled::Cancelled, Polled::Durable))
            .recv(&transient_rx, |r| {
                r.map_or(Polled::Cancelled, Polled::Transient)
            })
            .recv(&cancel_rx, |_| Polled::Cancelled)
            .wait();

        match polled {
            Polled::Durable(action) => run_action(action, "durable"),
            Polled::Transient(action) => run_action(action, "transient"),
            Polled::Cancelled => break,
        }
    }

    // appends are rejected once shutdown begins, so both queues can only
    // shrink from here
    let mut drained = true;
    while drained {
        drained = false;
        if let Ok(action) = durable_rx.try_recv() {
            run_action(action, "durable");
            drained = true;
        }
        if let Ok(action) = transient_rx.try_recv() {
            run_action(action, "transient");
            drained = true;
        }
    }

    info!("consumer dispatch thread finished");
}

/// Runs a single action, isolating any panic so it cannot take down the
/// dispatch thread or affect the actions queued behind it.
fn run_action(action: WorkItem, queue: &str) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(action)) {
        error!(
            queue,
            panic = panic_message(panic.as_ref()),
            "queued action panicked on the dispatch thread"
        );
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg
    } else {
        "non-string panic payload"
    }
}
