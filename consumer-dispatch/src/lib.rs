//! Consumer-Dispatch
//!
//! Consumer-Dispatch -- serializes the consumer-side actions of a messaging
//! client onto a single dedicated dispatch thread.
//!
//! Producer threads (socket readers, heartbeat timers, reconnection logic)
//! enqueue opaque actions without blocking; one dispatch thread executes them
//! in FIFO order per queue, so user callbacks never run concurrently with each
//! other. Actions are routed to one of two queues: durable actions run even
//! across a connection interruption, transient actions are tied to the
//! connection instance that produced them and are thrown away on disconnect,
//! because the broker redelivers the unacknowledged messages behind them.

mod dispatcher;
pub use dispatcher::{Dispatcher, DispatcherOptions, WorkItem};

pub mod errors;
pub use errors::DispatcherError;
