//! # dispatchq
//!
//! Least-loaded request dispatcher over a fixed pool of async workers.
//!
//! Producers submit operations through a [`dispatcher::DispatcherHandle`].
//! A single dispatcher task owns the worker pool, an indexed min-heap keyed
//! by each worker's pending count, and routes every item to the worker with
//! the fewest outstanding items. Workers run their queue one item at a time
//! and report completion back to the dispatcher, which repositions them.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod pool;
pub mod telemetry;
pub mod work;
pub mod worker;

pub use dispatcher::{DispatchConfig, Dispatcher, DispatcherHandle};
pub use error::{Error, Result};
pub use work::{Operation, Ticket};
