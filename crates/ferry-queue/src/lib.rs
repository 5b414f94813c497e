//! Durable, lock-aware work queue.
//!
//! A [`Queue`] mediates access to records persisted in an
//! [`ItemStore`](ferry_meta::ItemStore). All state (the lock table, waiters,
//! armed timers) is owned by a single actor task; the public API talks to it
//! over channels, so per-id operations are strictly serialized.
//!
//! Consumers either take a specific record ([`Queue::get_by_id`]), the next
//! free record matching a predicate ([`Queue::get_next`]), or the next record
//! whose scheduled time has come ([`Queue::get_next_scheduled`]). Every item
//! handed out is locked until released with [`Queue::release`] or
//! [`Queue::release_and_update`]; [`Queue::process`] pairs the two for you.

mod actor;
mod error;
mod queue;
mod request;

pub use error::QueueError;
pub use queue::{Entry, Queue, Release};
pub use request::{GetNextRequest, GetNextScheduledRequest};

#[cfg(test)]
mod tests;
