//! Request types for [`Queue::get_next`](crate::Queue::get_next) and
//! [`Queue::get_next_scheduled`](crate::Queue::get_next_scheduled).
//!
//! The `filter` and `scheduled_at` callbacks run inside the queue's actor
//! task, serialized with every other queue operation. They must be pure and
//! fast: no I/O, no locks, no panics, and the same answer for the same item.

use std::sync::Arc;
use std::time::SystemTime;

use ferry_meta::StoreQuery;

/// In-memory predicate over a record.
pub type ItemFilter<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Time at which a record becomes eligible.
pub type ScheduledAt<T> = Arc<dyn Fn(&T) -> SystemTime + Send + Sync>;

/// Ask for the next free item matching a filter.
pub struct GetNextRequest<T> {
    /// Wait for a matching item instead of failing with `NoRows`.
    pub subscribe: bool,
    /// Storage-side filter and order, evaluated before `filter`.
    pub query: StoreQuery,
    /// In-memory predicate. Must be pure and fast.
    pub filter: ItemFilter<T>,
}

impl<T> GetNextRequest<T> {
    /// Non-subscribing request over all records.
    pub fn new(filter: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            subscribe: false,
            query: StoreQuery::default(),
            filter: Arc::new(filter),
        }
    }

    /// Block until a matching item appears.
    pub fn subscribe(mut self) -> Self {
        self.subscribe = true;
        self
    }

    /// Narrow the storage-side candidates.
    pub fn query(mut self, query: StoreQuery) -> Self {
        self.query = query;
        self
    }
}

impl<T> Clone for GetNextRequest<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: self.subscribe,
            query: self.query.clone(),
            filter: Arc::clone(&self.filter),
        }
    }
}

/// Ask for the next item matching a filter whose scheduled time has come.
///
/// The earliest candidate in `query` order is chosen; if it is not due yet
/// the queue arms a timer for it, and an earlier matching item released in
/// the meantime pre-empts it.
pub struct GetNextScheduledRequest<T> {
    /// Wait for a matching item instead of failing with `NoRows`.
    pub subscribe: bool,
    /// Storage-side filter and order. Order by the scheduled time field so
    /// the earliest item is considered first.
    pub query: StoreQuery,
    /// In-memory predicate. Must be pure and fast.
    pub filter: ItemFilter<T>,
    /// Eligibility time of an item. Must be pure and fast.
    pub scheduled_at: ScheduledAt<T>,
}

impl<T> GetNextScheduledRequest<T> {
    /// Non-subscribing request over all records.
    pub fn new(
        filter: impl Fn(&T) -> bool + Send + Sync + 'static,
        scheduled_at: impl Fn(&T) -> SystemTime + Send + Sync + 'static,
    ) -> Self {
        Self {
            subscribe: false,
            query: StoreQuery::default(),
            filter: Arc::new(filter),
            scheduled_at: Arc::new(scheduled_at),
        }
    }

    /// Block until a matching item appears.
    pub fn subscribe(mut self) -> Self {
        self.subscribe = true;
        self
    }

    /// Narrow the storage-side candidates.
    pub fn query(mut self, query: StoreQuery) -> Self {
        self.query = query;
        self
    }
}

impl<T> Clone for GetNextScheduledRequest<T> {
    fn clone(&self) -> Self {
        Self {
            subscribe: self.subscribe,
            query: self.query.clone(),
            filter: Arc::clone(&self.filter),
            scheduled_at: Arc::clone(&self.scheduled_at),
        }
    }
}
