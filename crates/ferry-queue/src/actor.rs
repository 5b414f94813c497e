//! The queue's single-writer actor.
//!
//! [`Actor`] owns the lock table and every waiter. It runs as one tokio task
//! fed by a command channel and a channel of timer firings. Nothing here
//! awaits; each command is handled to completion before the next one.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use ferry_meta::{ItemStore, Record, StoreQuery};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::QueueError;
use crate::queue::Entry;
use crate::request::{ItemFilter, ScheduledAt};

type Result<T> = std::result::Result<T, QueueError>;

pub(crate) type ItemReply<T> = oneshot::Sender<Result<T>>;

/// Messages accepted by the actor.
pub(crate) enum Command<T> {
    GetById {
        id: String,
        reply: oneshot::Sender<Result<Entry<T>>>,
    },
    GetNext(Search<T>),
    GetNextScheduled(Search<T>),
    Release {
        id: String,
        update: Option<T>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        request: u64,
    },
}

/// A pending `get_next` / `get_next_scheduled` request.
pub(crate) struct Search<T> {
    pub(crate) request: u64,
    pub(crate) subscribe: bool,
    pub(crate) query: StoreQuery,
    pub(crate) filter: ItemFilter<T>,
    /// Present for scheduled requests only.
    pub(crate) scheduled_at: Option<ScheduledAt<T>>,
    pub(crate) reply: ItemReply<T>,
}

impl<T> Search<T> {
    fn accepts(&self, item: &T) -> bool {
        (self.filter)(item)
    }

    fn due_at(&self, item: &T) -> SystemTime {
        self.scheduled_at.as_ref().map_or(UNIX_EPOCH, |f| f(item))
    }

    fn is_due(&self, item: &T) -> bool {
        self.due_at(item) <= SystemTime::now()
    }

    fn fail(self, err: QueueError) {
        let _ = self.reply.send(Err(err));
    }
}

/// A timer armed for one item on behalf of one scheduled search.
struct Scheduled<T> {
    seq: u64,
    timer: CancellationToken,
    item: T,
    search: Search<T>,
}

/// Timer firing for `id`. Stale firings carry an outdated `seq`.
pub(crate) struct Due {
    id: String,
    seq: u64,
}

pub(crate) struct Actor<T: Record> {
    store: Arc<dyn ItemStore<T>>,
    close: CancellationToken,
    due_tx: mpsc::UnboundedSender<Due>,
    next_seq: u64,

    locked: HashSet<String>,
    get_by_id_waiters: HashMap<String, VecDeque<oneshot::Sender<Result<Entry<T>>>>>,
    get_next_waiters: Vec<Search<T>>,
    get_next_scheduled_waiters: Vec<Search<T>>,
    scheduled: HashMap<String, Scheduled<T>>,
    due_waiters: HashMap<String, VecDeque<Search<T>>>,
}

impl<T: Record> Actor<T> {
    pub(crate) fn new(
        store: Arc<dyn ItemStore<T>>,
        close: CancellationToken,
        due_tx: mpsc::UnboundedSender<Due>,
    ) -> Self {
        Self {
            store,
            close,
            due_tx,
            next_seq: 0,
            locked: HashSet::new(),
            get_by_id_waiters: HashMap::new(),
            get_next_waiters: Vec::new(),
            get_next_scheduled_waiters: Vec::new(),
            scheduled: HashMap::new(),
            due_waiters: HashMap::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command<T>>,
        mut due: mpsc::UnboundedReceiver<Due>,
    ) {
        loop {
            tokio::select! {
                biased;
                _ = self.close.cancelled() => break,
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                Some(fired) = due.recv() => self.handle_due(fired),
            }
        }
        self.shutdown();
        debug!("queue actor stopped");
    }

    fn handle(&mut self, cmd: Command<T>) {
        match cmd {
            Command::GetById { id, reply } => self.handle_get_by_id(id, reply),
            Command::GetNext(search) => self.search_next(search),
            Command::GetNextScheduled(search) => self.search_scheduled(search),
            Command::Release { id, update, reply } => {
                let _ = reply.send(self.handle_release(id, update));
            }
            Command::Cancel { request } => self.handle_cancel(request),
        }
    }

    // ----- Lock helpers -----

    fn is_locked(&self, id: &str) -> bool {
        self.locked.contains(id)
    }

    /// Lock the item and hand it to `search`. Returns the item back if the
    /// caller went away, leaving it unlocked.
    fn deliver(&mut self, search: Search<T>, item: T) -> Option<T> {
        let id = item.id().to_string();
        self.locked.insert(id.clone());
        match search.reply.send(Ok(item)) {
            Ok(()) => {
                trace!(%id, request = search.request, "item handed over");
                None
            }
            Err(returned) => {
                self.locked.remove(&id);
                returned.ok()
            }
        }
    }

    /// Hand an entry to the oldest live `get_by_id` waiter for `id`.
    fn wake_get_by_id(&mut self, id: &str, entry: impl Fn() -> Entry<T>) -> bool {
        let Some(waiters) = self.get_by_id_waiters.get_mut(id) else {
            return false;
        };
        let mut delivered = false;
        while let Some(reply) = waiters.pop_front() {
            self.locked.insert(id.to_string());
            if reply.send(Ok(entry())).is_ok() {
                delivered = true;
                break;
            }
            self.locked.remove(id);
        }
        if waiters.is_empty() {
            self.get_by_id_waiters.remove(id);
        }
        delivered
    }

    // ----- Requests -----

    fn handle_get_by_id(&mut self, id: String, reply: oneshot::Sender<Result<Entry<T>>>) {
        if self.is_locked(&id) {
            self.get_by_id_waiters.entry(id).or_default().push_back(reply);
            return;
        }
        let entry = match self.store.get(&id) {
            Ok(Some(item)) => Entry::Occupied(item),
            Ok(None) => Entry::Vacant(id.clone()),
            Err(e) => {
                let _ = reply.send(Err(e.into()));
                return;
            }
        };
        self.locked.insert(id.clone());
        if reply.send(Ok(entry)).is_err() {
            self.locked.remove(&id);
        }
    }

    fn search_next(&mut self, search: Search<T>) {
        let found = {
            let locked = &self.locked;
            self.store.query(&search.query, &mut |item: &T| {
                !locked.contains(item.id()) && search.accepts(item)
            })
        };
        match found {
            Ok(Some(item)) => {
                if let Some(item) = self.deliver(search, item) {
                    self.offer(item);
                }
            }
            Ok(None) if search.subscribe => self.get_next_waiters.push(search),
            Ok(None) => search.fail(QueueError::NoRows),
            Err(e) => search.fail(e.into()),
        }
    }

    fn search_scheduled(&mut self, search: Search<T>) {
        let found = {
            let locked = &self.locked;
            let scheduled = &self.scheduled;
            self.store.query(&search.query, &mut |item: &T| {
                let id = item.id();
                !locked.contains(id) && !scheduled.contains_key(id) && search.accepts(item)
            })
        };
        match found {
            Ok(Some(item)) if search.is_due(&item) => {
                if let Some(item) = self.deliver(search, item) {
                    self.offer(item);
                }
            }
            Ok(Some(item)) => self.schedule(search, item),
            Ok(None) if search.subscribe => self.get_next_scheduled_waiters.push(search),
            Ok(None) => search.fail(QueueError::NoRows),
            Err(e) => search.fail(e.into()),
        }
    }

    fn schedule(&mut self, search: Search<T>, item: T) {
        let id = item.id().to_string();
        let delay = search
            .due_at(&item)
            .duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO);

        self.next_seq += 1;
        let seq = self.next_seq;
        let timer = self.close.child_token();
        let fire = Due {
            id: id.clone(),
            seq,
        };
        let due_tx = self.due_tx.clone();
        let token = timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    let _ = due_tx.send(fire);
                }
            }
        });

        debug!(%id, request = search.request, ?delay, "item scheduled");
        self.scheduled.insert(
            id,
            Scheduled {
                seq,
                timer,
                item,
                search,
            },
        );
    }

    fn handle_due(&mut self, fired: Due) {
        match self.scheduled.get(&fired.id) {
            Some(entry) if entry.seq == fired.seq => {}
            _ => return,
        }
        let Some(entry) = self.scheduled.remove(&fired.id) else {
            return;
        };
        let search = entry.search;

        if self.is_locked(&fired.id) {
            self.due_waiters.entry(fired.id).or_default().push_back(search);
            return;
        }
        match self.store.get(&fired.id) {
            Ok(Some(item)) if search.accepts(&item) && search.is_due(&item) => {
                if let Some(item) = self.deliver(search, item) {
                    self.offer(item);
                }
            }
            // Changed or vanished underneath the timer; look again.
            Ok(_) => {
                self.search_scheduled(search);
                self.offer_unscheduled(&fired.id);
            }
            Err(e) => search.fail(e.into()),
        }
    }

    fn handle_cancel(&mut self, request: u64) {
        if let Some(pos) = self.get_next_waiters.iter().position(|w| w.request == request) {
            self.get_next_waiters.remove(pos).fail(QueueError::Canceled);
            return;
        }
        if let Some(pos) = self
            .get_next_scheduled_waiters
            .iter()
            .position(|w| w.request == request)
        {
            self.get_next_scheduled_waiters
                .remove(pos)
                .fail(QueueError::Canceled);
            return;
        }
        let scheduled = self
            .scheduled
            .iter()
            .find(|(_, s)| s.search.request == request)
            .map(|(id, _)| id.clone());
        if let Some(id) = scheduled {
            if let Some(entry) = self.scheduled.remove(&id) {
                entry.timer.cancel();
                entry.search.fail(QueueError::Canceled);
            }
            self.offer_unscheduled(&id);
            return;
        }
        let mut emptied = None;
        for (id, waiters) in self.due_waiters.iter_mut() {
            if let Some(pos) = waiters.iter().position(|w| w.request == request) {
                if let Some(search) = waiters.remove(pos) {
                    search.fail(QueueError::Canceled);
                }
                if waiters.is_empty() {
                    emptied = Some(id.clone());
                }
                break;
            }
        }
        if let Some(id) = emptied {
            self.due_waiters.remove(&id);
        }
    }

    // ----- Release and dispatch -----

    fn handle_release(&mut self, id: String, update: Option<T>) -> Result<()> {
        if !self.locked.remove(&id) {
            return Err(QueueError::NotLocked(id));
        }

        let item = match update {
            Some(mut item) => {
                item.set_id(&id);
                if let Err(e) = self.store.set(&id, &item) {
                    warn!(%id, error = %e, "failed to persist released item");
                    // Waiters still get whatever is stored.
                    match self.store.get(&id) {
                        Ok(Some(prev)) => self.offer(prev),
                        Ok(None) => {
                            self.wake_get_by_id(&id, || Entry::Vacant(id.clone()));
                        }
                        Err(_) => {}
                    }
                    return Err(e.into());
                }
                item
            }
            None => match self.store.get(&id)? {
                Some(prev) => prev,
                None => {
                    self.wake_get_by_id(&id, || Entry::Vacant(id.clone()));
                    return Ok(());
                }
            },
        };

        self.offer(item);
        Ok(())
    }

    /// Run the dispatch chain for a free item: re-evaluate armed timers,
    /// then serve `get_by_id`, due, scheduled and plain waiters in that
    /// order, stopping at the first hand-over.
    fn offer(&mut self, item: T) {
        let id = item.id().to_string();
        self.get_next_waiters.retain(|w| !w.reply.is_closed());
        self.get_next_scheduled_waiters.retain(|w| !w.reply.is_closed());

        self.check_in_schedule(&item);
        if self.is_locked(&id) {
            return;
        }

        let occupied = item.clone();
        if self.wake_get_by_id(&id, || Entry::Occupied(occupied.clone())) {
            return;
        }

        if self.serve_due_waiters(&item) || self.is_locked(&id) {
            return;
        }

        if !self.scheduled.contains_key(&id) {
            while let Some(pos) = self
                .get_next_scheduled_waiters
                .iter()
                .position(|w| w.accepts(&item))
            {
                let search = self.get_next_scheduled_waiters.remove(pos);
                if search.is_due(&item) {
                    if self.deliver(search, item.clone()).is_none() {
                        return;
                    }
                } else {
                    self.schedule(search, item.clone());
                    break;
                }
            }
        }

        while let Some(pos) = self.get_next_waiters.iter().position(|w| w.accepts(&item)) {
            let search = self.get_next_waiters.remove(pos);
            if self.deliver(search, item.clone()).is_none() {
                return;
            }
        }
    }

    /// Re-evaluate armed timers against a released item.
    ///
    /// The same item is re-armed if its search still accepts it, otherwise
    /// the search looks for another candidate. A different item's timer is
    /// pre-empted when this item matches the same search, is due earlier and
    /// is not scheduled itself.
    fn check_in_schedule(&mut self, item: &T) {
        let id = item.id();
        let keys: Vec<String> = self.scheduled.keys().cloned().collect();
        let mut displaced = Vec::new();
        for key in keys {
            if key == id {
                let Some(entry) = self.scheduled.remove(&key) else {
                    continue;
                };
                entry.timer.cancel();
                if entry.search.accepts(item) {
                    self.schedule(entry.search, item.clone());
                } else {
                    self.search_scheduled(entry.search);
                }
                continue;
            }

            let preempt = match self.scheduled.get(&key) {
                Some(entry) => {
                    entry.search.accepts(item)
                        && entry.search.due_at(item) < entry.search.due_at(&entry.item)
                        && !self.scheduled.contains_key(id)
                        && !self.is_locked(id)
                }
                None => false,
            };
            if preempt {
                if let Some(entry) = self.scheduled.remove(&key) {
                    entry.timer.cancel();
                    debug!(%id, replaced = %key, "scheduled item pre-empted");
                    self.schedule(entry.search, item.clone());
                    displaced.push(key);
                }
            }
        }
        for key in displaced {
            self.offer_unscheduled(&key);
        }
    }

    /// Offer an item whose timer was just dropped. Scheduled searches
    /// skipped it while it was armed and may be parked waiting for it.
    fn offer_unscheduled(&mut self, id: &str) {
        if self.is_locked(id) || self.scheduled.contains_key(id) {
            return;
        }
        match self.store.get(id) {
            Ok(Some(item)) => self.offer(item),
            Ok(None) => {}
            Err(e) => warn!(%id, error = %e, "failed to re-read unscheduled item"),
        }
    }

    /// Serve searches whose timer fired while `item` was locked. Searches
    /// that no longer accept it look for another candidate.
    fn serve_due_waiters(&mut self, item: &T) -> bool {
        let id = item.id();
        let Some(waiters) = self.due_waiters.remove(id) else {
            return false;
        };

        let mut delivered = false;
        let mut keep = VecDeque::new();
        let mut retry = Vec::new();
        for search in waiters {
            if !search.accepts(item) {
                retry.push(search);
            } else if delivered {
                keep.push_back(search);
            } else if self.deliver(search, item.clone()).is_none() {
                delivered = true;
            }
        }
        if !keep.is_empty() {
            self.due_waiters.insert(id.to_string(), keep);
        }
        for search in retry {
            self.search_scheduled(search);
        }
        delivered
    }

    fn shutdown(&mut self) {
        for (_, waiters) in self.get_by_id_waiters.drain() {
            for reply in waiters {
                let _ = reply.send(Err(QueueError::Closed));
            }
        }
        for (_, waiters) in self.due_waiters.drain() {
            for search in waiters {
                search.fail(QueueError::Closed);
            }
        }
        for (_, entry) in self.scheduled.drain() {
            entry.timer.cancel();
            entry.search.fail(QueueError::Closed);
        }
        for search in self.get_next_waiters.drain(..) {
            search.fail(QueueError::Closed);
        }
        for search in self.get_next_scheduled_waiters.drain(..) {
            search.fail(QueueError::Closed);
        }
    }
}
