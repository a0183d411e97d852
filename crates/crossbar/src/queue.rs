use std::{
    collections::VecDeque,
    sync::{Condvar, Mutex, PoisonError},
    time::{Duration, Instant},
};

use crate::{conn::ConnectionId, lock};

/// Items travelling from caller threads to the IO loop.
pub(crate) enum SendItem {
    /// Encoded user payload bound for a connection.
    Message(ConnectionId, Vec<u8>),
    /// Kick off the outgoing connect for this id. Must be the first item the
    /// queue accepts for the id so the auth token is staged before any
    /// payload.
    Connect(ConnectionId),
    /// Shutdown sentinel, pushed by `stop`.
    Disconnected,
}

impl SendItem {
    /// Control items never count against the byte cap.
    pub(crate) fn byte_size(item: &Self) -> usize {
        match item {
            SendItem::Message(_, payload) => payload.len(),
            SendItem::Connect(_) | SendItem::Disconnected => 0,
        }
    }
}

/// FIFO bounded by the total byte size of its queued items.
///
/// Producers block in [`put`] while the cap would be exceeded; zero-size
/// items are always accepted. Consumers use [`try_get`] or [`get`].
///
/// [`put`]: ByteLimitedQueue::put
/// [`try_get`]: ByteLimitedQueue::try_get
/// [`get`]: ByteLimitedQueue::get
pub struct ByteLimitedQueue<T> {
    inner: Mutex<Inner<T>>,
    not_full: Condvar,
    not_empty: Condvar,
    size_of: fn(&T) -> usize,
}

struct Inner<T> {
    items: VecDeque<T>,
    /// Always equals the summed `size_of` of `items`.
    bytes: usize,
    max_bytes: Option<usize>,
    blocked_producers: usize,
}

impl<T> ByteLimitedQueue<T> {
    pub fn new(size_of: fn(&T) -> usize, max_bytes: Option<usize>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                bytes: 0,
                max_bytes,
                blocked_producers: 0,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
            size_of,
        }
    }

    /// Enqueues, blocking while the byte cap would be exceeded.
    pub fn put(&self, item: T) {
        let size = (self.size_of)(&item);
        let mut inner = lock(&self.inner);
        if size > 0 {
            while inner.max_bytes.is_some_and(|max| inner.bytes + size > max) {
                inner.blocked_producers += 1;
                inner = self.not_full.wait(inner).unwrap_or_else(PoisonError::into_inner);
                inner.blocked_producers -= 1;
            }
        }
        inner.bytes += size;
        inner.items.push_back(item);
        self.not_empty.notify_one();
    }

    pub fn try_get(&self) -> Option<T> {
        let mut inner = lock(&self.inner);
        self.pop_locked(&mut inner)
    }

    /// Blocks until an item arrives or the timeout elapses.
    pub fn get(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = lock(&self.inner);
        loop {
            if let Some(item) = self.pop_locked(&mut inner) {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .not_empty
                .wait_timeout(inner, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            inner = guard;
        }
    }

    /// Changes the cap; a raised or removed cap releases blocked producers.
    pub fn set_max_bytes(&self, max_bytes: Option<usize>) {
        lock(&self.inner).max_bytes = max_bytes;
        self.not_full.notify_all();
    }

    pub fn max_bytes(&self) -> Option<usize> {
        lock(&self.inner).max_bytes
    }

    /// Whether any producer is currently parked in [`put`].
    ///
    /// [`put`]: ByteLimitedQueue::put
    pub fn is_blocked(&self) -> bool {
        lock(&self.inner).blocked_producers > 0
    }

    pub fn pending_bytes(&self) -> usize {
        lock(&self.inner).bytes
    }

    fn pop_locked(&self, inner: &mut Inner<T>) -> Option<T> {
        let item = inner.items.pop_front()?;
        inner.bytes -= (self.size_of)(&item);
        self.not_full.notify_all();
        Some(item)
    }
}
