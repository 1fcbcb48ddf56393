//! Single-consumer async queues.
//!
//! The client input queue and the FSM event queue both need the same
//! shape: unbounded, single scheduler thread, async `get`, and — for the
//! proposer's batching — the ability to push an item back to the front
//! after peeking too far.

use std::cell::RefCell;
use std::collections::VecDeque;

use tokio::sync::Notify;

/// Unbounded async FIFO for one consumer on the scheduler thread.
pub struct MsgQueue<T> {
    items: RefCell<VecDeque<T>>,
    notify: Notify,
}

impl<T> Default for MsgQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> MsgQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            items: RefCell::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    /// Append an item.
    pub fn put(&self, item: T) {
        self.items.borrow_mut().push_back(item);
        self.notify.notify_one();
    }

    /// Push an item back to the front. Used when batching grabbed one
    /// item too many.
    pub fn put_front(&self, item: T) {
        self.items.borrow_mut().push_front(item);
        self.notify.notify_one();
    }

    /// Take the next item, waiting until one arrives.
    pub async fn get(&self) -> T {
        loop {
            if let Some(item) = self.items.borrow_mut().pop_front() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    /// Take the next item if one is queued.
    pub fn try_get(&self) -> Option<T> {
        self.items.borrow_mut().pop_front()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.items.borrow().is_empty()
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.borrow().len()
    }

    /// Drop everything queued.
    pub fn clear(&self) {
        self.items.borrow_mut().clear();
    }
}
