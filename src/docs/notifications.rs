//! # Change Notifications
//!
//! Commit-ordered document change signaling. Subscribers register a
//! collection filter and receive a manual-reset event; the store sets it
//! after a commit publishes when any change in the batch touches a
//! subscribed collection. Consumers (the indexing workers) reset the event,
//! process, then wait on it — a set that lands between reset and wait is
//! not lost because the flag stays up until the next reset.

use std::time::Duration;

use hashbrown::HashSet;
use parking_lot::{Condvar, Mutex};

/// Manual-reset event built on a mutex/condvar pair.
pub struct ChangeEvent {
    flag: Mutex<bool>,
    cond: Condvar,
}

impl ChangeEvent {
    pub fn new() -> Self {
        Self {
            flag: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn set(&self) {
        let mut flag = self.flag.lock();
        *flag = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.flag.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.flag.lock()
    }

    /// Blocks until the event is set.
    pub fn wait(&self) {
        let mut flag = self.flag.lock();
        while !*flag {
            self.cond.wait(&mut flag);
        }
    }

    /// Blocks until the event is set or the timeout passes; returns whether
    /// the event was set.
    pub fn wait_for(&self, timeout: Duration) -> bool {
        let mut flag = self.flag.lock();
        if *flag {
            return true;
        }
        self.cond.wait_for(&mut flag, timeout);
        *flag
    }
}

impl Default for ChangeEvent {
    fn default() -> Self {
        Self::new()
    }
}

/// What happened to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Put,
    Delete,
}

/// One committed document change, delivered after publication in commit
/// order.
#[derive(Debug, Clone)]
pub struct DocumentChange {
    pub key: String,
    pub collection: String,
    pub etag: u64,
    pub kind: ChangeKind,
}

/// A registered listener: an event plus an optional collection filter
/// (`None` subscribes to everything).
pub struct ChangeSubscription {
    event: ChangeEvent,
    filter: Option<HashSet<String>>,
}

impl ChangeSubscription {
    pub(crate) fn new(filter: Option<HashSet<String>>) -> Self {
        Self {
            event: ChangeEvent::new(),
            filter,
        }
    }

    pub fn event(&self) -> &ChangeEvent {
        &self.event
    }

    pub fn matches(&self, collection: &str) -> bool {
        match &self.filter {
            None => true,
            Some(collections) => collections.contains(collection),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn set_wakes_a_waiter() {
        let event = Arc::new(ChangeEvent::new());
        let signaler = Arc::clone(&event);

        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            signaler.set();
        });

        event.wait();
        assert!(event.is_set());
        handle.join().unwrap();
    }

    #[test]
    fn set_before_wait_is_not_lost() {
        let event = ChangeEvent::new();
        event.set();

        let start = Instant::now();
        event.wait();
        assert!(start.elapsed() < Duration::from_millis(50));
    }

    #[test]
    fn wait_for_times_out_when_unset() {
        let event = ChangeEvent::new();

        assert!(!event.wait_for(Duration::from_millis(10)));
    }

    #[test]
    fn reset_clears_the_flag() {
        let event = ChangeEvent::new();
        event.set();
        event.reset();

        assert!(!event.is_set());
    }

    #[test]
    fn subscription_filters_by_collection() {
        let all = ChangeSubscription::new(None);
        let users_only =
            ChangeSubscription::new(Some(["Users".to_string()].into_iter().collect()));

        assert!(all.matches("Dogs"));
        assert!(users_only.matches("Users"));
        assert!(!users_only.matches("Dogs"));
    }
}
