//! Notification fan-out
//! Delivers session snapshots and lifecycle events to subscribers, in
//! subscription order, synchronously on the session task.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use log::debug;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Table<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

fn lock<T>(table: &Mutex<Table<T>>) -> MutexGuard<'_, Table<T>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered list of callbacks.
pub struct Subscribers<T> {
    table: Arc<Mutex<Table<T>>>,
}

impl<T> Clone for Subscribers<T> {
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
        }
    }
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            table: Arc::new(Mutex::new(Table {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<T: 'static> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback. It stays registered until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let mut table = lock(&self.table);
        table.next_id += 1;
        let id = table.next_id;
        table.entries.push((id, Arc::new(callback)));
        debug!("Subscriber {} registered", id);

        let weak: Weak<Mutex<Table<T>>> = Arc::downgrade(&self.table);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(table) = weak.upgrade() {
                    lock(&table).entries.retain(|(entry, _)| *entry != id);
                }
            })),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.table).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls every subscriber with `value`.
    ///
    /// The table is not locked while callbacks run, so a callback may
    /// unsubscribe itself or others. Anyone removed mid-delivery is skipped.
    pub fn notify(&self, value: &T) {
        let snapshot: Vec<(u64, Callback<T>)> = lock(&self.table).entries.clone();
        for (id, callback) in snapshot {
            let still_subscribed = lock(&self.table)
                .entries
                .iter()
                .any(|(entry, _)| *entry == id);
            if still_subscribed {
                callback(value);
            }
        }
    }
}

/// Handle returned by `subscribe`. Dropping it unsubscribes.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Stops delivery. Safe to call more than once and from inside a callback.
    pub fn unsubscribe(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_in_subscription_order() {
        let subscribers = Subscribers::<u32>::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let first_seen = seen.clone();
        let _first = subscribers.subscribe(move |v| first_seen.lock().unwrap().push(("first", *v)));
        let second_seen = seen.clone();
        let _second =
            subscribers.subscribe(move |v| second_seen.lock().unwrap().push(("second", *v)));

        subscribers.notify(&7);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn dropping_the_handle_unsubscribes() {
        let subscribers = Subscribers::<u32>::new();
        let handle = subscribers.subscribe(|_| {});
        assert_eq!(subscribers.len(), 1);
        drop(handle);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn callback_can_unsubscribe_itself() {
        let subscribers = Subscribers::<u32>::new();
        let calls = Arc::new(Mutex::new(0));
        let slot: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let calls_in_cb = calls.clone();
        let slot_in_cb = slot.clone();
        let handle = subscribers.subscribe(move |_| {
            *calls_in_cb.lock().unwrap() += 1;
            if let Some(mut own) = slot_in_cb.lock().unwrap().take() {
                own.unsubscribe();
            }
        });
        *slot.lock().unwrap() = Some(handle);

        subscribers.notify(&1);
        subscribers.notify(&2);
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(subscribers.is_empty());
    }

    #[test]
    fn unsubscribed_mid_delivery_is_skipped() {
        let subscribers = Subscribers::<u32>::new();
        let later_calls = Arc::new(Mutex::new(0));
        let victim: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

        let victim_in_cb = victim.clone();
        let _killer = subscribers.subscribe(move |_| {
            victim_in_cb.lock().unwrap().take();
        });
        let later_in_cb = later_calls.clone();
        let handle = subscribers.subscribe(move |_| *later_in_cb.lock().unwrap() += 1);
        *victim.lock().unwrap() = Some(handle);

        subscribers.notify(&1);
        assert_eq!(*later_calls.lock().unwrap(), 0);
    }

    #[test]
    fn unsubscribe_is_idempotent() {
        let subscribers = Subscribers::<u32>::new();
        let mut handle = subscribers.subscribe(|_| {});
        handle.unsubscribe();
        handle.unsubscribe();
        assert!(subscribers.is_empty());
    }
}
