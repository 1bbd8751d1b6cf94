//! Observable state
//!
//! A value with a single update path and a subscribe/notify contract. Every
//! piece of state a UI (or another component) reads from the relay lives in
//! one of these: link state, writer cache, subscriber view, producer view.
//!
//! Two ways to observe: registered callbacks (invoked synchronously on the
//! updating task, outside of any internal lock) and a broadcast receiver for
//! async consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use uuid::Uuid;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

pub struct Observable<T: Clone + Send + Sync + 'static> {
    value: Mutex<T>,
    subscribers: Mutex<HashMap<Uuid, Callback<T>>>,
    update_tx: broadcast::Sender<T>,
}

impl<T: Clone + Send + Sync + 'static> Observable<T> {
    pub fn new(initial: T) -> Self {
        let (update_tx, _) = broadcast::channel(64);
        Self {
            value: Mutex::new(initial),
            subscribers: Mutex::new(HashMap::new()),
            update_tx,
        }
    }

    /// Snapshot of the current value.
    pub fn get(&self) -> Option<T> {
        self.value.lock().ok().map(|v| v.clone())
    }

    /// Replace the value and notify.
    pub fn update(&self, new_value: T) {
        if let Ok(mut guard) = self.value.lock() {
            *guard = new_value.clone();
        } else {
            return;
        }
        self.notify(&new_value);
    }

    /// Mutate in place and notify with the result.
    pub fn modify<F>(&self, f: F)
    where
        F: FnOnce(&mut T),
    {
        let snapshot = match self.value.lock() {
            Ok(mut guard) => {
                f(&mut guard);
                guard.clone()
            }
            Err(_) => return,
        };
        self.notify(&snapshot);
    }

    /// Mutate in place, notifying only when `f` reports a change.
    pub fn modify_if<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        let snapshot = match self.value.lock() {
            Ok(mut guard) => {
                if !f(&mut guard) {
                    return false;
                }
                guard.clone()
            }
            Err(_) => return false,
        };
        self.notify(&snapshot);
        true
    }

    pub fn subscribe(&self, callback: Box<dyn Fn(&T) + Send + Sync>) -> Uuid {
        let id = Uuid::new_v4();
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.insert(id, Arc::from(callback));
        }
        id
    }

    pub fn unsubscribe(&self, id: Uuid) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&id);
        }
    }

    /// Receiver for every subsequent update.
    pub fn watch(&self) -> broadcast::Receiver<T> {
        self.update_tx.subscribe()
    }

    fn notify(&self, value: &T) {
        let _ = self.update_tx.send(value.clone());
        let callbacks: Vec<Callback<T>> = match self.subscribers.lock() {
            Ok(subs) => subs.values().cloned().collect(),
            Err(_) => return,
        };
        for callback in callbacks {
            callback(value);
        }
    }
}

impl<T: Clone + Send + Sync + Default + 'static> Default for Observable<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_update_notifies_callbacks() {
        let obs = Observable::new(0u32);
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        obs.subscribe(Box::new(move |v| {
            seen_clone.store(*v as usize, Ordering::SeqCst);
        }));

        obs.update(7);
        assert_eq!(seen.load(Ordering::SeqCst), 7);
        assert_eq!(obs.get(), Some(7));
    }

    #[test]
    fn test_unsubscribe_stops_notifications() {
        let obs = Observable::new(0u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let id = obs.subscribe(Box::new(move |_| {
            calls_clone.fetch_add(1, Ordering::SeqCst);
        }));

        obs.update(1);
        obs.unsubscribe(id);
        obs.update(2);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_modify_if_skips_unchanged() {
        let obs = Observable::new(5u32);
        let mut rx = obs.watch();

        assert!(!obs.modify_if(|v| {
            let changed = *v != 5;
            *v = 5;
            changed
        }));
        assert!(rx.try_recv().is_err());

        assert!(obs.modify_if(|v| {
            *v = 6;
            true
        }));
        assert_eq!(rx.try_recv().unwrap(), 6);
    }

    #[test]
    fn test_callback_may_read_value() {
        let obs = Arc::new(Observable::new(String::new()));
        let reader = Arc::clone(&obs);
        let echoed = Arc::new(Mutex::new(String::new()));
        let echoed_clone = Arc::clone(&echoed);
        obs.subscribe(Box::new(move |_| {
            let current = reader.get().unwrap_or_default();
            *echoed_clone.lock().unwrap() = current;
        }));

        obs.modify(|s| s.push_str("hello"));
        assert_eq!(*echoed.lock().unwrap(), "hello");
    }
}
