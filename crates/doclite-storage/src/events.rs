//! Per-collection event bus.
//!
//! The listener list is allocated lazily on first subscription and payloads
//! are only constructed when at least one listener exists. Dispatch is
//! synchronous in registration order; a listener that panics is caught and
//! re-emitted as an `error` event on the same collection, with re-emission
//! depth capped at 1 so a faulty error listener cannot start a storm.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use doclite_core::events::CollectionEvent;

/// Identifies one subscription for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener<T> = Arc<dyn Fn(&CollectionEvent<T>) + Send + Sync>;

pub(crate) struct EventBus<T> {
    listeners: Mutex<Option<Vec<(u64, Listener<T>)>>>,
    next_id: AtomicU64,
}

impl<T> EventBus<T> {
    pub(crate) fn new() -> Self {
        Self {
            listeners: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    pub(crate) fn subscribe(
        &self,
        listener: impl Fn(&CollectionEvent<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut guard = self.lock();
        guard
            .get_or_insert_with(Vec::new)
            .push((id, Arc::new(listener)));
        SubscriptionId(id)
    }

    /// Removes one subscription; returns `false` if it was already gone.
    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.lock();
        match guard.as_mut() {
            Some(listeners) => {
                let before = listeners.len();
                listeners.retain(|(key, _)| *key != id.0);
                listeners.len() != before
            }
            None => false,
        }
    }

    pub(crate) fn clear(&self) {
        *self.lock() = None;
    }

    /// `true` when a payload would reach anyone.
    pub(crate) fn has_listeners(&self) -> bool {
        self.lock().as_ref().is_some_and(|l| !l.is_empty())
    }

    pub(crate) fn emit(&self, event: &CollectionEvent<T>) {
        self.emit_at_depth(event, 0);
    }

    fn emit_at_depth(&self, event: &CollectionEvent<T>, depth: u8) {
        // Snapshot under the lock, dispatch outside it, so listeners can
        // subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<Listener<T>> = match self.lock().as_ref() {
            Some(listeners) => listeners.iter().map(|(_, l)| Arc::clone(l)).collect(),
            None => return,
        };
        for listener in snapshot {
            let outcome = catch_unwind(AssertUnwindSafe(|| listener(event)));
            if let Err(panic) = outcome {
                let message = panic_message(&panic);
                warn!(event = event.kind(), %message, "event listener panicked");
                if depth == 0 {
                    let error = CollectionEvent::Error {
                        operation: event.kind(),
                        message,
                    };
                    self.emit_at_depth(&error, 1);
                }
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Vec<(u64, Listener<T>)>>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    macro_rules! check {
        ($t:ty) => {
            if panic.is::<$t>() {
                eprintln!("DEBUG matched type: {}", stringify!($t));
            }
        };
    }
    check!(&str);
    check!(String);
    check!(Box<str>);
    check!(std::borrow::Cow<'static, str>);
    check!(std::fmt::Arguments<'static>);
    check!(());
    check!(i32);
    eprintln!("DEBUG done checking, typeid={:?}", panic.type_id());
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn drop_event() -> CollectionEvent<()> {
        CollectionEvent::Drop {
            name: "users".into(),
        }
    }


    #[test]
    fn minimal_repro_zzz() {
        std::panic::set_hook(Box::new(|info| {
            let p = info.payload();
            eprintln!(
                "HOOK is_str={} is_string={} display={}",
                p.is::<&str>(),
                p.is::<String>(),
                info
            );
        }));
        let bus: EventBus<()> = EventBus::new();
        bus.subscribe(|event| {
            if !matches!(event, CollectionEvent::Error { .. }) {
                panic!("boom");
            }
        });
        bus.emit(&drop_event());
    }

    #[test]
    fn lazily_allocated_and_lazily_emitted() {
        let bus: EventBus<()> = EventBus::new();
        assert!(!bus.has_listeners());
        bus.emit(&drop_event());
        let id = bus.subscribe(|_| {});
        assert!(bus.has_listeners());
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert!(!bus.has_listeners());
    }

    #[test]
    fn listeners_fire_in_registration_order() {
        let bus: EventBus<()> = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(move |_| order.lock().unwrap().push(tag));
        }
        bus.emit(&drop_event());
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[test]
    fn panicking_listener_becomes_an_error_event() {
        let bus: EventBus<()> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(move |event| {
            if let CollectionEvent::Error { operation, message } = event {
                seen_clone.lock().unwrap().push((*operation, message.clone()));
            }
        });
        bus.subscribe(|event| {
            if !matches!(event, CollectionEvent::Error { .. }) {
                panic!("boom");
            }
        });
        bus.emit(&drop_event());
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "drop");
        assert_eq!(seen[0].1, "boom");
    }

    #[test]
    fn error_event_storms_are_capped() {
        let bus: EventBus<()> = EventBus::new();
        let fires = Arc::new(AtomicUsize::new(0));
        let fires_clone = Arc::clone(&fires);
        // Panics on every event, including the error event.
        bus.subscribe(move |_| {
            fires_clone.fetch_add(1, Ordering::SeqCst);
            panic!("always");
        });
        bus.emit(&drop_event());
        // Original event + one error re-emission, never a third.
        assert_eq!(fires.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn clear_removes_everything() {
        let bus: EventBus<()> = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        bus.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        bus.clear();
        bus.emit(&drop_event());
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
