//! Network capture: capability traits for the realm's communication
//! primitives, capture decorators over them, and native implementations.
//!
//! Each primitive is a trait ([`SocketFactory`], [`Fetch`],
//! [`HttpRequestFactory`]). A capture decorator implements the same trait as
//! the primitive it wraps and delegates to it, recording traffic into the
//! [`EventBuffer`](crate::EventBuffer) on the way through. Installing capture
//! is nothing more than swapping the realm binding for the decorator.

mod fetch;
mod native;
mod socket;
mod xhr;

pub use fetch::{CapturedFetch, Fetch, FetchRequest, FetchResponse};
pub use native::{NativeFetch, NativeHttpRequestFactory, NativeSocketFactory};
pub use socket::{
    CapturedSocket, CapturedSocketFactory, Connection, ConnectionLog, ConnectionState,
    InitialListeners, MessageData, ReadyState, Socket, SocketEvent, SocketEventKind,
    SocketFactory, SocketListener,
};
pub use xhr::{
    CapturedHttpRequest, CapturedHttpRequestFactory, HttpRequest, HttpRequestFactory,
    XhrEvent, XhrEventKind, XhrListener, XhrReadyState,
};

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

/// Run instrumentation code so that a panic in it never reaches the caller
/// of the wrapped primitive.
pub(crate) fn best_effort<T>(what: &str, f: impl FnOnce() -> T) -> Option<T> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(target_op = %what, "capture panicked, event dropped");
            None
        }
    }
}

// ============================================================================
// Listener Registry
// ============================================================================

/// Handle returned by `add_listener`, used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Shared callback stored in a [`ListenerSet`].
pub type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Subscription registry shared by primitives and decorators.
///
/// Supports both subscription styles a page uses: any number of listeners
/// per kind, plus one settable handler slot per kind that runs after them.
pub struct ListenerSet<K, E: ?Sized> {
    next_id: AtomicU64,
    listeners: Mutex<Vec<(ListenerId, K, Listener<E>)>>,
    handlers: Mutex<Vec<(K, Listener<E>)>>,
}

impl<K, E: ?Sized> Default for ListenerSet<K, E> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: Mutex::new(Vec::new()),
            handlers: Mutex::new(Vec::new()),
        }
    }
}

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<K: Copy + PartialEq, E: ?Sized> ListenerSet<K, E> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, kind: K, listener: Listener<E>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        locked(&self.listeners).push((id, kind, listener));
        id
    }

    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = locked(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(existing, _, _)| *existing != id);
        listeners.len() != before
    }

    /// Replace (or clear, with `None`) the handler slot for `kind`.
    pub fn set_handler(&self, kind: K, handler: Option<Listener<E>>) {
        let mut handlers = locked(&self.handlers);
        handlers.retain(|(existing, _)| *existing != kind);
        if let Some(handler) = handler {
            handlers.push((kind, handler));
        }
    }

    /// Empty every handler slot.
    pub fn clear_handlers(&self) {
        locked(&self.handlers).clear();
    }

    pub fn handler(&self, kind: K) -> Option<Listener<E>> {
        locked(&self.handlers)
            .iter()
            .find(|(existing, _)| *existing == kind)
            .map(|(_, handler)| handler.clone())
    }

    pub fn listener_count(&self, kind: K) -> usize {
        locked(&self.listeners)
            .iter()
            .filter(|(_, existing, _)| *existing == kind)
            .count()
    }

    /// Deliver `event` to every listener of `kind`, then to the handler.
    ///
    /// Callbacks run on a snapshot with no lock held, so they may add or
    /// remove listeners. A panicking callback does not stop delivery.
    pub fn dispatch(&self, kind: K, event: &E) {
        let snapshot: Vec<Listener<E>> = locked(&self.listeners)
            .iter()
            .filter(|(_, existing, _)| *existing == kind)
            .map(|(_, _, listener)| listener.clone())
            .collect();
        for listener in snapshot.into_iter().chain(self.handler(kind)) {
            best_effort("listener", || listener(event));
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Kind {
        A,
        B,
    }

    #[test]
    fn test_dispatch_listeners_then_handler() {
        let set: ListenerSet<Kind, str> = ListenerSet::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let sink = order.clone();
        set.set_handler(Kind::A, Some(Arc::new(move |e: &str| sink.lock().unwrap().push(format!("handler:{}", e)))));
        let sink = order.clone();
        set.add(Kind::A, Arc::new(move |e: &str| sink.lock().unwrap().push(format!("listener:{}", e))));
        let sink = order.clone();
        set.add(Kind::B, Arc::new(move |e: &str| sink.lock().unwrap().push(format!("other:{}", e))));

        set.dispatch(Kind::A, "x");
        assert_eq!(*order.lock().unwrap(), vec!["listener:x", "handler:x"]);
    }

    #[test]
    fn test_remove_and_clear_handler() {
        let set: ListenerSet<Kind, u32> = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let id = set.add(Kind::A, Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        let counter = hits.clone();
        set.set_handler(Kind::A, Some(Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        })));

        assert!(set.remove(id));
        assert!(!set.remove(id));
        set.set_handler(Kind::A, None);
        set.dispatch(Kind::A, &1);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(set.listener_count(Kind::A), 0);
    }

    #[test]
    fn test_panicking_listener_does_not_stop_delivery() {
        let set: ListenerSet<Kind, u32> = ListenerSet::new();
        let hits = Arc::new(AtomicUsize::new(0));
        set.add(Kind::B, Arc::new(|_: &u32| panic!("page bug")));
        let counter = hits.clone();
        set.add(Kind::B, Arc::new(move |_: &u32| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        set.dispatch(Kind::B, &7);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_best_effort() {
        assert_eq!(best_effort("ok", || 5), Some(5));
        assert_eq!(best_effort("boom", || -> u32 { panic!("x") }), None);
    }
}
