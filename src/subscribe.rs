//! Subscriber registry and event dispatch.
//!
//! Each transport owns one [`Dispatcher`]. It holds the single installed
//! [`Handlers`] set, the transport's [`ConnectionState`], and a session gate
//! that decides whether events from a background task may still be
//! delivered. Stopping a transport ends its session; any event produced by
//! the old session afterwards is discarded.

use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard, RwLock};

use crate::reading::{ConnectionState, Reading};
use crate::transport::TransportError;

pub type DataHandler = Arc<dyn Fn(&[Reading]) + Send + Sync>;
pub type StateHandler = Arc<dyn Fn() + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&TransportError) + Send + Sync>;

/// A complete set of event callbacks.
///
/// Installing a set replaces the previous one entirely. `Handlers::default()`
/// has no callbacks and mutes the transport.
#[derive(Clone, Default)]
pub struct Handlers {
    pub on_data: Option<DataHandler>,
    pub on_connect: Option<StateHandler>,
    pub on_disconnect: Option<StateHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called with new readings. Push transports deliver one reading per
    /// call, pull transports one batch per successful poll.
    pub fn on_data(mut self, f: impl Fn(&[Reading]) + Send + Sync + 'static) -> Self {
        self.on_data = Some(Arc::new(f));
        self
    }

    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    pub fn on_disconnect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&TransportError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.on_data.is_none()
            && self.on_connect.is_none()
            && self.on_disconnect.is_none()
            && self.on_error.is_none()
    }
}

impl fmt::Debug for Handlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handlers")
            .field("on_data", &self.on_data.is_some())
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .finish()
    }
}

#[derive(Default)]
struct HandlerSlot {
    installed: RwLock<(u64, Arc<Handlers>)>,
    generation: AtomicU64,
}

impl HandlerSlot {
    fn install(&self, handlers: Handlers) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *self.installed.write() = (generation, Arc::new(handlers));
        generation
    }

    fn current(&self) -> Arc<Handlers> {
        self.installed.read().1.clone()
    }
}

/// Handle to an installed handler set.
///
/// Dropping the handle leaves the handlers in place; call
/// [`Subscription::unsubscribe`] to remove them. Unsubscribing a set that has
/// since been replaced is a no-op.
#[derive(Debug)]
pub struct Subscription {
    slot: Weak<HandlerSlot>,
    generation: u64,
}

impl fmt::Debug for HandlerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerSlot")
            .field("generation", &self.installed.read().0)
            .finish()
    }
}

impl Subscription {
    /// Returns true while this handle's set is the installed one.
    pub fn is_active(&self) -> bool {
        self.slot
            .upgrade()
            .is_some_and(|slot| slot.installed.read().0 == self.generation)
    }

    /// Remove this handle's handler set if it is still installed.
    ///
    /// Returns true if the set was removed.
    pub fn unsubscribe(self) -> bool {
        let Some(slot) = self.slot.upgrade() else {
            return false;
        };
        let mut installed = slot.installed.write();
        if installed.0 != self.generation {
            return false;
        }
        installed.1 = Arc::new(Handlers::default());
        true
    }
}

/// Per-transport event hub.
pub(crate) struct Dispatcher {
    slot: Arc<HandlerSlot>,
    gate: ReentrantMutex<Cell<u64>>,
    state: Mutex<ConnectionState>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            slot: Arc::new(HandlerSlot::default()),
            gate: ReentrantMutex::new(Cell::new(0)),
            state: Mutex::new(ConnectionState::Disconnected),
        }
    }

    pub fn set_handlers(&self, handlers: Handlers) -> Subscription {
        let generation = self.slot.install(handlers);
        Subscription {
            slot: Arc::downgrade(&self.slot),
            generation,
        }
    }

    pub fn handlers(&self) -> Arc<Handlers> {
        self.slot.current()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Start a new session, invalidating the previous one.
    pub fn begin_session(&self) -> u64 {
        let gate = self.gate.lock();
        let next = gate.get() + 1;
        gate.set(next);
        next
    }

    /// Invalidate the current session without firing any callback.
    ///
    /// Once this returns, no event from an earlier session is delivered.
    pub fn end_session(&self) {
        let gate = self.gate.lock();
        gate.set(gate.get() + 1);
        *self.state.lock() = ConnectionState::Disconnected;
    }

    /// Run `f` with an emitter bound to `session`.
    ///
    /// Returns `None` without calling `f` if the session has ended.
    pub fn with_session<R>(&self, session: u64, f: impl FnOnce(&Emitter<'_>) -> R) -> Option<R> {
        let guard = self.gate.lock();
        if guard.get() != session {
            return None;
        }
        let emitter = Emitter {
            dispatcher: self,
            guard,
            session,
        };
        Some(f(&emitter))
    }

    /// Run `f` with an emitter bound to whatever session is current.
    pub fn with_current<R>(&self, f: impl FnOnce(&Emitter<'_>) -> R) -> R {
        let guard = self.gate.lock();
        let session = guard.get();
        let emitter = Emitter {
            dispatcher: self,
            guard,
            session,
        };
        f(&emitter)
    }

    /// Run `f` holding the session gate.
    ///
    /// Lifecycle changes go through here so they serialize with event
    /// delivery. The gate is reentrant, so callbacks may call back in.
    pub fn exclusive<R>(&self, f: impl FnOnce() -> R) -> R {
        let _gate = self.gate.lock();
        f()
    }

    pub fn is_live(&self, session: u64) -> bool {
        self.gate.lock().get() == session
    }
}

/// Delivers events for one session while holding the session gate.
pub(crate) struct Emitter<'a> {
    dispatcher: &'a Dispatcher,
    guard: ReentrantMutexGuard<'a, Cell<u64>>,
    session: u64,
}

impl Emitter<'_> {
    /// False once the session was ended, including from inside a callback.
    pub fn is_live(&self) -> bool {
        self.guard.get() == self.session
    }

    /// Move to `to`, firing connect/disconnect on the edges.
    ///
    /// Returns true if the state changed.
    pub fn transition(&self, to: ConnectionState) -> bool {
        if !self.is_live() {
            return false;
        }
        let from = std::mem::replace(&mut *self.dispatcher.state.lock(), to);
        if from == to {
            return false;
        }
        let handlers = self.dispatcher.handlers();
        if to.is_connected() {
            if let Some(f) = &handlers.on_connect {
                f();
            }
        } else if from.is_connected() {
            if let Some(f) = &handlers.on_disconnect {
                f();
            }
        }
        true
    }

    pub fn data(&self, readings: &[Reading]) {
        if readings.is_empty() || !self.is_live() {
            return;
        }
        if let Some(f) = &self.dispatcher.handlers().on_data {
            f(readings);
        }
    }

    pub fn error(&self, err: &TransportError) {
        if !self.is_live() {
            return;
        }
        if let Some(f) = &self.dispatcher.handlers().on_error {
            f(err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn() + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        (count, move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_edges_fire_once() {
        let dispatcher = Dispatcher::new();
        let (connects, on_connect) = counter();
        let (disconnects, on_disconnect) = counter();
        dispatcher.set_handlers(
            Handlers::new()
                .on_connect(on_connect)
                .on_disconnect(on_disconnect),
        );

        let session = dispatcher.begin_session();
        dispatcher.with_session(session, |e| {
            e.transition(ConnectionState::Connecting);
            e.transition(ConnectionState::Connected);
            e.transition(ConnectionState::Connected);
            e.transition(ConnectionState::Disconnected);
            e.transition(ConnectionState::Disconnected);
            e.transition(ConnectionState::Connecting);
            e.transition(ConnectionState::Disconnected);
        });

        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_set_handlers_replaces_whole_set() {
        let dispatcher = Dispatcher::new();
        let (connects, on_connect) = counter();
        dispatcher.set_handlers(Handlers::new().on_connect(on_connect));
        dispatcher.set_handlers(Handlers::new().on_error(|_| {}));

        let session = dispatcher.begin_session();
        dispatcher.with_session(session, |e| e.transition(ConnectionState::Connected));
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert!(dispatcher.handlers().on_error.is_some());
    }

    #[test]
    fn test_stale_subscription_cannot_remove_newer_set() {
        let dispatcher = Dispatcher::new();
        let first = dispatcher.set_handlers(Handlers::new().on_connect(|| {}));
        let second = dispatcher.set_handlers(Handlers::new().on_disconnect(|| {}));

        assert!(!first.is_active());
        assert!(!first.unsubscribe());
        assert!(dispatcher.handlers().on_disconnect.is_some());

        assert!(second.is_active());
        assert!(second.unsubscribe());
        assert!(dispatcher.handlers().is_empty());
    }

    #[test]
    fn test_ended_session_is_discarded() {
        let dispatcher = Dispatcher::new();
        let (connects, on_connect) = counter();
        dispatcher.set_handlers(Handlers::new().on_connect(on_connect));

        let session = dispatcher.begin_session();
        dispatcher.end_session();
        let ran = dispatcher.with_session(session, |e| e.transition(ConnectionState::Connected));
        assert!(ran.is_none());
        assert_eq!(connects.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_ending_session_inside_callback_mutes_rest() {
        let dispatcher = Arc::new(Dispatcher::new());
        let (batches, on_batch) = counter();
        let d = Arc::downgrade(&dispatcher);
        dispatcher.set_handlers(
            Handlers::new()
                .on_connect(move || {
                    if let Some(d) = d.upgrade() {
                        d.end_session();
                    }
                })
                .on_data(move |_| on_batch()),
        );

        let session = dispatcher.begin_session();
        let reading = Reading::ecg_ppg(1, 0.0, 0.0);
        dispatcher.with_session(session, |e| {
            e.transition(ConnectionState::Connected);
            e.data(&[reading]);
        });
        assert_eq!(batches.load(Ordering::SeqCst), 0);
        assert!(!dispatcher.is_live(session));
    }
}
