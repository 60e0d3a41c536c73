//! Event Source Adapters
//!
//! Bridges callback-style event sources (store change notifications, child
//! process lifecycle callbacks) into [`Signal`]s.
//!
//! An [`EventAdapter`] attaches exactly one native listener to its source,
//! no matter how many subscribers its signal has, and removes that listener
//! when the adapter is dropped.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::signal::{Signal, SignalValue};

/// A native callback
pub type Handler<R> = Arc<dyn Fn(R) + Send + Sync>;

/// Minimal callback registry for event sources that have no stream API
pub struct NativeEmitter<R> {
    listeners: Arc<Mutex<Vec<Handler<R>>>>,
}

impl<R> Clone for NativeEmitter<R> {
    fn clone(&self) -> Self {
        Self {
            listeners: Arc::clone(&self.listeners),
        }
    }
}

impl<R> Default for NativeEmitter<R> {
    fn default() -> Self {
        Self {
            listeners: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl<R> fmt::Debug for NativeEmitter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeEmitter")
            .field("listeners", &self.listeners.lock().len())
            .finish()
    }
}

impl<R: Clone> NativeEmitter<R> {
    /// Create an emitter with no listeners
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a listener
    pub fn on(&self, handler: Handler<R>) {
        self.listeners.lock().push(handler);
    }

    /// Detach a previously attached listener
    pub fn off(&self, handler: &Handler<R>) {
        self.listeners
            .lock()
            .retain(|existing| !Arc::ptr_eq(existing, handler));
    }

    /// Invoke every listener with `raw`, returning how many ran
    pub fn emit(&self, raw: R) -> usize {
        // Listeners run outside the lock so they may attach or detach.
        let listeners: Vec<Handler<R>> = self.listeners.lock().clone();
        for listener in &listeners {
            listener(raw.clone());
        }
        listeners.len()
    }

    /// Number of attached listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }
}

/// Exposes a callback event source as a [`Signal`]
pub struct EventAdapter<T> {
    signal: Signal<T>,
    detach: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<T> fmt::Debug for EventAdapter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventAdapter")
            .field("signal", &self.signal)
            .field("attached", &self.detach.is_some())
            .finish()
    }
}

impl<T: SignalValue> EventAdapter<T> {
    /// Attach to a source through its `subscribe`/`unsubscribe` pair
    ///
    /// `transform` converts each raw event into the signal's value.
    pub fn new<R, S, U, M>(subscribe: S, unsubscribe: U, transform: M) -> Self
    where
        R: 'static,
        S: FnOnce(Handler<R>),
        U: FnOnce(Handler<R>) + Send + Sync + 'static,
        M: Fn(R) -> T + Send + Sync + 'static,
    {
        Self::attach(Signal::new(), subscribe, unsubscribe, transform)
    }

    /// Like [`EventAdapter::new`], but late subscribers receive the last value
    pub fn replaying<R, S, U, M>(subscribe: S, unsubscribe: U, transform: M) -> Self
    where
        R: 'static,
        S: FnOnce(Handler<R>),
        U: FnOnce(Handler<R>) + Send + Sync + 'static,
        M: Fn(R) -> T + Send + Sync + 'static,
    {
        Self::attach(Signal::replay(), subscribe, unsubscribe, transform)
    }

    /// Attach to a [`NativeEmitter`]
    pub fn from_emitter<R, M>(emitter: &NativeEmitter<R>, transform: M) -> Self
    where
        R: Clone + Send + 'static,
        M: Fn(R) -> T + Send + Sync + 'static,
    {
        let on = emitter.clone();
        let off = emitter.clone();
        Self::new(
            move |handler| on.on(handler),
            move |handler| off.off(&handler),
            transform,
        )
    }

    fn attach<R, S, U, M>(signal: Signal<T>, subscribe: S, unsubscribe: U, transform: M) -> Self
    where
        R: 'static,
        S: FnOnce(Handler<R>),
        U: FnOnce(Handler<R>) + Send + Sync + 'static,
        M: Fn(R) -> T + Send + Sync + 'static,
    {
        let emitter = signal.clone();
        let handler: Handler<R> = Arc::new(move |raw: R| {
            emitter.emit(transform(raw));
        });
        subscribe(Arc::clone(&handler));
        Self {
            signal,
            detach: Some(Box::new(move || unsubscribe(handler))),
        }
    }

    /// The adapted signal
    #[must_use]
    pub fn signal(&self) -> Signal<T> {
        self.signal.clone()
    }
}

impl<T> Drop for EventAdapter<T> {
    fn drop(&mut self) {
        if let Some(detach) = self.detach.take() {
            detach();
        }
    }
}
