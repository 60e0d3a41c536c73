//! Signals - Hot Multicast Event Streams
//!
//! A [`Signal`] is the unit of composition for the launcher's event graph.
//! Every flow consumes signals and produces signals, and every subscriber to
//! a signal sees every value emitted after it subscribed.
//!
//! # Architecture
//!
//! ```text
//!            emit(value)
//!                 │
//!        ┌────────▼────────┐
//!        │ broadcast::Sender│──── last value (replay signals only)
//!        └────────┬────────┘
//!       ┌─────────┼─────────┐
//!       ▼         ▼         ▼
//!   subscriber subscriber  operator task ──▶ downstream Signal
//! ```
//!
//! Operators (`map`, `filter`, `with_latest_from`, ...) subscribe to their
//! upstream synchronously when they are constructed and forward values from a
//! spawned task. A graph built in one synchronous pass therefore observes
//! every value emitted after construction finishes.
//!
//! Operators must be constructed inside a Tokio runtime.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream};
use futures::{FutureExt, Stream, StreamExt};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

/// Per-subscriber buffer before a slow subscriber starts lagging
pub const DEFAULT_CAPACITY: usize = 256;

/// Bound for anything that can travel through a signal
pub trait SignalValue: Clone + Send + Sync + 'static {}

impl<T: Clone + Send + Sync + 'static> SignalValue for T {}

/// A live subscription to a signal
pub type Subscription<T> = BoxStream<'static, T>;

struct Inner<T> {
    tx: broadcast::Sender<T>,
    /// `Some` for replay signals
    last: Option<Mutex<Option<T>>>,
}

/// Hot, multicast, push-based stream of values
///
/// Cloning a `Signal` yields another handle to the same stream.
pub struct Signal<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("subscribers", &self.inner.tx.receiver_count())
            .field("replay", &self.inner.last.is_some())
            .finish()
    }
}

impl<T: SignalValue> Default for Signal<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SignalValue> Signal<T> {
    /// Create a plain signal: late subscribers see only future values
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, false)
    }

    /// Create a replay signal: late subscribers first receive the last value
    #[must_use]
    pub fn replay() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY, true)
    }

    /// Create a replay signal that already holds `value`
    #[must_use]
    pub fn seeded(value: T) -> Self {
        let signal = Self::replay();
        signal.emit(value);
        signal
    }

    fn with_capacity(capacity: usize, replay: bool) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(Inner {
                tx,
                last: replay.then(|| Mutex::new(None)),
            }),
        }
    }

    /// Whether late subscribers receive the most recent value
    #[must_use]
    pub fn is_replay(&self) -> bool {
        self.inner.last.is_some()
    }

    /// Push a value to every current subscriber
    ///
    /// Returns the number of subscribers that received it.
    pub fn emit(&self, value: T) -> usize {
        match &self.inner.last {
            Some(last) => {
                // Held across send so a concurrent subscribe sees either the
                // old value plus this emission or the new value, never both.
                let mut last = last.lock();
                *last = Some(value.clone());
                self.inner.tx.send(value).unwrap_or(0)
            }
            None => self.inner.tx.send(value).unwrap_or(0),
        }
    }

    /// Subscribe to values emitted from now on
    pub fn subscribe(&self) -> Subscription<T> {
        match &self.inner.last {
            Some(last) => {
                let last = last.lock();
                let rx = self.inner.tx.subscribe();
                stream::iter(last.clone()).chain(live(rx)).boxed()
            }
            None => live(self.inner.tx.subscribe()).boxed(),
        }
    }

    /// Most recent value of a replay signal
    #[must_use]
    pub fn latest(&self) -> Option<T> {
        self.inner.last.as_ref().and_then(|last| last.lock().clone())
    }

    /// Number of live subscriptions
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.tx.receiver_count()
    }

    /// No handle other than the caller's and no subscriber remain
    fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && self.inner.tx.receiver_count() == 0
    }

    // ========================================================================
    // Operators
    // ========================================================================

    /// Transform and optionally drop each value
    pub fn filter_map<U, F>(&self, mut f: F) -> Signal<U>
    where
        U: SignalValue,
        F: FnMut(T) -> Option<U> + Send + 'static,
    {
        let out = Signal::new();
        let emitter = out.clone();
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = upstream.next().await {
                if let Some(mapped) = f(value) {
                    emitter.emit(mapped);
                }
            }
        });
        out
    }

    /// Transform each value
    pub fn map<U, F>(&self, mut f: F) -> Signal<U>
    where
        U: SignalValue,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.filter_map(move |value| Some(f(value)))
    }

    /// Keep values matching `predicate`
    pub fn filter<F>(&self, mut predicate: F) -> Signal<T>
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.filter_map(move |value| predicate(&value).then_some(value))
    }

    /// Interleave values from both signals
    pub fn merge(&self, other: &Signal<T>) -> Signal<T> {
        let out = Signal::new();
        let emitter = out.clone();
        let mut merged = stream::select(self.subscribe(), other.subscribe());
        tokio::spawn(async move {
            while let Some(value) = merged.next().await {
                emitter.emit(value);
            }
        });
        out
    }

    /// Pair each value with the latest value of `latest`
    ///
    /// Only emissions of `self` produce output. Values arriving before
    /// `latest` has produced anything are dropped.
    pub fn with_latest_from<U: SignalValue>(&self, latest: &Signal<U>) -> Signal<(T, U)> {
        let out = Signal::new();
        let emitter = out.clone();
        let mut trigger = self.subscribe();
        let mut source = latest.subscribe();
        tokio::spawn(async move {
            let mut current: Option<U> = None;
            let mut source_open = true;
            loop {
                tokio::select! {
                    biased;
                    next = source.next(), if source_open => match next {
                        Some(value) => current = Some(value),
                        None => source_open = false,
                    },
                    next = trigger.next() => match next {
                        Some(value) => match &current {
                            Some(context) => {
                                emitter.emit((value, context.clone()));
                            }
                            None => {
                                tracing::debug!("with_latest_from dropped a value that arrived before its source");
                            }
                        },
                        None => break,
                    },
                }
            }
        });
        out
    }

    /// Emit the latest pair whenever either side emits, once both have
    pub fn combine_latest<U: SignalValue>(&self, other: &Signal<U>) -> Signal<(T, U)> {
        let out = Signal::new();
        let emitter = out.clone();
        let mut left_rx = self.subscribe();
        let mut right_rx = other.subscribe();
        tokio::spawn(async move {
            let mut left: Option<T> = None;
            let mut right: Option<U> = None;
            let (mut left_open, mut right_open) = (true, true);
            loop {
                tokio::select! {
                    next = left_rx.next(), if left_open => match next {
                        Some(value) => left = Some(value),
                        None => {
                            left_open = false;
                            continue;
                        }
                    },
                    next = right_rx.next(), if right_open => match next {
                        Some(value) => right = Some(value),
                        None => {
                            right_open = false;
                            continue;
                        }
                    },
                    else => break,
                }
                if let (Some(l), Some(r)) = (&left, &right) {
                    emitter.emit((l.clone(), r.clone()));
                }
            }
        });
        out
    }

    /// Forward only the first value
    pub fn first(&self) -> Signal<T> {
        let out = Signal::new();
        let emitter = out.clone();
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            if let Some(value) = upstream.next().await {
                emitter.emit(value);
            }
        });
        out
    }

    /// Forward the first value, or `fallback` if none arrives within `deadline`
    ///
    /// Exactly one value is emitted. The deadline starts at construction.
    pub fn first_within(&self, deadline: Duration, fallback: T) -> Signal<T> {
        let out = Signal::new();
        let emitter = out.clone();
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, upstream.next()).await {
                Ok(Some(value)) => {
                    emitter.emit(value);
                }
                Ok(None) => {}
                Err(_) => {
                    tracing::debug!(?deadline, "Signal deadline elapsed, emitting fallback");
                    emitter.emit(fallback);
                }
            }
        });
        out
    }

    /// Run an async transformation for each value, one at a time
    pub fn map_async<U, F, Fut>(&self, mut f: F) -> Signal<U>
    where
        U: SignalValue,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let out = Signal::new();
        let emitter = out.clone();
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = upstream.next().await {
                let mapped = f(value).await;
                emitter.emit(mapped);
            }
        });
        out
    }

    /// Like [`Signal::map_async`], but values arriving while a call is in
    /// flight are ignored rather than queued
    pub fn exhaust_map<U, F, Fut>(&self, mut f: F) -> Signal<U>
    where
        U: SignalValue,
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = U> + Send + 'static,
    {
        let out = Signal::new();
        let emitter = out.clone();
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = upstream.next().await {
                let mapped = f(value).await;
                emitter.emit(mapped);

                let mut ignored = 0usize;
                loop {
                    match upstream.next().now_or_never() {
                        Some(Some(_)) => ignored += 1,
                        Some(None) => return,
                        None => break,
                    }
                }
                if ignored > 0 {
                    tracing::debug!(ignored, "Values ignored while a call was in flight");
                }
            }
        });
        out
    }

    /// Run `f` for every value until the signal closes
    pub fn for_each<F>(&self, mut f: F) -> JoinHandle<()>
    where
        F: FnMut(T) + Send + 'static,
    {
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = upstream.next().await {
                f(value);
            }
        })
    }

    /// Run an async side effect for every value, in order
    pub fn for_each_async<F, Fut>(&self, mut f: F) -> JoinHandle<()>
    where
        F: FnMut(T) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut upstream = self.subscribe();
        tokio::spawn(async move {
            while let Some(value) = upstream.next().await {
                f(value).await;
            }
        })
    }

    /// Drive a signal from an arbitrary stream
    pub fn from_stream<S>(source: S) -> Self
    where
        S: Stream<Item = T> + Send + 'static,
    {
        let out = Self::new();
        let emitter = out.clone();
        tokio::spawn(async move {
            let mut source = Box::pin(source);
            while let Some(value) = source.next().await {
                emitter.emit(value);
            }
        });
        out
    }
}

impl Signal<u64> {
    /// Emit an increasing counter every `period`, starting immediately
    ///
    /// The timer stops once every handle and subscriber is gone.
    #[must_use]
    pub fn interval(period: Duration) -> Self {
        let out = Self::new();
        let emitter = out.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut count: u64 = 0;
            loop {
                ticker.tick().await;
                if emitter.is_orphaned() {
                    break;
                }
                emitter.emit(count);
                count += 1;
            }
        });
        out
    }
}

fn live<T: SignalValue>(rx: broadcast::Receiver<T>) -> impl Stream<Item = T> {
    BroadcastStream::new(rx).filter_map(|item| async move {
        match item {
            Ok(value) => Some(value),
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Signal subscriber lagged, oldest values dropped");
                None
            }
        }
    })
}
