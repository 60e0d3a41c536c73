//! Flow Combinators
//!
//! The two building blocks every concrete flow is made of:
//!
//! - [`fork`] partitions one signal into named channels by predicate.
//! - [`Flow`] wraps a builder `input -> Channels` with a name, mock-schema
//!   overrides and per-channel logging.
//!
//! # Fork semantics
//!
//! ```text
//!                 source
//!                   │  (one subscription, predicates run once per value)
//!          ┌────────▼─────────┐
//!          │ arm 1? arm 2? ...│  first match wins, in declaration order
//!          └──┬──────┬─────┬──┘
//!             ▼      ▼     ▼
//!          success failure unmatched
//! ```
//!
//! A value that matches no arm goes to the `unmatched` channel and is logged
//! at `warn`; it is never dropped silently.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging;
use crate::mock::MockSchema;
use crate::registry::Payload;
use crate::signal::{Signal, SignalValue};

/// Conventional success channel
pub const SUCCESS: &str = "success";
/// Conventional failure channel
pub const FAILURE: &str = "failure";
/// Channel receiving values no fork arm matched
pub const UNMATCHED: &str = "unmatched";

/// Every concrete flow in the launcher
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FlowId {
    /// Check persisted credentials at startup
    PersistedAuth,
    /// Email/password login
    Login,
    /// Email/password signup
    Signup,
    /// Periodic access-token refresh
    TokenRefresh,
    /// Subscription/payment status check
    SubscriptionCheck,
    /// Mandelbox assignment
    MandelboxCreate,
    /// Host service spin-up
    HostSpinUp,
    /// Build protocol launch parameters
    ProtocolLaunch,
    /// Observe one protocol process until it exits
    ProtocolClose,
    /// Periodic update check
    Autoupdate,
}

impl FlowId {
    /// All flows, in pipeline order
    pub const ALL: [FlowId; 10] = [
        FlowId::PersistedAuth,
        FlowId::Login,
        FlowId::Signup,
        FlowId::TokenRefresh,
        FlowId::SubscriptionCheck,
        FlowId::MandelboxCreate,
        FlowId::HostSpinUp,
        FlowId::ProtocolLaunch,
        FlowId::ProtocolClose,
        FlowId::Autoupdate,
    ];

    /// Name used in logs and trigger names
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            FlowId::PersistedAuth => "persistedAuthFlow",
            FlowId::Login => "loginFlow",
            FlowId::Signup => "signupFlow",
            FlowId::TokenRefresh => "tokenRefreshFlow",
            FlowId::SubscriptionCheck => "subscriptionCheckFlow",
            FlowId::MandelboxCreate => "mandelboxCreateFlow",
            FlowId::HostSpinUp => "hostSpinUpFlow",
            FlowId::ProtocolLaunch => "protocolLaunchFlow",
            FlowId::ProtocolClose => "protocolCloseFlow",
            FlowId::Autoupdate => "autoupdateFlow",
        }
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Errors from flow channel access
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FlowError {
    /// The flow exposes no channel with this name
    #[error("Flow '{flow}' has no channel named '{channel}'")]
    MissingChannel {
        /// Flow that was asked
        flow: FlowId,
        /// Requested channel
        channel: String,
    },
}

// ============================================================================
// Fork
// ============================================================================

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Ordered predicate arms for [`fork`]
pub struct Branches<T> {
    arms: Vec<(&'static str, Predicate<T>)>,
}

impl<T> Default for Branches<T> {
    fn default() -> Self {
        Self { arms: Vec::new() }
    }
}

impl<T> fmt::Debug for Branches<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.arms.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Branches").field("arms", &names).finish()
    }
}

impl<T: SignalValue> Branches<T> {
    /// Start an empty arm list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Route values matching `predicate` to channel `name`
    ///
    /// Arms are evaluated in the order they are added.
    #[must_use]
    pub fn when<F>(mut self, name: &'static str, predicate: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        debug_assert!(
            self.arms.iter().all(|(existing, _)| *existing != name) && name != UNMATCHED,
            "fork arm '{name}' declared twice"
        );
        self.arms.push((name, Box::new(predicate)));
        self
    }
}

/// Channels produced by [`fork`]
pub struct Fork<T> {
    channels: Vec<(&'static str, Signal<T>)>,
    unmatched: Signal<T>,
}

impl<T> fmt::Debug for Fork<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.channels.iter().map(|(name, _)| *name).collect();
        f.debug_struct("Fork").field("channels", &names).finish()
    }
}

impl<T: SignalValue> Fork<T> {
    /// Channel for arm `name`
    #[must_use]
    pub fn channel(&self, name: &str) -> Option<Signal<T>> {
        self.channels
            .iter()
            .find(|(arm, _)| *arm == name)
            .map(|(_, signal)| signal.clone())
    }

    /// Values that matched no arm
    #[must_use]
    pub fn unmatched(&self) -> Signal<T> {
        self.unmatched.clone()
    }

    /// Arm names in declaration order
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.channels.iter().map(|(name, _)| *name).collect()
    }
}

/// Partition `source` into one channel per arm, first match wins
pub fn fork<T: SignalValue>(source: &Signal<T>, branches: Branches<T>) -> Fork<T> {
    let arms: Vec<(&'static str, Predicate<T>, Signal<T>)> = branches
        .arms
        .into_iter()
        .map(|(name, predicate)| (name, predicate, Signal::new()))
        .collect();
    let channels = arms
        .iter()
        .map(|(name, _, signal)| (*name, signal.clone()))
        .collect();
    let unmatched = Signal::new();

    let leftover = unmatched.clone();
    let mut upstream = source.subscribe();
    tokio::spawn(async move {
        while let Some(value) = upstream.next().await {
            match arms.iter().find(|(_, predicate, _)| predicate(&value)) {
                Some((_, _, channel)) => {
                    channel.emit(value);
                }
                None => {
                    let arms: Vec<&str> = arms.iter().map(|(name, ..)| *name).collect();
                    tracing::warn!(?arms, "Fork value matched no arm");
                    leftover.emit(value);
                }
            }
        }
    });

    Fork {
        channels,
        unmatched,
    }
}

// ============================================================================
// Channels
// ============================================================================

/// Named output signals of one flow invocation
#[derive(Clone)]
pub struct Channels {
    flow: FlowId,
    signals: BTreeMap<&'static str, Signal<Payload>>,
}

impl fmt::Debug for Channels {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channels")
            .field("flow", &self.flow)
            .field("names", &self.names())
            .finish()
    }
}

impl Channels {
    /// Empty channel map for `flow`
    #[must_use]
    pub fn new(flow: FlowId) -> Self {
        Self {
            flow,
            signals: BTreeMap::new(),
        }
    }

    /// Every arm of `fork`, plus its `unmatched` channel
    #[must_use]
    pub fn from_fork(flow: FlowId, fork: &Fork<Payload>) -> Self {
        let mut channels = Self::new(flow);
        for (name, signal) in &fork.channels {
            channels.signals.insert(*name, signal.clone());
        }
        channels.signals.insert(UNMATCHED, fork.unmatched());
        channels
    }

    /// Add or replace a channel
    #[must_use]
    pub fn with(mut self, name: &'static str, signal: Signal<Payload>) -> Self {
        self.signals.insert(name, signal);
        self
    }

    /// Transform the values of channel `name`, if present
    #[must_use]
    pub fn map_channel<F>(mut self, name: &'static str, f: F) -> Self
    where
        F: FnMut(Payload) -> Payload + Send + 'static,
    {
        if let Some(signal) = self.signals.get(name) {
            let mapped = signal.map(f);
            self.signals.insert(name, mapped);
        }
        self
    }

    /// Swap the signal behind `name`, returning the previous one
    pub fn replace(&mut self, name: &'static str, signal: Signal<Payload>) -> Option<Signal<Payload>> {
        self.signals.insert(name, signal)
    }

    /// Signal for channel `name`
    pub fn get(&self, name: &str) -> Result<Signal<Payload>, FlowError> {
        self.signals
            .get(name)
            .cloned()
            .ok_or_else(|| FlowError::MissingChannel {
                flow: self.flow,
                channel: name.to_string(),
            })
    }

    /// The `success` channel
    pub fn success(&self) -> Result<Signal<Payload>, FlowError> {
        self.get(SUCCESS)
    }

    /// The `failure` channel
    pub fn failure(&self) -> Result<Signal<Payload>, FlowError> {
        self.get(FAILURE)
    }

    /// Channel names, sorted
    #[must_use]
    pub fn names(&self) -> Vec<&'static str> {
        self.signals.keys().copied().collect()
    }

    /// Iterate `(name, signal)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Signal<Payload>)> + '_ {
        self.signals.iter().map(|(name, signal)| (*name, signal))
    }

    /// Flow that produced these channels
    #[must_use]
    pub fn flow(&self) -> FlowId {
        self.flow
    }
}

// ============================================================================
// Flow
// ============================================================================

type Builder = Arc<dyn Fn(&Signal<Payload>) -> Channels + Send + Sync>;

/// A named transformation from an input signal to named output channels
///
/// Each [`Flow::run`] builds a fresh, independent set of subscriptions.
#[derive(Clone)]
pub struct Flow {
    id: FlowId,
    builder: Builder,
    schema: Option<Arc<MockSchema>>,
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("id", &self.id)
            .field("schema", &self.schema.as_ref().map(|s| s.name().to_string()))
            .finish()
    }
}

impl Flow {
    /// Wrap a builder
    pub fn new<F>(id: FlowId, builder: F) -> Self
    where
        F: Fn(&Signal<Payload>) -> Channels + Send + Sync + 'static,
    {
        Self {
            id,
            builder: Arc::new(builder),
            schema: None,
        }
    }

    /// Apply channel overrides from `schema` on every run
    #[must_use]
    pub fn mocked_by(mut self, schema: Option<Arc<MockSchema>>) -> Self {
        self.schema = schema;
        self
    }

    /// Flow identity
    #[must_use]
    pub fn id(&self) -> FlowId {
        self.id
    }

    /// Build the channels for `input`
    ///
    /// Overridden channels replace the builder's signal for that channel
    /// only; the rest are the builder's own. When the schema overrides every
    /// channel the builder exposes, the builder never sees `input`, so none
    /// of its live calls are made.
    pub fn run(&self, input: &Signal<Payload>) -> Channels {
        let mut channels = match &self.schema {
            Some(schema) if schema.overrides_for(self.id).next().is_some() => {
                let dormant = (self.builder)(&Signal::new());
                if self.fully_mocked(schema, &dormant) {
                    tracing::info!(flow = %self.id, schema = schema.name(), "Live flow skipped");
                    dormant
                } else {
                    (self.builder)(input)
                }
            }
            _ => (self.builder)(input),
        };

        if let Some(schema) = &self.schema {
            for (channel, mock) in schema.overrides_for(self.id) {
                tracing::info!(
                    flow = %self.id,
                    channel,
                    schema = schema.name(),
                    "Channel replaced by mock schema"
                );
                channels.replace(channel, mock(input));
            }
        }

        for (channel, signal) in channels.iter() {
            let flow = self.id;
            signal.for_each(move |payload| {
                tracing::debug!(
                    flow = %flow,
                    channel,
                    payload = %logging::redact(&payload),
                    "Flow emitted"
                );
            });
        }

        channels
    }

    /// Every channel but `unmatched` is overridden
    fn fully_mocked(&self, schema: &MockSchema, channels: &Channels) -> bool {
        channels
            .names()
            .into_iter()
            .filter(|name| *name != UNMATCHED)
            .all(|name| schema.overrides(self.id, name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::Subscription;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    async fn next<T>(sub: &mut Subscription<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .ok()
            .flatten()
    }

    fn sign_fork(source: &Signal<i64>) -> Fork<i64> {
        fork(
            source,
            Branches::new()
                .when("positive", |v: &i64| *v > 0)
                .when("even", |v: &i64| v % 2 == 0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fork_first_match_wins() {
        let source = Signal::new();
        let forked = sign_fork(&source);
        let mut positive = forked.channel("positive").unwrap().subscribe();
        let mut even = forked.channel("even").unwrap().subscribe();

        source.emit(4);
        source.emit(-2);

        assert_eq!(next(&mut positive).await, Some(4));
        assert_eq!(next(&mut even).await, Some(-2));
        assert_eq!(next(&mut positive).await, None);
        assert_eq!(next(&mut even).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fork_routes_leftovers_to_unmatched() {
        let source = Signal::new();
        let forked = sign_fork(&source);
        let mut unmatched = forked.unmatched().subscribe();

        source.emit(-3);

        assert_eq!(next(&mut unmatched).await, Some(-3));
        assert_eq!(forked.names(), vec!["positive", "even"]);
        assert!(forked.channel(UNMATCHED).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fork_evaluates_predicates_once_per_value() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);

        let source = Signal::new();
        let forked = fork(
            &source,
            Branches::new().when(SUCCESS, move |_: &u8| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );
        let mut a = forked.channel(SUCCESS).unwrap().subscribe();
        let mut b = forked.channel(SUCCESS).unwrap().subscribe();

        source.emit(1);

        assert_eq!(next(&mut a).await, Some(1));
        assert_eq!(next(&mut b).await, Some(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    fn echo_flow() -> Flow {
        Flow::new(FlowId::Login, |input| {
            let forked = fork(
                input,
                Branches::new()
                    .when(SUCCESS, |p: &Payload| p["ok"] == json!(true))
                    .when(FAILURE, |p: &Payload| p["ok"] != json!(true)),
            );
            Channels::from_fork(FlowId::Login, &forked)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_flow_channels_match_builder() {
        let input = Signal::new();
        let channels = echo_flow().run(&input);
        let mut success = channels.success().unwrap().subscribe();
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(json!({"ok": true}));
        input.emit(json!({"ok": false}));

        assert_eq!(next(&mut success).await, Some(json!({"ok": true})));
        assert_eq!(next(&mut failure).await, Some(json!({"ok": false})));
        assert_eq!(channels.names(), vec![FAILURE, SUCCESS, UNMATCHED]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_runs_are_independent() {
        let flow = echo_flow();
        let first_input = Signal::new();
        let second_input = Signal::new();
        let mut first = flow.run(&first_input).success().unwrap().subscribe();
        let mut second = flow.run(&second_input).success().unwrap().subscribe();

        second_input.emit(json!({"ok": true, "run": 2}));

        assert_eq!(next(&mut second).await, Some(json!({"ok": true, "run": 2})));
        assert_eq!(next(&mut first).await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_override_replaces_only_named_channel() {
        let schema = MockSchema::new("test").with_override(FlowId::Login, SUCCESS, |input| {
            input.map(|_| json!({"mocked": true}))
        });
        let input = Signal::new();
        let channels = echo_flow().mocked_by(Some(Arc::new(schema))).run(&input);
        let mut success = channels.success().unwrap().subscribe();
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(json!({"ok": false}));

        assert_eq!(next(&mut success).await, Some(json!({"mocked": true})));
        assert_eq!(next(&mut failure).await, Some(json!({"ok": false})));
    }

    fn counting_flow(calls: Arc<AtomicUsize>) -> Flow {
        Flow::new(FlowId::Login, move |input| {
            let calls = Arc::clone(&calls);
            let answered = input.map_async(move |request| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { request }
            });
            let forked = fork(
                &answered,
                Branches::new()
                    .when(SUCCESS, |p: &Payload| p["ok"] == json!(true))
                    .when(FAILURE, |p: &Payload| p["ok"] != json!(true)),
            );
            Channels::from_fork(FlowId::Login, &forked)
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_fully_overridden_flow_makes_no_live_call() {
        let calls = Arc::new(AtomicUsize::new(0));
        let schema = MockSchema::new("test")
            .with_override(FlowId::Login, SUCCESS, |input| input.map(|_| json!({"mocked": true})))
            .with_override(FlowId::Login, FAILURE, |_| crate::mock::silence());
        let input = Signal::new();
        let channels = counting_flow(Arc::clone(&calls))
            .mocked_by(Some(Arc::new(schema)))
            .run(&input);
        let mut success = channels.success().unwrap().subscribe();

        input.emit(json!({"ok": false}));

        assert_eq!(next(&mut success).await, Some(json!({"mocked": true})));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(channels.get(UNMATCHED).is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_partly_overridden_flow_still_runs_live() {
        let calls = Arc::new(AtomicUsize::new(0));
        let schema = MockSchema::new("test")
            .with_override(FlowId::Login, SUCCESS, |_| crate::mock::silence());
        let input = Signal::new();
        let channels = counting_flow(Arc::clone(&calls))
            .mocked_by(Some(Arc::new(schema)))
            .run(&input);
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(json!({"ok": false}));

        assert_eq!(next(&mut failure).await, Some(json!({"ok": false})));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_channel_is_an_error() {
        let channels = Channels::new(FlowId::Autoupdate);
        assert_eq!(
            channels.success().unwrap_err(),
            FlowError::MissingChannel {
                flow: FlowId::Autoupdate,
                channel: SUCCESS.into()
            }
        );
    }

    #[test]
    fn test_flow_names_are_unique() {
        let mut names: Vec<&str> = FlowId::ALL.iter().map(FlowId::name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), FlowId::ALL.len());
    }
}
