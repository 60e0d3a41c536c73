//! Flow Graph - Composition Root
//!
//! Registers every trigger, runs every flow and attaches the effects and
//! the session machine. Nothing else in the crate knows how flows are
//! connected.
//!
//! ```text
//! appReady ─▶ persisted ─▶ persistedAuthFlow ─┐
//! loginAction ─▶ loginFlow ───────────────────┼─▶ authenticated ─▶ mandelboxRequest
//! signupAction ─▶ signupFlow ─────────────────┘          │               │
//!                              tokenRefreshFlow ◀────────┘               ▼
//!                                                    mandelboxCreateFlow (per attempt)
//!                                                                        ▼
//!                                                       hostSpinUpFlow (per attempt)
//!                                                                        ▼
//!                       protocolCloseFlow (per process) ◀── protocolLaunchFlow
//! ```
//!
//! # Join Points
//!
//! | Where | Drives cadence | Supplies latest value |
//! |-------|----------------|-----------------------|
//! | token refresh | refresh interval tick | `authenticated` |
//! | relaunch | `relaunchAction` | `authenticated` (read through its replay) |
//! | host spin-up | mandelbox `success` | credentials the attempt started with |
//!
//! The persisted check is built when the app becomes ready, and mandelbox
//! assignment and host spin-up are rebuilt for every attempt, so that their
//! deadlines start when the work does. Attempts run one at a time in request
//! order. Protocol close is rebuilt for every process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::config::{DEFAULT_AUTOUPDATE_INTERVAL, DEFAULT_TOKEN_REFRESH_INTERVAL};
use crate::effects::{self, ProtocolSupervisor, WindowCommand, WindowKind, Windows};
use crate::flow::{Channels, Flow, FlowError, FlowId, FAILURE, SUCCESS};
use crate::flows::{auth, autoupdate, host, mandelbox, payment, protocol, FlowContext};
use crate::flows::{AVAILABLE, SPAWNED, WARNING};
use crate::http::ServerResponse;
use crate::ipc::RendererState;
use crate::logging;
use crate::protocol::{LaunchInfo, ProtocolSpawner};
use crate::registry::{Payload, RegistryError, TriggerRegistry};
use crate::session::{SessionEvent, SessionMachine, SessionState};
use crate::signal::{Signal, Subscription};
use crate::store::Store;
use crate::triggers::{
    flow_trigger, APP_READY, AUTHENTICATED, LOGIN_ACTION, MANDELBOX_REQUEST, PERSISTED,
    QUIT_ACTION, RELAUNCH_ACTION, SIGNOUT_ACTION, SIGNUP_ACTION,
};

/// Extra time a run waits beyond its flow's own deadline before giving up
const ATTEMPT_SLACK: Duration = Duration::from_secs(5);

/// Channels of per-attempt and per-process flows, published as sources
const PER_RUN_CHANNELS: [(FlowId, &[&str]); 4] = [
    (FlowId::PersistedAuth, &[SUCCESS, FAILURE]),
    (FlowId::MandelboxCreate, &[SUCCESS, FAILURE]),
    (FlowId::HostSpinUp, &[SUCCESS, FAILURE]),
    (FlowId::ProtocolClose, &[SPAWNED, SUCCESS, FAILURE]),
];

/// Errors wiring the graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// Trigger registration or lookup failed
    #[error(transparent)]
    Registry(#[from] RegistryError),

    /// A flow lacks a channel the graph consumes
    #[error(transparent)]
    Flow(#[from] FlowError),
}

/// What the graph needs from the outside world
pub struct Dependencies {
    /// Shared flow environment
    pub context: FlowContext,
    /// Persisted store
    pub store: Store,
    /// Starts protocol processes
    pub spawner: Arc<dyn ProtocolSpawner>,
    /// Period between token refreshes
    pub token_refresh_interval: Duration,
    /// Period between update checks
    pub autoupdate_interval: Duration,
}

impl fmt::Debug for Dependencies {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dependencies")
            .field("context", &self.context)
            .field("store", &self.store)
            .field("token_refresh_interval", &self.token_refresh_interval)
            .field("autoupdate_interval", &self.autoupdate_interval)
            .finish_non_exhaustive()
    }
}

impl Dependencies {
    /// Dependencies with default intervals
    #[must_use]
    pub fn new(context: FlowContext, store: Store, spawner: Arc<dyn ProtocolSpawner>) -> Self {
        Self {
            context,
            store,
            spawner,
            token_refresh_interval: DEFAULT_TOKEN_REFRESH_INTERVAL,
            autoupdate_interval: DEFAULT_AUTOUPDATE_INTERVAL,
        }
    }

    /// Override the periodic intervals
    #[must_use]
    pub fn with_intervals(mut self, token_refresh: Duration, autoupdate: Duration) -> Self {
        self.token_refresh_interval = token_refresh;
        self.autoupdate_interval = autoupdate;
        self
    }
}

/// Latest renderer state plus a signal of every change
#[derive(Clone, Debug)]
struct Renderer {
    state: Arc<Mutex<RendererState>>,
    states: Signal<RendererState>,
}

impl Renderer {
    fn new() -> Self {
        let initial = RendererState {
            session: Some(SessionState::Idle),
            ..RendererState::default()
        };
        Self {
            state: Arc::new(Mutex::new(initial.clone())),
            states: Signal::seeded(initial),
        }
    }

    fn update(&self, f: impl FnOnce(&mut RendererState)) {
        let mut state = self.state.lock();
        f(&mut state);
        self.states.emit(state.clone());
    }
}

/// Flows rebuilt for every mandelbox attempt
#[derive(Clone, Debug)]
struct Attempts {
    mandelbox: Flow,
    host: Flow,
    deadline: Duration,
}

/// Handles every subscriber needs
#[derive(Clone)]
struct Shared {
    registry: TriggerRegistry,
    session: Arc<SessionMachine>,
    store: Store,
    windows: Windows,
    supervisor: Arc<ProtocolSupervisor>,
    renderer: Renderer,
    authenticated: Signal<Payload>,
    mandelbox_request: Signal<Payload>,
}

impl Shared {
    /// Record valid credentials and ask for a mandelbox with them
    fn authenticate(&self, credentials: Payload) {
        self.authenticated.emit(credentials.clone());
        self.mandelbox_request.emit(credentials);
    }

    fn publish_outcome(&self, flow: FlowId, channel: &str, payload: Payload) {
        if let Err(e) = self.registry.emit(&flow_trigger(flow, channel), payload) {
            tracing::warn!(flow = %flow, channel, error = %e, "Outcome not published");
        }
    }

    /// Run `flow` once on `payload` and wait for its outcome
    async fn run_once(&self, flow: &Flow, payload: Payload, deadline: Duration) -> (&'static str, Payload) {
        let input = Signal::new();
        let channels = flow.run(&input);
        let mut outcomes = outcomes(&channels, &[SUCCESS, FAILURE]);
        input.emit(payload);

        match tokio::time::timeout(deadline, outcomes.next()).await {
            Ok(Some(outcome)) => outcome,
            _ => {
                tracing::warn!(flow = %flow.id(), ?deadline, "Attempt produced no outcome");
                (FAILURE, ServerResponse::timed_out().into_payload())
            }
        }
    }

    /// One mandelbox attempt, through host spin-up
    async fn run_attempt(&self, attempts: &Attempts, credentials: Payload) {
        if self.session.state() != SessionState::CreatingContainer
            && self.session.apply(SessionEvent::ContainerRequested).is_none()
        {
            tracing::debug!(state = %self.session.state(), "Mandelbox request ignored");
            return;
        }

        let (channel, mandelbox) = self
            .run_once(&attempts.mandelbox, credentials.clone(), attempts.deadline)
            .await;
        let event = if channel == SUCCESS {
            SessionEvent::ContainerCreated
        } else {
            SessionEvent::ContainerFailed
        };
        if !self.advance(event, FlowId::MandelboxCreate, channel, mandelbox.clone()) || channel != SUCCESS {
            return;
        }

        let request = host::host_request(&mandelbox, &credentials);
        let (channel, ready) = self.run_once(&attempts.host, request, attempts.deadline).await;
        let event = if channel == SUCCESS {
            SessionEvent::HostReady
        } else {
            SessionEvent::HostFailed
        };
        self.advance(event, FlowId::HostSpinUp, channel, ready);
    }

    /// Apply `event` and publish the outcome that caused it
    ///
    /// An outcome the session no longer accepts (the user signed out while
    /// the call was in flight) is dropped unpublished.
    fn advance(&self, event: SessionEvent, flow: FlowId, channel: &str, payload: Payload) -> bool {
        if self.session.apply(event).is_none() {
            tracing::info!(flow = %flow, channel, state = %self.session.state(), "Stale outcome dropped");
            return false;
        }
        self.publish_outcome(flow, channel, payload);
        true
    }

    /// Spawn the protocol and follow it with a fresh close flow
    fn launch_protocol(&self, close: &Flow, launch: &Payload) {
        let state = self.session.state();
        if state != SessionState::LaunchingProtocol {
            tracing::warn!(state = %state, "Protocol launch outside of session setup ignored");
            return;
        }
        let Some(info) = LaunchInfo::from_payload(launch) else {
            tracing::error!("Launch payload is not launch info");
            self.session.apply(SessionEvent::ProtocolFailed);
            return;
        };
        let (generation, events) = self.supervisor.launch(&info);
        let channels = close.run(&events);
        for channel in [SPAWNED, SUCCESS, FAILURE] {
            match channels.get(channel) {
                Ok(signal) => {
                    let shared = self.clone();
                    signal.for_each(move |payload| shared.protocol_event(generation, channel, payload));
                }
                Err(e) => tracing::error!(error = %e, "Protocol close channel missing"),
            }
        }
    }

    fn protocol_event(&self, generation: u64, channel: &'static str, payload: Payload) {
        if !self.supervisor.is_current(generation) {
            tracing::debug!(generation, channel, "Event from a replaced protocol process");
            return;
        }
        self.publish_outcome(FlowId::ProtocolClose, channel, payload);
        match channel {
            SPAWNED => {
                self.session.apply(SessionEvent::ProtocolSpawned);
            }
            SUCCESS => {
                self.supervisor.exited(generation);
                self.session
                    .apply_all(&[SessionEvent::ProtocolClosed, SessionEvent::ProtocolExited]);
            }
            _ if self.supervisor.stopped_on_purpose() => {
                self.supervisor.exited(generation);
                self.session
                    .apply_all(&[SessionEvent::ProtocolClosed, SessionEvent::ProtocolExited]);
            }
            _ => {
                self.supervisor.exited(generation);
                self.session.apply(SessionEvent::ProtocolFailed);
            }
        }
    }

    /// Settle the startup check: sign in with stored credentials or ask for login
    fn persisted_checked(&self, channel: &str, outcome: Payload) {
        if channel == SUCCESS {
            if self.advance(SessionEvent::PersistedFound, FlowId::PersistedAuth, channel, outcome.clone()) {
                self.authenticate(outcome);
            }
            return;
        }
        let event = match outcome["error"].as_str() {
            Some(error) if error != "TIMEOUT" => SessionEvent::StorageFailed,
            _ => SessionEvent::PersistedMissing,
        };
        self.advance(event, FlowId::PersistedAuth, channel, outcome);
    }

    fn relaunch(&self) {
        match self.session.state() {
            SessionState::Error(stage) => {
                self.session.apply(SessionEvent::RetryRequested);
                if stage.needs_login() {
                    return;
                }
            }
            SessionState::Idle | SessionState::Authenticated => {}
            other => {
                tracing::debug!(state = %other, "Relaunch ignored");
                return;
            }
        }
        match self.authenticated.latest().filter(|c| !c.is_null()) {
            Some(credentials) => {
                self.mandelbox_request.emit(credentials);
            }
            None => {
                tracing::info!("Relaunch without credentials, asking for login");
                self.session.apply(SessionEvent::SignedOut);
            }
        }
    }
}

/// First value on any of `names`, tagged with its channel
fn outcomes(channels: &Channels, names: &[&'static str]) -> Subscription<(&'static str, Payload)> {
    let streams = names.iter().filter_map(|&name| match channels.get(name) {
        Ok(signal) => Some(signal.subscribe().map(move |payload| (name, payload)).boxed()),
        Err(e) => {
            tracing::error!(error = %e, "Outcome channel missing");
            None
        }
    });
    futures::stream::select_all(streams).boxed()
}

/// Register every channel of `channels` under its flow trigger name
fn publish(registry: &TriggerRegistry, channels: Channels) -> Result<Channels, GraphError> {
    for (name, signal) in channels.iter() {
        registry.create_trigger(flow_trigger(channels.flow(), name), signal.clone())?;
    }
    Ok(channels)
}

fn is_auth_rejection(response: &Payload) -> bool {
    matches!(response["status"].as_u64(), Some(401 | 403))
}

/// The wired launcher
pub struct FlowGraph {
    shared: Shared,
    quit: Signal<Payload>,
    tasks: Vec<JoinHandle<()>>,
}

impl fmt::Debug for FlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlowGraph")
            .field("session", &self.shared.session.state())
            .field("registry", &self.shared.registry)
            .field("tasks", &self.tasks.len())
            .finish()
    }
}

impl FlowGraph {
    /// Wire every trigger, flow and effect into `registry`
    ///
    /// Must be called inside a tokio runtime. Fails if any trigger name is
    /// already registered. Nothing runs against the store until
    /// [`FlowGraph::start`], so the graph may sit built for any length of time.
    pub fn build(registry: &TriggerRegistry, deps: Dependencies) -> Result<Self, GraphError> {
        let Dependencies {
            context: ctx,
            store,
            spawner,
            token_refresh_interval,
            autoupdate_interval,
        } = deps;

        let app_ready = registry.create_source(APP_READY)?;
        let persisted = registry.create_trigger(PERSISTED, Signal::replay())?;
        let login_action = registry.create_source(LOGIN_ACTION)?;
        let signup_action = registry.create_source(SIGNUP_ACTION)?;
        let signout_action = registry.create_source(SIGNOUT_ACTION)?;
        let relaunch_action = registry.create_source(RELAUNCH_ACTION)?;
        let quit_action = registry.create_source(QUIT_ACTION)?;
        let authenticated = registry.create_trigger(AUTHENTICATED, Signal::replay())?;
        let mandelbox_request = registry.create_source(MANDELBOX_REQUEST)?;
        for (flow, channels) in PER_RUN_CHANNELS {
            for channel in channels {
                registry.create_source(flow_trigger(flow, channel))?;
            }
        }

        let shared = Shared {
            registry: registry.clone(),
            session: Arc::new(SessionMachine::new()),
            store,
            windows: Windows::new(),
            supervisor: Arc::new(ProtocolSupervisor::new(spawner)),
            renderer: Renderer::new(),
            authenticated: authenticated.clone(),
            mandelbox_request: mandelbox_request.clone(),
        };
        let mut tasks = Vec::new();

        // Session state drives the main window and the renderer
        tasks.push(shared.session.states().for_each({
            let s = shared.clone();
            move |state| {
                s.windows.follow(state);
                let window = s.windows.main();
                s.renderer.update(|r| {
                    r.session = Some(state);
                    r.window = window;
                });
            }
        }));

        // Startup: the persisted check is built when the app is ready, so
        // its deadline runs from then
        let persisted_auth = auth::persisted_auth(&ctx);
        let check_deadline = ctx.policy_timeout + ATTEMPT_SLACK;
        tasks.push(app_ready.for_each_async({
            let s = shared.clone();
            let persisted = persisted.clone();
            move |_| {
                let s = s.clone();
                let persisted = persisted.clone();
                let flow = persisted_auth.clone();
                async move {
                    if s.session.apply(SessionEvent::Started).is_none() {
                        return;
                    }
                    let snapshot = s.store.snapshot();
                    persisted.emit(snapshot.clone());
                    let (channel, outcome) = s.run_once(&flow, snapshot, check_deadline).await;
                    s.persisted_checked(channel, outcome);
                }
            }
        }));

        // Login and signup
        let login = publish(registry, auth::login(&ctx).run(&login_action))?;
        let signup = publish(registry, auth::signup(&ctx).run(&signup_action))?;
        let signed_in = login.success()?.merge(&signup.success()?);
        tasks.push(signed_in.for_each_async({
            let s = shared.clone();
            move |credentials| {
                let s = s.clone();
                async move {
                    if s.session.apply(SessionEvent::LoginSucceeded).is_none() {
                        return;
                    }
                    s.renderer.update(|r| r.warning = None);
                    effects::persist_credentials(&s.store, &credentials);
                    s.authenticate(credentials);
                    effects::flush_store(&s.store).await;
                }
            }
        }));
        let rejected = login
            .failure()?
            .merge(&signup.failure()?)
            .merge(&signup.get(WARNING)?);
        tasks.push(rejected.for_each({
            let s = shared.clone();
            move |response| {
                s.session.apply(SessionEvent::LoginFailed);
                s.renderer.update(|r| r.warning = Some(logging::redact(&response)));
            }
        }));

        // Token refresh: the interval drives cadence, `authenticated`
        // supplies the credentials. Ticks before any login are dropped.
        let refresh_input = Signal::interval(token_refresh_interval)
            .filter(|tick| *tick > 0)
            .with_latest_from(&authenticated)
            .filter_map(|(_, credentials)| (!credentials.is_null()).then_some(credentials));
        let token_refresh = publish(registry, auth::token_refresh(&ctx).run(&refresh_input))?;
        tasks.push(token_refresh.success()?.for_each_async({
            let s = shared.clone();
            move |credentials| {
                let s = s.clone();
                async move {
                    if effects::persist_credentials(&s.store, &credentials) {
                        s.authenticated.emit(credentials);
                        effects::flush_store(&s.store).await;
                    }
                }
            }
        }));
        tasks.push(token_refresh.failure()?.for_each({
            let s = shared.clone();
            move |response| {
                if is_auth_rejection(&response) {
                    s.session.apply(SessionEvent::AuthExpired);
                } else {
                    tracing::warn!(status = %response["status"], "Token refresh failed, keeping credentials");
                }
            }
        }));

        // Subscription check runs beside every mandelbox request
        let subscription =
            publish(registry, payment::subscription_check(&ctx).run(&mandelbox_request))?;
        tasks.push(subscription.failure()?.for_each({
            let s = shared.clone();
            move |_| s.windows.open_extra(WindowKind::Payment)
        }));

        // Mandelbox and host, one attempt at a time
        let attempts = Attempts {
            mandelbox: mandelbox::mandelbox_create(&ctx),
            host: host::host_spin_up(&ctx),
            deadline: ctx.mandelbox_timeout + ATTEMPT_SLACK,
        };
        tasks.push(mandelbox_request.for_each_async({
            let s = shared.clone();
            move |credentials| {
                let s = s.clone();
                let attempts = attempts.clone();
                async move { s.run_attempt(&attempts, credentials).await }
            }
        }));

        // Protocol
        let host_ready = registry.from_trigger(&flow_trigger(FlowId::HostSpinUp, SUCCESS))?;
        let launch = publish(registry, protocol::protocol_launch(&ctx).run(&host_ready))?;
        let close = protocol::protocol_close(&ctx);
        tasks.push(launch.success()?.for_each({
            let s = shared.clone();
            move |info| s.launch_protocol(&close, &info)
        }));
        tasks.push(launch.failure()?.for_each({
            let s = shared.clone();
            move |_| {
                s.session.apply(SessionEvent::ProtocolFailed);
            }
        }));

        // User actions
        tasks.push(signout_action.for_each_async({
            let s = shared.clone();
            move |_| {
                let s = s.clone();
                async move {
                    s.supervisor.stop();
                    effects::clear_credentials(&s.store);
                    s.authenticated.emit(Value::Null);
                    s.session.apply(SessionEvent::SignedOut);
                    effects::flush_store(&s.store).await;
                }
            }
        }));
        tasks.push(relaunch_action.for_each({
            let s = shared.clone();
            move |_| s.relaunch()
        }));
        tasks.push(quit_action.for_each({
            let s = shared.clone();
            move |_| {
                s.supervisor.stop();
            }
        }));

        // Autoupdate: app ready and every later interval tick each trigger a check
        let ticks = app_ready.merge(
            &Signal::interval(autoupdate_interval)
                .filter(|tick| *tick > 0)
                .map(|tick| json!(tick)),
        );
        let autoupdate = publish(registry, autoupdate::autoupdate(&ctx).run(&ticks))?;
        tasks.push(autoupdate.get(AVAILABLE)?.for_each({
            let s = shared.clone();
            move |versions| {
                let announced = s.renderer.state.lock().update.is_some();
                s.renderer.update(|r| r.update = Some(versions));
                if !announced {
                    s.windows.open_extra(WindowKind::Update);
                }
            }
        }));

        tracing::info!(triggers = registry.len(), "Flow graph built");
        Ok(Self {
            shared,
            quit: quit_action,
            tasks,
        })
    }

    /// Announce that the application is ready
    pub fn start(&self) -> Result<(), GraphError> {
        self.shared.registry.emit(APP_READY, json!({}))?;
        Ok(())
    }

    /// Registry the graph was built into
    #[must_use]
    pub fn registry(&self) -> &TriggerRegistry {
        &self.shared.registry
    }

    /// Current session state
    #[must_use]
    pub fn session(&self) -> SessionState {
        self.shared.session.state()
    }

    /// Every session state, starting with the current one
    #[must_use]
    pub fn session_states(&self) -> Signal<SessionState> {
        self.shared.session.states()
    }

    /// Window instructions for the renderer
    #[must_use]
    pub fn window_commands(&self) -> Signal<WindowCommand> {
        self.shared.windows.commands()
    }

    /// Every renderer state, starting with the current one
    #[must_use]
    pub fn renderer_states(&self) -> Signal<RendererState> {
        self.shared.renderer.states.clone()
    }

    /// Emits when the user asks to quit
    #[must_use]
    pub fn quit_requested(&self) -> Signal<Payload> {
        self.quit.clone()
    }

    /// Stop the protocol and write the store
    pub async fn shutdown(&self) {
        self.shared.supervisor.stop_and_wait().await;
        effects::flush_store(&self.shared.store).await;
        tracing::info!("Flow graph shut down");
    }
}

impl Drop for FlowGraph {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::StubApi;
    use crate::protocol::ProcessSpawner;
    use pretty_assertions::assert_eq;

    fn deps() -> Dependencies {
        Dependencies::new(
            FlowContext::new(Arc::new(StubApi::new())),
            Store::in_memory(),
            Arc::new(ProcessSpawner::new("/nonexistent/whist-client")),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_registers_every_flow_channel() {
        let registry = TriggerRegistry::new();
        let _graph = FlowGraph::build(&registry, deps()).unwrap();

        for name in [
            APP_READY,
            PERSISTED,
            AUTHENTICATED,
            "persistedAuthFlowSuccess",
            "loginFlowFailure",
            "signupFlowWarning",
            "mandelboxCreateFlowSuccess",
            "hostSpinUpFlowFailure",
            "protocolLaunchFlowSuccess",
            "protocolCloseFlowSpawned",
            "autoupdateFlowNotAvailable",
            "subscriptionCheckFlowFailure",
        ] {
            assert!(registry.contains(name), "missing trigger {name}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_building_twice_into_one_registry_fails() {
        let registry = TriggerRegistry::new();
        let _graph = FlowGraph::build(&registry, deps()).unwrap();

        let second = FlowGraph::build(&registry, deps());
        assert!(matches!(
            second,
            Err(GraphError::Registry(RegistryError::DuplicateTrigger(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_credentials_asks_for_login() {
        let registry = TriggerRegistry::new();
        let graph = FlowGraph::build(&registry, deps()).unwrap();
        let mut states = graph.session_states().subscribe();

        graph.start().unwrap();

        assert_eq!(states.next().await, Some(SessionState::Idle));
        assert_eq!(states.next().await, Some(SessionState::CheckingPersisted));
        assert_eq!(states.next().await, Some(SessionState::AwaitingLogin));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_start_still_finds_persisted_credentials() {
        let registry = TriggerRegistry::new();
        let deps = deps();
        let store = deps.store.clone();
        let graph = FlowGraph::build(&registry, deps).unwrap();
        let mut found = registry.from_trigger("persistedAuthFlowSuccess").unwrap().subscribe();
        let mut states = graph.session_states().subscribe();

        tokio::time::sleep(Duration::from_secs(30)).await;
        store.set("auth.userEmail", "a@b.com");
        store.set("auth.accessToken", "at");
        store.set("auth.refreshToken", "rt");
        store.set("auth.configToken", "ct");
        graph.start().unwrap();

        let credentials = tokio::time::timeout(Duration::from_secs(1), found.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credentials["accessToken"], "at");
        let mut seen = Vec::new();
        while let Ok(Some(state)) = tokio::time::timeout(Duration::from_secs(1), states.next()).await {
            seen.push(state);
            if state == SessionState::Authenticated {
                break;
            }
        }
        assert!(seen.contains(&SessionState::Authenticated), "{seen:?}");
        assert!(!seen.contains(&SessionState::AwaitingLogin), "{seen:?}");
    }

    #[test]
    fn test_auth_rejection_statuses() {
        assert!(is_auth_rejection(&json!({"status": 401, "json": {}})));
        assert!(!is_auth_rejection(&json!({"status": 500, "json": {}})));
    }
}
