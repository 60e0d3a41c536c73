//! Side effects attached to the flow graph
//!
//! Flows only describe outcomes. Everything that touches the world outside
//! the graph (windows, the persisted store, the protocol process) happens
//! here, driven by the graph's subscribers.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::protocol::{LaunchInfo, ProtocolHandle, ProtocolSpawner};
use crate::registry::Payload;
use crate::session::{ErrorStage, SessionState};
use crate::signal::{Signal, Subscription};
use crate::store::{Credentials, Store};

// ============================================================================
// Windows
// ============================================================================

/// Windows the renderer knows how to show
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "stage", rename_all = "camelCase")]
pub enum WindowKind {
    /// Login and signup
    Auth,
    /// Progress while a session is being established
    Loading,
    /// Subscription required
    Payment,
    /// A newer client is available
    Update,
    /// A stage failed
    Error(ErrorStage),
}

/// Instruction for the renderer
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command", content = "window", rename_all = "camelCase")]
pub enum WindowCommand {
    /// Show a window
    Open(WindowKind),
    /// Hide a window
    Close(WindowKind),
}

/// The window that represents `state`, if any
///
/// While streaming the protocol owns the screen, so no launcher window is
/// shown.
#[must_use]
pub fn window_for(state: SessionState) -> Option<WindowKind> {
    match state {
        SessionState::AwaitingLogin => Some(WindowKind::Auth),
        SessionState::CheckingPersisted
        | SessionState::Authenticated
        | SessionState::CreatingContainer
        | SessionState::SpinningUpHost
        | SessionState::LaunchingProtocol => Some(WindowKind::Loading),
        SessionState::Error(stage) => Some(WindowKind::Error(stage)),
        SessionState::Idle | SessionState::Streaming | SessionState::ClosingProtocol => None,
    }
}

/// Tracks the main window and publishes open/close commands
///
/// Payment and update windows are shown alongside the main window and are
/// not replaced by session changes.
#[derive(Debug, Clone, Default)]
pub struct Windows {
    main: Arc<Mutex<Option<WindowKind>>>,
    commands: Signal<WindowCommand>,
}

impl Windows {
    /// No window open
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every command issued from now on
    #[must_use]
    pub fn commands(&self) -> Signal<WindowCommand> {
        self.commands.clone()
    }

    /// Currently shown main window
    #[must_use]
    pub fn main(&self) -> Option<WindowKind> {
        *self.main.lock()
    }

    /// Replace the main window with the one for `state`
    pub fn follow(&self, state: SessionState) {
        let wanted = window_for(state);
        let mut main = self.main.lock();
        if *main == wanted {
            return;
        }
        if let Some(previous) = main.take() {
            self.commands.emit(WindowCommand::Close(previous));
        }
        if let Some(kind) = wanted {
            tracing::debug!(window = ?kind, %state, "Opening window");
            self.commands.emit(WindowCommand::Open(kind));
        }
        *main = wanted;
    }

    /// Show a window next to the main one
    pub fn open_extra(&self, kind: WindowKind) {
        tracing::debug!(window = ?kind, "Opening window");
        self.commands.emit(WindowCommand::Open(kind));
    }
}

// ============================================================================
// Credentials
// ============================================================================

/// Write credentials from a flow payload to the store
///
/// Returns `false` for payloads that are not complete credentials.
pub fn persist_credentials(store: &Store, payload: &Payload) -> bool {
    match Credentials::from_payload(payload) {
        Some(credentials) => {
            store.set_credentials(&credentials);
            tracing::info!(user = %credentials.user_email, "Credentials persisted");
            true
        }
        None => {
            tracing::warn!("Refusing to persist incomplete credentials");
            false
        }
    }
}

/// Forget the signed-in user
pub fn clear_credentials(store: &Store) {
    store.clear_auth();
    tracing::info!("Credentials cleared");
}

/// Write the store to disk, logging failures
pub async fn flush_store(store: &Store) {
    if let Err(e) = store.flush().await {
        tracing::error!(error = %e, "Failed to flush store");
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// How long a stopped process gets to report its exit at each step
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Owns the running protocol process
///
/// Only one process runs at a time. Every launch gets a new generation;
/// events from an older generation belong to a process that was replaced.
/// Processes stopped through [`ProtocolSupervisor::stop`] are marked so that
/// their exit is not reported as a crash.
pub struct ProtocolSupervisor {
    spawner: Arc<dyn ProtocolSpawner>,
    running: Mutex<Option<Arc<ProtocolHandle>>>,
    generation: AtomicU64,
    stopping: AtomicBool,
}

impl std::fmt::Debug for ProtocolSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolSupervisor")
            .field("running", &self.running.lock().as_ref().and_then(|h| h.pid()))
            .field("generation", &self.generation.load(Ordering::SeqCst))
            .field("stopping", &self.stopping.load(Ordering::SeqCst))
            .finish()
    }
}

impl ProtocolSupervisor {
    /// Supervise processes started by `spawner`
    #[must_use]
    pub fn new(spawner: Arc<dyn ProtocolSpawner>) -> Self {
        Self {
            spawner,
            running: Mutex::new(None),
            generation: AtomicU64::new(0),
            stopping: AtomicBool::new(false),
        }
    }

    /// Start a process for `info`, returning its generation and events
    ///
    /// A process that is still running is stopped first.
    pub fn launch(&self, info: &LaunchInfo) -> (u64, Signal<Payload>) {
        if self.is_running() {
            tracing::warn!("Protocol already running, stopping it before relaunch");
            self.stop();
        }
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.stopping.store(false, Ordering::SeqCst);

        let handle = Arc::new(self.spawner.spawn(info));
        let events = handle.events();
        *self.running.lock() = Some(handle);
        (generation, events)
    }

    /// Whether `generation` is the most recent launch
    #[must_use]
    pub fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Whether a process is held
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Ask the running process to quit, then kill it
    ///
    /// The handle stays alive until the exit is reported so that the exit
    /// still reaches subscribers. Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        match self.take_for_stop() {
            Some((handle, events)) => {
                tokio::spawn(terminate(handle, events));
                true
            }
            None => false,
        }
    }

    /// Like [`ProtocolSupervisor::stop`], but waits for the process to go away
    pub async fn stop_and_wait(&self) -> bool {
        match self.take_for_stop() {
            Some((handle, events)) => {
                terminate(handle, events).await;
                true
            }
            None => false,
        }
    }

    fn take_for_stop(&self) -> Option<(Arc<ProtocolHandle>, Subscription<Payload>)> {
        let handle = self.running.lock().take()?;
        self.stopping.store(true, Ordering::SeqCst);
        tracing::info!(pid = ?handle.pid(), "Stopping protocol");
        let events = handle.events().subscribe();
        Some((handle, events))
    }

    /// Whether the current process was stopped on purpose
    #[must_use]
    pub fn stopped_on_purpose(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Forget the process of `generation` after it exited on its own
    pub fn exited(&self, generation: u64) {
        if self.is_current(generation) {
            self.running.lock().take();
        }
    }
}

/// Send the `kill` argument, then kill outright if the process lingers
async fn terminate(handle: Arc<ProtocolHandle>, mut events: Subscription<Payload>) {
    match handle.send_arg("kill", "0").await {
        Ok(()) => {
            if wait_for_exit(&mut events).await {
                return;
            }
        }
        Err(e) => tracing::debug!(error = %e, "Protocol did not take the kill argument"),
    }
    handle.kill();
    if !wait_for_exit(&mut events).await {
        tracing::warn!(pid = ?handle.pid(), "Protocol did not report its exit");
    }
}

/// Wait up to [`STOP_GRACE`] for anything other than `spawned`
async fn wait_for_exit(events: &mut Subscription<Payload>) -> bool {
    let exit = async {
        while let Some(event) = events.next().await {
            if event["event"] != "spawned" {
                return;
            }
        }
    };
    tokio::time::timeout(STOP_GRACE, exit).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{EventAdapter, NativeEmitter};
    use crate::protocol::ProtocolEvent;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tokio::sync::oneshot;

    #[test]
    fn test_windows_follow_session() {
        assert_eq!(window_for(SessionState::AwaitingLogin), Some(WindowKind::Auth));
        assert_eq!(window_for(SessionState::SpinningUpHost), Some(WindowKind::Loading));
        assert_eq!(
            window_for(SessionState::Error(ErrorStage::Host)),
            Some(WindowKind::Error(ErrorStage::Host))
        );
        assert_eq!(window_for(SessionState::Streaming), None);
    }

    #[tokio::test]
    async fn test_follow_closes_previous_window() {
        let windows = Windows::new();
        let mut commands = windows.commands().subscribe();

        windows.follow(SessionState::AwaitingLogin);
        windows.follow(SessionState::Authenticated);
        windows.follow(SessionState::CreatingContainer);
        windows.follow(SessionState::Streaming);

        assert_eq!(commands.next().await, Some(WindowCommand::Open(WindowKind::Auth)));
        assert_eq!(commands.next().await, Some(WindowCommand::Close(WindowKind::Auth)));
        assert_eq!(commands.next().await, Some(WindowCommand::Open(WindowKind::Loading)));
        assert_eq!(commands.next().await, Some(WindowCommand::Close(WindowKind::Loading)));
        assert_eq!(windows.main(), None);
    }

    #[test]
    fn test_window_command_serialization() {
        assert_eq!(
            serde_json::to_value(WindowCommand::Open(WindowKind::Error(ErrorStage::Mandelbox))).unwrap(),
            json!({"command": "open", "window": {"kind": "error", "stage": "mandelbox"}})
        );
    }

    #[test]
    fn test_persist_and_clear_credentials() {
        let store = Store::in_memory();
        let payload = json!({
            "userEmail": "a@b.com",
            "accessToken": "at",
            "refreshToken": "rt",
            "configToken": "ct",
        });

        assert!(persist_credentials(&store, &payload));
        assert_eq!(store.credentials().unwrap().access_token, "at");

        clear_credentials(&store);
        assert!(store.credentials().is_none());
        assert!(!persist_credentials(&store, &json!({"userEmail": "a@b.com"})));
    }

    /// Spawner whose processes only exit when killed
    struct FakeSpawner {
        spawned: Mutex<usize>,
    }

    impl ProtocolSpawner for FakeSpawner {
        fn spawn(&self, _: &LaunchInfo) -> ProtocolHandle {
            *self.spawned.lock() += 1;
            let native = NativeEmitter::<ProtocolEvent>::new();
            let events = EventAdapter::from_emitter(&native, ProtocolEvent::into_payload);
            let (kill_tx, kill_rx) = oneshot::channel::<()>();
            tokio::spawn(async move {
                if kill_rx.await.is_ok() {
                    native.emit(ProtocolEvent::Closed { code: None });
                }
            });
            ProtocolHandle::from_parts(events, None, Some(kill_tx), Some(1))
        }
    }

    fn info() -> LaunchInfo {
        LaunchInfo {
            ip: "10.0.0.1".into(),
            port_32262: 1,
            port_32263: 2,
            port_32273: 3,
            aes_key: "k".into(),
        }
    }

    #[tokio::test]
    async fn test_stop_marks_exit_as_intentional() {
        let supervisor = ProtocolSupervisor::new(Arc::new(FakeSpawner { spawned: Mutex::new(0) }));
        let (generation, events) = supervisor.launch(&info());
        let mut events = events.subscribe();
        assert!(supervisor.is_running());
        assert!(supervisor.is_current(generation));
        assert!(!supervisor.stopped_on_purpose());

        assert!(supervisor.stop());
        let closed = tokio::time::timeout(Duration::from_secs(1), events.next()).await.unwrap();

        assert_eq!(closed.unwrap()["event"], "closed");
        assert!(supervisor.stopped_on_purpose());
        assert!(!supervisor.stop());
    }

    #[tokio::test]
    async fn test_relaunch_replaces_running_process() {
        let spawner = Arc::new(FakeSpawner { spawned: Mutex::new(0) });
        let supervisor = ProtocolSupervisor::new(spawner.clone());

        let (first_generation, first) = supervisor.launch(&info());
        let mut first = first.subscribe();
        let (second_generation, _) = supervisor.launch(&info());

        let closed = tokio::time::timeout(Duration::from_secs(1), first.next()).await.unwrap();
        assert_eq!(closed.unwrap()["event"], "closed");
        assert_eq!(*spawner.spawned.lock(), 2);
        assert!(!supervisor.is_current(first_generation));
        assert!(supervisor.is_current(second_generation));
        assert!(!supervisor.stopped_on_purpose());

        supervisor.exited(first_generation);
        assert!(supervisor.is_running());
        supervisor.exited(second_generation);
        assert!(!supervisor.is_running());
    }

    #[tokio::test]
    async fn test_stop_and_wait_returns_once_the_process_exited() {
        let supervisor = ProtocolSupervisor::new(Arc::new(FakeSpawner { spawned: Mutex::new(0) }));
        supervisor.launch(&info());

        assert!(supervisor.stop_and_wait().await);
        assert!(!supervisor.is_running());
        assert!(supervisor.stopped_on_purpose());
        assert!(!supervisor.stop_and_wait().await);
    }
}
