//! Session Management
//!
//! Tracks where the launcher is in establishing a streaming session, from
//! process start to a running protocol and back.
//!
//! # Design Philosophy
//!
//! The transition table lives in one pure function,
//! [`SessionState::next`]. Flows never set state directly: the graph turns
//! flow channel emissions into [`SessionEvent`]s and the [`SessionMachine`]
//! applies them. Events that make no sense in the current state are logged
//! and ignored.
//!
//! ```text
//! Idle ─▶ CheckingPersisted ─┬─▶ Authenticated ─▶ CreatingContainer ─▶ SpinningUpHost
//!                            └─▶ AwaitingLogin ──┘        │                  │
//!                                                         ▼                  ▼
//!   Idle ◀─ ClosingProtocol ◀─ Streaming ◀─ LaunchingProtocol ◀──────────────┘
//! ```

use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::signal::Signal;

/// Which stage of session establishment failed
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorStage {
    /// Stored credentials stopped working
    Auth,
    /// Mandelbox assignment failed
    Mandelbox,
    /// Host spin-up failed
    Host,
    /// Protocol could not start or crashed
    Protocol,
    /// Persisted store is unreadable
    Storage,
}

impl ErrorStage {
    /// Whether recovering requires logging in again
    #[must_use]
    pub fn needs_login(&self) -> bool {
        matches!(self, ErrorStage::Auth | ErrorStage::Storage)
    }
}

/// Session establishment state
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "camelCase")]
pub enum SessionState {
    /// Process started, nothing checked yet
    Idle,
    /// Reading persisted credentials
    CheckingPersisted,
    /// Waiting for the user to log in or sign up
    AwaitingLogin,
    /// Holding valid credentials
    Authenticated,
    /// Mandelbox assignment in flight
    CreatingContainer,
    /// Host spin-up in flight
    SpinningUpHost,
    /// Protocol process being started
    LaunchingProtocol,
    /// Protocol running
    Streaming,
    /// Protocol process exited, tearing down
    ClosingProtocol,
    /// A stage failed; the user may retry
    Error(ErrorStage),
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Error(stage) => write!(f, "Error({stage:?})"),
            other => write!(f, "{other:?}"),
        }
    }
}

/// Something that happened to the session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionEvent {
    /// Application ready
    Started,
    /// Persisted credentials are complete
    PersistedFound,
    /// Persisted credentials are missing or incomplete
    PersistedMissing,
    /// Persisted store could not be read
    StorageFailed,
    /// Login or signup produced credentials
    LoginSucceeded,
    /// Login or signup was rejected
    LoginFailed,
    /// A mandelbox was requested
    ContainerRequested,
    /// Mandelbox assigned
    ContainerCreated,
    /// Mandelbox assignment failed
    ContainerFailed,
    /// Host is ready for the protocol
    HostReady,
    /// Host spin-up failed
    HostFailed,
    /// Protocol process started
    ProtocolSpawned,
    /// Protocol process exited
    ProtocolClosed,
    /// Teardown after a clean exit finished
    ProtocolExited,
    /// Protocol could not start or exited abnormally
    ProtocolFailed,
    /// Credentials were rejected while in use
    AuthExpired,
    /// User signed out
    SignedOut,
    /// User asked to retry after an error
    RetryRequested,
}

impl SessionState {
    /// State after `event`, or `None` when `event` is not valid here
    #[must_use]
    pub fn next(self, event: SessionEvent) -> Option<SessionState> {
        use SessionEvent as E;
        use SessionState as S;

        let next = match (self, event) {
            (_, E::SignedOut) => S::AwaitingLogin,

            (S::Idle, E::Started) => S::CheckingPersisted,
            (S::CheckingPersisted, E::PersistedFound) => S::Authenticated,
            (S::CheckingPersisted, E::PersistedMissing) => S::AwaitingLogin,
            (S::CheckingPersisted, E::StorageFailed) => S::Error(ErrorStage::Storage),

            (S::AwaitingLogin, E::LoginSucceeded) => S::Authenticated,
            (S::AwaitingLogin, E::LoginFailed) => S::AwaitingLogin,

            (S::Authenticated | S::Idle, E::ContainerRequested) => S::CreatingContainer,
            (S::Error(stage), E::ContainerRequested) if !stage.needs_login() => S::CreatingContainer,
            (S::CreatingContainer, E::ContainerCreated) => S::SpinningUpHost,
            (S::CreatingContainer, E::ContainerFailed) => S::Error(ErrorStage::Mandelbox),

            (S::SpinningUpHost, E::HostReady) => S::LaunchingProtocol,
            (S::SpinningUpHost, E::HostFailed) => S::Error(ErrorStage::Host),

            (S::LaunchingProtocol, E::ProtocolSpawned) => S::Streaming,
            (S::Streaming, E::ProtocolClosed) => S::ClosingProtocol,
            (S::ClosingProtocol, E::ProtocolExited) => S::Idle,
            (S::LaunchingProtocol | S::Streaming | S::ClosingProtocol, E::ProtocolFailed) => {
                S::Error(ErrorStage::Protocol)
            }

            (
                S::Authenticated
                | S::CreatingContainer
                | S::SpinningUpHost
                | S::LaunchingProtocol
                | S::Streaming,
                E::AuthExpired,
            ) => S::Error(ErrorStage::Auth),

            (S::Error(stage), E::RetryRequested) if stage.needs_login() => S::AwaitingLogin,
            (S::Error(_), E::RetryRequested) => S::CreatingContainer,

            _ => return None,
        };
        Some(next)
    }
}

/// Applies events to the current state and publishes every change
#[derive(Debug)]
pub struct SessionMachine {
    state: Mutex<SessionState>,
    states: Signal<SessionState>,
}

impl Default for SessionMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionMachine {
    /// Machine in [`SessionState::Idle`]
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SessionState::Idle),
            states: Signal::seeded(SessionState::Idle),
        }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Every state the machine enters, starting with the current one
    #[must_use]
    pub fn states(&self) -> Signal<SessionState> {
        self.states.clone()
    }

    /// Apply `event`, returning the new state if it was valid
    pub fn apply(&self, event: SessionEvent) -> Option<SessionState> {
        let mut state = self.state.lock();
        match state.next(event) {
            Some(next) => {
                tracing::info!(from = %*state, to = %next, ?event, "Session transition");
                *state = next;
                self.states.emit(next);
                Some(next)
            }
            None => {
                tracing::debug!(state = %*state, ?event, "Session event ignored");
                None
            }
        }
    }

    /// Apply events in order
    pub fn apply_all(&self, events: &[SessionEvent]) -> SessionState {
        for event in events {
            self.apply(*event);
        }
        self.state()
    }
}
