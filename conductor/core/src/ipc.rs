//! Renderer IPC
//!
//! The renderer talks to the graph over one named channel. Outbound
//! messages carry the serialized [`RendererState`]; inbound messages may
//! carry a `trigger` naming a user action and its payload, which the
//! [`IpcBridge`] emits on the registry.
//!
//! Messages are JSON objects, one per line:
//!
//! ```text
//! → {"channel":"StateChannel","state":{"session":{"state":"awaitingLogin"},...}}
//! ← {"trigger":{"name":"loginAction","payload":{"email":"a@b.com","password":"..."}}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::effects::{WindowCommand, WindowKind};
use crate::registry::{Payload, RegistryError, TriggerRegistry};
use crate::session::SessionState;
use crate::triggers::RENDERER_ACTIONS;

/// Name of the renderer channel
pub const STATE_CHANNEL: &str = "StateChannel";

/// Errors handling renderer messages
#[derive(Debug, Error)]
pub enum IpcError {
    /// Line is not a JSON message
    #[error("Malformed IPC message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// Renderer named a trigger it may not emit
    #[error("Trigger '{0}' cannot be emitted by the renderer")]
    Forbidden(String),

    /// Trigger is not registered
    #[error(transparent)]
    Registry(#[from] RegistryError),
}

/// Everything the renderer needs to draw
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RendererState {
    /// Session establishment state
    pub session: Option<SessionState>,
    /// Main window currently shown
    pub window: Option<WindowKind>,
    /// Last soft failure shown to the user (e.g. a rejected login)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<Payload>,
    /// `{current, latest}` when an update is available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub update: Option<Payload>,
}

/// A user action from the renderer
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TriggerMessage {
    /// Trigger to emit on
    pub name: String,
    /// Action payload
    #[serde(default)]
    pub payload: Payload,
}

/// One inbound message on [`STATE_CHANNEL`]
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    /// Action to forward, if any
    #[serde(default)]
    pub trigger: Option<TriggerMessage>,
}

/// One outbound message
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum OutboundMessage {
    /// New renderer state
    State {
        /// Always [`STATE_CHANNEL`]
        channel: &'static str,
        /// The state
        state: RendererState,
    },
    /// Window instruction
    Window {
        /// Always [`STATE_CHANNEL`]
        channel: &'static str,
        /// The instruction
        window: WindowCommand,
    },
}

impl OutboundMessage {
    /// Wrap a state
    #[must_use]
    pub fn state(state: RendererState) -> Self {
        Self::State {
            channel: STATE_CHANNEL,
            state,
        }
    }

    /// Wrap a window instruction
    #[must_use]
    pub fn window(window: WindowCommand) -> Self {
        Self::Window {
            channel: STATE_CHANNEL,
            window,
        }
    }

    /// Encode as one line, without the trailing newline
    pub fn encode(&self) -> Result<String, IpcError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Feeds renderer actions into the registry
#[derive(Debug, Clone)]
pub struct IpcBridge {
    registry: TriggerRegistry,
}

impl IpcBridge {
    /// Bridge into `registry`
    #[must_use]
    pub fn new(registry: TriggerRegistry) -> Self {
        Self { registry }
    }

    /// Handle one inbound line
    ///
    /// Returns the emitted trigger's name, or `None` for messages without
    /// a trigger. Only [`RENDERER_ACTIONS`] may be emitted.
    pub fn handle_line(&self, line: &str) -> Result<Option<String>, IpcError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let message: InboundMessage = serde_json::from_str(line)?;
        self.handle(message)
    }

    /// Handle one decoded message
    pub fn handle(&self, message: InboundMessage) -> Result<Option<String>, IpcError> {
        let Some(TriggerMessage { name, payload }) = message.trigger else {
            return Ok(None);
        };
        if !RENDERER_ACTIONS.contains(&name.as_str()) {
            tracing::warn!(trigger = %name, "Renderer tried to emit a non-action trigger");
            return Err(IpcError::Forbidden(name));
        }
        let delivered = self.registry.emit(&name, normalise(payload))?;
        tracing::debug!(trigger = %name, delivered, "Renderer action forwarded");
        Ok(Some(name))
    }
}

/// Actions without a payload still need a value to flow
fn normalise(payload: Payload) -> Payload {
    match payload {
        Value::Null => Value::Object(serde_json::Map::new()),
        other => other,
    }
}
