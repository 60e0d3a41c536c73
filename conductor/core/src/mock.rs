//! Mock schemas
//!
//! A [`MockSchema`] replaces individual flow channels with deterministic
//! doubles so the launcher can be exercised without a webserver, a host
//! service or the protocol binary. Overrides are keyed by [`FlowId`] and
//! channel name; a flow only consults the schema for its own id.
//!
//! Built-in schemas are selected at startup by name through
//! [`MOCK_SCHEMA_ENV`] or the launcher's `--mock-schema` flag.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use crate::flow::{FlowId, FAILURE, SUCCESS};
use crate::http::ServerResponse;
use crate::registry::Payload;
use crate::signal::Signal;

/// Environment variable selecting a built-in schema
pub const MOCK_SCHEMA_ENV: &str = "WHIST_MOCK_SCHEMA";

/// Replacement for one channel: receives the flow's input, returns the stream to expose
pub type MockFn = Arc<dyn Fn(&Signal<Payload>) -> Signal<Payload> + Send + Sync>;

/// Typed table of channel overrides
#[derive(Clone)]
pub struct MockSchema {
    name: String,
    overrides: BTreeMap<(FlowId, &'static str), MockFn>,
}

impl fmt::Debug for MockSchema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<String> = self
            .overrides
            .keys()
            .map(|(flow, channel)| format!("{flow}.{channel}"))
            .collect();
        f.debug_struct("MockSchema")
            .field("name", &self.name)
            .field("overrides", &keys)
            .finish()
    }
}

impl MockSchema {
    /// Names accepted by [`MockSchema::builtin`]
    pub const BUILTIN: [&'static str; 4] = [
        "loginSuccess",
        "loginFailure",
        "mandelboxUnavailable",
        "hostTimeout",
    ];

    /// Empty schema
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            overrides: BTreeMap::new(),
        }
    }

    /// Replace `flow`'s `channel` with the signal `mock` builds
    #[must_use]
    pub fn with_override<F>(mut self, flow: FlowId, channel: &'static str, mock: F) -> Self
    where
        F: Fn(&Signal<Payload>) -> Signal<Payload> + Send + Sync + 'static,
    {
        self.overrides.insert((flow, channel), Arc::new(mock));
        self
    }

    /// Schema name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Overrides registered for `flow`
    pub fn overrides_for(&self, flow: FlowId) -> impl Iterator<Item = (&'static str, &MockFn)> + '_ {
        self.overrides
            .iter()
            .filter(move |((id, _), _)| *id == flow)
            .map(|((_, channel), mock)| (*channel, mock))
    }

    /// Whether `flow`'s `channel` is overridden
    #[must_use]
    pub fn overrides(&self, flow: FlowId, channel: &str) -> bool {
        self.overrides_for(flow).any(|(name, _)| name == channel)
    }

    /// Number of overridden channels
    #[must_use]
    pub fn len(&self) -> usize {
        self.overrides.len()
    }

    /// Whether the schema overrides nothing
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overrides.is_empty()
    }

    /// Look up a built-in schema by name
    #[must_use]
    pub fn builtin(name: &str) -> Option<Self> {
        let schema = match name {
            "loginSuccess" => Self::new(name)
                .with_override(FlowId::Login, SUCCESS, |input| {
                    input.map(|request| {
                        json!({
                            "userEmail": request["email"],
                            "accessToken": "mock-access-token",
                            "refreshToken": "mock-refresh-token",
                            "configToken": "mock-config-token",
                            "isNewConfigToken": false,
                        })
                    })
                })
                .with_override(FlowId::Login, FAILURE, |_| silence()),
            "loginFailure" => Self::new(name)
                .with_override(FlowId::Login, SUCCESS, |_| silence())
                .with_override(FlowId::Login, FAILURE, |input| {
                    respond(input, ServerResponse::new(200, json!({})))
                }),
            "mandelboxUnavailable" => Self::new(name)
                .with_override(FlowId::MandelboxCreate, SUCCESS, |_| silence())
                .with_override(FlowId::MandelboxCreate, FAILURE, |input| {
                    respond_after(
                        input,
                        Duration::from_millis(2000),
                        ServerResponse::new(503, json!({"error": "NO_INSTANCE_AVAILABLE"})),
                    )
                }),
            "hostTimeout" => Self::new(name)
                .with_override(FlowId::HostSpinUp, SUCCESS, |_| silence())
                .with_override(FlowId::HostSpinUp, FAILURE, |input| {
                    respond(input, ServerResponse::timed_out())
                }),
            _ => return None,
        };
        Some(schema)
    }

    /// Built-in schema by name, logging unknown names
    #[must_use]
    pub fn resolve(name: &str) -> Option<Self> {
        let schema = Self::builtin(name);
        match &schema {
            Some(schema) => {
                tracing::warn!(schema = %name, overrides = schema.len(), "Mock schema active");
            }
            None => {
                tracing::error!(schema = %name, known = ?Self::BUILTIN, "Unknown mock schema ignored");
            }
        }
        schema
    }
}

/// A signal that never emits
#[must_use]
pub fn silence() -> Signal<Payload> {
    Signal::new()
}

/// Answer every input with `response`
pub fn respond(input: &Signal<Payload>, response: ServerResponse) -> Signal<Payload> {
    let payload = response.into_payload();
    input.map(move |_| payload.clone())
}

/// Answer every input with `response` after `delay`
pub fn respond_after(input: &Signal<Payload>, delay: Duration, response: ServerResponse) -> Signal<Payload> {
    let payload = response.into_payload();
    input.map_async(move |_| {
        let payload = payload.clone();
        async move {
            tokio::time::sleep(delay).await;
            payload
        }
    })
}
