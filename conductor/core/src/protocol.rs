//! Streaming Protocol Supervision
//!
//! The protocol client is an external binary. The launcher owns exactly one
//! instance at a time: it spawns it with the connection parameters from the
//! host service, feeds it dynamic arguments over stdin and watches for it to
//! exit.
//!
//! # Process lifecycle
//!
//! ```text
//!   spawn ──▶ Spawned ──▶ (stdin: key?value lines) ──▶ Closed { code }
//!     │                                                    ▲
//!     └──▶ Error { reason }          kill() / handle drop ─┘
//! ```
//!
//! Lifecycle events reach flows through an [`EventAdapter`] over a
//! [`NativeEmitter`], so the protocol-close flow sees them as an ordinary
//! signal.

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::{ChildStdin, Command};
use tokio::sync::oneshot;

use crate::adapter::{EventAdapter, NativeEmitter};
use crate::http::ServerResponse;
use crate::registry::Payload;
use crate::signal::Signal;

/// Protocol server port carrying the video stream
pub const PORT_32262: u16 = 32262;
/// Protocol server port carrying audio
pub const PORT_32263: u16 = 32263;
/// Protocol server port carrying input
pub const PORT_32273: u16 = 32273;

/// Everything the protocol binary needs to connect
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchInfo {
    /// Host address
    pub ip: String,
    /// Host port mapped to 32262
    pub port_32262: u16,
    /// Host port mapped to 32263
    pub port_32263: u16,
    /// Host port mapped to 32273
    pub port_32273: u16,
    /// Session key
    pub aes_key: String,
}

impl LaunchInfo {
    /// Combine the mandelbox address with a host spin-up response
    ///
    /// Accepts the port map either at the top level or under `result`.
    #[must_use]
    pub fn from_host_response(ip: &str, response: &ServerResponse) -> Option<Self> {
        if ip.is_empty() || !response.is_success_status() {
            return None;
        }
        let body = response.json.get("result").unwrap_or(&response.json);
        let port = |key: &str| {
            body.get(key)
                .and_then(Value::as_u64)
                .and_then(|p| u16::try_from(p).ok())
        };
        let aes_key = body
            .get("aes_key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())?;

        Some(Self {
            ip: ip.to_string(),
            port_32262: port("port_32262")?,
            port_32263: port("port_32263")?,
            port_32273: port("port_32273")?,
            aes_key: aes_key.to_string(),
        })
    }

    /// Command-line arguments for the protocol binary
    #[must_use]
    pub fn args(&self) -> Vec<String> {
        vec![
            self.ip.clone(),
            "-p".to_string(),
            format!(
                "{PORT_32262}:{}.{PORT_32263}:{}.{PORT_32273}:{}",
                self.port_32262, self.port_32263, self.port_32273
            ),
            "-k".to_string(),
            self.aes_key.clone(),
        ]
    }

    /// Serialize as a trigger payload
    #[must_use]
    pub fn to_payload(&self) -> Payload {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// Parse from a trigger payload
    #[must_use]
    pub fn from_payload(payload: &Payload) -> Option<Self> {
        serde_json::from_value(payload.clone()).ok()
    }
}

/// Lifecycle of one protocol process
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProtocolEvent {
    /// The process started
    Spawned {
        /// OS process id
        pid: Option<u32>,
    },
    /// The process exited
    Closed {
        /// Exit code, `None` when killed by a signal
        code: Option<i32>,
    },
    /// The process could not be started or waited on
    Error {
        /// What went wrong
        reason: String,
    },
}

impl ProtocolEvent {
    /// Serialize as a trigger payload
    #[must_use]
    pub fn into_payload(self) -> Payload {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Errors talking to a running protocol process
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Stdin is not available
    #[error("Protocol stdin is closed")]
    StdinClosed,

    /// Writing to stdin failed
    #[error("Failed to write to protocol stdin: {0}")]
    Write(#[source] io::Error),
}

/// A running (or failed) protocol process
pub struct ProtocolHandle {
    events: EventAdapter<Payload>,
    stdin: Arc<tokio::sync::Mutex<Option<ChildStdin>>>,
    kill: Mutex<Option<oneshot::Sender<()>>>,
    pid: Option<u32>,
}

impl fmt::Debug for ProtocolHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolHandle")
            .field("pid", &self.pid)
            .field("killable", &self.kill.lock().is_some())
            .finish()
    }
}

impl ProtocolHandle {
    /// Assemble a handle from its parts
    #[must_use]
    pub fn from_parts(
        events: EventAdapter<Payload>,
        stdin: Option<ChildStdin>,
        kill: Option<oneshot::Sender<()>>,
        pid: Option<u32>,
    ) -> Self {
        Self {
            events,
            stdin: Arc::new(tokio::sync::Mutex::new(stdin)),
            kill: Mutex::new(kill),
            pid,
        }
    }

    /// Lifecycle events as payloads
    #[must_use]
    pub fn events(&self) -> Signal<Payload> {
        self.events.signal()
    }

    /// OS process id
    #[must_use]
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Pass a dynamic argument as a `key?value` line
    pub async fn send_arg(&self, key: &str, value: &str) -> Result<(), ProtocolError> {
        let mut stdin = self.stdin.lock().await;
        let pipe = stdin.as_mut().ok_or(ProtocolError::StdinClosed)?;
        pipe.write_all(format!("{key}?{value}\n").as_bytes())
            .await
            .map_err(ProtocolError::Write)?;
        pipe.flush().await.map_err(ProtocolError::Write)
    }

    /// Ask the process to terminate
    ///
    /// Returns `false` when a kill was already requested.
    pub fn kill(&self) -> bool {
        match self.kill.lock().take() {
            Some(tx) => {
                tracing::info!(pid = ?self.pid, "Killing protocol");
                tx.send(()).is_ok()
            }
            None => false,
        }
    }
}

/// Starts protocol processes
pub trait ProtocolSpawner: Send + Sync {
    /// Start a process for `info`
    ///
    /// Never fails: a process that cannot start reports
    /// [`ProtocolEvent::Error`] on its events signal.
    fn spawn(&self, info: &LaunchInfo) -> ProtocolHandle;
}

/// [`ProtocolSpawner`] running a binary through `tokio::process`
#[derive(Clone, Debug)]
pub struct ProcessSpawner {
    program: PathBuf,
    leading_args: Vec<String>,
}

impl ProcessSpawner {
    /// Spawn `program`
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    /// Arguments placed before the connection arguments
    #[must_use]
    pub fn with_leading_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.leading_args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl ProtocolSpawner for ProcessSpawner {
    fn spawn(&self, info: &LaunchInfo) -> ProtocolHandle {
        let native = NativeEmitter::<ProtocolEvent>::new();
        let events = EventAdapter::from_emitter(&native, ProtocolEvent::into_payload);

        let spawned = Command::new(&self.program)
            .args(&self.leading_args)
            .args(info.args())
            .stdin(Stdio::piped())
            .kill_on_drop(true)
            .spawn();

        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                let reason = format!("Failed to spawn {}: {e}", self.program.display());
                tracing::error!(program = %self.program.display(), error = %e, "Protocol spawn failed");
                tokio::spawn(async move {
                    native.emit(ProtocolEvent::Error { reason });
                });
                return ProtocolHandle::from_parts(events, None, None, None);
            }
        };

        let pid = child.id();
        let stdin = child.stdin.take();
        let (kill_tx, kill_rx) = oneshot::channel();
        tracing::info!(?pid, ip = %info.ip, "Protocol spawned");

        tokio::spawn(async move {
            native.emit(ProtocolEvent::Spawned { pid });
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    if let Err(e) = child.start_kill() {
                        tracing::warn!(error = %e, "Protocol kill failed");
                    }
                    child.wait().await
                }
            };
            match status {
                Ok(status) => {
                    tracing::info!(?pid, code = ?status.code(), "Protocol exited");
                    native.emit(ProtocolEvent::Closed {
                        code: status.code(),
                    });
                }
                Err(e) => {
                    native.emit(ProtocolEvent::Error {
                        reason: format!("Failed to wait for protocol: {e}"),
                    });
                }
            }
        });

        ProtocolHandle::from_parts(events, stdin, Some(kill_tx), pid)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn info() -> LaunchInfo {
        LaunchInfo {
            ip: "10.0.0.1".into(),
            port_32262: 40001,
            port_32263: 40002,
            port_32273: 40003,
            aes_key: "deadbeef".into(),
        }
    }

    fn shell(script: &str) -> ProcessSpawner {
        ProcessSpawner::new("sh").with_leading_args(["-c", script])
    }

    async fn events_until_exit(handle: &ProtocolHandle) -> Vec<Payload> {
        let mut sub = handle.events().subscribe();
        let mut seen = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), sub.next()).await {
            let done = event["event"] != json!("spawned");
            seen.push(event);
            if done {
                break;
            }
        }
        seen
    }

    #[test]
    fn test_args_encode_port_triple() {
        assert_eq!(
            info().args(),
            vec!["10.0.0.1", "-p", "32262:40001.32263:40002.32273:40003", "-k", "deadbeef"]
        );
    }

    #[test]
    fn test_launch_info_from_host_response() {
        let response = ServerResponse::new(
            200,
            json!({"result": {"port_32262": 40001, "port_32263": 40002, "port_32273": 40003, "aes_key": "deadbeef"}}),
        );
        assert_eq!(LaunchInfo::from_host_response("10.0.0.1", &response), Some(info()));

        let missing_key = ServerResponse::new(200, json!({"port_32262": 1, "port_32263": 2, "port_32273": 3}));
        assert_eq!(LaunchInfo::from_host_response("10.0.0.1", &missing_key), None);
        assert_eq!(LaunchInfo::from_host_response("", &response), None);
    }

    #[tokio::test]
    async fn test_clean_exit_reports_code_zero() {
        let handle = shell("exit 0").spawn(&info());
        let events = events_until_exit(&handle).await;

        assert_eq!(events.first().unwrap()["event"], "spawned");
        assert_eq!(events.last().unwrap(), &json!({"event": "closed", "code": 0}));
    }

    #[tokio::test]
    async fn test_positional_args_reach_process() {
        let handle = shell(r#"test "$0" = 10.0.0.1 && test "$4" = deadbeef"#).spawn(&info());
        let events = events_until_exit(&handle).await;
        assert_eq!(events.last().unwrap()["code"], 0);
    }

    #[tokio::test]
    async fn test_stdin_lines_use_key_value_format() {
        let handle = shell(r#"read line; test "$line" = "loading?done""#).spawn(&info());
        let mut sub = handle.events().subscribe();

        handle.send_arg("loading", "done").await.unwrap();

        let mut last = None;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), sub.next()).await {
            last = Some(event);
            if last.as_ref().unwrap()["event"] == "closed" {
                break;
            }
        }
        assert_eq!(last, Some(json!({"event": "closed", "code": 0})));
    }

    #[tokio::test]
    async fn test_kill_terminates_process() {
        let handle = shell("sleep 30").spawn(&info());
        let mut sub = handle.events().subscribe();

        assert!(handle.kill());
        assert!(!handle.kill());

        let mut closed = None;
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(10), sub.next()).await {
            if event["event"] == "closed" {
                closed = Some(event);
                break;
            }
        }
        assert_eq!(closed, Some(json!({"event": "closed", "code": null})));
    }

    #[tokio::test]
    async fn test_missing_binary_reports_error() {
        let handle = ProcessSpawner::new("/nonexistent/whist-protocol").spawn(&info());
        let mut sub = handle.events().subscribe();

        let event = sub.next().await.unwrap();
        assert_eq!(event["event"], "error");
        assert!(matches!(
            handle.send_arg("k", "v").await,
            Err(ProtocolError::StdinClosed)
        ));
    }
}
