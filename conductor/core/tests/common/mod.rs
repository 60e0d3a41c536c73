//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::oneshot;

use whist_conductor::api::{HostSpinUpRequest, LoginRequest, MandelboxRequest};
use whist_conductor::{
    EventAdapter, LaunchInfo, NativeEmitter, Payload, ProtocolEvent, ProtocolHandle,
    ProtocolSpawner, ServerResponse, Subscription, WhistApi,
};

/// Canned webserver answers keyed by method name
#[derive(Default)]
pub struct StubApi {
    responses: Mutex<HashMap<&'static str, (ServerResponse, Duration)>>,
    calls: Mutex<Vec<&'static str>>,
}

impl StubApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, method: &'static str, response: ServerResponse) -> Self {
        self.respond_after(method, Duration::ZERO, response)
    }

    pub fn respond_after(self, method: &'static str, delay: Duration, response: ServerResponse) -> Self {
        self.responses.lock().insert(method, (response, delay));
        self
    }

    /// Answers for a user who gets all the way to a running protocol
    pub fn happy_path() -> Self {
        Self::new()
            .respond(
                "email_login",
                ServerResponse::new(200, json!({"access_token": "at", "refresh_token": "rt"})),
            )
            .respond(
                "subscription_status",
                ServerResponse::new(200, json!({"subscription_status": "active"})),
            )
            .respond(
                "mandelbox_create",
                ServerResponse::new(200, json!({"ID": "box-1", "ip": "10.0.0.7"})),
            )
            .respond(
                "host_spin_up",
                ServerResponse::new(
                    200,
                    json!({"port_32262": 40001, "port_32263": 40002, "port_32273": 40003, "aes_key": "k3y"}),
                ),
            )
            .respond("latest_version", ServerResponse::new(200, json!({"version": "0.0.1"})))
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn count(&self, method: &str) -> usize {
        self.calls.lock().iter().filter(|m| **m == method).count()
    }

    async fn answer(&self, method: &'static str) -> ServerResponse {
        self.calls.lock().push(method);
        let canned = self.responses.lock().get(method).cloned();
        match canned {
            Some((response, delay)) => {
                tokio::time::sleep(delay).await;
                response
            }
            None => ServerResponse::new(404, json!({"error": "NOT_STUBBED"})),
        }
    }
}

#[async_trait]
impl WhistApi for StubApi {
    async fn email_login(&self, _: &LoginRequest) -> ServerResponse {
        self.answer("email_login").await
    }
    async fn email_signup(&self, _: &LoginRequest, _: &str) -> ServerResponse {
        self.answer("email_signup").await
    }
    async fn token_refresh(&self, _: &str) -> ServerResponse {
        self.answer("token_refresh").await
    }
    async fn subscription_status(&self, _: &str) -> ServerResponse {
        self.answer("subscription_status").await
    }
    async fn mandelbox_create(&self, _: &MandelboxRequest) -> ServerResponse {
        self.answer("mandelbox_create").await
    }
    async fn host_spin_up(&self, _: &HostSpinUpRequest) -> ServerResponse {
        self.answer("host_spin_up").await
    }
    async fn latest_version(&self) -> ServerResponse {
        self.answer("latest_version").await
    }
}

/// Emitters of the processes a [`FakeSpawner`] started
pub type Processes = Arc<Mutex<Vec<NativeEmitter<ProtocolEvent>>>>;

/// Protocol spawner that starts nothing
///
/// Each process reports `spawned` right away and `closed` with code 0 when
/// killed. Tests can make a process exit on its own through
/// [`FakeSpawner::processes`].
#[derive(Default)]
pub struct FakeSpawner {
    launched: Mutex<Vec<LaunchInfo>>,
    processes: Processes,
}

impl FakeSpawner {
    pub fn launched(&self) -> Vec<LaunchInfo> {
        self.launched.lock().clone()
    }

    pub fn processes(&self) -> Processes {
        Arc::clone(&self.processes)
    }

    /// Make the latest process exit with `code`
    pub fn exit_latest(&self, code: i32) {
        if let Some(native) = self.processes.lock().last() {
            native.emit(ProtocolEvent::Closed { code: Some(code) });
        }
    }
}

impl ProtocolSpawner for FakeSpawner {
    fn spawn(&self, info: &LaunchInfo) -> ProtocolHandle {
        self.launched.lock().push(info.clone());
        let native = NativeEmitter::<ProtocolEvent>::new();
        let events = EventAdapter::from_emitter(&native, ProtocolEvent::into_payload);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();

        let spawned = native.clone();
        tokio::spawn(async move {
            spawned.emit(ProtocolEvent::Spawned { pid: Some(4242) });
            if kill_rx.await.is_ok() {
                spawned.emit(ProtocolEvent::Closed { code: Some(0) });
            }
        });
        self.processes.lock().push(native);
        ProtocolHandle::from_parts(events, None, Some(kill_tx), Some(4242))
    }
}

pub fn credentials() -> Payload {
    json!({"userEmail": "a@b.com", "accessToken": "at", "refreshToken": "rt", "configToken": "ct"})
}

/// Next value, or `None` after a second of (virtual) time
pub async fn next<T>(sub: &mut Subscription<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(1), sub.next())
        .await
        .ok()
        .flatten()
}

/// Wait until `sub` yields a value matching `predicate`
pub async fn wait_for<T, F>(sub: &mut Subscription<T>, within: Duration, mut predicate: F) -> Option<T>
where
    F: FnMut(&T) -> bool,
{
    tokio::time::timeout(within, async {
        while let Some(value) = sub.next().await {
            if predicate(&value) {
                return Some(value);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}
