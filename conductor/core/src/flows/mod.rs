//! Concrete Flows
//!
//! Each submodule builds the [`Flow`]s for one stage of session
//! establishment. Flows talk to the outside world only through the
//! [`WhistApi`] in their [`FlowContext`] and report every outcome as a value
//! on a named channel.
//!
//! | Flow | Channels |
//! |------|----------|
//! | [`auth::persisted_auth`] | `success`, `failure` |
//! | [`auth::login`] | `success`, `failure` |
//! | [`auth::signup`] | `success`, `warning`, `failure` |
//! | [`auth::token_refresh`] | `success`, `failure` |
//! | [`payment::subscription_check`] | `success`, `failure` |
//! | [`mandelbox::mandelbox_create`] | `success`, `failure` |
//! | [`host::host_spin_up`] | `success`, `failure` |
//! | [`protocol::protocol_launch`] | `success`, `failure` |
//! | [`protocol::protocol_close`] | `spawned`, `success`, `failure` |
//! | [`autoupdate::autoupdate`] | `available`, `notAvailable`, `failure` |
//!
//! [`Flow`]: crate::flow::Flow

pub mod auth;
pub mod autoupdate;
pub mod host;
pub mod mandelbox;
pub mod payment;
pub mod protocol;

use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;

use crate::api::WhistApi;
use crate::mock::MockSchema;

/// Soft failure channel of the signup flow
pub const WARNING: &str = "warning";
/// Protocol process started
pub const SPAWNED: &str = "spawned";
/// A newer client version exists
pub const AVAILABLE: &str = "available";
/// The running client is current
pub const NOT_AVAILABLE: &str = "notAvailable";

/// Default deadline for auth and policy calls
pub const DEFAULT_POLICY_TIMEOUT: Duration = Duration::from_secs(10);
/// Default deadline for mandelbox assignment and host spin-up
pub const DEFAULT_MANDELBOX_TIMEOUT: Duration = Duration::from_secs(45);

/// Everything flows need from their environment
#[derive(Clone)]
pub struct FlowContext {
    /// Remote services
    pub api: Arc<dyn WhistApi>,
    /// Region requested for mandelboxes
    pub region: String,
    /// Deadline for auth and policy calls
    pub policy_timeout: Duration,
    /// Deadline for mandelbox assignment and host spin-up
    pub mandelbox_timeout: Duration,
    /// Version of the running client
    pub current_version: String,
    /// Opaque settings forwarded to the host service
    pub json_data: String,
    /// Channel overrides
    pub schema: Option<Arc<MockSchema>>,
}

impl std::fmt::Debug for FlowContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlowContext")
            .field("region", &self.region)
            .field("policy_timeout", &self.policy_timeout)
            .field("mandelbox_timeout", &self.mandelbox_timeout)
            .field("current_version", &self.current_version)
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

impl FlowContext {
    /// Context with default deadlines and no schema
    #[must_use]
    pub fn new(api: Arc<dyn WhistApi>) -> Self {
        Self {
            api,
            region: "us-east-1".to_string(),
            policy_timeout: DEFAULT_POLICY_TIMEOUT,
            mandelbox_timeout: DEFAULT_MANDELBOX_TIMEOUT,
            current_version: env!("CARGO_PKG_VERSION").to_string(),
            json_data: "{}".to_string(),
            schema: None,
        }
    }
}

/// Fresh 256-bit config encryption token, hex encoded
#[must_use]
pub fn generate_config_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
pub(crate) mod testing {
    //! Stub API shared by flow tests

    use std::collections::HashMap;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;

    use crate::api::{HostSpinUpRequest, LoginRequest, MandelboxRequest, WhistApi};
    use crate::http::ServerResponse;

    /// Canned responses keyed by method name, with optional delays
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

        pub fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().clone()
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
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_tokens_are_random_hex() {
        let a = generate_config_token();
        let b = generate_config_token();
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }
}
