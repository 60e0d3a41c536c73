//! Remote service API
//!
//! The [`WhistApi`] trait is the seam between flows and the network. Flows
//! hold an `Arc<dyn WhistApi>`; the launcher plugs in [`WebserverApi`] and
//! tests plug in stubs.
//!
//! # Design Philosophy
//!
//! Every method returns a [`ServerResponse`]. There is no error type: a
//! refused connection, a 401 and a missing field are all values that the
//! calling flow classifies with its fork predicates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::http::{HttpClient, ServerResponse};

/// Port the host service listens on
pub const HOST_SERVICE_PORT: u16 = 4678;

/// Webserver endpoints
pub mod endpoints {
    /// Email login
    pub const LOGIN: &str = "/account/login";
    /// Email signup
    pub const SIGNUP: &str = "/account/register";
    /// Access-token refresh
    pub const REFRESH: &str = "/token/refresh";
    /// Subscription status
    pub const SUBSCRIPTION: &str = "/stripe/can_access_product";
    /// Mandelbox assignment
    pub const MANDELBOX_ASSIGN: &str = "/mandelbox/assign";
    /// Latest published client version
    pub const LATEST_VERSION: &str = "/version";
    /// Host service spin-up, relative to the host
    pub const JSON_TRANSPORT: &str = "/json_transport";
}

/// Email and password as submitted by the user
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Account email
    pub email: String,
    /// Plain-text password
    pub password: String,
}

/// Mandelbox assignment parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MandelboxRequest {
    /// Account email
    pub email: String,
    /// Bearer token
    pub access_token: String,
    /// Preferred region
    pub region: String,
}

/// Host service spin-up parameters
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostSpinUpRequest {
    /// Address of the host running the mandelbox
    pub ip: String,
    /// Assigned mandelbox
    pub mandelbox_id: String,
    /// Bearer token
    pub access_token: String,
    /// Key for the user's encrypted application config
    pub config_token: String,
    /// Whether `config_token` was generated for this session
    pub is_new_config_token: bool,
    /// Opaque client settings forwarded to the mandelbox
    pub json_data: String,
}

/// Remote calls the launcher makes
#[async_trait]
pub trait WhistApi: Send + Sync {
    /// Authenticate with email and password
    async fn email_login(&self, request: &LoginRequest) -> ServerResponse;

    /// Create an account
    async fn email_signup(&self, request: &LoginRequest, config_token: &str) -> ServerResponse;

    /// Exchange a refresh token for a new access token
    async fn token_refresh(&self, refresh_token: &str) -> ServerResponse;

    /// Whether the account may use the product
    async fn subscription_status(&self, access_token: &str) -> ServerResponse;

    /// Ask for a mandelbox
    async fn mandelbox_create(&self, request: &MandelboxRequest) -> ServerResponse;

    /// Ask the host to start the mandelbox's protocol server
    async fn host_spin_up(&self, request: &HostSpinUpRequest) -> ServerResponse;

    /// Latest published client version
    async fn latest_version(&self) -> ServerResponse;
}

/// [`WhistApi`] over HTTP
#[derive(Clone, Debug)]
pub struct WebserverApi {
    webserver: HttpClient,
    host_scheme: String,
    host_port: u16,
}

impl WebserverApi {
    /// Talk to the webserver at `base_url` and to hosts over HTTPS
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            webserver: HttpClient::new(base_url),
            host_scheme: "https".to_string(),
            host_port: HOST_SERVICE_PORT,
        }
    }

    /// Override how host services are reached
    #[must_use]
    pub fn with_host_endpoint(mut self, scheme: impl Into<String>, port: u16) -> Self {
        self.host_scheme = scheme.into();
        self.host_port = port;
        self
    }

    fn host_client(&self, ip: &str) -> HttpClient {
        HttpClient::insecure(format!("{}://{}:{}", self.host_scheme, ip, self.host_port))
    }
}

#[async_trait]
impl WhistApi for WebserverApi {
    async fn email_login(&self, request: &LoginRequest) -> ServerResponse {
        let body = json!({"username": request.email, "password": request.password});
        self.webserver.post(endpoints::LOGIN, &body, None).await
    }

    async fn email_signup(&self, request: &LoginRequest, config_token: &str) -> ServerResponse {
        let body = json!({
            "username": request.email,
            "password": request.password,
            "encrypted_config_token": config_token,
        });
        self.webserver.post(endpoints::SIGNUP, &body, None).await
    }

    async fn token_refresh(&self, refresh_token: &str) -> ServerResponse {
        self.webserver
            .post(endpoints::REFRESH, &json!({}), Some(refresh_token))
            .await
    }

    async fn subscription_status(&self, access_token: &str) -> ServerResponse {
        self.webserver
            .post(endpoints::SUBSCRIPTION, &json!({}), Some(access_token))
            .await
    }

    async fn mandelbox_create(&self, request: &MandelboxRequest) -> ServerResponse {
        let body = json!({"username": request.email, "region": request.region});
        self.webserver
            .post(endpoints::MANDELBOX_ASSIGN, &body, Some(&request.access_token))
            .await
    }

    async fn host_spin_up(&self, request: &HostSpinUpRequest) -> ServerResponse {
        let body = json!({
            "mandelbox_id": request.mandelbox_id,
            "jwt_access_token": request.access_token,
            "config_encryption_token": request.config_token,
            "is_new_config_encryption_token": request.is_new_config_token,
            "json_data": request.json_data,
        });
        self.host_client(&request.ip)
            .put(endpoints::JSON_TRANSPORT, &body, None)
            .await
    }

    async fn latest_version(&self) -> ServerResponse {
        self.webserver.get(endpoints::LATEST_VERSION, None).await
    }
}
