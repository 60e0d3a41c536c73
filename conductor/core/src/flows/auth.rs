//! Authentication flows
//!
//! Validity is judged by the presence of an `access_token` in the response
//! body, never by status code alone.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::api::LoginRequest;
use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE, SUCCESS};
use crate::flows::{generate_config_token, FlowContext, WARNING};
use crate::http::{with_deadline, ServerResponse};
use crate::registry::Payload;
use crate::store::{keys, Credentials, SNAPSHOT_ERROR};

/// One request/response round, with whatever context the success mapping needs
fn attempt(context: Value, response: ServerResponse) -> Payload {
    json!({"context": context, "response": response.into_payload()})
}

fn invalid_request() -> ServerResponse {
    ServerResponse::new(400, json!({"error": "INVALID_REQUEST"}))
}

fn access_token(attempt: &Payload) -> Option<&str> {
    attempt["response"]["json"]["access_token"]
        .as_str()
        .filter(|t| !t.is_empty())
}

fn response_json_str<'a>(attempt: &'a Payload, key: &str) -> Option<&'a str> {
    attempt["response"]["json"][key]
        .as_str()
        .filter(|s| !s.is_empty())
}

fn parse_login(request: &Payload) -> Option<LoginRequest> {
    serde_json::from_value::<LoginRequest>(request.clone())
        .ok()
        .filter(|r| !r.email.is_empty())
}

// ============================================================================
// Persisted credentials
// ============================================================================

/// Credential record from a store snapshot
///
/// Complete records come out with exactly the four credential keys. A
/// snapshot carrying a load error comes out as `{"error": ...}`.
fn persisted_credentials(snapshot: &Payload) -> Payload {
    if let Some(error) = snapshot.get(SNAPSHOT_ERROR) {
        return json!({"error": error});
    }
    let field = |key: &str| snapshot.get(key).cloned().unwrap_or(Value::Null);
    let candidate = json!({
        "userEmail": field(keys::USER_EMAIL),
        "accessToken": field(keys::ACCESS_TOKEN),
        "refreshToken": field(keys::REFRESH_TOKEN),
        "configToken": field(keys::CONFIG_TOKEN),
    });
    Credentials::from_payload(&candidate).map_or(candidate, |c| c.to_payload())
}

/// Decide at startup whether stored credentials can skip login
///
/// Input: one store snapshot. If none arrives within the policy deadline the
/// flow fails with `{"error": "TIMEOUT"}`.
pub fn persisted_auth(ctx: &FlowContext) -> Flow {
    let deadline = ctx.policy_timeout;
    Flow::new(FlowId::PersistedAuth, move |input| {
        let checked = input
            .first_within(deadline, json!({"error": "TIMEOUT"}))
            .map(|snapshot| persisted_credentials(&snapshot));
        let forked = fork(
            &checked,
            Branches::new()
                .when(SUCCESS, |p: &Payload| Credentials::from_payload(p).is_some())
                .when(FAILURE, |p: &Payload| Credentials::from_payload(p).is_none()),
        );
        Channels::from_fork(FlowId::PersistedAuth, &forked)
    })
    .mocked_by(ctx.schema.clone())
}

// ============================================================================
// Login
// ============================================================================

fn login_credentials(attempt: &Payload) -> Payload {
    let (config_token, is_new_config_token) = match response_json_str(attempt, "encrypted_config_token") {
        Some(token) => (token.to_string(), false),
        None => (generate_config_token(), true),
    };
    Credentials {
        user_email: attempt["context"]["email"].as_str().unwrap_or_default().to_string(),
        access_token: access_token(attempt).unwrap_or_default().to_string(),
        refresh_token: response_json_str(attempt, "refresh_token")
            .unwrap_or_default()
            .to_string(),
        config_token,
        is_new_config_token,
    }
    .to_payload()
}

/// Email/password login
///
/// Input: `{email, password}`. `success` carries [`Credentials`];
/// `failure` carries the raw [`ServerResponse`]. Submissions made while a
/// login is in flight are ignored.
pub fn login(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let deadline = ctx.policy_timeout;
    Flow::new(FlowId::Login, move |input| {
        let api = Arc::clone(&api);
        let attempts = input.exhaust_map(move |request| {
            let api = Arc::clone(&api);
            async move {
                let Some(request) = parse_login(&request) else {
                    return attempt(Value::Null, invalid_request());
                };
                let response = with_deadline(deadline, api.email_login(&request)).await;
                attempt(json!({"email": request.email}), response)
            }
        });
        let forked = fork(
            &attempts,
            Branches::new()
                .when(SUCCESS, |a: &Payload| access_token(a).is_some())
                .when(FAILURE, |a: &Payload| access_token(a).is_none()),
        );
        Channels::from_fork(FlowId::Login, &forked)
            .map_channel(SUCCESS, |a| login_credentials(&a))
            .map_channel(FAILURE, |a| a["response"].clone())
    })
    .mocked_by(ctx.schema.clone())
}

// ============================================================================
// Signup
// ============================================================================

fn signup_credentials(attempt: &Payload) -> Payload {
    Credentials {
        user_email: attempt["context"]["email"].as_str().unwrap_or_default().to_string(),
        access_token: access_token(attempt).unwrap_or_default().to_string(),
        refresh_token: response_json_str(attempt, "refresh_token")
            .unwrap_or_default()
            .to_string(),
        config_token: attempt["context"]["configToken"]
            .as_str()
            .unwrap_or_default()
            .to_string(),
        is_new_config_token: true,
    }
    .to_payload()
}

/// Email/password signup
///
/// A fresh config token is generated for every new account. A 500 without
/// a token is a soft failure on `warning`; anything else without a token
/// is `failure`.
pub fn signup(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let deadline = ctx.policy_timeout;
    Flow::new(FlowId::Signup, move |input| {
        let api = Arc::clone(&api);
        let attempts = input.exhaust_map(move |request| {
            let api = Arc::clone(&api);
            async move {
                let Some(request) = parse_login(&request) else {
                    return attempt(Value::Null, invalid_request());
                };
                let config_token = generate_config_token();
                let response =
                    with_deadline(deadline, api.email_signup(&request, &config_token)).await;
                attempt(
                    json!({"email": request.email, "configToken": config_token}),
                    response,
                )
            }
        });
        let forked = fork(
            &attempts,
            Branches::new()
                .when(SUCCESS, |a: &Payload| access_token(a).is_some())
                .when(WARNING, |a: &Payload| a["response"]["status"] == json!(500))
                .when(FAILURE, |_: &Payload| true),
        );
        Channels::from_fork(FlowId::Signup, &forked)
            .map_channel(SUCCESS, |a| signup_credentials(&a))
            .map_channel(WARNING, |a| a["response"].clone())
            .map_channel(FAILURE, |a| a["response"].clone())
    })
    .mocked_by(ctx.schema.clone())
}

// ============================================================================
// Token refresh
// ============================================================================

fn refreshed_credentials(attempt: &Payload) -> Payload {
    let Some(mut credentials) = Credentials::from_payload(&attempt["context"]) else {
        return Value::Null;
    };
    if let Some(token) = access_token(attempt) {
        credentials.access_token = token.to_string();
    }
    if let Some(token) = response_json_str(attempt, "refresh_token") {
        credentials.refresh_token = token.to_string();
    }
    credentials.to_payload()
}

/// Exchange the refresh token for a new access token
///
/// Input: current [`Credentials`], typically sampled on an interval.
/// `success` carries the updated credentials.
pub fn token_refresh(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let deadline = ctx.policy_timeout;
    Flow::new(FlowId::TokenRefresh, move |input| {
        let api = Arc::clone(&api);
        let attempts = input.exhaust_map(move |credentials| {
            let api = Arc::clone(&api);
            async move {
                let Some(parsed) = Credentials::from_payload(&credentials) else {
                    return attempt(Value::Null, invalid_request());
                };
                let response =
                    with_deadline(deadline, api.token_refresh(&parsed.refresh_token)).await;
                attempt(credentials, response)
            }
        });
        let forked = fork(
            &attempts,
            Branches::new()
                .when(SUCCESS, |a: &Payload| access_token(a).is_some() && !a["context"].is_null())
                .when(FAILURE, |_: &Payload| true),
        );
        Channels::from_fork(FlowId::TokenRefresh, &forked)
            .map_channel(SUCCESS, |a| refreshed_credentials(&a))
            .map_channel(FAILURE, |a| a["response"].clone())
    })
    .mocked_by(ctx.schema.clone())
}
