//! Subscription check flow
//!
//! Runs alongside mandelbox creation once a user is authenticated. A failed
//! check opens the payment window; it does not hold back the session.

use std::sync::Arc;

use serde_json::{json, Value};

use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE, SUCCESS};
use crate::flows::FlowContext;
use crate::http::{with_deadline, ServerResponse};
use crate::registry::Payload;
use crate::store::Credentials;

fn subscribed(response: &Payload) -> bool {
    let body = &response["json"];
    let ok = ServerResponse::from_payload(response).is_some_and(|r| r.is_success_status());
    ok && (body["subscribed"] == true
        || matches!(body["subscription_status"].as_str(), Some("active" | "trialing")))
}

/// Ask whether the account may use the product
///
/// Input: [`Credentials`]. Both channels carry the raw [`ServerResponse`].
pub fn subscription_check(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let deadline = ctx.policy_timeout;
    Flow::new(FlowId::SubscriptionCheck, move |input| {
        let api = Arc::clone(&api);
        let responses = input.exhaust_map(move |credentials: Value| {
            let api = Arc::clone(&api);
            async move {
                let Some(credentials) = Credentials::from_payload(&credentials) else {
                    return ServerResponse::new(400, json!({"error": "INVALID_CREDENTIALS"})).into_payload();
                };
                with_deadline(deadline, api.subscription_status(&credentials.access_token))
                    .await
                    .into_payload()
            }
        });
        let forked = fork(
            &responses,
            Branches::new()
                .when(SUCCESS, subscribed)
                .when(FAILURE, |r: &Payload| !subscribed(r)),
        );
        Channels::from_fork(FlowId::SubscriptionCheck, &forked)
    })
    .mocked_by(ctx.schema.clone())
}
