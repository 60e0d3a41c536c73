//! Mandelbox assignment flow

use std::sync::Arc;

use serde_json::Value;

use crate::api::MandelboxRequest;
use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE, SUCCESS};
use crate::flows::FlowContext;
use crate::http::ServerResponse;
use crate::registry::Payload;
use crate::store::Credentials;

/// Identifier of the assigned mandelbox in an assignment response payload
///
/// The webserver has used both `ID` and `mandelbox_id` for this field.
#[must_use]
pub fn mandelbox_id(response: &Payload) -> Option<&str> {
    ["ID", "mandelbox_id"]
        .iter()
        .find_map(|key| response["json"][key].as_str().filter(|id| !id.is_empty()))
}

/// Address of the assigned mandelbox's host
#[must_use]
pub fn mandelbox_ip(response: &Payload) -> Option<&str> {
    response["json"]["ip"].as_str().filter(|ip| !ip.is_empty())
}

/// Ask the webserver for a mandelbox
///
/// Input: [`Credentials`]. One attempt per run: the first response, or a
/// 504 once the mandelbox deadline has passed since the flow was built.
/// Both channels carry the raw [`ServerResponse`]; `success` requires a
/// non-empty mandelbox identifier whatever the status.
pub fn mandelbox_create(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let region = ctx.region.clone();
    let deadline = ctx.mandelbox_timeout;
    Flow::new(FlowId::MandelboxCreate, move |input| {
        let api = Arc::clone(&api);
        let region = region.clone();
        let responses = input
            .map_async(move |credentials: Value| {
                let api = Arc::clone(&api);
                let region = region.clone();
                async move {
                    let Some(credentials) = Credentials::from_payload(&credentials) else {
                        return ServerResponse::new(400, serde_json::json!({"error": "INVALID_CREDENTIALS"}))
                            .into_payload();
                    };
                    let request = MandelboxRequest {
                        email: credentials.user_email,
                        access_token: credentials.access_token,
                        region,
                    };
                    api.mandelbox_create(&request).await.into_payload()
                }
            })
            .first_within(deadline, ServerResponse::timed_out().into_payload());

        let forked = fork(
            &responses,
            Branches::new()
                .when(SUCCESS, |r: &Payload| mandelbox_id(r).is_some())
                .when(FAILURE, |r: &Payload| mandelbox_id(r).is_none()),
        );
        Channels::from_fork(FlowId::MandelboxCreate, &forked)
    })
    .mocked_by(ctx.schema.clone())
}
