//! Host service spin-up flow

use std::sync::Arc;

use serde_json::{json, Value};

use crate::api::HostSpinUpRequest;
use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE, SUCCESS};
use crate::flows::mandelbox::{mandelbox_id, mandelbox_ip};
use crate::flows::FlowContext;
use crate::http::ServerResponse;
use crate::registry::Payload;
use crate::store::Credentials;

/// Input for [`host_spin_up`]: an assignment response and the credentials it was made with
#[must_use]
pub fn host_request(mandelbox: &Payload, credentials: &Payload) -> Payload {
    json!({"mandelbox": mandelbox, "credentials": credentials})
}

fn build_request(input: &Payload, json_data: &str) -> Option<HostSpinUpRequest> {
    let credentials = Credentials::from_payload(&input["credentials"])?;
    Some(HostSpinUpRequest {
        ip: mandelbox_ip(&input["mandelbox"])?.to_string(),
        mandelbox_id: mandelbox_id(&input["mandelbox"])?.to_string(),
        access_token: credentials.access_token,
        config_token: credentials.config_token,
        is_new_config_token: credentials.is_new_config_token,
        json_data: json_data.to_string(),
    })
}

/// Ask the mandelbox's host to start the protocol server
///
/// Input: [`host_request`]. One attempt per run, bounded by the mandelbox
/// deadline. `success` carries `{ip, mandelboxId, response}` for the
/// protocol-launch flow; `failure` carries the raw [`ServerResponse`].
pub fn host_spin_up(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let json_data = ctx.json_data.clone();
    let deadline = ctx.mandelbox_timeout;
    Flow::new(FlowId::HostSpinUp, move |input| {
        let api = Arc::clone(&api);
        let json_data = json_data.clone();
        let attempts = input
            .map_async(move |input: Value| {
                let api = Arc::clone(&api);
                let request = build_request(&input, &json_data);
                async move {
                    let Some(request) = request else {
                        let invalid = ServerResponse::new(400, json!({"error": "INVALID_MANDELBOX"}));
                        return json!({"response": invalid.into_payload()});
                    };
                    let response = api.host_spin_up(&request).await;
                    json!({
                        "ip": request.ip,
                        "mandelboxId": request.mandelbox_id,
                        "response": response.into_payload(),
                    })
                }
            })
            .first_within(
                deadline,
                json!({"response": ServerResponse::timed_out().into_payload()}),
            );

        let ready = |a: &Payload| {
            a["ip"].is_string()
                && ServerResponse::from_payload(&a["response"]).is_some_and(|r| r.is_success_status())
        };
        let forked = fork(
            &attempts,
            Branches::new()
                .when(SUCCESS, ready)
                .when(FAILURE, move |a: &Payload| !ready(a)),
        );
        Channels::from_fork(FlowId::HostSpinUp, &forked)
            .map_channel(FAILURE, |a| a["response"].clone())
    })
    .mocked_by(ctx.schema.clone())
}
