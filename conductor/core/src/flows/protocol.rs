//! Protocol launch and close flows

use serde_json::{json, Value};

use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE, SUCCESS};
use crate::flows::{FlowContext, SPAWNED};
use crate::http::ServerResponse;
use crate::protocol::LaunchInfo;
use crate::registry::Payload;

fn launch_info(ready_host: &Payload) -> Option<LaunchInfo> {
    let ip = ready_host["ip"].as_str()?;
    let response = ServerResponse::from_payload(&ready_host["response"])?;
    LaunchInfo::from_host_response(ip, &response)
}

/// Turn a ready host into protocol launch parameters
///
/// Input: the host spin-up flow's `success` payload. `success` carries a
/// [`LaunchInfo`]; `failure` carries `{error, host}` when the host's answer
/// lacks ports or a key.
pub fn protocol_launch(ctx: &FlowContext) -> Flow {
    Flow::new(FlowId::ProtocolLaunch, |input| {
        let parsed = input.map(|host: Value| {
            let launch = launch_info(&host).map_or(Value::Null, |info| info.to_payload());
            json!({"launch": launch, "host": host})
        });
        let forked = fork(
            &parsed,
            Branches::new()
                .when(SUCCESS, |p: &Payload| !p["launch"].is_null())
                .when(FAILURE, |p: &Payload| p["launch"].is_null()),
        );
        Channels::from_fork(FlowId::ProtocolLaunch, &forked)
            .map_channel(SUCCESS, |p| p["launch"].clone())
            .map_channel(FAILURE, |p| json!({"error": "INVALID_HOST_RESPONSE", "host": p["host"]}))
    })
    .mocked_by(ctx.schema.clone())
}

/// Follow one protocol process from spawn to exit
///
/// Input: that process's event signal. A clean exit (code 0) is `success`;
/// any other exit, or a spawn error, is `failure`. Run once per process.
pub fn protocol_close(ctx: &FlowContext) -> Flow {
    Flow::new(FlowId::ProtocolClose, |input| {
        let forked = fork(
            input,
            Branches::new()
                .when(SPAWNED, |e: &Payload| e["event"] == "spawned")
                .when(SUCCESS, |e: &Payload| e["event"] == "closed" && e["code"] == 0)
                .when(FAILURE, |_: &Payload| true),
        );
        Channels::from_fork(FlowId::ProtocolClose, &forked)
    })
    .mocked_by(ctx.schema.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::StubApi;
    use crate::protocol::ProtocolEvent;
    use crate::signal::{Signal, Subscription};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    async fn next(sub: &mut Subscription<Payload>) -> Option<Payload> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .ok()
            .flatten()
    }

    fn ctx() -> FlowContext {
        FlowContext::new(Arc::new(StubApi::new()))
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_info_from_ready_host() {
        let input = Signal::new();
        let channels = protocol_launch(&ctx()).run(&input);
        let mut success = channels.success().unwrap().subscribe();

        input.emit(json!({
            "ip": "10.0.0.1",
            "mandelboxId": "mb-1",
            "response": {"status": 200, "json": {"port_32262": 1, "port_32263": 2, "port_32273": 3, "aes_key": "k"}},
        }));

        let info = LaunchInfo::from_payload(&next(&mut success).await.unwrap()).unwrap();
        assert_eq!(info.args()[2], "32262:1.32263:2.32273:3");
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_without_key_fails() {
        let input = Signal::new();
        let channels = protocol_launch(&ctx()).run(&input);
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(json!({"ip": "10.0.0.1", "response": {"status": 200, "json": {}}}));

        assert_eq!(next(&mut failure).await.unwrap()["error"], "INVALID_HOST_RESPONSE");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_channels_by_exit_code() {
        let input = Signal::new();
        let channels = protocol_close(&ctx()).run(&input);
        let mut spawned = channels.get(SPAWNED).unwrap().subscribe();
        let mut success = channels.success().unwrap().subscribe();
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(ProtocolEvent::Spawned { pid: Some(7) }.into_payload());
        input.emit(ProtocolEvent::Closed { code: Some(0) }.into_payload());
        input.emit(ProtocolEvent::Closed { code: Some(139) }.into_payload());
        input.emit(ProtocolEvent::Error { reason: "boom".into() }.into_payload());

        assert_eq!(next(&mut spawned).await.unwrap()["pid"], 7);
        assert_eq!(next(&mut success).await.unwrap()["code"], 0);
        assert_eq!(next(&mut failure).await.unwrap()["code"], 139);
        assert_eq!(next(&mut failure).await.unwrap()["event"], "error");
    }
}
