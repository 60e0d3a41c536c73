//! Autoupdate flow
//!
//! Driven by a tick signal (app ready plus a periodic interval), never by a
//! one-shot trigger.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::flow::{fork, Branches, Channels, Flow, FlowId, FAILURE};
use crate::flows::{FlowContext, AVAILABLE, NOT_AVAILABLE};
use crate::http::{with_deadline, ServerResponse};
use crate::registry::Payload;

/// Numeric components of a dotted version, ignoring a leading `v` and any
/// pre-release suffix
fn components(version: &str) -> Option<Vec<u64>> {
    let core = version.trim().trim_start_matches('v');
    let core = core.split(['-', '+']).next()?;
    core.split('.').map(|part| part.parse().ok()).collect()
}

/// Compare two dotted versions, treating missing components as zero
#[must_use]
pub fn compare_versions(a: &str, b: &str) -> Option<Ordering> {
    let (mut a, mut b) = (components(a)?, components(b)?);
    let len = a.len().max(b.len());
    a.resize(len, 0);
    b.resize(len, 0);
    Some(a.cmp(&b))
}

fn latest(check: &Payload) -> Option<&str> {
    let response = &check["response"];
    if !ServerResponse::from_payload(response).is_some_and(|r| r.is_success_status()) {
        return None;
    }
    response["json"]["version"].as_str()
}

fn newer(check: &Payload) -> Option<bool> {
    let latest = latest(check)?;
    let current = check["current"].as_str()?;
    compare_versions(latest, current).map(|order| order == Ordering::Greater)
}

/// Check for a newer client on every tick
///
/// `available` and `notAvailable` carry `{current, latest}`; `failure`
/// carries the raw [`ServerResponse`], including unparseable versions.
pub fn autoupdate(ctx: &FlowContext) -> Flow {
    let api = Arc::clone(&ctx.api);
    let deadline = ctx.policy_timeout;
    let current = ctx.current_version.clone();
    Flow::new(FlowId::Autoupdate, move |input| {
        let api = Arc::clone(&api);
        let current = current.clone();
        let checks = input.exhaust_map(move |_tick: Value| {
            let api = Arc::clone(&api);
            let current = current.clone();
            async move {
                let response = with_deadline(deadline, api.latest_version()).await;
                json!({"current": current, "response": response.into_payload()})
            }
        });
        let forked = fork(
            &checks,
            Branches::new()
                .when(AVAILABLE, |c: &Payload| newer(c) == Some(true))
                .when(NOT_AVAILABLE, |c: &Payload| newer(c) == Some(false))
                .when(FAILURE, |_: &Payload| true),
        );
        let versions = |c: Payload| json!({"current": c["current"], "latest": latest(&c)});
        Channels::from_fork(FlowId::Autoupdate, &forked)
            .map_channel(AVAILABLE, versions)
            .map_channel(NOT_AVAILABLE, versions)
            .map_channel(FAILURE, |c| c["response"].clone())
    })
    .mocked_by(ctx.schema.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flows::testing::StubApi;
    use crate::signal::{Signal, Subscription};
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn next(sub: &mut Subscription<Payload>) -> Option<Payload> {
        tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .ok()
            .flatten()
    }

    fn ctx(api: StubApi) -> FlowContext {
        let mut ctx = FlowContext::new(Arc::new(api));
        ctx.current_version = "1.2.0".into();
        ctx
    }

    #[test]
    fn test_version_ordering() {
        assert_eq!(compare_versions("1.10.0", "1.9.9"), Some(Ordering::Greater));
        assert_eq!(compare_versions("v2.0", "2.0.0"), Some(Ordering::Equal));
        assert_eq!(compare_versions("2.0.0-rc1", "1.0.0"), Some(Ordering::Greater));
        assert_eq!(compare_versions("banana", "1.0.0"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_newer_version_is_available() {
        let api = StubApi::new().respond("latest_version", ServerResponse::new(200, json!({"version": "1.3.0"})));
        let input = Signal::new();
        let channels = autoupdate(&ctx(api)).run(&input);
        let mut available = channels.get(AVAILABLE).unwrap().subscribe();

        input.emit(json!(0));

        assert_eq!(
            next(&mut available).await,
            Some(json!({"current": "1.2.0", "latest": "1.3.0"}))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_version_is_not_available() {
        let api = StubApi::new().respond("latest_version", ServerResponse::new(200, json!({"version": "1.2.0"})));
        let input = Signal::new();
        let channels = autoupdate(&ctx(api)).run(&input);
        let mut not_available = channels.get(NOT_AVAILABLE).unwrap().subscribe();

        input.emit(json!(0));

        assert!(next(&mut not_available).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unreachable_update_server_fails() {
        let api = StubApi::new().respond("latest_version", ServerResponse::transport_failure());
        let input = Signal::new();
        let channels = autoupdate(&ctx(api)).run(&input);
        let mut failure = channels.failure().unwrap().subscribe();

        input.emit(json!(0));

        assert_eq!(next(&mut failure).await, Some(json!({"status": 500, "json": {}})));
    }
}
