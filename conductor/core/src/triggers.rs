//! Well-known trigger names
//!
//! Sources fed from outside the graph (application lifecycle, renderer
//! actions) plus the names flow channels are published under.

use crate::flow::FlowId;

/// Application finished starting
pub const APP_READY: &str = "appReady";
/// Store snapshot read at startup (replays its last value)
pub const PERSISTED: &str = "persisted";
/// Latest valid credentials from any auth path (replays its last value)
pub const AUTHENTICATED: &str = "authenticated";
/// Credentials for which a new mandelbox attempt should start
pub const MANDELBOX_REQUEST: &str = "mandelboxRequest";

/// Renderer submitted `{email, password}` for login
pub const LOGIN_ACTION: &str = "loginAction";
/// Renderer submitted `{email, password}` for signup
pub const SIGNUP_ACTION: &str = "signupAction";
/// User signed out
pub const SIGNOUT_ACTION: &str = "signoutAction";
/// User asked to start a new session or retry a failed one
pub const RELAUNCH_ACTION: &str = "relaunchAction";
/// User asked to quit
pub const QUIT_ACTION: &str = "quitAction";

/// Triggers a renderer may emit over IPC
pub const RENDERER_ACTIONS: [&str; 5] = [
    LOGIN_ACTION,
    SIGNUP_ACTION,
    SIGNOUT_ACTION,
    RELAUNCH_ACTION,
    QUIT_ACTION,
];

/// Name a flow channel is published under, e.g. `loginFlowSuccess`
#[must_use]
pub fn flow_trigger(flow: FlowId, channel: &str) -> String {
    let mut chars = channel.chars();
    let capitalised: String = match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    };
    format!("{}{capitalised}", flow.name())
}
