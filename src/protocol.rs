//! Friend-to-friend request protocol: paths, ports, and the status payload.

use std::time::Duration;

use crate::model::Status;

/// Port the web server is published on inside the hidden service.
pub const WEB_SERVER_VIRTUAL_PORT: u16 = 443;

/// `POST`: body is the sender's status.
pub const PUSH_STATUS_REQUEST_PATH: &str = "/pushStatus";

/// `GET`: response body is the responder's status.
pub const PULL_STATUS_REQUEST_PATH: &str = "/pullStatus";

pub const DEFAULT_PULL_PERIOD: Duration = Duration::from_secs(5 * 60);

/// Encode a status as the JSON request/response body.
pub fn encode_status(status: &Status) -> Result<String, serde_json::Error> {
    serde_json::to_string(status)
}

/// Decode a peer's status body.
pub fn decode_status(body: &str) -> Result<Status, serde_json::Error> {
    serde_json::from_str(body)
}
