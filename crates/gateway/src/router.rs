//! Maps the command routes onto the serial links.

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    serial::{LinkSet, SendError},
    store::DeviceRole,
};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Missing cmd")]
    Missing,
    #[error(transparent)]
    Send(#[from] SendError),
}

impl ResponseError for CommandError {
    fn status_code(&self) -> StatusCode {
        match self {
            CommandError::Missing => StatusCode::BAD_REQUEST,
            CommandError::Send(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        HttpResponse::build(self.status_code()).json(json!({ "error": self.to_string() }))
    }
}

#[derive(Debug, PartialEq, Serialize)]
pub struct CommandAccepted {
    pub status: String,
    pub cmd: String,
}

#[derive(Deserialize)]
struct CommandBody {
    cmd: Option<serde_json::Value>,
}

#[derive(Clone)]
pub struct CommandRouter {
    links: LinkSet,
}

impl CommandRouter {
    pub fn new(links: LinkSet) -> Self {
        Self { links }
    }

    /// Validate a raw request body and forward its `cmd` to `role`'s link.
    ///
    /// Bodies that are not JSON, lack `cmd`, or carry a blank or non-string
    /// `cmd` are rejected before the link is touched.
    pub fn dispatch(&self, role: DeviceRole, body: &[u8]) -> Result<CommandAccepted, CommandError> {
        let cmd = match parse_command(body) {
            Some(cmd) => cmd,
            None => {
                metrics::counter!("gateway_commands_total", "device" => role.label(), "result" => "rejected")
                    .increment(1);
                return Err(CommandError::Missing);
            }
        };

        if let Err(err) = self.links.send(role, &cmd) {
            metrics::counter!("gateway_commands_total", "device" => role.label(), "result" => "failed")
                .increment(1);
            warn!("command {cmd:?} for {role} failed: {err}");
            return Err(err.into());
        }

        metrics::counter!("gateway_commands_total", "device" => role.label(), "result" => "sent")
            .increment(1);
        info!("> Sent: {cmd}");
        Ok(CommandAccepted {
            status: format!("sent to {role}"),
            cmd,
        })
    }
}

fn parse_command(body: &[u8]) -> Option<String> {
    let parsed: CommandBody = serde_json::from_slice(body).ok()?;
    match parsed.cmd? {
        serde_json::Value::String(cmd) if !cmd.trim().is_empty() => Some(cmd),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::TelemetryStore;

    #[test]
    fn blank_or_absent_commands_are_rejected() {
        for body in [
            &br#"{}"#[..],
            br#"{"cmd": ""}"#,
            br#"{"cmd": "   "}"#,
            br#"{"cmd": 5}"#,
            br#"{"cmd": null}"#,
            b"not json",
            b"",
        ] {
            assert_eq!(parse_command(body), None, "{}", String::from_utf8_lossy(body));
        }
        assert_eq!(parse_command(br#"{"cmd":"OPEN","x":1}"#).as_deref(), Some("OPEN"));
    }

    #[test]
    fn missing_link_maps_to_server_error() {
        let router = CommandRouter::new(LinkSet::new(TelemetryStore::new()));
        let err = router.dispatch(DeviceRole::A, br#"{"cmd":"OPEN"}"#).unwrap_err();
        assert_eq!(err.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(err.to_string(), "Port A is not connected");

        let err = router.dispatch(DeviceRole::B, b"{}").unwrap_err();
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.to_string(), "Missing cmd");
    }
}
