use serde::{Deserialize, Serialize};

use crate::volume_manager::{AppVolume, DuckStatus};

/// Datagram sent by the UI process.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Status,
    Start,
    Stop,
    ForceDuck,
    ForceRestore,
    ListApps,
}

impl ControlRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ControlRequest::Status => "status",
            ControlRequest::Start => "start",
            ControlRequest::Stop => "stop",
            ControlRequest::ForceDuck => "force_duck",
            ControlRequest::ForceRestore => "force_restore",
            ControlRequest::ListApps => "list_apps",
        }
    }
}

/// Reply datagram. `type` echoes the request; unparseable requests get
/// `"error"`.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ControlResponse {
    #[serde(rename = "type")]
    pub msg_type: String,
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<DuckStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apps: Option<Vec<AppVolume>>,
    /// Fades started by a force action
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fades_started: Option<usize>,
    /// Policy values replaced by defaults
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warnings: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn ok(request: &ControlRequest) -> Self {
        Self {
            msg_type: request.name().to_string(),
            ok: true,
            status: None,
            apps: None,
            fades_started: None,
            warnings: None,
            error: None,
        }
    }

    pub fn failed(msg_type: &str, error: impl Into<String>) -> Self {
        Self {
            msg_type: msg_type.to_string(),
            ok: false,
            status: None,
            apps: None,
            fades_started: None,
            warnings: None,
            error: Some(error.into()),
        }
    }

    pub fn with_status(mut self, status: DuckStatus) -> Self {
        self.status = Some(status);
        self
    }
}
