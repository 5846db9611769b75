use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::channel::ChannelError;
use crate::models::StoreError;

/// Every way a VM operation can fail, as seen by HTTP callers.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    #[error("caller is not authenticated")]
    Unauthenticated,

    #[error("request body is missing or invalid")]
    BadRequest(&'static str),

    #[error("caller does not own this vm")]
    Forbidden,

    #[error("vm {0} not found")]
    NotFound(String),

    #[error("no agent is connected")]
    NoAgentAvailable,

    #[error("agent {0} is not connected")]
    AgentUnavailable(String),

    #[error("agent {0} disconnected before replying")]
    AgentDisconnected(String),

    #[error("agent reply was malformed: {0}")]
    AgentProtocol(String),

    #[error("agent {agent_id} did not reply within {timeout:?}")]
    Timeout { agent_id: String, timeout: Duration },

    #[error("vm {vm_id} is bound to a different agent")]
    RoutingConflict {
        vm_id: String,
        bound: Option<String>,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ControlError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthenticated => "unauthenticated",
            Self::BadRequest(code) => *code,
            Self::Forbidden => "not_vm_owner",
            Self::NotFound(_) => "vm_not_found",
            Self::NoAgentAvailable => "no_agent_connected",
            Self::AgentUnavailable(_) => "client_not_connected",
            Self::AgentDisconnected(_) => "agent_disconnected",
            Self::AgentProtocol(_) => "agent_protocol_error",
            Self::Timeout { .. } => "agent_response_timeout",
            Self::RoutingConflict { .. } => "vm_owned_by_other_client",
            Self::Store(_) => "internal",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthenticated => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound(_) | Self::AgentUnavailable(_) => StatusCode::NOT_FOUND,
            Self::RoutingConflict { .. } => StatusCode::CONFLICT,
            Self::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::NoAgentAvailable
            | Self::AgentDisconnected(_)
            | Self::AgentProtocol(_)
            | Self::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<ChannelError> for ControlError {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::AgentUnavailable(agent_id) => Self::AgentUnavailable(agent_id),
            ChannelError::AgentDisconnected(agent_id) => Self::AgentDisconnected(agent_id),
            ChannelError::Timeout {
                agent_id, timeout, ..
            } => Self::Timeout { agent_id, timeout },
            ChannelError::Encode(detail) => Self::AgentProtocol(detail),
        }
    }
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(code = self.code(), "request failed: {self}");
        }
        let mut body = json!({
            "ok": false,
            "error": self.code(),
            "detail": self.to_string(),
        });
        if let Self::RoutingConflict {
            bound: Some(bound), ..
        } = &self
        {
            body["ownerClient"] = json!(bound);
        }
        (status, Json(body)).into_response()
    }
}
