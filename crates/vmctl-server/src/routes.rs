use axum::body::Bytes;
use axum::extract::rejection::JsonRejection;
use axum::extract::Path;
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::time::Instant;
use tracing::debug;
use vmctl_protocol::CreateVmCommand;

use crate::auth::Caller;
use crate::error::ControlError;
use crate::models::VmRecord;
use crate::State;

type ApiResult = Result<Json<Value>, ControlError>;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecRequest {
    pub agent_id: Option<String>,
    /// Older agents call themselves clients.
    pub client_id: Option<String>,
    pub vm_id: Option<String>,
    pub command: Option<String>,
}

impl ExecRequest {
    fn into_parts(self) -> Option<(String, String, String)> {
        let present = |value: Option<String>| value.filter(|v| !v.trim().is_empty());
        Some((
            present(self.agent_id).or(present(self.client_id))?,
            present(self.vm_id)?,
            present(self.command)?,
        ))
    }
}

/// Record plus the advisory live view, as one JSON object.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct VmWithLiveStatus<'a> {
    #[serde(flatten)]
    record: &'a VmRecord,
    live_status: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspect_message: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inspect_error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    live: Option<&'a Value>,
}

fn required_vm_id(raw: &str) -> Result<&str, ControlError> {
    let vm_id = raw.trim();
    if vm_id.is_empty() {
        return Err(ControlError::BadRequest("vmId_required"));
    }
    Ok(vm_id)
}

pub async fn create_vm(
    Extension(state): Extension<State>,
    caller: Caller,
    body: Bytes,
) -> ApiResult {
    // An empty body asks for the agent's defaults.
    let spec = if body.iter().all(u8::is_ascii_whitespace) {
        CreateVmCommand::default()
    } else {
        serde_json::from_slice(&body).map_err(|err| {
            debug!("rejecting create body: {err}");
            ControlError::BadRequest("invalid_vm_spec")
        })?
    };
    let created = state.coordinator.create(&caller, spec).await?;
    Ok(Json(json!({
        "ok": true,
        "agentId": created.agent_id,
        "created": created.record,
    })))
}

pub async fn start_vm(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(vm_id): Path<String>,
) -> ApiResult {
    let vm_id = required_vm_id(&vm_id)?;
    let started = state.coordinator.start(&caller, vm_id).await?;
    Ok(Json(json!({
        "ok": true,
        "vmId": started.vm_id,
        "agentId": started.agent_id,
    })))
}

pub async fn stop_vm(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(vm_id): Path<String>,
) -> ApiResult {
    let vm_id = required_vm_id(&vm_id)?;
    let stopped = state.coordinator.stop(&caller, vm_id).await?;
    Ok(Json(json!({
        "ok": true,
        "vmId": stopped.vm_id,
        "status": stopped.status,
        "result": stopped.reply,
    })))
}

pub async fn exec_vm(
    Extension(state): Extension<State>,
    caller: Caller,
    body: Result<Json<ExecRequest>, JsonRejection>,
) -> ApiResult {
    let missing = ControlError::BadRequest("clientId_vmId_command_required");
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            debug!("rejecting exec body: {rejection}");
            return Err(missing);
        }
    };
    let (agent_id, vm_id, command) = request.into_parts().ok_or(missing)?;
    let output = state
        .coordinator
        .exec(&caller, &vm_id, &agent_id, &command)
        .await?;
    Ok(Json(json!({
        "ok": true,
        "output": output,
    })))
}

pub async fn inspect_vm(
    Extension(state): Extension<State>,
    caller: Caller,
    Path(vm_id): Path<String>,
) -> ApiResult {
    let vm_id = required_vm_id(&vm_id)?;
    let view = state.coordinator.inspect(&caller, vm_id).await?;

    Ok(Json(json!({
        "ok": true,
        "vm": VmWithLiveStatus {
            record: &view.record,
            live_status: &view.live_status,
            inspect_message: view.message.as_deref(),
            inspect_error: view.error.as_deref(),
            live: view.live.as_ref(),
        },
    })))
}

pub async fn list_vms(Extension(state): Extension<State>, caller: Caller) -> ApiResult {
    let vms = state.coordinator.list(&caller).await?;
    Ok(Json(json!({
        "ok": true,
        "vms": vms,
    })))
}

pub async fn list_agents(Extension(state): Extension<State>) -> Json<Value> {
    let now = Instant::now();
    let outstanding = state.channel.pending().outstanding();
    let agents: Vec<Value> = state
        .registry
        .snapshot()
        .into_iter()
        .map(|agent| {
            let pending: Vec<Value> = outstanding
                .iter()
                .filter(|request| request.agent_id == agent.id)
                .map(|request| {
                    let expires_in = request.deadline.saturating_duration_since(now);
                    json!({
                        "correlationId": request.correlation_id,
                        "expectedType": request.expected_type,
                        "expiresInMs": u64::try_from(expires_in.as_millis()).unwrap_or(u64::MAX),
                    })
                })
                .collect();
            let vms: Vec<Value> = state
                .routes
                .vms_for_agent(&agent.id)
                .into_iter()
                .map(|(vm_id, entry)| {
                    json!({
                        "vmId": vm_id,
                        "name": entry.name,
                        "owner": entry.owner,
                    })
                })
                .collect();
            json!({
                "id": agent.id,
                "connectedAt": agent.connected_at,
                "boundVms": agent.bound_vms,
                "vms": vms,
                "pendingRequests": pending,
            })
        })
        .collect();

    Json(json!({
        "ok": true,
        "nextPlacement": state.registry.select().map(|agent| agent.id),
        "agents": agents,
    }))
}

pub async fn health_check() -> Json<()> {
    Json(())
}
