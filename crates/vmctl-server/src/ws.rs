//! Agent side of the control plane: one WebSocket per connected agent.

use std::ops::ControlFlow;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Query;
use axum::response::IntoResponse;
use axum::Extension;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmctl_protocol::AgentMessage;

use crate::registry::AgentHandle;
use crate::State;

#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    #[serde(rename = "agentId")]
    pub agent_id: Option<String>,
}

pub async fn connect(
    Extension(state): Extension<State>,
    Query(params): Query<ConnectParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let agent_id = params
        .agent_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    ws.on_upgrade(move |socket| serve_agent(state, agent_id, socket))
}

async fn serve_agent(state: State, agent_id: String, socket: WebSocket) {
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<AgentMessage>();

    let bound_vms = state.routes.count_for_agent(&agent_id);
    let handle = state.registry.register(agent_id.clone(), tx, bound_vms);
    info!(%agent_id, bound_vms, agents = state.registry.len(), "agent connected");

    let writer_id = agent_id.clone();
    let mut writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let text = match serde_json::to_string(&message) {
                Ok(text) => text,
                Err(err) => {
                    warn!(agent_id = %writer_id, "could not encode command: {err}");
                    continue;
                }
            };
            if let Err(err) = sink.send(Message::Text(text)).await {
                debug!(agent_id = %writer_id, "agent socket closed for writing: {err}");
                break;
            }
        }
    });

    loop {
        tokio::select! {
            frame = stream.next() => match frame {
                Some(Ok(frame)) => {
                    if handle_frame(&state, &agent_id, frame).is_break() {
                        break;
                    }
                }
                None => break,
                Some(Err(err)) => {
                    debug!(%agent_id, "agent socket error: {err}");
                    break;
                }
            },
            _ = &mut writer => break,
        }
    }

    writer.abort();
    hang_up(&state, &handle);
}

/// Applies one inbound frame. Breaks when the agent closes the socket.
fn handle_frame(state: &State, agent_id: &str, frame: Message) -> ControlFlow<()> {
    match frame {
        Message::Text(text) => match serde_json::from_str::<AgentMessage>(&text) {
            Ok(message) => state.channel.dispatch(agent_id, message),
            Err(err) => warn!(%agent_id, "discarding malformed agent frame: {err}"),
        },
        Message::Binary(bytes) => {
            debug!(%agent_id, len = bytes.len(), "ignoring binary frame");
        }
        Message::Ping(_) | Message::Pong(_) => {}
        Message::Close(_) => return ControlFlow::Break(()),
    }
    ControlFlow::Continue(())
}

fn hang_up(state: &State, handle: &AgentHandle) {
    if state.registry.unregister(&handle.id, handle.session).is_none() {
        debug!(agent_id = %handle.id, session = handle.session, "connection already replaced");
    }
    info!(agent_id = %handle.id, session = handle.session, "agent disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelError, SendOptions};
    use crate::config::CommandTimeouts;
    use crate::models::MemoryVmStore;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::Instant;
    use vmctl_protocol::{STOP_VM, VM_STOPPED};

    fn state() -> State {
        State::new(Arc::new(MemoryVmStore::new()), CommandTimeouts::default())
    }

    fn connect(
        state: &State,
        agent_id: &str,
    ) -> (AgentHandle, mpsc::UnboundedReceiver<AgentMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (state.registry.register(agent_id, tx, 0), rx)
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    #[tokio::test]
    async fn malformed_and_binary_frames_leave_waiters_alone() {
        let state = state();
        let (handle, _rx) = connect(&state, "agent-a");
        let pending = state.channel.pending();
        let waiter = pending.register("c-1", "agent-a", handle.session, VM_STOPPED, deadline());

        for frame in [
            Message::Text("not json".to_string()),
            Message::Text(r#"{"payload":{},"correlationId":"c-1"}"#.to_string()),
            Message::Binary(vec![0, 1, 2]),
            Message::Ping(vec![]),
        ] {
            assert!(handle_frame(&state, "agent-a", frame).is_continue());
        }
        assert!(pending.contains("c-1"));
        assert!(state.registry.is_current("agent-a", handle.session));

        let reply = json!({
            "type": VM_STOPPED,
            "payload": {"success": true},
            "correlationId": "c-1",
        });
        assert!(handle_frame(&state, "agent-a", Message::Text(reply.to_string())).is_continue());
        let resolved = waiter.await.unwrap().unwrap();
        assert_eq!(resolved.payload, json!({"success": true}));
    }

    #[tokio::test]
    async fn close_frame_ends_session_and_fails_waiters() {
        let state = state();
        let (handle, _rx) = connect(&state, "agent-a");
        let waiter = state.channel.pending().register(
            "c-1",
            "agent-a",
            handle.session,
            VM_STOPPED,
            deadline(),
        );

        assert!(handle_frame(&state, "agent-a", Message::Close(None)).is_break());
        hang_up(&state, &handle);

        assert!(state.registry.get("agent-a").is_none());
        assert_eq!(
            waiter.await.unwrap().unwrap_err(),
            ChannelError::AgentDisconnected("agent-a".to_string())
        );
    }

    #[tokio::test]
    async fn stale_hang_up_keeps_replacement() {
        let state = state();
        let (stale, _rx1) = connect(&state, "agent-a");
        let (current, mut rx2) = connect(&state, "agent-a");

        hang_up(&state, &stale);
        assert!(state.registry.is_current("agent-a", current.session));

        state
            .channel
            .send(
                "agent-a",
                AgentMessage::new(STOP_VM, json!({"vmId": "vm-1"})).unwrap(),
                SendOptions::fire_and_forget(),
            )
            .await
            .unwrap();
        assert_eq!(rx2.recv().await.unwrap().kind, STOP_VM);
    }
}
