//! Correlated command/reply exchange with connected agents.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;
use vmctl_protocol::AgentMessage;

use crate::pending::PendingTable;
use crate::registry::AgentRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelError {
    #[error("agent {0} is not connected")]
    AgentUnavailable(String),

    #[error("agent {0} disconnected before replying")]
    AgentDisconnected(String),

    #[error("agent {agent_id} did not reply with {expected} within {timeout:?}")]
    Timeout {
        agent_id: String,
        expected: String,
        timeout: Duration,
    },

    #[error("could not encode command: {0}")]
    Encode(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    pub wait_for: Option<&'static str>,
    pub timeout: Duration,
}

impl SendOptions {
    pub fn fire_and_forget() -> Self {
        Self {
            wait_for: None,
            timeout: Duration::ZERO,
        }
    }

    pub fn wait_for(kind: &'static str, timeout: Duration) -> Self {
        Self {
            wait_for: Some(kind),
            timeout,
        }
    }
}

/// Removes the pending entry if the waiting future is dropped mid-flight.
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    correlation_id: &'a str,
    armed: bool,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.pending.cancel(self.correlation_id);
        }
    }
}

#[derive(Clone)]
pub struct CommandChannel {
    registry: Arc<AgentRegistry>,
    pending: Arc<PendingTable>,
}

impl CommandChannel {
    pub fn new(registry: Arc<AgentRegistry>, pending: Arc<PendingTable>) -> Self {
        Self { registry, pending }
    }

    pub fn pending(&self) -> &PendingTable {
        &self.pending
    }

    /// Sends `message` to `agent_id` under a fresh correlation id.
    ///
    /// Without `wait_for` this returns `Ok(None)` as soon as the frame is
    /// queued. Otherwise it waits for a reply of that type carrying the same
    /// correlation id from the same agent, or fails once the timeout passes.
    /// A reply that shows up after the timeout is dropped by [`dispatch`](Self::dispatch).
    pub async fn send(
        &self,
        agent_id: &str,
        message: AgentMessage,
        options: SendOptions,
    ) -> Result<Option<AgentMessage>, ChannelError> {
        let handle = self
            .registry
            .get_connected(agent_id)
            .ok_or_else(|| ChannelError::AgentUnavailable(agent_id.to_string()))?;

        let correlation_id = Uuid::new_v4().to_string();
        let message = message.with_correlation_id(correlation_id.clone());

        let Some(expected) = options.wait_for else {
            debug!(%agent_id, %correlation_id, kind = %message.kind, "sending command");
            handle.deliver(message)?;
            return Ok(None);
        };

        let deadline = Instant::now() + options.timeout;
        let mut completion = self
            .pending
            .register(&correlation_id, agent_id, handle.session, expected, deadline);
        let mut guard = PendingGuard {
            pending: &self.pending,
            correlation_id: &correlation_id,
            armed: true,
        };

        // The agent may have gone away between lookup and registration, in
        // which case nobody would ever fail this entry.
        if !self.registry.is_current(agent_id, handle.session) {
            return Err(ChannelError::AgentDisconnected(agent_id.to_string()));
        }

        debug!(%agent_id, %correlation_id, kind = %message.kind, %expected, "sending command");
        handle.deliver(message)?;

        let waited = tokio::time::timeout_at(deadline, &mut completion).await;
        let outcome = match waited {
            Ok(resolved) => resolved,
            Err(_elapsed) => {
                if self.pending.cancel(&correlation_id) {
                    guard.armed = false;
                    warn!(%agent_id, %correlation_id, %expected, "agent reply timed out");
                    return Err(ChannelError::Timeout {
                        agent_id: agent_id.to_string(),
                        expected: expected.to_string(),
                        timeout: options.timeout,
                    });
                }
                // Someone removed the entry just before the deadline fired and
                // is about to complete it.
                completion.await
            }
        };
        guard.armed = false;

        match outcome {
            Ok(result) => result.map(Some),
            Err(_closed) => Err(ChannelError::AgentDisconnected(agent_id.to_string())),
        }
    }

    /// Routes one inbound frame from `agent_id` to the request waiting on it.
    /// Frames that match nothing are dropped.
    pub fn dispatch(&self, agent_id: &str, message: AgentMessage) {
        let kind = message.kind.clone();
        let correlation_id = message.correlation_id.clone();
        if !self.pending.resolve(agent_id, message) {
            debug!(
                %agent_id,
                %kind,
                correlation_id = correlation_id.as_deref().unwrap_or(""),
                "discarding unmatched agent frame"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::mpsc;
    use vmctl_protocol::{STOP_VM, VM_OUTPUT, VM_STOPPED};

    fn setup() -> (Arc<AgentRegistry>, CommandChannel) {
        let pending = Arc::new(PendingTable::new());
        let registry = Arc::new(AgentRegistry::new(pending.clone()));
        let channel = CommandChannel::new(registry.clone(), pending);
        (registry, channel)
    }

    fn stop(vm_id: &str) -> AgentMessage {
        AgentMessage::new(STOP_VM, json!({"vmId": vm_id})).unwrap()
    }

    fn reply_to(sent: &AgentMessage, kind: &str) -> AgentMessage {
        AgentMessage::new(kind, json!({"success": true}))
            .unwrap()
            .with_correlation_id(sent.correlation_id.clone().unwrap())
    }

    #[tokio::test]
    async fn fire_and_forget_returns_without_waiting() {
        let (registry, channel) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("agent-a", tx, 0);

        let result = channel
            .send("agent-a", stop("vm-1"), SendOptions::fire_and_forget())
            .await
            .unwrap();
        assert!(result.is_none());

        let sent = rx.recv().await.unwrap();
        assert_eq!(sent.kind, STOP_VM);
        assert!(sent.correlation_id.is_some());
        assert!(channel.pending().outstanding().is_empty());
    }

    #[tokio::test]
    async fn unknown_agent_is_unavailable() {
        let (_registry, channel) = setup();
        let err = channel
            .send(
                "ghost",
                stop("vm-1"),
                SendOptions::wait_for(VM_STOPPED, Duration::from_secs(1)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::AgentUnavailable("ghost".to_string()));
    }

    #[tokio::test]
    async fn resolves_only_on_matching_reply() {
        let (registry, channel) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("agent-a", tx, 0);

        let agent_channel = channel.clone();
        let agent = tokio::spawn(async move {
            let sent = rx.recv().await.unwrap();
            // Wrong type, wrong agent, and an uncorrelated frame first.
            agent_channel.dispatch("agent-a", reply_to(&sent, VM_OUTPUT));
            agent_channel.dispatch("agent-b", reply_to(&sent, VM_STOPPED));
            agent_channel.dispatch(
                "agent-a",
                AgentMessage::new(VM_STOPPED, json!({})).unwrap(),
            );
            agent_channel.dispatch("agent-a", reply_to(&sent, VM_STOPPED));
        });

        let reply = channel
            .send(
                "agent-a",
                stop("vm-1"),
                SendOptions::wait_for(VM_STOPPED, Duration::from_secs(5)),
            )
            .await
            .unwrap()
            .unwrap();
        agent.await.unwrap();

        assert_eq!(reply.kind, VM_STOPPED);
        assert_eq!(reply.payload, json!({"success": true}));
        assert!(channel.pending().outstanding().is_empty());
    }

    #[tokio::test]
    async fn timeout_removes_entry_and_late_reply_is_discarded() {
        let (registry, channel) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("agent-a", tx, 0);

        let err = channel
            .send(
                "agent-a",
                stop("vm-1"),
                SendOptions::wait_for(VM_STOPPED, Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ChannelError::Timeout { .. }));
        assert!(channel.pending().outstanding().is_empty());

        let sent = rx.recv().await.unwrap();
        channel.dispatch("agent-a", reply_to(&sent, VM_STOPPED));
        assert!(channel.pending().outstanding().is_empty());
    }

    #[tokio::test]
    async fn disconnect_fails_in_flight_request() {
        let (registry, channel) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = registry.register("agent-a", tx, 0);

        let agent_registry = registry.clone();
        tokio::spawn(async move {
            let _sent = rx.recv().await.unwrap();
            agent_registry.unregister("agent-a", handle.session);
        });

        let err = channel
            .send(
                "agent-a",
                stop("vm-1"),
                SendOptions::wait_for(VM_STOPPED, Duration::from_secs(5)),
            )
            .await
            .unwrap_err();
        assert_eq!(err, ChannelError::AgentDisconnected("agent-a".to_string()));
    }

    #[tokio::test]
    async fn concurrent_requests_to_one_agent_resolve_independently() {
        let (registry, channel) = setup();
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register("agent-a", tx, 0);

        let agent_channel = channel.clone();
        tokio::spawn(async move {
            let first = rx.recv().await.unwrap();
            let second = rx.recv().await.unwrap();
            // Answer out of order.
            for sent in [second, first] {
                let vm_id = sent.payload["vmId"].clone();
                let reply = AgentMessage::new(VM_STOPPED, json!({"vmId": vm_id}))
                    .unwrap()
                    .with_correlation_id(sent.correlation_id.unwrap());
                agent_channel.dispatch("agent-a", reply);
            }
        });

        let options = SendOptions::wait_for(VM_STOPPED, Duration::from_secs(5));
        let (one, two) = tokio::join!(
            channel.send("agent-a", stop("vm-1"), options),
            channel.send("agent-a", stop("vm-2"), options),
        );
        assert_eq!(one.unwrap().unwrap().payload["vmId"], json!("vm-1"));
        assert_eq!(two.unwrap().unwrap().payload["vmId"], json!("vm-2"));
    }
}
