//! Table of in-flight correlated requests.
//!
//! Whoever removes an entry from the table owns its completion handle, so a
//! request resolves at most once no matter how a reply, a deadline and an
//! agent disconnect interleave.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use vmctl_protocol::AgentMessage;

use crate::channel::ChannelError;

pub type Completion = oneshot::Receiver<Result<AgentMessage, ChannelError>>;

struct PendingRequest {
    agent_id: String,
    /// Connection the command went out on.
    session: u64,
    expected_type: String,
    deadline: Instant,
    completion: oneshot::Sender<Result<AgentMessage, ChannelError>>,
}

#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest>>,
}

/// Outstanding request as reported by [`PendingTable::outstanding`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSummary {
    pub correlation_id: String,
    pub agent_id: String,
    pub expected_type: String,
    pub deadline: Instant,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        correlation_id: &str,
        agent_id: &str,
        session: u64,
        expected_type: &str,
        deadline: Instant,
    ) -> Completion {
        let (tx, rx) = oneshot::channel();
        let previous = self.entries.lock().insert(
            correlation_id.to_string(),
            PendingRequest {
                agent_id: agent_id.to_string(),
                session,
                expected_type: expected_type.to_string(),
                deadline,
                completion: tx,
            },
        );
        debug_assert!(previous.is_none(), "correlation id reused while pending");
        rx
    }

    /// Resolves the entry matching this inbound frame. The frame must come
    /// from the addressed agent and carry the expected reply type; anything
    /// else leaves the table untouched.
    pub fn resolve(&self, agent_id: &str, message: AgentMessage) -> bool {
        let Some(correlation_id) = message.correlation_id.as_deref() else {
            return false;
        };
        let entry = {
            let mut entries = self.entries.lock();
            let matches = entries.get(correlation_id).is_some_and(|pending| {
                pending.agent_id == agent_id && pending.expected_type == message.kind
            });
            if !matches {
                return false;
            }
            entries.remove(correlation_id)
        };
        match entry {
            Some(pending) => {
                // The waiter may have been dropped already; nothing to deliver then.
                let _ = pending.completion.send(Ok(message));
                true
            }
            None => false,
        }
    }

    /// Removes an entry without resolving it. Returns `false` if it was
    /// already resolved or removed.
    pub fn cancel(&self, correlation_id: &str) -> bool {
        self.entries.lock().remove(correlation_id).is_some()
    }

    /// Fails every request sent over one connection of `agent_id`. Requests
    /// already sent over a newer connection are left alone.
    pub fn fail_session(&self, agent_id: &str, session: u64) -> usize {
        let failed: Vec<(String, PendingRequest)> = {
            let mut entries = self.entries.lock();
            let ids: Vec<String> = entries
                .iter()
                .filter(|(_, pending)| pending.agent_id == agent_id && pending.session == session)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| entries.remove(&id).map(|pending| (id, pending)))
                .collect()
        };
        let count = failed.len();
        for (correlation_id, pending) in failed {
            debug!(%agent_id, session, %correlation_id, "failing pending request of disconnected agent");
            let _ = pending
                .completion
                .send(Err(ChannelError::AgentDisconnected(agent_id.to_string())));
        }
        count
    }

    #[cfg(test)]
    pub fn contains(&self, correlation_id: &str) -> bool {
        self.entries.lock().contains_key(correlation_id)
    }

    pub fn outstanding(&self) -> Vec<PendingSummary> {
        let mut out: Vec<PendingSummary> = self
            .entries
            .lock()
            .iter()
            .map(|(id, pending)| PendingSummary {
                correlation_id: id.clone(),
                agent_id: pending.agent_id.clone(),
                expected_type: pending.expected_type.clone(),
                deadline: pending.deadline,
            })
            .collect();
        out.sort_by(|a, b| a.deadline.cmp(&b.deadline));
        out
    }
}
