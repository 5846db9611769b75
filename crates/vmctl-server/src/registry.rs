use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{info, warn};
use vmctl_protocol::AgentMessage;

use crate::channel::ChannelError;
use crate::pending::PendingTable;

/// Sending half of one live agent connection.
#[derive(Clone, Debug)]
pub struct AgentHandle {
    pub id: String,
    /// Distinguishes successive connections that reuse the same agent id.
    pub session: u64,
    pub connected_at: DateTime<Utc>,
    outbound: mpsc::UnboundedSender<AgentMessage>,
}

impl AgentHandle {
    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn deliver(&self, message: AgentMessage) -> Result<(), ChannelError> {
        self.outbound
            .send(message)
            .map_err(|_| ChannelError::AgentUnavailable(self.id.clone()))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AgentSummary {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    pub bound_vms: usize,
}

struct AgentEntry {
    handle: AgentHandle,
    bound_vms: usize,
}

impl AgentEntry {
    /// Placement order: fewest bound VMs, then earliest connection.
    fn placement_key(&self) -> (usize, DateTime<Utc>, u64) {
        (self.bound_vms, self.handle.connected_at, self.handle.session)
    }
}

/// Currently connected agents and the placement policy over them.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, AgentEntry>>,
    pending: Arc<PendingTable>,
    next_session: AtomicU64,
}

impl AgentRegistry {
    pub fn new(pending: Arc<PendingTable>) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            pending,
            next_session: AtomicU64::new(1),
        }
    }

    /// Registers a freshly connected agent. `bound_vms` seeds its load with
    /// the VMs already bound to it. A previous connection under the same id
    /// is replaced and its outstanding requests fail.
    pub fn register(
        &self,
        id: impl Into<String>,
        outbound: mpsc::UnboundedSender<AgentMessage>,
        bound_vms: usize,
    ) -> AgentHandle {
        let handle = AgentHandle {
            id: id.into(),
            session: self.next_session.fetch_add(1, Ordering::SeqCst),
            connected_at: Utc::now(),
            outbound,
        };
        let replaced = self.agents.write().insert(
            handle.id.clone(),
            AgentEntry {
                handle: handle.clone(),
                bound_vms,
            },
        );
        if let Some(old) = replaced {
            let failed = self
                .pending
                .fail_session(&old.handle.id, old.handle.session);
            warn!(
                agent_id = %handle.id,
                old_session = old.handle.session,
                failed,
                "agent reconnected; replaced previous connection"
            );
        }
        info!(agent_id = %handle.id, session = handle.session, bound_vms, "agent registered");
        handle
    }

    /// Removes the agent if `session` is still its live connection, and
    /// fails every request waiting on that connection. A stale session is a
    /// no-op, so a replaced socket closing late cannot evict its successor.
    pub fn unregister(&self, agent_id: &str, session: u64) -> Option<AgentHandle> {
        let removed = {
            let mut agents = self.agents.write();
            match agents.get(agent_id) {
                Some(entry) if entry.handle.session == session => agents.remove(agent_id),
                _ => None,
            }
        }?;
        let failed = self.pending.fail_session(agent_id, session);
        info!(%agent_id, session, failed, "agent unregistered");
        Some(removed.handle)
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentHandle> {
        self.agents
            .read()
            .get(agent_id)
            .map(|entry| entry.handle.clone())
    }

    /// `get`, restricted to agents whose channel is still open.
    pub fn get_connected(&self, agent_id: &str) -> Option<AgentHandle> {
        self.get(agent_id).filter(AgentHandle::is_open)
    }

    pub fn is_current(&self, agent_id: &str, session: u64) -> bool {
        self.agents
            .read()
            .get(agent_id)
            .is_some_and(|entry| entry.handle.session == session)
    }

    /// Picks the agent a new VM should go to without changing any load.
    pub fn select(&self) -> Option<AgentHandle> {
        self.agents
            .read()
            .values()
            .filter(|entry| entry.handle.is_open())
            .min_by_key(|entry| entry.placement_key())
            .map(|entry| entry.handle.clone())
    }

    /// Selects like [`select`](Self::select) and counts one more VM against
    /// the chosen agent in the same critical section, so concurrent
    /// placements spread out. Undo with [`release_binding`](Self::release_binding)
    /// if the VM is never created.
    pub fn reserve(&self) -> Option<AgentHandle> {
        let mut agents = self.agents.write();
        let entry = agents
            .values_mut()
            .filter(|entry| entry.handle.is_open())
            .min_by_key(|entry| entry.placement_key())?;
        entry.bound_vms += 1;
        Some(entry.handle.clone())
    }

    pub fn release_binding(&self, agent_id: &str) {
        if let Some(entry) = self.agents.write().get_mut(agent_id) {
            entry.bound_vms = entry.bound_vms.saturating_sub(1);
        }
    }

    /// Connected agents in placement order.
    pub fn snapshot(&self) -> Vec<AgentSummary> {
        let agents = self.agents.read();
        let mut entries: Vec<&AgentEntry> = agents.values().collect();
        entries.sort_by_key(|entry| entry.placement_key());
        entries
            .into_iter()
            .map(|entry| AgentSummary {
                id: entry.handle.id.clone(),
                connected_at: entry.handle.connected_at,
                bound_vms: entry.bound_vms,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.agents.read().len()
    }
}
