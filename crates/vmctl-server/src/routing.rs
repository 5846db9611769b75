use std::collections::HashMap;

use parking_lot::RwLock;

use crate::models::VmRecord;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingEntry {
    pub agent_id: String,
    pub owner: String,
    pub name: Option<String>,
}

/// In-memory `vm_id -> agent_id` index over the durable VM records.
///
/// Volatile: rebuilt from the store on startup with [`warm`](Self::warm).
#[derive(Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<String, RoutingEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `vm_id` to `entry.agent_id`, replacing any earlier binding.
    pub fn save(&self, vm_id: impl Into<String>, entry: RoutingEntry) {
        self.entries.write().insert(vm_id.into(), entry);
    }

    pub fn get(&self, vm_id: &str) -> Option<String> {
        self.entries
            .read()
            .get(vm_id)
            .map(|entry| entry.agent_id.clone())
    }

    pub fn count_for_agent(&self, agent_id: &str) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.agent_id == agent_id)
            .count()
    }

    /// VMs bound to `agent_id`, ordered by id.
    pub fn vms_for_agent(&self, agent_id: &str) -> Vec<(String, RoutingEntry)> {
        let mut bound: Vec<(String, RoutingEntry)> = self
            .entries
            .read()
            .iter()
            .filter(|(_, entry)| entry.agent_id == agent_id)
            .map(|(vm_id, entry)| (vm_id.clone(), entry.clone()))
            .collect();
        bound.sort_by(|a, b| a.0.cmp(&b.0));
        bound
    }

    /// Loads every bound record. Records without an agent are skipped.
    pub fn warm(&self, records: &[VmRecord]) -> usize {
        let mut entries = self.entries.write();
        let mut loaded = 0;
        for record in records {
            if let Some(agent_id) = &record.agent_id {
                entries.insert(
                    record.vm_id.clone(),
                    RoutingEntry {
                        agent_id: agent_id.clone(),
                        owner: record.owner.clone(),
                        name: record.name.clone(),
                    },
                );
                loaded += 1;
            }
        }
        loaded
    }
}
