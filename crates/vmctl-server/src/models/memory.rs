//! Process-local [`VmStore`], used when no database is configured and in tests.
//!
//! Records live only as long as the process.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::{NewVmRecord, StoreError, VmRecord, VmStore};

#[derive(Default)]
pub struct MemoryVmStore {
    vms: RwLock<HashMap<String, VmRecord>>,
}

impl MemoryVmStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted(mut records: Vec<VmRecord>) -> Vec<VmRecord> {
    records.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.vm_id.cmp(&b.vm_id))
    });
    records
}

#[async_trait]
impl VmStore for MemoryVmStore {
    async fn insert(&self, new: NewVmRecord) -> Result<VmRecord, StoreError> {
        let mut vms = self.vms.write();
        if vms.contains_key(&new.vm_id) {
            return Err(StoreError::Conflict(new.vm_id));
        }
        let record = new.into_record(chrono::Utc::now().naive_utc());
        vms.insert(record.vm_id.clone(), record.clone());
        Ok(record)
    }

    async fn find(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError> {
        Ok(self.vms.read().get(vm_id).cloned())
    }

    async fn record_agent_reply(
        &self,
        vm_id: &str,
        status: &str,
        reply: Value,
    ) -> Result<(), StoreError> {
        let mut vms = self.vms.write();
        let record = vms
            .get_mut(vm_id)
            .ok_or_else(|| StoreError::NotFound(vm_id.to_string()))?;
        record.status = status.to_string();
        record.last_agent_reply = Some(reply);
        record.last_agent_reply_at = Some(chrono::Utc::now().naive_utc());
        Ok(())
    }

    async fn list(&self) -> Result<Vec<VmRecord>, StoreError> {
        Ok(sorted(self.vms.read().values().cloned().collect()))
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<VmRecord>, StoreError> {
        let owned = self
            .vms
            .read()
            .values()
            .filter(|vm| vm.owner == owner)
            .cloned()
            .collect();
        Ok(sorted(owned))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn new_vm(vm_id: &str, owner: &str) -> NewVmRecord {
        NewVmRecord {
            vm_id: vm_id.to_string(),
            name: None,
            owner: owner.to_string(),
            agent_id: Some("agent-a".to_string()),
            ip: None,
            cpu: None,
            memory: None,
            image: None,
            status: "running".to_string(),
        }
    }

    #[tokio::test]
    async fn insert_rejects_duplicate_vm_id() {
        let store = MemoryVmStore::new();
        store.insert(new_vm("vm-1", "u1")).await.unwrap();
        let err = store.insert(new_vm("vm-1", "u2")).await.unwrap_err();
        assert_eq!(err, StoreError::Conflict("vm-1".to_string()));

        let kept = store.find("vm-1").await.unwrap().unwrap();
        assert_eq!(kept.owner, "u1");
    }

    #[tokio::test]
    async fn record_agent_reply_updates_status_and_audit() {
        let store = MemoryVmStore::new();
        store.insert(new_vm("vm-1", "u1")).await.unwrap();
        store
            .record_agent_reply("vm-1", "stopped", json!({"success": true}))
            .await
            .unwrap();

        let vm = store.find("vm-1").await.unwrap().unwrap();
        assert_eq!(vm.status, "stopped");
        assert_eq!(vm.last_agent_reply, Some(json!({"success": true})));
        assert!(vm.last_agent_reply_at.is_some());

        let err = store
            .record_agent_reply("missing", "stopped", json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn list_by_owner_filters() {
        let store = MemoryVmStore::new();
        store.insert(new_vm("vm-1", "u1")).await.unwrap();
        store.insert(new_vm("vm-2", "u2")).await.unwrap();
        store.insert(new_vm("vm-3", "u1")).await.unwrap();

        let mine: Vec<_> = store
            .list_by_owner("u1")
            .await
            .unwrap()
            .into_iter()
            .map(|vm| vm.vm_id)
            .collect();
        assert_eq!(mine.len(), 2);
        assert!(mine.contains(&"vm-1".to_string()));
        assert!(mine.contains(&"vm-3".to_string()));
        assert_eq!(store.list().await.unwrap().len(), 3);
    }
}
