use crate::models::schema::vms;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Durable ownership and last-known state of one VM.
#[derive(Queryable, Serialize, Deserialize, Debug, Clone, PartialEq)]
#[diesel(check_for_backend(diesel::pg::Pg))]
#[diesel(table_name = vms)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    pub vm_id: String,
    pub name: Option<String>,
    pub owner: String,
    /// Agent the VM was created on. Never rebound after creation.
    pub agent_id: Option<String>,
    pub ip: Option<String>,
    pub cpu: Option<i32>,
    pub memory: Option<String>,
    pub image: Option<String>,
    pub status: String,

    pub created_at: chrono::NaiveDateTime,
    pub last_agent_reply: Option<Value>,
    pub last_agent_reply_at: Option<chrono::NaiveDateTime>,
}

#[derive(Insertable, Debug, Clone, PartialEq)]
#[diesel(table_name = vms)]
pub struct NewVmRecord {
    pub vm_id: String,
    pub name: Option<String>,
    pub owner: String,
    pub agent_id: Option<String>,
    pub ip: Option<String>,
    pub cpu: Option<i32>,
    pub memory: Option<String>,
    pub image: Option<String>,
    pub status: String,
}

impl NewVmRecord {
    pub fn into_record(self, created_at: chrono::NaiveDateTime) -> VmRecord {
        VmRecord {
            vm_id: self.vm_id,
            name: self.name,
            owner: self.owner,
            agent_id: self.agent_id,
            ip: self.ip,
            cpu: self.cpu,
            memory: self.memory,
            image: self.image,
            status: self.status,
            created_at,
            last_agent_reply: None,
            last_agent_reply_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn record_serializes_camel_case() {
        let record = NewVmRecord {
            vm_id: "vm-1".to_string(),
            name: Some("web".to_string()),
            owner: "user-1".to_string(),
            agent_id: Some("agent-a".to_string()),
            ip: None,
            cpu: Some(2),
            memory: Some("2G".to_string()),
            image: None,
            status: "running".to_string(),
        }
        .into_record(chrono::Utc::now().naive_utc());

        let encoded = serde_json::to_value(&record).expect("encode record");
        assert_eq!(encoded["vmId"], json!("vm-1"));
        assert_eq!(encoded["agentId"], json!("agent-a"));
        assert_eq!(encoded["status"], json!("running"));
        assert!(encoded["lastAgentReply"].is_null());
        assert!(encoded["createdAt"].is_string());
    }
}
