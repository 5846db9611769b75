use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const CREATE_VM: &str = "create-vm";
pub const START_VM: &str = "start-vm";
pub const STOP_VM: &str = "stop-vm";
pub const INSPECT_VM: &str = "inspect-vm";
pub const EXEC_VM: &str = "exec-vm";

pub const VM_CREATED: &str = "vm-created";
pub const VM_STOPPED: &str = "vm-stopped";
pub const VM_INSPECTED: &str = "vm-inspected";
pub const VM_OUTPUT: &str = "vm-output";

pub const STATUS_RUNNING: &str = "running";
pub const STATUS_STOPPED: &str = "stopped";
pub const STATUS_UNKNOWN: &str = "unknown";

/// One frame on an agent channel, in either direction.
#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
pub struct AgentMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default = "empty_object")]
    pub payload: Value,
    #[serde(
        rename = "correlationId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

impl AgentMessage {
    pub fn new(kind: impl Into<String>, payload: impl Serialize) -> serde_json::Result<Self> {
        Ok(Self {
            kind: kind.into(),
            payload: serde_json::to_value(payload)?,
            correlation_id: None,
        })
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }
}

/// Body of `create-vm`. Sizes arrive from HTTP callers as numbers or
/// strings and are normalized here.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct CreateVmCommand {
    #[serde(
        default,
        deserialize_with = "lenient::count",
        skip_serializing_if = "Option::is_none"
    )]
    pub cpu: Option<u32>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub memory: Option<String>,
    #[serde(
        default,
        deserialize_with = "lenient::text",
        skip_serializing_if = "Option::is_none"
    )]
    pub storage: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Payload of `start-vm`, `stop-vm` and `inspect-vm`.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct VmTarget {
    #[serde(rename = "vmId")]
    pub vm_id: String,
}

impl VmTarget {
    pub fn new(vm_id: impl Into<String>) -> Self {
        Self {
            vm_id: vm_id.into(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct ExecVmCommand {
    #[serde(rename = "vmId")]
    pub vm_id: String,
    pub command: String,
}

/// Agent replies are read field by field: a field with an unexpected shape
/// is dropped instead of failing the whole reply.
mod lenient {
    use serde::{Deserialize, Deserializer};
    use serde_json::Value;

    /// A string, or a number rendered as one.
    pub fn as_text(value: &Value) -> Option<String> {
        match value {
            Value::String(text) => Some(text.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }

    /// A non-negative integer, or a string holding one.
    pub fn as_count(value: &Value) -> Option<u32> {
        match value {
            Value::Number(number) => number.as_u64().and_then(|n| u32::try_from(n).ok()),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_flag(value: &Value) -> bool {
        match value {
            Value::Bool(flag) => *flag,
            Value::String(text) => text.eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(None),
            other => as_text(&other)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("expected a string or a number")),
        }
    }

    pub fn count<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match value {
            Value::Null => Ok(None),
            other => as_count(&other)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom("expected a non-negative integer")),
        }
    }
}

fn text_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(lenient::as_text)
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VmCreatedReply {
    pub vm_id: Option<String>,
    pub id: Option<String>,
    pub name: Option<String>,
    pub ip: Option<String>,
    pub cpu: Option<u32>,
    pub memory: Option<String>,
    pub image: Option<String>,
    pub status: Option<String>,
}

impl VmCreatedReply {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            vm_id: text_field(payload, "vmId"),
            id: text_field(payload, "id"),
            name: text_field(payload, "name"),
            ip: text_field(payload, "ip"),
            cpu: payload.get("cpu").and_then(lenient::as_count),
            memory: text_field(payload, "memory"),
            image: text_field(payload, "image"),
            status: text_field(payload, "status"),
        }
    }

    /// The id the agent assigned: first non-empty of `vmId`, `id`, `name`.
    pub fn canonical_vm_id(&self) -> Option<&str> {
        [&self.vm_id, &self.id, &self.name]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|v| !v.is_empty())
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmStoppedReply {
    pub vm_id: Option<String>,
    pub success: bool,
    pub status: Option<String>,
    pub message: Option<String>,
}

impl VmStoppedReply {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            vm_id: text_field(payload, "vmId"),
            success: payload.get("success").is_some_and(lenient::as_flag),
            status: text_field(payload, "status"),
            message: text_field(payload, "message"),
        }
    }

    pub fn resolved_status(&self) -> &str {
        match self.status.as_deref() {
            Some(status) if !status.is_empty() => status,
            _ if self.success => STATUS_STOPPED,
            _ => STATUS_UNKNOWN,
        }
    }
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct VmInspectedReply {
    pub status: Option<String>,
    pub state: Option<String>,
    pub ip: Option<String>,
    pub message: Option<String>,
}

impl VmInspectedReply {
    pub fn from_payload(payload: &Value) -> Self {
        Self {
            status: text_field(payload, "status"),
            state: text_field(payload, "state"),
            ip: text_field(payload, "ip"),
            message: text_field(payload, "message"),
        }
    }

    pub fn live_status(&self) -> Option<&str> {
        [&self.status, &self.state]
            .into_iter()
            .filter_map(|v| v.as_deref())
            .find(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_uses_wire_field_names() {
        let msg = AgentMessage::new(STOP_VM, VmTarget::new("vm-1"))
            .expect("encode payload")
            .with_correlation_id("c-1");
        let encoded = serde_json::to_value(&msg).expect("encode envelope");
        assert_eq!(
            encoded,
            json!({"type": "stop-vm", "payload": {"vmId": "vm-1"}, "correlationId": "c-1"})
        );
    }

    #[test]
    fn envelope_without_payload_or_correlation_decodes() {
        let msg: AgentMessage =
            serde_json::from_str(r#"{"type":"vm-output","extra":1}"#).expect("decode envelope");
        assert_eq!(msg.kind, VM_OUTPUT);
        assert_eq!(msg.payload, json!({}));
        assert!(msg.correlation_id.is_none());

        let encoded = serde_json::to_string(&msg).expect("encode envelope");
        assert!(!encoded.contains("correlationId"));
    }

    #[test]
    fn create_command_omits_unset_fields() {
        let cmd = CreateVmCommand {
            cpu: Some(2),
            memory: Some("2G".to_string()),
            os: Some("linux".to_string()),
            ..Default::default()
        };
        let encoded = serde_json::to_value(&cmd).expect("encode command");
        assert_eq!(encoded, json!({"cpu": 2, "memory": "2G", "os": "linux"}));
    }

    #[test]
    fn create_command_accepts_numeric_strings() {
        let cmd: CreateVmCommand = serde_json::from_value(
            json!({"cpu": "4", "memory": 8192, "storage": "20G", "os": "ubuntu", "name": "db"}),
        )
        .expect("decode command");
        assert_eq!(cmd.cpu, Some(4));
        assert_eq!(cmd.memory.as_deref(), Some("8192"));
        assert_eq!(cmd.storage.as_deref(), Some("20G"));

        let cmd: CreateVmCommand =
            serde_json::from_value(json!({"cpu": null})).expect("decode command");
        assert_eq!(cmd, CreateVmCommand::default());

        assert!(serde_json::from_value::<CreateVmCommand>(json!({"cpu": "four"})).is_err());
        assert!(serde_json::from_value::<CreateVmCommand>(json!({"memory": [1]})).is_err());
    }

    #[test]
    fn canonical_vm_id_prefers_vm_id_then_id_then_name() {
        let reply = VmCreatedReply::from_payload(&json!({"vmId": "vm-1", "id": "x", "name": "n"}));
        assert_eq!(reply.canonical_vm_id(), Some("vm-1"));

        let reply = VmCreatedReply::from_payload(&json!({"id": "x", "name": "n"}));
        assert_eq!(reply.canonical_vm_id(), Some("x"));

        let reply = VmCreatedReply::from_payload(&json!({"name": "n"}));
        assert_eq!(reply.canonical_vm_id(), Some("n"));

        let reply = VmCreatedReply::from_payload(&json!({"vmId": "", "status": "running"}));
        assert_eq!(reply.canonical_vm_id(), None);

        let reply = VmCreatedReply::from_payload(&json!({"id": 42}));
        assert_eq!(reply.canonical_vm_id(), Some("42"));
    }

    #[test]
    fn created_reply_drops_fields_with_unexpected_shapes() {
        let reply = VmCreatedReply::from_payload(&json!({
            "vmId": "vm-1",
            "memory": 2048,
            "cpu": "2",
            "ip": {"v4": "10.0.0.2"},
            "image": ["ubuntu"],
            "status": "running",
        }));
        assert_eq!(reply.canonical_vm_id(), Some("vm-1"));
        assert_eq!(reply.memory.as_deref(), Some("2048"));
        assert_eq!(reply.cpu, Some(2));
        assert_eq!(reply.ip, None);
        assert_eq!(reply.image, None);
        assert_eq!(reply.status.as_deref(), Some("running"));

        let reply = VmCreatedReply::from_payload(&json!("vm-1"));
        assert_eq!(reply, VmCreatedReply::default());
    }

    #[test]
    fn stopped_status_falls_back_on_success_flag() {
        let explicit = VmStoppedReply::from_payload(
            &json!({"vmId": "vm-1", "success": true, "status": "paused"}),
        );
        assert_eq!(explicit.resolved_status(), "paused");

        let success = VmStoppedReply::from_payload(&json!({"vmId": "vm-1", "success": true}));
        assert_eq!(success.resolved_status(), STATUS_STOPPED);

        let failed = VmStoppedReply::from_payload(&json!({"vmId": "vm-1", "message": "boom"}));
        assert_eq!(failed.resolved_status(), STATUS_UNKNOWN);

        let odd = VmStoppedReply::from_payload(&json!({"success": "true", "message": 7}));
        assert_eq!(odd.resolved_status(), STATUS_STOPPED);
        assert_eq!(odd.message.as_deref(), Some("7"));
    }

    #[test]
    fn inspected_live_status_survives_odd_fields() {
        let reply = VmInspectedReply::from_payload(&json!({"state": "running", "ip": "10.0.0.2"}));
        assert_eq!(reply.live_status(), Some("running"));
        assert_eq!(reply.ip.as_deref(), Some("10.0.0.2"));

        let reply = VmInspectedReply::from_payload(
            &json!({"status": "paused", "ip": ["10.0.0.2"], "message": {"text": "ok"}}),
        );
        assert_eq!(reply.live_status(), Some("paused"));
        assert_eq!(reply.ip, None);
        assert_eq!(reply.message, None);

        let empty = VmInspectedReply::default();
        assert_eq!(empty.live_status(), None);
    }
}
