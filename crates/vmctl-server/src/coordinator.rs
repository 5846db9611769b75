//! VM lifecycle operations: authorize, find or place the agent, run the
//! command over the channel, and reconcile the durable record.

use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info, warn};
use vmctl_protocol::{
    AgentMessage, CreateVmCommand, ExecVmCommand, VmCreatedReply, VmInspectedReply,
    VmStoppedReply, VmTarget, CREATE_VM, EXEC_VM, INSPECT_VM, START_VM, STATUS_RUNNING,
    STATUS_UNKNOWN, STOP_VM, VM_CREATED, VM_INSPECTED, VM_OUTPUT, VM_STOPPED,
};

use crate::auth::Caller;
use crate::channel::{ChannelError, CommandChannel, SendOptions};
use crate::config::CommandTimeouts;
use crate::error::ControlError;
use crate::models::{NewVmRecord, VmRecord, VmStore};
use crate::registry::{AgentHandle, AgentRegistry};
use crate::routing::{RoutingEntry, RoutingTable};

pub const LIVE_NO_AGENT: &str = "no_client_assigned";
pub const LIVE_AGENT_OFFLINE: &str = "agent_offline";

#[derive(Debug, Clone, PartialEq)]
pub struct CreatedVm {
    pub agent_id: String,
    pub record: VmRecord,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedVm {
    pub vm_id: String,
    pub agent_id: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoppedVm {
    pub vm_id: String,
    pub status: String,
    /// Raw `vm-stopped` payload.
    pub reply: Value,
}

/// Durable record plus an advisory view of what the agent currently reports.
/// The live part never fails the read; problems land in `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct InspectedVm {
    pub record: VmRecord,
    pub live_status: String,
    pub message: Option<String>,
    pub error: Option<String>,
    pub live: Option<Value>,
}

pub struct VmLifecycleCoordinator {
    registry: Arc<AgentRegistry>,
    channel: CommandChannel,
    routes: Arc<RoutingTable>,
    store: Arc<dyn VmStore>,
    timeouts: CommandTimeouts,
}

impl VmLifecycleCoordinator {
    pub fn new(
        registry: Arc<AgentRegistry>,
        channel: CommandChannel,
        routes: Arc<RoutingTable>,
        store: Arc<dyn VmStore>,
        timeouts: CommandTimeouts,
    ) -> Self {
        Self {
            registry,
            channel,
            routes,
            store,
            timeouts,
        }
    }

    /// Places a new VM on the least loaded agent and records it as owned by
    /// `caller`.
    pub async fn create(
        &self,
        caller: &Caller,
        spec: CreateVmCommand,
    ) -> Result<CreatedVm, ControlError> {
        let agent = self.registry.reserve().ok_or(ControlError::NoAgentAvailable)?;
        match self.create_on(&agent, caller, spec).await {
            Ok(created) => Ok(created),
            Err(err) => {
                self.registry.release_binding(&agent.id);
                Err(err)
            }
        }
    }

    async fn create_on(
        &self,
        agent: &AgentHandle,
        caller: &Caller,
        spec: CreateVmCommand,
    ) -> Result<CreatedVm, ControlError> {
        let command = encode(CREATE_VM, &spec)?;
        let reply = self
            .request(&agent.id, command, VM_CREATED, self.timeouts.create)
            .await?;
        let created = VmCreatedReply::from_payload(&reply.payload);
        let vm_id = created
            .canonical_vm_id()
            .ok_or_else(|| ControlError::AgentProtocol(format!("{VM_CREATED} carried no vm id")))?
            .to_string();

        let status = created
            .status
            .filter(|status| !status.is_empty())
            .unwrap_or_else(|| STATUS_RUNNING.to_string());
        let record = self
            .store
            .insert(NewVmRecord {
                vm_id: vm_id.clone(),
                name: created.name.or(spec.name),
                owner: caller.id.clone(),
                agent_id: Some(agent.id.clone()),
                ip: created.ip,
                cpu: created
                    .cpu
                    .or(spec.cpu)
                    .and_then(|cpu| i32::try_from(cpu).ok()),
                memory: created.memory.or(spec.memory),
                image: created.image.or(spec.os),
                status,
            })
            .await?;

        self.routes.save(
            vm_id.clone(),
            RoutingEntry {
                agent_id: agent.id.clone(),
                owner: record.owner.clone(),
                name: record.name.clone(),
            },
        );
        info!(%vm_id, agent_id = %agent.id, owner = %caller.id, "vm created");

        Ok(CreatedVm {
            agent_id: agent.id.clone(),
            record,
        })
    }

    /// Asks the bound agent to start the VM. Dispatch is the only
    /// confirmation; nothing is persisted.
    pub async fn start(&self, caller: &Caller, vm_id: &str) -> Result<StartedVm, ControlError> {
        let record = self.authorized_record(caller, vm_id).await?;
        let agent_id = self.bound_agent(&record)?;
        self.channel
            .send(
                &agent_id,
                encode(START_VM, VmTarget::new(vm_id))?,
                SendOptions::fire_and_forget(),
            )
            .await?;
        info!(%vm_id, %agent_id, "start dispatched");
        Ok(StartedVm {
            vm_id: vm_id.to_string(),
            agent_id,
        })
    }

    pub async fn stop(&self, caller: &Caller, vm_id: &str) -> Result<StoppedVm, ControlError> {
        let record = self.authorized_record(caller, vm_id).await?;
        let agent_id = self.bound_agent(&record)?;
        let reply = self
            .request(
                &agent_id,
                encode(STOP_VM, VmTarget::new(vm_id))?,
                VM_STOPPED,
                self.timeouts.stop,
            )
            .await?;

        if !reply.payload.is_object() {
            warn!(%vm_id, %agent_id, "{VM_STOPPED} payload is not an object");
        }
        let stopped = VmStoppedReply::from_payload(&reply.payload);
        let status = stopped.resolved_status().to_string();

        // The agent already stopped the VM; a failed write must not hide that.
        if let Err(err) = self
            .store
            .record_agent_reply(vm_id, &status, reply.payload.clone())
            .await
        {
            warn!(%vm_id, %status, "could not persist stop outcome: {err}");
        }
        info!(%vm_id, %agent_id, %status, "vm stopped");

        Ok(StoppedVm {
            vm_id: vm_id.to_string(),
            status,
            reply: reply.payload,
        })
    }

    /// Returns the stored record, overlaid with whatever the bound agent
    /// reports right now. Never writes back.
    pub async fn inspect(&self, caller: &Caller, vm_id: &str) -> Result<InspectedVm, ControlError> {
        let mut record = self.authorized_record(caller, vm_id).await?;
        let mut view = InspectedVm {
            record: record.clone(),
            live_status: LIVE_NO_AGENT.to_string(),
            message: None,
            error: None,
            live: None,
        };

        let Some(agent_id) = record.agent_id.clone() else {
            return Ok(view);
        };
        self.sync_route(&record, &agent_id);
        if self.registry.get_connected(&agent_id).is_none() {
            view.live_status = LIVE_AGENT_OFFLINE.to_string();
            return Ok(view);
        }

        let live = match encode(INSPECT_VM, VmTarget::new(vm_id)) {
            Ok(command) => {
                self.channel
                    .send(
                        &agent_id,
                        command,
                        SendOptions::wait_for(VM_INSPECTED, self.timeouts.inspect),
                    )
                    .await
            }
            Err(err) => {
                view.live_status = STATUS_UNKNOWN.to_string();
                view.error = Some(err.to_string());
                return Ok(view);
            }
        };

        match live {
            Ok(Some(reply)) => {
                let inspected = VmInspectedReply::from_payload(&reply.payload);
                view.live_status = inspected
                    .live_status()
                    .unwrap_or(STATUS_UNKNOWN)
                    .to_string();
                if inspected.ip.is_some() {
                    record.ip = inspected.ip.clone();
                }
                view.record = record;
                view.message = inspected.message;
                view.live = Some(reply.payload);
            }
            Ok(None) => view.live_status = STATUS_UNKNOWN.to_string(),
            Err(ChannelError::AgentUnavailable(_)) => {
                view.live_status = LIVE_AGENT_OFFLINE.to_string();
            }
            Err(err) => {
                debug!(%vm_id, %agent_id, "live inspect failed: {err}");
                view.live_status = STATUS_UNKNOWN.to_string();
                view.error = Some(err.to_string());
            }
        }
        Ok(view)
    }

    /// Runs `command` inside the VM. `agent_id` is the caller's idea of where
    /// the VM lives and must match the stored binding.
    pub async fn exec(
        &self,
        caller: &Caller,
        vm_id: &str,
        agent_id: &str,
        command: &str,
    ) -> Result<Value, ControlError> {
        let record = self.authorized_record(caller, vm_id).await?;
        if record.agent_id.as_deref() != Some(agent_id) {
            return Err(ControlError::RoutingConflict {
                vm_id: vm_id.to_string(),
                bound: record.agent_id,
            });
        }
        self.sync_route(&record, agent_id);

        let exec = ExecVmCommand {
            vm_id: vm_id.to_string(),
            command: command.to_string(),
        };
        let reply = self
            .request(agent_id, encode(EXEC_VM, exec)?, VM_OUTPUT, self.timeouts.exec)
            .await?;
        Ok(reply.payload)
    }

    /// Records visible to `caller`: all of them for admins.
    pub async fn list(&self, caller: &Caller) -> Result<Vec<VmRecord>, ControlError> {
        let records = if caller.is_admin() {
            self.store.list().await?
        } else {
            self.store.list_by_owner(&caller.id).await?
        };
        Ok(records)
    }

    async fn authorized_record(&self, caller: &Caller, vm_id: &str) -> Result<VmRecord, ControlError> {
        let record = self
            .store
            .find(vm_id)
            .await?
            .ok_or_else(|| ControlError::NotFound(vm_id.to_string()))?;
        if !caller.can_access(&record) {
            return Err(ControlError::Forbidden);
        }
        Ok(record)
    }

    /// Agent the record is bound to, looked up through the routing table.
    fn bound_agent(&self, record: &VmRecord) -> Result<String, ControlError> {
        let agent_id = record
            .agent_id
            .as_deref()
            .ok_or_else(|| ControlError::AgentUnavailable("unassigned".to_string()))?;
        self.sync_route(record, agent_id);
        self.routes
            .get(&record.vm_id)
            .ok_or_else(|| ControlError::AgentUnavailable(agent_id.to_string()))
    }

    /// The stored binding wins over the cache.
    fn sync_route(&self, record: &VmRecord, agent_id: &str) {
        if self.routes.get(&record.vm_id).as_deref() == Some(agent_id) {
            return;
        }
        debug!(vm_id = %record.vm_id, %agent_id, "refreshing routing entry from store");
        self.routes.save(
            record.vm_id.clone(),
            RoutingEntry {
                agent_id: agent_id.to_string(),
                owner: record.owner.clone(),
                name: record.name.clone(),
            },
        );
    }

    async fn request(
        &self,
        agent_id: &str,
        command: AgentMessage,
        expected: &'static str,
        timeout: std::time::Duration,
    ) -> Result<AgentMessage, ControlError> {
        self.channel
            .send(agent_id, command, SendOptions::wait_for(expected, timeout))
            .await?
            .ok_or_else(|| ControlError::AgentProtocol(format!("no {expected} reply")))
    }
}

fn encode(kind: &str, payload: impl serde::Serialize) -> Result<AgentMessage, ControlError> {
    AgentMessage::new(kind, payload)
        .map_err(|err| ChannelError::Encode(err.to_string()).into())
}
