use async_trait::async_trait;
use diesel_migrations::{embed_migrations, EmbeddedMigrations};
use serde_json::Value;
use thiserror::Error;

pub mod memory;
pub mod pg;
mod schema;
pub mod vm_record;

pub use memory::MemoryVmStore;
pub use pg::PgVmStore;
pub use vm_record::{NewVmRecord, VmRecord};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("vm already exists: {0}")]
    Conflict(String),

    #[error("vm not found: {0}")]
    NotFound(String),
}

impl From<diesel::result::Error> for StoreError {
    fn from(err: diesel::result::Error) -> Self {
        Self::Database(err.to_string())
    }
}

/// Durable source of truth for VM ownership and status.
#[async_trait]
pub trait VmStore: Send + Sync {
    /// Fails with [`StoreError::Conflict`] if `vm_id` is already recorded.
    async fn insert(&self, new: NewVmRecord) -> Result<VmRecord, StoreError>;

    async fn find(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError>;

    /// Writes an authoritative agent outcome: the new status plus the raw reply.
    async fn record_agent_reply(
        &self,
        vm_id: &str,
        status: &str,
        reply: Value,
    ) -> Result<(), StoreError>;

    async fn list(&self) -> Result<Vec<VmRecord>, StoreError>;

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<VmRecord>, StoreError>;
}
