use anyhow::Context;
use async_trait::async_trait;
use diesel::prelude::*;
use diesel::r2d2::{ConnectionManager, Pool};
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel_migrations::MigrationHarness;
use serde_json::Value;
use tracing::info;

use super::schema::vms;
use super::{NewVmRecord, StoreError, VmRecord, VmStore, MIGRATIONS};

/// PostgreSQL-backed [`VmStore`]. Diesel is synchronous, so every query runs
/// on the blocking pool.
#[derive(Clone)]
pub struct PgVmStore {
    pool: Pool<ConnectionManager<PgConnection>>,
}

impl PgVmStore {
    pub fn connect(database_url: &str, max_size: u32) -> anyhow::Result<Self> {
        let manager = ConnectionManager::<PgConnection>::new(database_url);
        let pool = Pool::builder()
            .max_size(max_size)
            .test_on_check_out(true)
            .build(manager)
            .context("build database connection pool")?;

        let mut connection = pool.get().context("check out migration connection")?;
        connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| anyhow::anyhow!("migrations could not run: {e}"))?;
        info!("Database migrations applied");

        Ok(Self { pool })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T, StoreError> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| StoreError::Database(e.to_string()))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Database(format!("database task failed: {e}")))?
    }
}

#[async_trait]
impl VmStore for PgVmStore {
    async fn insert(&self, new: NewVmRecord) -> Result<VmRecord, StoreError> {
        self.with_conn(move |conn| {
            diesel::insert_into(vms::table)
                .values(&new)
                .get_result::<VmRecord>(conn)
                .map_err(|err| match err {
                    DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _) => {
                        StoreError::Conflict(new.vm_id.clone())
                    }
                    other => other.into(),
                })
        })
        .await
    }

    async fn find(&self, vm_id: &str) -> Result<Option<VmRecord>, StoreError> {
        let vm_id = vm_id.to_string();
        self.with_conn(move |conn| {
            let found = vms::table
                .find(&vm_id)
                .first::<VmRecord>(conn)
                .optional()?;
            Ok(found)
        })
        .await
    }

    async fn record_agent_reply(
        &self,
        vm_id: &str,
        status: &str,
        reply: Value,
    ) -> Result<(), StoreError> {
        let vm_id = vm_id.to_string();
        let status = status.to_string();
        self.with_conn(move |conn| {
            let updated = diesel::update(vms::table.find(&vm_id))
                .set((
                    vms::status.eq(&status),
                    vms::last_agent_reply.eq(Some(reply)),
                    vms::last_agent_reply_at.eq(Some(chrono::Utc::now().naive_utc())),
                ))
                .execute(conn)?;
            if updated == 0 {
                return Err(StoreError::NotFound(vm_id));
            }
            Ok(())
        })
        .await
    }

    async fn list(&self) -> Result<Vec<VmRecord>, StoreError> {
        self.with_conn(|conn| {
            let items = vms::table
                .order((vms::created_at.asc(), vms::vm_id.asc()))
                .load::<VmRecord>(conn)?;
            Ok(items)
        })
        .await
    }

    async fn list_by_owner(&self, owner: &str) -> Result<Vec<VmRecord>, StoreError> {
        let owner = owner.to_string();
        self.with_conn(move |conn| {
            let items = vms::table
                .filter(vms::owner.eq(&owner))
                .order((vms::created_at.asc(), vms::vm_id.asc()))
                .load::<VmRecord>(conn)?;
            Ok(items)
        })
        .await
    }
}
