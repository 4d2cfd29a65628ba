//! Persistence seams the engine talks to.
//!
//! The job store is the only shared resource that needs real mutual
//! exclusion, and it gets it through [`JobStore::update_if_status_in`]: a
//! conditional write that only lands if the job still sits in one of the
//! expected statuses. Zero rows affected means another writer got there first.

mod file;
mod memory;

pub use file::{FileJobStore, JsonlEventLog, write_atomic};
pub use memory::{MemoryEventLog, MemoryJobStore};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::state_machine::{Job, JobEvent, JobFields, JobStatus, Machine};

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Job>, StoreError>;

    async fn list(&self) -> Result<Vec<Job>, StoreError>;

    /// Jobs whose canonical base name equals `base`.
    async fn find_by_base(&self, base: &str) -> Result<Vec<Job>, StoreError>;

    async fn list_by_status(&self, status: JobStatus) -> Result<Vec<Job>, StoreError> {
        let jobs = self.list().await?;
        Ok(jobs.into_iter().filter(|j| j.status == status).collect())
    }

    /// Insert a new job. Returns `false` when the key already exists.
    async fn insert_if_absent(&self, job: Job) -> Result<bool, StoreError>;

    /// Move `key` to `to` and apply `fields`, but only if its current status
    /// is in `from`. Returns the number of rows affected (0 or 1).
    async fn update_if_status_in(
        &self,
        key: &str,
        from: &[JobStatus],
        to: JobStatus,
        fields: &JobFields,
    ) -> Result<u64, StoreError>;

    /// Overwrite the pallet regardless of status. Returns rows affected.
    async fn set_pallet(&self, key: &str, pallet: &str) -> Result<u64, StoreError>;
}

/// Append-only event sink. Events are never mutated or deleted.
#[async_trait]
pub trait EventLog: Send + Sync {
    async fn append(&self, event: JobEvent) -> Result<(), StoreError>;

    async fn for_job(&self, key: &str) -> Result<Vec<JobEvent>, StoreError>;
}

/// Read-only view of the configured machines.
#[async_trait]
pub trait MachineRegistry: Send + Sync {
    async fn list(&self) -> Result<Vec<Machine>, StoreError>;

    async fn get(&self, id: u32) -> Result<Option<Machine>, StoreError> {
        Ok(self.list().await?.into_iter().find(|m| m.id == id))
    }

    /// Resolve a drop-file token (machine name or numeric id).
    async fn by_token(&self, token: &str) -> Result<Option<Machine>, StoreError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .find(|m| m.matches_token(token)))
    }
}

/// Machines loaded once from configuration.
#[derive(Debug, Clone, Default)]
pub struct StaticMachines {
    machines: Vec<Machine>,
}

impl StaticMachines {
    pub fn new(machines: Vec<Machine>) -> Self {
        Self { machines }
    }
}

#[async_trait]
impl MachineRegistry for StaticMachines {
    async fn list(&self) -> Result<Vec<Machine>, StoreError> {
        Ok(self.machines.clone())
    }
}
