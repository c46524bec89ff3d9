pub mod chatdb;
pub mod db;
pub mod jobdb;
pub mod memory;

use thiserror::Error;

use crate::models::{
    escrowmodel::{EscrowMovement, EscrowTransaction},
    jobmodel::{Invitation, Job},
};

pub use chatdb::ChatExt;
pub use db::DBClient;
pub use jobdb::{EscrowExt, JobExt, ReviewExt};
pub use memory::MemoryDb;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("record was modified concurrently")]
    VersionConflict,

    #[error("record already exists")]
    Duplicate,

    #[error("record not found")]
    NotFound,

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Everything one lifecycle transition writes. Applied atomically: the job row
/// is compared against `expected_version` and nothing is written on mismatch.
#[derive(Debug, Clone)]
pub struct JobChange {
    pub expected_version: i64,
    pub job: Job,
    pub escrow: Option<EscrowTransaction>,
    pub movements: Vec<EscrowMovement>,
    pub invitation: Option<Invitation>,
}

/// Full persistence surface used by the services.
pub trait Store: JobExt + EscrowExt + ReviewExt + ChatExt + std::fmt::Debug + Send + Sync {}

impl<T> Store for T where T: JobExt + EscrowExt + ReviewExt + ChatExt + std::fmt::Debug + Send + Sync {}
