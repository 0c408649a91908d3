use barsync_core::{SyncError, ValidationError, WarehouseError};
use thiserror::Error;

/// Failures surfaced by `barsync`, each with a stable process exit code.
#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("sync engine: {0}")]
    Sync(#[from] SyncError),

    #[error("warehouse: {0}")]
    Warehouse(#[from] WarehouseError),

    #[error("--strict: {count} warning(s), first: {first}")]
    StrictModeViolation { count: usize, first: String },

    #[error(transparent)]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Validation(_) => 2,
            Self::Warehouse(_) => 4,
            Self::StrictModeViolation { .. } => 5,
            Self::Sync(_) | Self::Serialization(_) | Self::Io(_) => 10,
        }
    }
}
