use crate::systems::transaction::ZoneId;

pub type VolumeResult<T> = Result<T, VolumeError>;

/// Error kinds surfaced by the volume core. Recoverable kinds leave the
/// volume in a consistent state; only invariant violations are fatal and
/// those panic instead of returning.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VolumeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("narrow-band budget exhausted ({requested} bytes requested)")]
    OutOfMemory { requested: usize },

    #[error("client {client} has no authority over zone {zone}")]
    AuthorityDenied { client: u64, zone: ZoneId },

    #[error("version conflict on zone {zone}: expected base {expected}, found {found}")]
    VersionConflict {
        zone: ZoneId,
        expected: u64,
        found: u64,
    },

    #[error("delta out of sync on zone {zone}: base {base}, current {current}")]
    OutOfSync { zone: ZoneId, base: u64, current: u64 },

    #[error("transaction {0} aborted")]
    TransactionAborted(u64),

    #[error("corrupted input: {0}")]
    Corrupted(String),

    #[error("operation cancelled: budget exceeded")]
    Cancelled,
}

impl VolumeError {
    pub fn invalid(msg: impl Into<String>) -> VolumeError {
        VolumeError::InvalidArgument(msg.into())
    }

    pub fn corrupted(msg: impl Into<String>) -> VolumeError {
        VolumeError::Corrupted(msg.into())
    }
}
