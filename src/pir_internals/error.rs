use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum MutualPIRError {
    // Binary Fuse Filter
    #[error("Can not build binary fuse filter over an empty record set")]
    EmptyRecordSet,
    #[error("Record '{index}' has {field} of length {actual} bytes, expected {expected} bytes")]
    InconsistentRecordLength { index: usize, field: &'static str, expected: usize, actual: usize },
    #[error("Record set holds duplicate key at record '{0}'")]
    DuplicateKey(usize),
    #[error("Exhausted '{0}' attempts to build 3-wise XOR binary fuse filter")]
    ExhaustedFilterConstructionAttempts(usize),
    #[error("Binary fuse filter parameters are inconsistent")]
    InvalidFilterParams,

    // Row Store
    #[error("Row store must have non-zero number of rows and row length")]
    InvalidRowStoreDimension,
    #[error("Row store must hold 'num_rows * row_len' = {expected} bytes, found {actual} bytes")]
    InvalidRowStoreByteLength { expected: usize, actual: usize },
    #[error("Row index '{index}' is out of bounds for table of {num_rows} rows")]
    RowIndexOutOfBounds { index: usize, num_rows: usize },

    // Row Authentication
    #[error("Row of {actual} bytes is too short to carry a {proof_len} bytes proof")]
    MalformedProof { proof_len: usize, actual: usize },
    #[error("Row proof rejected: {0}")]
    ProofRejected(String),

    // PIR
    #[error("Malformed DPF key: {0}")]
    InvalidDpfKey(String),
    #[error("Query index '{index}' is outside of table with {num_rows} rows")]
    IndexOutOfDomain { index: usize, num_rows: usize },
    #[error("Failed to reconstruct row from answer halves: {0}")]
    ReconstructionFailed(String),

    // Notification Matrix
    #[error("Secret sharing needs at least 2 shares, requested {0}")]
    InvalidShareCount(usize),
    #[error("Share must be {expected} bytes long, found {actual} bytes")]
    InvalidShareLength { expected: usize, actual: usize },
    #[error("Identity '{index}' is outside of notification matrix of size {size}")]
    IdentityOutOfRange { index: usize, size: usize },

    // Contact Database
    #[error("Key is not present in table")]
    KeyNotFound,

    // Session and transport
    #[error("Server session is not initialized, call setup first")]
    SessionNotInitialized,
    #[error("Server session is being reset, retry after setup completes")]
    SessionResetting,
    #[error("Invalid experiment configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),
    #[error("Servers disagree on {0}")]
    ServerMismatch(&'static str),
    #[error("Transport failure (retryable: {retryable}): {reason}")]
    Transport { retryable: bool, reason: String },

    // Serialization
    #[error("Serialization failure in {context}: {reason}")]
    Serialization { context: String, reason: String },
}

impl MutualPIRError {
    /// Whether the failed call may be issued again. Only transient transport failures qualify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport { retryable: true, .. })
    }

    pub(crate) fn serialization(context: impl ToString, reason: impl ToString) -> Self {
        Self::Serialization {
            context: context.to_string(),
            reason: reason.to_string(),
        }
    }
}
