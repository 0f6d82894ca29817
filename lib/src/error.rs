/// Crate-wide error type.
///
/// Every variant maps to one of the categories in the error handling design:
/// I/O failures on persistent stores are fatal, wire-level and peer-attributable
/// errors are not. Callers that need to tell "fatal" from "drop this peer" apart
/// match on the variant rather than inspecting the message.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("store I/O failed: {0}")]
    Store(#[from] std::io::Error),

    #[error("corrupt record in store (checksum mismatch)")]
    CorruptRecord,

    #[error("directory already locked by another instance")]
    AlreadyLocked,

    #[error("operation aborted")]
    Aborted,

    #[error("wire protocol violation: {0}")]
    Protocol(String),

    #[error(transparent)]
    Bitcoin(#[from] bitcoin::consensus::encode::Error),

    #[error(transparent)]
    Rejected(#[from] Reason),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Outcome of `check_block`/`accept_block`.
///
/// `Genesis` is a distinguished non-error: it tells the caller the block is the
/// configured genesis and should simply be skipped, not retried or logged as a
/// failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    #[error("Genesis")]
    Genesis,

    #[error("already known")]
    AlreadyKnown,

    #[error("unknown parent {0}")]
    UnknownParent(bitcoin::BlockHash),

    #[error("proof of work does not meet target")]
    BadProofOfWork,

    #[error("merkle root mismatch")]
    BadMerkleRoot,

    #[error("timestamp too far in the future")]
    TimestampTooNew,

    #[error("duplicate input within transaction")]
    DuplicateInput,

    #[error("output value out of range")]
    BadOutputValue,

    #[error("script exceeds maximum size")]
    ScriptTooBig,

    #[error("missing previous output {0:?}")]
    MissingPrevout(bitcoin::OutPoint),

    #[error("script/signature verification failed")]
    BadSignature,

    #[error("coinbase claims more than subsidy plus fees")]
    BadCoinbaseValue,

    #[error("operation aborted")]
    Aborted,
}

impl Reason {
    /// True for reasons that should cause the delivering peer to be marked broken.
    pub fn is_peer_fault(&self) -> bool {
        !matches!(
            self,
            Reason::Genesis | Reason::AlreadyKnown | Reason::UnknownParent(_) | Reason::Aborted
        )
    }
}
