//! Error taxonomy for the simulator.
//!
//! `InvalidConfig`, `InvalidTime` and `ProtocolNotImplemented` are fatal:
//! they abort the whole batch before or during a run. The rest are
//! non-fatal: the run controller logs them, counts them in
//! [`crate::run::RunDiagnostics`], and continues.

use crate::replica::ReplicaId;
use crate::time::SimTime;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid config field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },

    #[error("attempted to schedule an event at {attempted}, before the current clock {current}")]
    InvalidTime { attempted: SimTime, current: SimTime },

    #[error("packet addressed to unknown replica {dst:?}")]
    UnknownRecipient { dst: ReplicaId },

    #[error("replica {replica:?} aborted during dispatch: {reason}")]
    ProtocolAbort { replica: ReplicaId, reason: String },

    #[error("run exceeded its ceiling ({ceiling}) before every correct replica decided")]
    RunTimeout { ceiling: String },

    #[error("protocol `{0}` has no replica implementation in this build; known protocols are {}", crate::config::KNOWN_PROTOCOLS.join(", "))]
    ProtocolNotImplemented(String),
}

impl Error {
    /// Fatal errors abort the whole batch; non-fatal ones are logged, counted,
    /// and the run continues.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::InvalidConfig { .. } | Error::InvalidTime { .. } | Error::ProtocolNotImplemented(_)
        )
    }
}
