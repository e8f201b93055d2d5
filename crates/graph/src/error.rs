use thiserror::Error;

/// Engine errors.
///
/// Structural and scheduling errors abort the single offending mutation and
/// leave the rest of the pending diff intact. Safety errors (stale views,
/// unfenced access) are programming errors: they are reported
/// deterministically at the illegal access and must not be retried.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid or destroyed handle")]
    InvalidHandle,
    #[error("no such port")]
    InvalidPort,
    #[error("port array index out of range")]
    PortIndexOutOfRange,
    #[error("this connection already exists")]
    DuplicateConnection,
    #[error("input port is already fed by another source")]
    PortOccupied,
    #[error("port array still has a connection at or above the requested length")]
    PortArrayInUse,
    #[error("connection would close a cycle of normal edges")]
    CycleDetected,
    #[error("port kinds are incompatible")]
    KindMismatch,
    #[error("port already forwards to another destination")]
    AlreadyForwarded,
    #[error("port cannot forward to a port on its own node")]
    ForwardToSelf,
    #[error("forwarding chain does not reach a concrete port")]
    ForwardingDepthExceeded,
    #[error("value has not been produced by a completed tick yet")]
    NotYetValid,
    #[error("handle was disposed by a later commit")]
    Disposed,
    #[error("view refers to a superseded execution window")]
    StaleView,
    #[error("operation would race the open execution window")]
    UnfencedAccess,
}

pub type Result<T> = std::result::Result<T, Error>;
