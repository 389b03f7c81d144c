use thiserror::Error;

use crate::{client::PortId, device::DeviceMask, patch::PatchHandle, stream::IoHandle};

/// Error types for the routing engine.
///
/// Variants follow the engine's rejection taxonomy: malformed requests,
/// unknown handles, missing routes, redundant transitions and transport
/// failures. Transport failures are only surfaced after any partially
/// constructed local state has been rolled back.
#[derive(Error, Debug)]
pub enum RoutingError {
    /// Request is malformed (bad device mask, out-of-range index, ...).
    #[error("invalid argument for '{what}': {reason}")]
    InvalidArgument {
        /// Parameter that failed validation
        what: &'static str,
        /// Why it was rejected
        reason: String,
    },

    /// Unknown port id.
    #[error("no client registered for port {0:?}")]
    PortNotFound(PortId),

    /// Unknown patch handle, or no patch attached where one is required.
    #[error("no patch for handle {0:?}")]
    PatchNotFound(PatchHandle),

    /// Unknown device descriptor.
    #[error("device {device:?} at address '{address}' is not known")]
    DeviceNotFound {
        /// Requested device kind
        device: DeviceMask,
        /// Requested device address
        address: String,
    },

    /// Unknown stream handle.
    #[error("no open stream for handle {0:?}")]
    StreamNotFound(IoHandle),

    /// No compatible profile or open stream can reach the requested device
    /// with the requested parameters. Callers may retry with relaxed flags.
    #[error("no route to {device:?}: {reason}")]
    NoRoute {
        /// Device that could not be reached
        device: DeviceMask,
        /// Why no path exists
        reason: String,
    },

    /// The requested transition is redundant (device already connected,
    /// client already started, ...). Non-fatal; no state was changed.
    #[error("already in requested state: {0}")]
    AlreadyInState(String),

    /// A capture request lost concurrency arbitration.
    #[error("capture concurrency conflict: {0:?}")]
    CaptureConflict(crate::manager::ConcurrencyKind),

    /// The underlying transport call failed. Local state has been rolled
    /// back to what it was before the operation.
    #[error("transport failure during {op}: {reason}")]
    Transport {
        /// Operation that was being attempted
        op: &'static str,
        /// Transport-reported reason
        reason: String,
    },

    /// Fatal initialization failure. The engine cannot run without a
    /// primary output.
    #[error("initialization failed: {0}")]
    Init(String),
}

/// A specialized `Result` type for routing operations.
pub type Result<T> = std::result::Result<T, RoutingError>;

impl From<crate::transport::TransportError> for RoutingError {
    fn from(err: crate::transport::TransportError) -> Self {
        RoutingError::Transport {
            op: err.op,
            reason: err.reason,
        }
    }
}

impl From<crate::config::ConfigError> for RoutingError {
    fn from(err: crate::config::ConfigError) -> Self {
        RoutingError::Init(err.to_string())
    }
}

impl RoutingError {
    /// Creates an `InvalidArgument` error.
    pub fn invalid(what: &'static str, reason: impl std::fmt::Display) -> Self {
        RoutingError::InvalidArgument {
            what,
            reason: reason.to_string(),
        }
    }

    /// Creates a `NoRoute` error.
    pub fn no_route(device: DeviceMask, reason: impl std::fmt::Display) -> Self {
        RoutingError::NoRoute {
            device,
            reason: reason.to_string(),
        }
    }
}
