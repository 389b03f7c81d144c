//! Live representations of open hardware streams and their clients.

/// Output stream descriptors and registry.
pub mod output;

/// Input stream descriptors and registry.
pub mod input;

pub use input::*;
pub use output::*;

/// Handle of one open hardware stream, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IoHandle(pub u32);
