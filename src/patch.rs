//! Audio patches: physical connections between sources and sinks.

use std::collections::HashMap;

use crate::{
    client::{StreamType, Uid},
    core::{Result, RoutingError},
    device::{DeviceMask, ModuleId},
    stream::IoHandle,
};

/// Local patch handle, assigned by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatchHandle(pub u32);

/// Transport-level patch handle, assigned by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportPatchHandle(pub u32);

/// Maximum endpoints on either side of a patch.
pub const MAX_PATCH_PORTS: usize = 4;

/// One endpoint of a patch: a device or an open stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchEndpoint {
    /// Physical device endpoint.
    Device {
        /// Device kind.
        device: DeviceMask,
        /// Endpoint address, empty unless address-qualified.
        address: String,
        /// Owning hardware module.
        module: ModuleId,
    },
    /// Open hardware stream endpoint.
    Stream {
        /// Stream handle.
        io: IoHandle,
        /// Stream type carried on the connection.
        stream: StreamType,
    },
}

impl PatchEndpoint {
    /// Device endpoint constructor.
    pub fn device(device: DeviceMask, module: ModuleId) -> Self {
        PatchEndpoint::Device {
            device,
            address: String::new(),
            module,
        }
    }

    /// Stream endpoint constructor.
    pub fn stream(io: IoHandle, stream: StreamType) -> Self {
        PatchEndpoint::Stream { io, stream }
    }

    /// Module owning a device endpoint, if this is one.
    pub fn module(&self) -> Option<ModuleId> {
        match self {
            PatchEndpoint::Device { module, .. } => Some(*module),
            PatchEndpoint::Stream { .. } => None,
        }
    }

    /// Device kind of a device endpoint, if this is one.
    pub fn device_kind(&self) -> Option<DeviceMask> {
        match self {
            PatchEndpoint::Device { device, .. } => Some(*device),
            PatchEndpoint::Stream { .. } => None,
        }
    }
}

/// Connection request: up to two sources, up to [`MAX_PATCH_PORTS`] sinks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PatchSpec {
    /// Source endpoints.
    pub sources: Vec<PatchEndpoint>,
    /// Sink endpoints.
    pub sinks: Vec<PatchEndpoint>,
}

impl PatchSpec {
    /// Builder-style source addition.
    pub fn with_source(mut self, endpoint: PatchEndpoint) -> Self {
        self.sources.push(endpoint);
        self
    }

    /// Builder-style sink addition.
    pub fn with_sink(mut self, endpoint: PatchEndpoint) -> Self {
        self.sinks.push(endpoint);
        self
    }

    /// Validates endpoint counts.
    ///
    /// # Errors
    /// Returns `InvalidArgument` when either side is empty or too large.
    pub fn validate(&self) -> Result<()> {
        if self.sources.is_empty() || self.sources.len() > 2 {
            return Err(RoutingError::invalid(
                "patch.sources",
                format!("expected 1..=2 sources, got {}", self.sources.len()),
            ));
        }
        if self.sinks.is_empty() || self.sinks.len() > MAX_PATCH_PORTS {
            return Err(RoutingError::invalid(
                "patch.sinks",
                format!("expected 1..={MAX_PATCH_PORTS} sinks, got {}", self.sinks.len()),
            ));
        }
        Ok(())
    }
}

/// Installed patch record.
#[derive(Debug, Clone)]
pub struct AudioPatch {
    /// Local handle.
    pub handle: PatchHandle,
    /// Handle of the low-level connection at the transport.
    pub transport_handle: TransportPatchHandle,
    /// Identity that requested the patch.
    pub owner: Uid,
    /// Connection description.
    pub spec: PatchSpec,
}

/// Registry of installed patches, keyed by local handle.
#[derive(Debug, Default)]
pub struct PatchRegistry {
    patches: HashMap<PatchHandle, AudioPatch>,
    next_handle: u32,
}

impl PatchRegistry {
    /// Reserves the next local handle.
    pub fn next_handle(&mut self) -> PatchHandle {
        self.next_handle += 1;
        PatchHandle(self.next_handle)
    }

    /// Records an installed patch, replacing any record with the same handle.
    pub fn insert(&mut self, patch: AudioPatch) {
        self.patches.insert(patch.handle, patch);
    }

    /// Looks up a patch.
    pub fn get(&self, handle: PatchHandle) -> Option<&AudioPatch> {
        self.patches.get(&handle)
    }

    /// Mutable lookup.
    pub fn get_mut(&mut self, handle: PatchHandle) -> Option<&mut AudioPatch> {
        self.patches.get_mut(&handle)
    }

    /// Removes a patch record.
    pub fn remove(&mut self, handle: PatchHandle) -> Option<AudioPatch> {
        self.patches.remove(&handle)
    }

    /// All installed patches.
    pub fn iter(&self) -> impl Iterator<Item = &AudioPatch> {
        self.patches.values()
    }

    /// Number of installed patches.
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    /// Whether no patch is installed.
    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }
}
