//! Command interface to the audio flinger side of the system.
//!
//! The manager never sleeps; every command that must be deferred carries a
//! `delay_ms` the transport is expected to honor before touching hardware.

use thiserror::Error;

use crate::{
    client::{CaptureSource, StreamType},
    device::{DeviceMask, ModuleId},
    patch::{PatchSpec, TransportPatchHandle},
    profile::{InputFlags, OutputFlags, StreamFormat},
    stream::IoHandle,
};

/// Failure reported by the transport for a refused command.
#[derive(Debug, Clone, Error)]
#[error("transport {op} failed: {reason}")]
pub struct TransportError {
    /// Command that failed.
    pub op: &'static str,
    /// Transport-side reason.
    pub reason: String,
}

impl TransportError {
    /// Shorthand constructor.
    pub fn new(op: &'static str, reason: impl Into<String>) -> Self {
        Self {
            op,
            reason: reason.into(),
        }
    }
}

/// Request to open a hardware output stream.
#[derive(Debug, Clone)]
pub struct OutputOpenRequest {
    /// Owning hardware module.
    pub module: ModuleId,
    /// Profile name within the module.
    pub profile: String,
    /// Initial device routing.
    pub device: DeviceMask,
    /// Device address, empty unless address-qualified.
    pub address: String,
    /// Requested format.
    pub format: StreamFormat,
    /// Requested flags.
    pub flags: OutputFlags,
}

/// Request to open a hardware input stream.
#[derive(Debug, Clone)]
pub struct InputOpenRequest {
    /// Owning hardware module.
    pub module: ModuleId,
    /// Profile name within the module.
    pub profile: String,
    /// Initial device routing.
    pub device: DeviceMask,
    /// Device address, empty unless address-qualified.
    pub address: String,
    /// Requested format.
    pub format: StreamFormat,
    /// Requested flags.
    pub flags: InputFlags,
    /// Capture source driving the open.
    pub source: CaptureSource,
}

/// Result of a successful stream open.
#[derive(Debug, Clone, Copy)]
pub struct OpenedStream {
    /// Assigned stream handle.
    pub io: IoHandle,
    /// Reported latency; zero for inputs.
    pub latency_ms: u32,
    /// Format actually configured, may differ from the request.
    pub format: StreamFormat,
}

/// Commands the routing manager issues to the audio system.
pub trait Transport {
    /// Opens a hardware output stream.
    ///
    /// # Errors
    /// Returns [`TransportError`] when the stream cannot be opened.
    fn open_output(&mut self, request: &OutputOpenRequest) -> Result<OpenedStream, TransportError>;

    /// Opens a logical output duplicating to two open hardware outputs.
    ///
    /// # Errors
    /// Returns [`TransportError`] when duplication is not possible.
    fn open_duplicate_output(
        &mut self,
        left: IoHandle,
        right: IoHandle,
    ) -> Result<OpenedStream, TransportError>;

    /// Closes an output stream.
    fn close_output(&mut self, io: IoHandle);

    /// Opens a hardware input stream.
    ///
    /// # Errors
    /// Returns [`TransportError`] when the stream cannot be opened.
    fn open_input(&mut self, request: &InputOpenRequest) -> Result<OpenedStream, TransportError>;

    /// Closes an input stream.
    fn close_input(&mut self, io: IoHandle);

    /// Installs a connection, or updates `existing` in place when given.
    /// The transport applies the change after `delay_ms`.
    ///
    /// # Errors
    /// Returns [`TransportError`] when the connection is rejected.
    fn create_patch(
        &mut self,
        spec: &PatchSpec,
        existing: Option<TransportPatchHandle>,
        delay_ms: u32,
    ) -> Result<TransportPatchHandle, TransportError>;

    /// Tears down a connection.
    ///
    /// # Errors
    /// Returns [`TransportError`] when the handle is unknown to the transport.
    fn release_patch(&mut self, handle: TransportPatchHandle) -> Result<(), TransportError>;

    /// Sends key/value parameters to a stream after `delay_ms`.
    fn set_parameters(&mut self, io: IoHandle, parameters: &str, delay_ms: u32);

    /// Applies a stream volume on an output after `delay_ms`.
    fn set_stream_volume(&mut self, io: IoHandle, stream: StreamType, volume_db: f32, delay_ms: u32);

    /// Applies the telephony voice volume after `delay_ms`.
    fn set_voice_volume(&mut self, volume: f32, delay_ms: u32);

    /// Tells mixers that clients of `stream` must re-request their output.
    fn invalidate_stream(&mut self, stream: StreamType);

    /// Notifies listeners that the set of ports changed.
    fn on_ports_changed(&mut self);

    /// Notifies listeners that the set of patches changed.
    fn on_patches_changed(&mut self);
}

/// One recorded transport command, for inspection in tests.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportCommand {
    /// An output stream was opened.
    OpenOutput {
        /// Assigned handle.
        io: IoHandle,
        /// Profile name.
        profile: String,
        /// Initial device.
        device: DeviceMask,
    },
    /// A duplicating output was opened.
    OpenDuplicateOutput {
        /// Assigned handle.
        io: IoHandle,
        /// First sub-output.
        left: IoHandle,
        /// Second sub-output.
        right: IoHandle,
    },
    /// An output stream was closed.
    CloseOutput(IoHandle),
    /// An input stream was opened.
    OpenInput {
        /// Assigned handle.
        io: IoHandle,
        /// Profile name.
        profile: String,
        /// Initial device.
        device: DeviceMask,
    },
    /// An input stream was closed.
    CloseInput(IoHandle),
    /// A connection was installed or updated.
    CreatePatch {
        /// Assigned transport handle.
        handle: TransportPatchHandle,
        /// Updated handle, when replacing in place.
        existing: Option<TransportPatchHandle>,
        /// Connection description.
        spec: PatchSpec,
        /// Deferral requested by the manager.
        delay_ms: u32,
    },
    /// A connection was torn down.
    ReleasePatch(TransportPatchHandle),
    /// Parameters were sent to a stream.
    SetParameters {
        /// Target stream.
        io: IoHandle,
        /// Key/value payload.
        parameters: String,
        /// Deferral requested by the manager.
        delay_ms: u32,
    },
    /// A stream volume was applied.
    SetStreamVolume {
        /// Target output.
        io: IoHandle,
        /// Stream type.
        stream: StreamType,
        /// Volume in dB attenuation.
        volume_db: f32,
        /// Deferral requested by the manager.
        delay_ms: u32,
    },
    /// The voice volume was applied.
    SetVoiceVolume {
        /// Linear volume in 0..=1.
        volume: f32,
        /// Deferral requested by the manager.
        delay_ms: u32,
    },
    /// Clients of a stream type were invalidated.
    InvalidateStream(StreamType),
    /// Port list change notification.
    PortsChanged,
    /// Patch list change notification.
    PatchesChanged,
}

/// Recording transport double for tests. Every open succeeds with a fixed
/// latency and handles are assigned monotonically.
#[derive(Debug, Default)]
pub struct FakeTransport {
    /// Every command issued, in order.
    pub commands: Vec<TransportCommand>,
    /// Latency reported for opened outputs.
    pub output_latency_ms: u32,
    next_io: u32,
    next_patch: u32,
}

impl FakeTransport {
    /// A fake reporting 20 ms output latency.
    pub fn new() -> Self {
        Self {
            output_latency_ms: 20,
            ..Self::default()
        }
    }

    /// Drops recorded commands, keeping handle counters.
    pub fn clear(&mut self) {
        self.commands.clear();
    }

    /// Commands matching a predicate.
    pub fn filter<'a>(
        &'a self,
        pred: impl Fn(&TransportCommand) -> bool + 'a,
    ) -> impl Iterator<Item = &'a TransportCommand> {
        self.commands.iter().filter(move |c| pred(c))
    }

    fn next_io(&mut self) -> IoHandle {
        self.next_io += 1;
        IoHandle(self.next_io)
    }
}

impl Transport for FakeTransport {
    fn open_output(&mut self, request: &OutputOpenRequest) -> Result<OpenedStream, TransportError> {
        let io = self.next_io();
        self.commands.push(TransportCommand::OpenOutput {
            io,
            profile: request.profile.clone(),
            device: request.device,
        });
        Ok(OpenedStream {
            io,
            latency_ms: self.output_latency_ms,
            format: request.format,
        })
    }

    fn open_duplicate_output(
        &mut self,
        left: IoHandle,
        right: IoHandle,
    ) -> Result<OpenedStream, TransportError> {
        let io = self.next_io();
        self.commands
            .push(TransportCommand::OpenDuplicateOutput { io, left, right });
        Ok(OpenedStream {
            io,
            latency_ms: self.output_latency_ms,
            format: StreamFormat::mixer_default(),
        })
    }

    fn close_output(&mut self, io: IoHandle) {
        self.commands.push(TransportCommand::CloseOutput(io));
    }

    fn open_input(&mut self, request: &InputOpenRequest) -> Result<OpenedStream, TransportError> {
        let io = self.next_io();
        self.commands.push(TransportCommand::OpenInput {
            io,
            profile: request.profile.clone(),
            device: request.device,
        });
        Ok(OpenedStream {
            io,
            latency_ms: 0,
            format: request.format,
        })
    }

    fn close_input(&mut self, io: IoHandle) {
        self.commands.push(TransportCommand::CloseInput(io));
    }

    fn create_patch(
        &mut self,
        spec: &PatchSpec,
        existing: Option<TransportPatchHandle>,
        delay_ms: u32,
    ) -> Result<TransportPatchHandle, TransportError> {
        let handle = match existing {
            Some(h) => h,
            None => {
                self.next_patch += 1;
                TransportPatchHandle(self.next_patch)
            }
        };
        self.commands.push(TransportCommand::CreatePatch {
            handle,
            existing,
            spec: spec.clone(),
            delay_ms,
        });
        Ok(handle)
    }

    fn release_patch(&mut self, handle: TransportPatchHandle) -> Result<(), TransportError> {
        self.commands.push(TransportCommand::ReleasePatch(handle));
        Ok(())
    }

    fn set_parameters(&mut self, io: IoHandle, parameters: &str, delay_ms: u32) {
        self.commands.push(TransportCommand::SetParameters {
            io,
            parameters: parameters.to_owned(),
            delay_ms,
        });
    }

    fn set_stream_volume(&mut self, io: IoHandle, stream: StreamType, volume_db: f32, delay_ms: u32) {
        self.commands.push(TransportCommand::SetStreamVolume {
            io,
            stream,
            volume_db,
            delay_ms,
        });
    }

    fn set_voice_volume(&mut self, volume: f32, delay_ms: u32) {
        self.commands
            .push(TransportCommand::SetVoiceVolume { volume, delay_ms });
    }

    fn invalidate_stream(&mut self, stream: StreamType) {
        self.commands.push(TransportCommand::InvalidateStream(stream));
    }

    fn on_ports_changed(&mut self) {
        self.commands.push(TransportCommand::PortsChanged);
    }

    fn on_patches_changed(&mut self) {
        self.commands.push(TransportCommand::PatchesChanged);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fake_assigns_distinct_handles() {
        let mut fake = FakeTransport::new();
        let req = OutputOpenRequest {
            module: ModuleId(0),
            profile: "primary".into(),
            device: DeviceMask::SPEAKER,
            address: String::new(),
            format: StreamFormat::mixer_default(),
            flags: OutputFlags::PRIMARY,
        };
        let a = fake.open_output(&req);
        let b = fake.open_output(&req);
        match (a, b) {
            (Ok(a), Ok(b)) => assert_ne!(a.io, b.io),
            other => panic!("open failed: {other:?}"),
        }
    }

    #[test]
    fn patch_update_keeps_handle() {
        let mut fake = FakeTransport::new();
        let spec = PatchSpec::default();
        let first = fake.create_patch(&spec, None, 0);
        let Ok(first) = first else {
            panic!("create failed");
        };
        let second = fake.create_patch(&spec, Some(first), 250);
        assert_eq!(second.ok(), Some(first));
    }
}
