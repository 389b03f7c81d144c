use std::collections::HashMap;

use super::IoHandle;
use crate::{
    client::{CaptureSource, PortId, RecordClient, SessionId},
    device::{DeviceMask, ModuleId},
    patch::PatchHandle,
    profile::{InputFlags, StreamFormat},
};

/// One open input stream and its attached capture clients.
#[derive(Debug, Clone)]
pub struct InputDescriptor {
    /// Stream handle.
    pub io: IoHandle,
    /// Owning hardware module.
    pub module: ModuleId,
    /// Name of the profile the stream was opened from.
    pub profile: String,
    /// Flags granted at open.
    pub flags: InputFlags,
    /// Negotiated format.
    pub format: StreamFormat,
    /// Devices reachable from this stream; `device` never leaves this set.
    pub supported_devices: DeviceMask,
    /// Sessions this input preempted to start hotword capture.
    pub preempted_sessions: Vec<SessionId>,
    device: DeviceMask,
    patch: Option<PatchHandle>,
    clients: HashMap<PortId, RecordClient>,
}

impl InputDescriptor {
    /// Creates a descriptor for a freshly opened input stream.
    pub fn new(
        io: IoHandle,
        module: ModuleId,
        profile: impl Into<String>,
        flags: InputFlags,
        format: StreamFormat,
        supported_devices: DeviceMask,
    ) -> Self {
        Self {
            io,
            module,
            profile: profile.into(),
            flags,
            format,
            supported_devices,
            preempted_sessions: Vec::new(),
            device: DeviceMask::empty(),
            patch: None,
            clients: HashMap::new(),
        }
    }

    /// Currently routed device mask.
    pub fn device(&self) -> DeviceMask {
        self.device
    }

    /// Routes the input; `device` must stay within `supported_devices`.
    pub fn set_device(&mut self, device: DeviceMask) {
        debug_assert!(self.supported_devices.contains(device));
        self.device = device;
    }

    /// Patch currently feeding this input, if any.
    pub fn patch(&self) -> Option<PatchHandle> {
        self.patch
    }

    /// Records or clears the attached patch handle.
    pub fn set_patch(&mut self, patch: Option<PatchHandle>) {
        self.patch = patch;
    }

    /// Registers a client; replaces any record with the same port.
    pub fn add_client(&mut self, client: RecordClient) {
        self.clients.insert(client.port, client);
    }

    /// Removes a client record.
    pub fn remove_client(&mut self, port: PortId) -> Option<RecordClient> {
        self.clients.remove(&port)
    }

    /// Client lookup by port.
    pub fn client(&self, port: PortId) -> Option<&RecordClient> {
        self.clients.get(&port)
    }

    /// Mutable client lookup by port.
    pub fn client_mut(&mut self, port: PortId) -> Option<&mut RecordClient> {
        self.clients.get_mut(&port)
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients, optionally restricted to active ones.
    pub fn clients(&self, active_only: bool) -> impl Iterator<Item = &RecordClient> {
        self.clients
            .values()
            .filter(move |c| !active_only || c.active)
    }

    /// Mutable view of all clients.
    pub fn clients_mut(&mut self) -> impl Iterator<Item = &mut RecordClient> {
        self.clients.values_mut()
    }

    /// Whether any client is capturing.
    pub fn is_active(&self) -> bool {
        self.clients.values().any(|c| c.active)
    }

    /// The explicit routing request shared by every active client. Any
    /// default-routed active client, or disagreement, vetoes it.
    pub fn preferred_device_of_active_clients(&self) -> Option<DeviceMask> {
        let mut preferred = None;
        let mut any_active = false;
        for client in self.clients(true) {
            any_active = true;
            match (client.preferred_device, preferred) {
                (None, _) => return None,
                (Some(d), None) => preferred = Some(d),
                (Some(d), Some(p)) if d != p => return None,
                _ => {}
            }
        }
        if any_active { preferred } else { None }
    }

    /// Highest-priority capture source among clients; the winner drives
    /// device selection on a shared input.
    pub fn highest_priority_source(&self, active_only: bool) -> Option<CaptureSource> {
        self.clients(active_only)
            .map(|c| c.source)
            .max_by_key(|s| s.priority())
    }

    /// Whether this input only serves hotword detection.
    pub fn is_hotword_only(&self, active_only: bool) -> bool {
        let mut seen = false;
        for client in self.clients(active_only) {
            if client.source != CaptureSource::Hotword {
                return false;
            }
            seen = true;
        }
        seen
    }
}

/// Registry of open inputs, keyed by stream handle.
#[derive(Debug, Default)]
pub struct InputRegistry {
    inputs: HashMap<IoHandle, InputDescriptor>,
}

impl InputRegistry {
    /// Registers an open input.
    pub fn add(&mut self, desc: InputDescriptor) {
        self.inputs.insert(desc.io, desc);
    }

    /// Removes an input descriptor.
    pub fn remove(&mut self, io: IoHandle) -> Option<InputDescriptor> {
        self.inputs.remove(&io)
    }

    /// Descriptor lookup.
    pub fn get(&self, io: IoHandle) -> Option<&InputDescriptor> {
        self.inputs.get(&io)
    }

    /// Mutable descriptor lookup.
    pub fn get_mut(&mut self, io: IoHandle) -> Option<&mut InputDescriptor> {
        self.inputs.get_mut(&io)
    }

    /// All open inputs.
    pub fn iter(&self) -> impl Iterator<Item = &InputDescriptor> {
        self.inputs.values()
    }

    /// Mutable view of all open inputs.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut InputDescriptor> {
        self.inputs.values_mut()
    }

    /// Handles of all open inputs.
    pub fn handles(&self) -> Vec<IoHandle> {
        self.inputs.keys().copied().collect()
    }

    /// Input owning the given client port.
    pub fn input_for_client(&self, port: PortId) -> Option<IoHandle> {
        self.inputs
            .values()
            .find(|d| d.client(port).is_some())
            .map(|d| d.io)
    }

    /// Whether any input has an active client with the given source.
    pub fn is_source_active(&self, source: CaptureSource) -> bool {
        self.inputs
            .values()
            .any(|d| d.clients(true).any(|c| c.source == source))
    }

    /// Number of open inputs.
    pub fn len(&self) -> usize {
        self.inputs.len()
    }

    /// Whether no input is open.
    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::Uid;

    fn descriptor() -> InputDescriptor {
        InputDescriptor::new(
            IoHandle(20),
            ModuleId(0),
            "builtin-mic",
            InputFlags::empty(),
            StreamFormat::mixer_default(),
            DeviceMask::BUILTIN_MIC | DeviceMask::WIRED_HEADSET_MIC,
        )
    }

    fn client(port: u32, source: CaptureSource, active: bool) -> RecordClient {
        RecordClient {
            port: PortId(port),
            uid: Uid(10_000),
            session: SessionId(port),
            source,
            flags: InputFlags::empty(),
            preferred_device: None,
            active,
            silenced: false,
        }
    }

    #[test]
    fn highest_priority_source_wins() {
        let mut desc = descriptor();
        desc.add_client(client(1, CaptureSource::Hotword, true));
        desc.add_client(client(2, CaptureSource::Camcorder, true));
        desc.add_client(client(3, CaptureSource::VoiceCommunication, false));

        assert_eq!(
            desc.highest_priority_source(true),
            Some(CaptureSource::Camcorder)
        );
        assert_eq!(
            desc.highest_priority_source(false),
            Some(CaptureSource::VoiceCommunication)
        );
    }

    #[test]
    fn explicit_route_requires_unanimous_active_clients() {
        let mut desc = descriptor();
        let mut routed = client(1, CaptureSource::Mic, true);
        routed.preferred_device = Some(DeviceMask::WIRED_HEADSET_MIC);
        desc.add_client(routed);
        assert_eq!(
            desc.preferred_device_of_active_clients(),
            Some(DeviceMask::WIRED_HEADSET_MIC)
        );

        // a default-routed active client vetoes explicit routing
        desc.add_client(client(2, CaptureSource::Mic, true));
        assert_eq!(desc.preferred_device_of_active_clients(), None);
    }

    #[test]
    fn hotword_only_detection() {
        let mut desc = descriptor();
        assert!(!desc.is_hotword_only(false));
        desc.add_client(client(1, CaptureSource::Hotword, true));
        assert!(desc.is_hotword_only(true));
        desc.add_client(client(2, CaptureSource::Mic, true));
        assert!(!desc.is_hotword_only(true));
    }

    #[test]
    fn registry_tracks_active_sources() {
        let mut reg = InputRegistry::default();
        let mut desc = descriptor();
        desc.add_client(client(5, CaptureSource::Mic, true));
        reg.add(desc);

        assert!(reg.is_source_active(CaptureSource::Mic));
        assert!(!reg.is_source_active(CaptureSource::Hotword));
        assert_eq!(reg.input_for_client(PortId(5)), Some(IoHandle(20)));
    }
}
