use std::{
    collections::HashMap,
    time::{Duration, Instant},
};

use super::IoHandle;
use crate::{
    client::{PortId, StreamType, TrackClient},
    device::{DeviceMask, ModuleId},
    engine::Strategy,
    patch::PatchHandle,
    profile::{OutputFlags, StreamFormat},
};

/// Shape of an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputKind {
    /// Stream backed directly by one hardware output.
    Hardware,
    /// Logical stream fanning out to two hardware outputs in lockstep.
    Duplicated {
        /// First sub-output.
        left: IoHandle,
        /// Second sub-output.
        right: IoHandle,
    },
}

/// One open output stream and its attached playback clients.
#[derive(Debug, Clone)]
pub struct OutputDescriptor {
    /// Stream handle.
    pub io: IoHandle,
    /// Owning hardware module.
    pub module: ModuleId,
    /// Name of the profile the stream was opened from.
    pub profile: String,
    /// Hardware or duplicated.
    pub kind: OutputKind,
    /// Flags granted at open.
    pub flags: OutputFlags,
    /// Negotiated format.
    pub format: StreamFormat,
    /// Reported latency.
    pub latency_ms: u32,
    /// Devices reachable from this stream; `device` never leaves this set.
    pub supported_devices: DeviceMask,
    /// Open count for direct streams.
    pub direct_open_count: u32,
    /// Session that opened a direct stream.
    pub direct_session: Option<crate::client::SessionId>,
    device: DeviceMask,
    patch: Option<PatchHandle>,
    active: [u32; StreamType::COUNT],
    stop_time: [Option<Instant>; StreamType::COUNT],
    mute_count: [u32; StreamType::COUNT],
    strategy_muted_by_device: [bool; Strategy::COUNT],
    volume_db: [f32; StreamType::COUNT],
    clients: HashMap<PortId, TrackClient>,
}

impl OutputDescriptor {
    /// Creates a descriptor for a freshly opened hardware stream.
    pub fn new(
        io: IoHandle,
        module: ModuleId,
        profile: impl Into<String>,
        flags: OutputFlags,
        format: StreamFormat,
        latency_ms: u32,
        supported_devices: DeviceMask,
    ) -> Self {
        Self {
            io,
            module,
            profile: profile.into(),
            kind: OutputKind::Hardware,
            flags,
            format,
            latency_ms,
            supported_devices,
            direct_open_count: 0,
            direct_session: None,
            device: DeviceMask::empty(),
            patch: None,
            active: [0; StreamType::COUNT],
            stop_time: [None; StreamType::COUNT],
            mute_count: [0; StreamType::COUNT],
            strategy_muted_by_device: [false; Strategy::COUNT],
            volume_db: [f32::NEG_INFINITY; StreamType::COUNT],
            clients: HashMap::new(),
        }
    }

    /// Creates the logical descriptor for a duplicated pair.
    pub fn duplicated(
        io: IoHandle,
        left: &OutputDescriptor,
        right: &OutputDescriptor,
    ) -> Self {
        let mut desc = Self::new(
            io,
            left.module,
            format!("dup:{}+{}", left.profile, right.profile),
            OutputFlags::empty(),
            left.format,
            left.latency_ms.max(right.latency_ms),
            left.supported_devices | right.supported_devices,
        );
        desc.kind = OutputKind::Duplicated {
            left: left.io,
            right: right.io,
        };
        desc
    }

    /// Whether this is a duplicated logical stream.
    pub fn is_duplicated(&self) -> bool {
        matches!(self.kind, OutputKind::Duplicated { .. })
    }

    /// Sub-outputs of a duplicated stream.
    pub fn sub_outputs(&self) -> Option<(IoHandle, IoHandle)> {
        match self.kind {
            OutputKind::Duplicated { left, right } => Some((left, right)),
            OutputKind::Hardware => None,
        }
    }

    /// Whether the mixer is bypassed.
    pub fn is_direct(&self) -> bool {
        self.flags.contains(OutputFlags::DIRECT)
    }

    /// Currently routed device mask.
    pub fn device(&self) -> DeviceMask {
        self.device
    }

    /// Routes the stream; `device` must stay within `supported_devices`.
    pub fn set_device(&mut self, device: DeviceMask) {
        debug_assert!(self.supported_devices.contains(device));
        self.device = device;
    }

    /// Patch currently feeding this stream, if any.
    pub fn patch(&self) -> Option<PatchHandle> {
        self.patch
    }

    /// Records or clears the attached patch handle.
    pub fn set_patch(&mut self, patch: Option<PatchHandle>) {
        self.patch = patch;
    }

    /// Registers a client; replaces any record with the same port.
    pub fn add_client(&mut self, client: TrackClient) {
        self.clients.insert(client.port, client);
    }

    /// Removes a client record.
    pub fn remove_client(&mut self, port: PortId) -> Option<TrackClient> {
        self.clients.remove(&port)
    }

    /// Client lookup by port.
    pub fn client(&self, port: PortId) -> Option<&TrackClient> {
        self.clients.get(&port)
    }

    /// Mutable client lookup by port.
    pub fn client_mut(&mut self, port: PortId) -> Option<&mut TrackClient> {
        self.clients.get_mut(&port)
    }

    /// Number of attached clients.
    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Clients, optionally restricted to active ones.
    pub fn clients(&self, active_only: bool) -> impl Iterator<Item = &TrackClient> {
        self.clients
            .values()
            .filter(move |c| !active_only || c.active)
    }

    /// The device every active client explicitly asked for, when they all
    /// agree and no active client uses default routing. One client must
    /// never force routing for another's default-routed playback.
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

    /// Adjusts the per-stream activity counter, recording stop time on the
    /// last stop.
    pub fn change_stream_active(&mut self, stream: StreamType, active: bool) {
        let i = stream.index();
        if active {
            self.active[i] += 1;
        } else if self.active[i] > 0 {
            self.active[i] -= 1;
            if self.active[i] == 0 {
                self.stop_time[i] = Some(Instant::now());
            }
        }
    }

    /// Active client count for one stream type.
    pub fn stream_active_count(&self, stream: StreamType) -> u32 {
        self.active[stream.index()]
    }

    /// Whether `stream` is active, counting streams stopped less than
    /// `in_past_ms` ago as still active (drain tail).
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        let i = stream.index();
        if self.active[i] > 0 {
            return true;
        }
        if in_past_ms == 0 {
            return false;
        }
        self.stop_time[i]
            .is_some_and(|t| t.elapsed() <= Duration::from_millis(u64::from(in_past_ms)))
    }

    /// Whether any stream type is active.
    pub fn is_active(&self, in_past_ms: u32) -> bool {
        StreamType::ALL
            .into_iter()
            .any(|s| self.is_stream_active(s, in_past_ms))
    }

    /// Current mute count for one stream type.
    pub fn mute_count(&self, stream: StreamType) -> u32 {
        self.mute_count[stream.index()]
    }

    /// Increments the mute count.
    pub fn inc_mute(&mut self, stream: StreamType) {
        self.mute_count[stream.index()] += 1;
    }

    /// Decrements the mute count; returns false on an unmatched unmute.
    pub fn dec_mute(&mut self, stream: StreamType) -> bool {
        let i = stream.index();
        if self.mute_count[i] == 0 {
            return false;
        }
        self.mute_count[i] -= 1;
        true
    }

    /// Whether the device-incompatibility mute is latched for a strategy.
    pub fn strategy_muted_by_device(&self, strategy: Strategy) -> bool {
        self.strategy_muted_by_device[strategy.index()]
    }

    /// Latches or clears the device-incompatibility mute for a strategy.
    pub fn set_strategy_muted_by_device(&mut self, strategy: Strategy, muted: bool) {
        self.strategy_muted_by_device[strategy.index()] = muted;
    }

    /// Records the applied volume; returns true when it changed.
    pub fn apply_volume(&mut self, stream: StreamType, volume_db: f32) -> bool {
        let i = stream.index();
        if (self.volume_db[i] - volume_db).abs() < f32::EPSILON {
            return false;
        }
        self.volume_db[i] = volume_db;
        true
    }

    /// Last applied volume for a stream type.
    pub fn volume_db(&self, stream: StreamType) -> f32 {
        self.volume_db[stream.index()]
    }
}

/// Registry of open outputs, keyed by stream handle.
#[derive(Debug, Default)]
pub struct OutputRegistry {
    outputs: HashMap<IoHandle, OutputDescriptor>,
}

impl OutputRegistry {
    /// Registers an open output.
    pub fn add(&mut self, desc: OutputDescriptor) {
        self.outputs.insert(desc.io, desc);
    }

    /// Removes an output descriptor.
    pub fn remove(&mut self, io: IoHandle) -> Option<OutputDescriptor> {
        self.outputs.remove(&io)
    }

    /// Descriptor lookup.
    pub fn get(&self, io: IoHandle) -> Option<&OutputDescriptor> {
        self.outputs.get(&io)
    }

    /// Mutable descriptor lookup.
    pub fn get_mut(&mut self, io: IoHandle) -> Option<&mut OutputDescriptor> {
        self.outputs.get_mut(&io)
    }

    /// All open outputs.
    pub fn iter(&self) -> impl Iterator<Item = &OutputDescriptor> {
        self.outputs.values()
    }

    /// Handles of all open outputs.
    pub fn handles(&self) -> Vec<IoHandle> {
        self.outputs.keys().copied().collect()
    }

    /// Output owning the given client port.
    pub fn output_for_client(&self, port: PortId) -> Option<IoHandle> {
        self.outputs
            .values()
            .find(|d| d.client(port).is_some())
            .map(|d| d.io)
    }

    /// Handles of outputs that can reach `device`, sorted for determinism.
    pub fn outputs_for_device(&self, device: DeviceMask) -> Vec<IoHandle> {
        let mut found: Vec<IoHandle> = self
            .outputs
            .values()
            .filter(|d| d.supported_devices.intersects(device))
            .map(|d| d.io)
            .collect();
        found.sort_by_key(|io| io.0);
        found
    }

    /// Whether any output has `stream` active locally (duplicated parents
    /// excluded so activity is not counted twice).
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        self.outputs
            .values()
            .filter(|d| !d.is_duplicated())
            .any(|d| d.is_stream_active(stream, in_past_ms))
    }

    /// Number of open outputs.
    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    /// Whether no output is open.
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{AudioAttributes, SessionId, Uid, Usage};

    fn descriptor() -> OutputDescriptor {
        OutputDescriptor::new(
            IoHandle(1),
            ModuleId(0),
            "primary",
            OutputFlags::PRIMARY,
            StreamFormat::mixer_default(),
            20,
            DeviceMask::SPEAKER | DeviceMask::WIRED_HEADSET,
        )
    }

    fn client(port: u32, preferred: Option<DeviceMask>, active: bool) -> TrackClient {
        TrackClient {
            port: PortId(port),
            uid: Uid(10_000),
            session: SessionId(1),
            attributes: AudioAttributes::for_usage(Usage::Media),
            stream: StreamType::Music,
            flags: OutputFlags::empty(),
            preferred_device: preferred,
            active,
        }
    }

    #[test]
    fn activity_counters_round_trip() {
        let mut desc = descriptor();
        desc.change_stream_active(StreamType::Music, true);
        desc.change_stream_active(StreamType::Music, true);
        assert_eq!(desc.stream_active_count(StreamType::Music), 2);
        desc.change_stream_active(StreamType::Music, false);
        desc.change_stream_active(StreamType::Music, false);
        assert_eq!(desc.stream_active_count(StreamType::Music), 0);
        // stopped just now, still counts as active within a drain window
        assert!(desc.is_stream_active(StreamType::Music, 1000));
        assert!(!desc.is_stream_active(StreamType::Music, 0));
    }

    #[test]
    fn mute_count_never_goes_negative() {
        let mut desc = descriptor();
        assert!(!desc.dec_mute(StreamType::Music));
        desc.inc_mute(StreamType::Music);
        assert!(desc.dec_mute(StreamType::Music));
        assert!(!desc.dec_mute(StreamType::Music));
        assert_eq!(desc.mute_count(StreamType::Music), 0);
    }

    #[test]
    fn preferred_device_requires_unanimity() {
        let mut desc = descriptor();
        desc.add_client(client(1, Some(DeviceMask::WIRED_HEADSET), true));
        assert_eq!(
            desc.preferred_device_of_active_clients(),
            Some(DeviceMask::WIRED_HEADSET)
        );

        // a default-routed active client vetoes explicit routing
        desc.add_client(client(2, None, true));
        assert_eq!(desc.preferred_device_of_active_clients(), None);

        // inactive default-routed clients do not veto
        if let Some(c) = desc.client_mut(PortId(2)) {
            c.active = false;
        }
        assert_eq!(
            desc.preferred_device_of_active_clients(),
            Some(DeviceMask::WIRED_HEADSET)
        );
    }

    #[test]
    fn registry_finds_outputs_by_device_and_client() {
        let mut reg = OutputRegistry::default();
        let mut desc = descriptor();
        desc.add_client(client(7, None, false));
        reg.add(desc);

        assert_eq!(reg.outputs_for_device(DeviceMask::SPEAKER), vec![IoHandle(1)]);
        assert!(reg.outputs_for_device(DeviceMask::HDMI).is_empty());
        assert_eq!(reg.output_for_client(PortId(7)), Some(IoHandle(1)));
        assert_eq!(reg.output_for_client(PortId(8)), None);
    }
}
