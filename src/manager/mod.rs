//! The routing manager: single owner of every piece of mutable policy state.
//!
//! All entry points take `&mut self`; callers serialize access. The manager
//! never blocks: operations that need deferral hand a `delay_ms` to the
//! transport or return the wait they would otherwise have slept through.

mod devices;
mod input;
mod output;
mod routing;
mod volume;

pub use input::InputRequest;
pub use output::OutputRequest;

use std::collections::HashMap;

use tracing::{debug, info, instrument};

use crate::{
    client::{PortId, SourceClient, StreamType, Uid},
    config::{Config, Tuning},
    core::{Result, RoutingError},
    device::{DeviceDescriptor, DeviceList, DeviceMask, ModuleId},
    engine::{Availability, PolicyEngine, Strategy},
    patch::{PatchHandle, PatchRegistry},
    profile::IoProfile,
    stream::{InputRegistry, IoHandle, OutputRegistry},
    transport::Transport,
    volume::VolumeCurves,
};

/// Identity the manager acts under when installing its own patches.
pub const SYSTEM_UID: Uid = Uid(1000);

/// Which arbitration rule rejected a capture request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConcurrencyKind {
    /// Capture denied because telephony owns the microphone path.
    Call,
    /// Capture denied by another active capture.
    Capture,
    /// Hotword capture denied by another hotword session.
    Hotword,
}

/// Runtime image of one hardware module and its profiles.
#[derive(Debug)]
pub struct HwModule {
    /// Module identifier.
    pub id: ModuleId,
    /// Module name from the catalog.
    pub name: String,
    /// Output profiles.
    pub output_profiles: Vec<IoProfile>,
    /// Input profiles.
    pub input_profiles: Vec<IoProfile>,
}

impl HwModule {
    /// Union of devices any output profile of this module can reach.
    pub fn supported_output_devices(&self) -> DeviceMask {
        self.output_profiles
            .iter()
            .fold(DeviceMask::empty(), |acc, p| acc | p.supported_devices)
    }

    /// Union of devices any input profile of this module can reach.
    pub fn supported_input_devices(&self) -> DeviceMask {
        self.input_profiles
            .iter()
            .fold(DeviceMask::empty(), |acc, p| acc | p.supported_devices)
    }
}

/// Central routing authority, generic over the transport so tests can
/// substitute a recording double.
pub struct RoutingManager<T: Transport> {
    pub(crate) tuning: Tuning,
    pub(crate) engine: Box<dyn PolicyEngine>,
    pub(crate) curves: Box<dyn VolumeCurves>,
    pub(crate) transport: T,
    pub(crate) modules: Vec<HwModule>,
    pub(crate) available_outputs: DeviceList,
    pub(crate) available_inputs: DeviceList,
    pub(crate) outputs: OutputRegistry,
    pub(crate) inputs: InputRegistry,
    pub(crate) patches: PatchRegistry,
    pub(crate) sources: HashMap<PortId, SourceClient>,
    pub(crate) primary_output: Option<IoHandle>,
    pub(crate) call_rx_patch: Option<PatchHandle>,
    pub(crate) call_tx_patch: Option<PatchHandle>,
    pub(crate) a2dp_suspended: bool,
    pub(crate) cached_devices: [DeviceMask; Strategy::COUNT],
    pub(crate) volume_indices: HashMap<(usize, u64), u32>,
    pub(crate) last_voice_volume: f32,
    pub(crate) beacon_playing: u32,
    pub(crate) beacon_mute_refs: u32,
    pub(crate) beacon_muted: bool,
    pub(crate) next_port: u32,
    pub(crate) port_generation: u32,
}

impl<T: Transport> RoutingManager<T> {
    /// Builds the manager from a catalog, opens the attached streams and
    /// routes them.
    ///
    /// # Errors
    /// Returns [`RoutingError::Init`] when the catalog yields no primary
    /// output, and transport errors for streams that fail to open.
    #[instrument(skip_all)]
    pub fn new(
        config: Config,
        engine: Box<dyn PolicyEngine>,
        curves: Box<dyn VolumeCurves>,
        transport: T,
    ) -> Result<Self> {
        let mut modules = Vec::new();
        let mut available_outputs = DeviceList::default();
        let mut available_inputs = DeviceList::default();

        for (index, module_cfg) in config.modules.iter().enumerate() {
            let id = ModuleId(index as u32);
            let mut output_profiles = Vec::new();
            for profile in &module_cfg.outputs {
                output_profiles.push(profile.to_output_profile()?);
            }
            let mut input_profiles = Vec::new();
            for profile in &module_cfg.inputs {
                input_profiles.push(profile.to_input_profile()?);
            }
            for kind in mask_bits(crate::config::parse_devices(
                &module_cfg.attached_output_devices,
            )?) {
                available_outputs.add(DeviceDescriptor::new(kind, id));
            }
            for kind in mask_bits(crate::config::parse_devices(
                &module_cfg.attached_input_devices,
            )?) {
                available_inputs.add(DeviceDescriptor::new(kind, id));
            }
            modules.push(HwModule {
                id,
                name: module_cfg.name.clone(),
                output_profiles,
                input_profiles,
            });
        }

        let mut manager = Self {
            tuning: config.tuning,
            engine,
            curves,
            transport,
            modules,
            available_outputs,
            available_inputs,
            outputs: OutputRegistry::default(),
            inputs: InputRegistry::default(),
            patches: PatchRegistry::default(),
            sources: HashMap::new(),
            primary_output: None,
            call_rx_patch: None,
            call_tx_patch: None,
            a2dp_suspended: false,
            cached_devices: [DeviceMask::empty(); Strategy::COUNT],
            volume_indices: HashMap::new(),
            last_voice_volume: -1.0,
            beacon_playing: 0,
            beacon_mute_refs: 0,
            beacon_muted: false,
            next_port: 0,
            port_generation: 0,
        };
        manager.initialize()?;
        Ok(manager)
    }

    fn initialize(&mut self) -> Result<()> {
        let attached = self.available_outputs.types();
        for module_index in 0..self.modules.len() {
            let profile_count = self.modules[module_index].output_profiles.len();
            for profile_index in 0..profile_count {
                let module_id = self.modules[module_index].id;
                let module_attached = self.available_outputs.types_on_module(module_id);
                let profile = &self.modules[module_index].output_profiles[profile_index];
                let reachable = profile.supported_devices & module_attached;
                if reachable.is_empty() || !profile.can_open_new_stream() {
                    continue;
                }
                let io = self.open_output_from_profile(module_index, profile_index, reachable)?;
                if self.modules[module_index].output_profiles[profile_index]
                    .output_flags
                    .contains(crate::profile::OutputFlags::PRIMARY)
                {
                    self.primary_output = Some(io);
                }
            }
        }
        if self.primary_output.is_none() {
            return Err(RoutingError::Init(format!(
                "no primary output for attached devices {attached:?}"
            )));
        }
        self.update_devices_and_outputs(0);
        for io in self.outputs.handles() {
            let device = self.outputs.get(io).map(|d| d.device());
            if let Some(device) = device {
                self.apply_stream_volumes(io, device, 0, true);
            }
        }
        self.port_generation += 1;
        self.transport.on_ports_changed();
        info!(
            outputs = self.outputs.len(),
            primary = ?self.primary_output,
            "routing manager initialized"
        );
        Ok(())
    }

    /// Current availability snapshot fed to the engine.
    pub(crate) fn availability(&self) -> Availability {
        Availability {
            output_devices: self.available_outputs.types(),
            input_devices: self.available_inputs.types(),
        }
    }

    /// Allocates a fresh client port id.
    pub(crate) fn allocate_port(&mut self) -> PortId {
        self.next_port += 1;
        PortId(self.next_port)
    }

    pub(crate) fn output_profile_mut(
        &mut self,
        module: ModuleId,
        name: &str,
    ) -> Option<&mut IoProfile> {
        self.modules
            .iter_mut()
            .find(|m| m.id == module)?
            .output_profiles
            .iter_mut()
            .find(|p| p.name == name)
    }

    pub(crate) fn input_profile_mut(
        &mut self,
        module: ModuleId,
        name: &str,
    ) -> Option<&mut IoProfile> {
        self.modules
            .iter_mut()
            .find(|m| m.id == module)?
            .input_profiles
            .iter_mut()
            .find(|p| p.name == name)
    }

    /// Module owning a device kind, preferring the primary output's module
    /// when several qualify.
    pub(crate) fn module_for_output_device(&self, device: DeviceMask) -> Option<ModuleId> {
        let primary_module = self
            .primary_output
            .and_then(|io| self.outputs.get(io))
            .map(|d| d.module);
        if let Some(id) = primary_module {
            if let Some(module) = self.modules.iter().find(|m| m.id == id) {
                if module.supported_output_devices().intersects(device) {
                    return Some(id);
                }
            }
        }
        self.modules
            .iter()
            .find(|m| m.supported_output_devices().intersects(device))
            .map(|m| m.id)
    }

    pub(crate) fn module_for_input_device(&self, device: DeviceMask) -> Option<ModuleId> {
        self.modules
            .iter()
            .find(|m| m.supported_input_devices().intersects(device))
            .map(|m| m.id)
    }

    /// Primary output handle. Present after successful construction.
    pub fn primary_output(&self) -> Option<IoHandle> {
        self.primary_output
    }

    /// The transport commands go through. Tests inspect recording doubles
    /// through this.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Mutable transport access, for doubles that reset between phases.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Open output streams.
    pub fn outputs(&self) -> &OutputRegistry {
        &self.outputs
    }

    /// Open input streams.
    pub fn inputs(&self) -> &InputRegistry {
        &self.inputs
    }

    /// Installed patches.
    pub fn patches(&self) -> &PatchRegistry {
        &self.patches
    }

    /// Devices currently available for playback.
    pub fn available_output_devices(&self) -> DeviceMask {
        self.available_outputs.types()
    }

    /// Devices currently available for capture.
    pub fn available_input_devices(&self) -> DeviceMask {
        self.available_inputs.types()
    }

    /// Cached device resolution for a strategy.
    pub fn device_for_strategy(&self, strategy: Strategy) -> DeviceMask {
        self.cached_devices[strategy.index()]
    }

    /// Generation counter bumped whenever the set of ports changes.
    pub fn port_generation(&self) -> u32 {
        self.port_generation
    }

    /// Whether `stream` is active on any output, counting recent stops
    /// within `in_past_ms` as active.
    pub fn is_stream_active(&self, stream: StreamType, in_past_ms: u32) -> bool {
        self.outputs.is_stream_active(stream, in_past_ms)
    }

    /// Whether any client with `source` is capturing right now.
    pub fn is_source_active(&self, source: crate::client::CaptureSource) -> bool {
        self.inputs.is_source_active(source)
    }

    /// Strategy governing a stream type, as resolved by the engine.
    pub(crate) fn strategy_for_stream(&self, stream: StreamType) -> Strategy {
        self.engine.strategy_for_stream(stream)
    }

    /// Whether any stream governed by `strategy` is active on `io`.
    pub(crate) fn is_strategy_active_on(
        &self,
        io: IoHandle,
        strategy: Strategy,
        in_past_ms: u32,
    ) -> bool {
        let Some(desc) = self.outputs.get(io) else {
            return false;
        };
        StreamType::ALL.into_iter().any(|s| {
            self.engine.strategy_for_stream(s) == strategy && desc.is_stream_active(s, in_past_ms)
        })
    }

    pub(crate) fn bump_port_generation(&mut self) {
        self.port_generation += 1;
        self.transport.on_ports_changed();
        debug!(generation = self.port_generation, "port topology changed");
    }
}

/// Iterates the single-bit masks contained in `mask`.
pub(crate) fn mask_bits(mask: DeviceMask) -> impl Iterator<Item = DeviceMask> {
    (0..u64::BITS)
        .map(move |bit| mask & DeviceMask::from_bits_truncate(1u64 << bit))
        .filter(|m| !m.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        engine::DefaultPolicyEngine,
        transport::FakeTransport,
        volume::LinearVolumeCurves,
    };

    pub(crate) fn manager() -> RoutingManager<FakeTransport> {
        match RoutingManager::new(
            Config::default_catalog(),
            Box::new(DefaultPolicyEngine::new()),
            Box::new(LinearVolumeCurves),
            FakeTransport::new(),
        ) {
            Ok(m) => m,
            Err(e) => panic!("manager construction failed: {e}"),
        }
    }

    #[test]
    fn construction_opens_a_primary_output() {
        let m = manager();
        assert!(m.primary_output().is_some());
        assert!(!m.outputs().is_empty());
        assert!(m.available_output_devices().contains(DeviceMask::SPEAKER));
    }

    #[test]
    fn construction_fails_without_primary_profile() {
        let mut config = Config::default_catalog();
        for module in &mut config.modules {
            for output in &mut module.outputs {
                output.flags.retain(|f| f != "primary");
            }
        }
        let result = RoutingManager::new(
            config,
            Box::new(DefaultPolicyEngine::new()),
            Box::new(LinearVolumeCurves),
            FakeTransport::new(),
        );
        assert!(matches!(result, Err(RoutingError::Init(_))));
    }

    #[test]
    fn initial_routing_stays_within_supported_devices() {
        let m = manager();
        for desc in m.outputs().iter() {
            assert!(desc.supported_devices.contains(desc.device()));
        }
    }

    #[test]
    fn mask_bit_iteration() {
        let mask = DeviceMask::SPEAKER | DeviceMask::BUILTIN_MIC;
        let bits: Vec<_> = mask_bits(mask).collect();
        assert_eq!(bits, vec![DeviceMask::SPEAKER, DeviceMask::BUILTIN_MIC]);
    }
}
