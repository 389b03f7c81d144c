//! Device reselection, patch installation and global routing updates.

use tracing::{debug, info, instrument, warn};

use super::{RoutingManager, SYSTEM_UID};
use crate::{
    client::{AudioAttributes, CaptureSource, PortId, SourceClient, StreamType, Uid},
    core::{Result, RoutingError},
    device::DeviceMask,
    engine::{ForceUse, ForcedConfig, PhoneState, Strategy},
    patch::{AudioPatch, PatchEndpoint, PatchHandle, PatchSpec},
    stream::IoHandle,
    transport::Transport,
};

impl<T: Transport> RoutingManager<T> {
    /// Resolves the device an output should be routed to right now.
    ///
    /// Precedence: a patch installed by an external owner pins the current
    /// device; a unanimous explicit routing request from every active client
    /// wins next; otherwise the highest-priority strategy with activity on
    /// the output decides.
    pub(crate) fn new_output_device(&self, io: IoHandle) -> DeviceMask {
        let Some(desc) = self.outputs.get(io) else {
            return DeviceMask::empty();
        };
        if let Some(handle) = desc.patch() {
            if let Some(patch) = self.patches.get(handle) {
                if patch.owner != SYSTEM_UID {
                    return desc.device();
                }
            }
        }
        if let Some(preferred) = desc.preferred_device_of_active_clients() {
            let available = preferred & self.available_outputs.types();
            if !available.is_empty() {
                return available;
            }
        }

        let availability = self.availability();
        let resolve = |s: Strategy| self.engine.device_for_strategy(s, &availability);
        if self.engine.force_use(ForceUse::System) == ForcedConfig::SystemEnforced
            && self.is_strategy_active_on(io, Strategy::EnforcedAudible, 0)
        {
            return resolve(Strategy::EnforcedAudible);
        }
        if self.engine.phone_state().is_in_call()
            || self.is_strategy_active_on(io, Strategy::Phone, 0)
        {
            return resolve(Strategy::Phone);
        }
        let ordered = [
            Strategy::Sonification,
            Strategy::EnforcedAudible,
            Strategy::Accessibility,
            Strategy::SonificationRespectful,
            Strategy::Media,
            Strategy::Dtmf,
            Strategy::TransmittedThroughSpeaker,
            Strategy::Rerouting,
        ];
        for strategy in ordered {
            if self.is_strategy_active_on(io, strategy, 0) {
                return resolve(strategy);
            }
        }
        DeviceMask::empty()
    }

    /// Resolves the device an input should capture from right now.
    ///
    /// Precedence mirrors the output side: an externally owned patch pins
    /// the current device, a unanimous explicit routing request from the
    /// active clients wins next, a call forces the voice-communication
    /// source, otherwise the highest-priority active source decides. An
    /// idle input resolves to no device so its patch can come down.
    pub(crate) fn new_input_device(&self, io: IoHandle) -> DeviceMask {
        let Some(desc) = self.inputs.get(io) else {
            return DeviceMask::empty();
        };
        if let Some(handle) = desc.patch() {
            if let Some(patch) = self.patches.get(handle) {
                if patch.owner != SYSTEM_UID {
                    return desc.device();
                }
            }
        }
        if let Some(preferred) = desc.preferred_device_of_active_clients() {
            let available = preferred & self.available_inputs.types();
            if !available.is_empty() {
                return available;
            }
        }
        if self.engine.phone_state().is_in_call() {
            return self
                .engine
                .device_for_source(CaptureSource::VoiceCommunication, &self.availability());
        }
        match desc.highest_priority_source(true) {
            Some(source) => self.engine.device_for_source(source, &self.availability()),
            None => DeviceMask::empty(),
        }
    }

    /// Routes an output to `device`, muting around the transition when the
    /// output is active. Returns the wait the caller should observe before
    /// starting new playback.
    ///
    /// `device` is intersected with the output's reachable set; an empty
    /// result leaves routing untouched. A no-op reselection (same device, a
    /// patch already installed, `force` not set) only re-evaluates mutes.
    pub(crate) fn set_output_device(
        &mut self,
        io: IoHandle,
        device: DeviceMask,
        force: bool,
        delay_ms: u32,
    ) -> u32 {
        let Some(desc) = self.outputs.get(io) else {
            return 0;
        };
        if let Some((left, right)) = desc.sub_outputs() {
            let wait_left = self.set_output_device(left, device, force, delay_ms);
            let wait_right = self.set_output_device(right, device, force, delay_ms);
            if let Some(desc) = self.outputs.get_mut(io) {
                let filtered = device & desc.supported_devices;
                if !filtered.is_empty() {
                    desc.set_device(filtered);
                }
            }
            return wait_left.max(wait_right);
        }

        let supported = desc.supported_devices;
        let prev_device = desc.device();
        let has_patch = desc.patch().is_some();
        let device = device & supported;

        let mute_wait = self.check_device_mute_strategies(io, device, prev_device, delay_ms);

        if device.is_empty() {
            return mute_wait;
        }
        if device == prev_device && has_patch && !force {
            debug!(?io, ?device, "routing unchanged");
            return mute_wait;
        }
        if let Some(desc) = self.outputs.get_mut(io) {
            desc.set_device(device);
        }
        self.install_output_patch(io, device, delay_ms.max(mute_wait));
        self.apply_stream_volumes(io, device, delay_ms, force);
        debug!(?io, from = ?prev_device, to = ?device, "output rerouted");
        mute_wait
    }

    /// Tears down the patch feeding an output, leaving it unrouted.
    pub(crate) fn reset_output_device(&mut self, io: IoHandle) {
        let Some(desc) = self.outputs.get_mut(io) else {
            return;
        };
        let Some(handle) = desc.patch() else {
            return;
        };
        desc.set_patch(None);
        if let Some(patch) = self.patches.remove(handle) {
            if self.transport.release_patch(patch.transport_handle).is_err() {
                warn!(?handle, "transport refused patch release");
            }
            self.transport.on_patches_changed();
        }
    }

    /// Tears down the patch feeding an input, leaving it unrouted.
    pub(crate) fn reset_input_device(&mut self, io: IoHandle) {
        let Some(desc) = self.inputs.get_mut(io) else {
            return;
        };
        let Some(handle) = desc.patch() else {
            return;
        };
        desc.set_patch(None);
        if let Some(patch) = self.patches.remove(handle) {
            if self.transport.release_patch(patch.transport_handle).is_err() {
                warn!(?handle, "transport refused patch release");
            }
            self.transport.on_patches_changed();
        }
    }

    /// Routes an input to capture from `device`.
    pub(crate) fn set_input_device(&mut self, io: IoHandle, device: DeviceMask, force: bool) {
        let Some(desc) = self.inputs.get(io) else {
            return;
        };
        let supported = desc.supported_devices;
        let prev_device = desc.device();
        let has_patch = desc.patch().is_some();
        let device = device & supported;
        if device.is_empty() || (device == prev_device && has_patch && !force) {
            return;
        }
        if let Some(desc) = self.inputs.get_mut(io) {
            desc.set_device(device);
        }
        self.install_input_patch(io, device);
        debug!(?io, from = ?prev_device, to = ?device, "input rerouted");
    }

    fn device_sinks(&self, device: DeviceMask) -> Vec<PatchEndpoint> {
        let mut sinks = Vec::new();
        for descriptor in self.available_outputs.matching(device) {
            sinks.push(PatchEndpoint::Device {
                device: descriptor.kind,
                address: descriptor.address.clone(),
                module: descriptor.module,
            });
        }
        sinks
    }

    /// Installs or updates in place the patch connecting an output to its
    /// devices. One patch per stream; a transport refusal leaves the
    /// previous patch in force.
    fn install_output_patch(&mut self, io: IoHandle, device: DeviceMask, delay_ms: u32) {
        let sinks = self.device_sinks(device);
        if sinks.is_empty() {
            return;
        }
        let mut spec = PatchSpec::default().with_source(PatchEndpoint::stream(io, StreamType::Patch));
        spec.sinks = sinks;
        if spec.validate().is_err() {
            spec.sinks.truncate(crate::patch::MAX_PATCH_PORTS);
        }

        let existing = self
            .outputs
            .get(io)
            .and_then(|d| d.patch())
            .and_then(|h| self.patches.get(h).map(|p| (h, p.transport_handle)));
        match existing {
            Some((handle, transport_handle)) => {
                match self
                    .transport
                    .create_patch(&spec, Some(transport_handle), delay_ms)
                {
                    Ok(_) => {
                        if let Some(patch) = self.patches.get_mut(handle) {
                            patch.spec = spec;
                        }
                    }
                    Err(e) => warn!(?io, error = %e, "patch update refused"),
                }
            }
            None => match self.transport.create_patch(&spec, None, delay_ms) {
                Ok(transport_handle) => {
                    let handle = self.patches.next_handle();
                    self.patches.insert(AudioPatch {
                        handle,
                        transport_handle,
                        owner: SYSTEM_UID,
                        spec,
                    });
                    if let Some(desc) = self.outputs.get_mut(io) {
                        desc.set_patch(Some(handle));
                    }
                }
                Err(e) => warn!(?io, error = %e, "patch creation refused"),
            },
        }
        self.transport.on_patches_changed();
    }

    fn install_input_patch(&mut self, io: IoHandle, device: DeviceMask) {
        let mut sources = Vec::new();
        for descriptor in self.available_inputs.matching(device) {
            sources.push(PatchEndpoint::Device {
                device: descriptor.kind,
                address: descriptor.address.clone(),
                module: descriptor.module,
            });
            break;
        }
        if sources.is_empty() {
            return;
        }
        let mut spec = PatchSpec::default().with_sink(PatchEndpoint::stream(io, StreamType::Patch));
        spec.sources = sources;

        let existing = self
            .inputs
            .get(io)
            .and_then(|d| d.patch())
            .and_then(|h| self.patches.get(h).map(|p| (h, p.transport_handle)));
        match existing {
            Some((handle, transport_handle)) => {
                match self.transport.create_patch(&spec, Some(transport_handle), 0) {
                    Ok(_) => {
                        if let Some(patch) = self.patches.get_mut(handle) {
                            patch.spec = spec;
                        }
                    }
                    Err(e) => warn!(?io, error = %e, "input patch update refused"),
                }
            }
            None => match self.transport.create_patch(&spec, None, 0) {
                Ok(transport_handle) => {
                    let handle = self.patches.next_handle();
                    self.patches.insert(AudioPatch {
                        handle,
                        transport_handle,
                        owner: SYSTEM_UID,
                        spec,
                    });
                    if let Some(desc) = self.inputs.get_mut(io) {
                        desc.set_patch(Some(handle));
                    }
                }
                Err(e) => warn!(?io, error = %e, "input patch creation refused"),
            },
        }
        self.transport.on_patches_changed();
    }

    /// Re-resolves every strategy, invalidating streams whose strategy moved
    /// to another device, then reroutes every open output.
    pub(crate) fn update_devices_and_outputs(&mut self, delay_ms: u32) {
        self.check_output_for_all_strategies();
        let availability = self.availability();
        for strategy in Strategy::ALL {
            self.cached_devices[strategy.index()] =
                self.engine.device_for_strategy(strategy, &availability);
        }
        for io in self.outputs.handles() {
            if self
                .outputs
                .get(io)
                .is_some_and(|d| d.is_duplicated())
            {
                continue;
            }
            let device = self.new_output_device(io);
            if !device.is_empty() {
                self.set_output_device(io, device, false, delay_ms);
            }
        }
    }

    /// Compares a strategy's cached device with a fresh resolution; when it
    /// moved, mutes the strategy across the transition and invalidates its
    /// streams so clients re-request their outputs.
    pub(crate) fn check_output_for_strategy(&mut self, strategy: Strategy) {
        let old_device = self.cached_devices[strategy.index()];
        let new_device = self
            .engine
            .device_for_strategy(strategy, &self.availability());
        if old_device == new_device {
            return;
        }
        info!(?strategy, from = ?old_device, to = ?new_device, "strategy moved");
        let mute_ms = self.tuning.temp_mute_duration_ms;
        for io in self.outputs.handles() {
            if self.is_strategy_active_on(io, strategy, 0) {
                let device = self.outputs.get(io).map(|d| d.device()).unwrap_or_default();
                self.set_strategy_mute(strategy, true, io, 0, device);
                self.set_strategy_mute(strategy, false, io, mute_ms, device);
            }
        }
        for stream in StreamType::policy_streams() {
            if self.engine.strategy_for_stream(stream) == strategy {
                self.transport.invalidate_stream(stream);
            }
        }
    }

    pub(crate) fn check_output_for_all_strategies(&mut self) {
        for strategy in Strategy::ALL {
            self.check_output_for_strategy(strategy);
        }
    }

    /// Suspends the A2DP output while SCO or telephony owns the Bluetooth
    /// link, and resumes it once the link is free again.
    pub(crate) fn check_a2dp_suspend(&mut self) {
        let a2dp_output = self
            .outputs
            .iter()
            .find(|d| {
                !d.is_duplicated() && d.supported_devices.intersects(DeviceMask::ALL_A2DP_OUT)
            })
            .map(|d| d.io);
        let Some(io) = a2dp_output else {
            self.a2dp_suspended = false;
            return;
        };

        let sco_connected = self
            .available_outputs
            .types()
            .intersects(DeviceMask::ALL_SCO_OUT)
            || self
                .available_inputs
                .types()
                .intersects(DeviceMask::BLUETOOTH_SCO_MIC);
        let sco_forced = self.engine.force_use(ForceUse::Communication) == ForcedConfig::BtSco
            || self.engine.force_use(ForceUse::Record) == ForcedConfig::BtSco;
        let in_telephony = matches!(
            self.engine.phone_state(),
            PhoneState::Ringtone | PhoneState::InCall
        );

        let suspend = (sco_connected && sco_forced) || in_telephony;
        if suspend == self.a2dp_suspended {
            return;
        }
        self.a2dp_suspended = suspend;
        let parameters = if suspend {
            "A2dpSuspended=true"
        } else {
            "A2dpSuspended=false"
        };
        self.transport.set_parameters(io, parameters, 0);
        debug!(?io, suspend, "a2dp suspend state changed");
    }

    /// Updates the telephony state and rewires the voice path. Returns the
    /// wait the caller should observe before starting voice streams.
    ///
    /// # Errors
    /// Returns [`RoutingError::AlreadyInState`] when `state` is current.
    #[instrument(skip(self))]
    pub fn set_phone_state(&mut self, state: PhoneState) -> Result<u32> {
        let previous = self.engine.phone_state();
        self.engine.set_phone_state(state)?;
        info!(?previous, current = ?state, "phone state changed");

        let delay = if state.is_in_call() || previous.is_in_call() {
            self.tuning.temp_mute_duration_ms.min(500)
        } else {
            0
        };
        self.check_a2dp_suspend();
        self.update_devices_and_outputs(delay);

        let mut wait = 0;
        if state == PhoneState::InCall {
            let rx_device = self
                .engine
                .device_for_strategy(Strategy::Phone, &self.availability());
            wait = self.update_call_routing(rx_device, delay)?;
        } else if previous == PhoneState::InCall {
            self.release_call_patches();
            self.update_devices_and_outputs(0);
        }
        if let Some(primary) = self.primary_output {
            let device = self
                .outputs
                .get(primary)
                .map(|d| d.device())
                .unwrap_or_default();
            self.apply_stream_volumes(primary, device, delay, true);
        }
        Ok(wait.max(delay))
    }

    /// Updates a forced routing configuration and reroutes everything that
    /// resolves differently under it.
    ///
    /// # Errors
    /// Returns [`RoutingError::AlreadyInState`] when `config` is current.
    #[instrument(skip(self))]
    pub fn set_force_use(&mut self, usage: ForceUse, config: ForcedConfig) -> Result<()> {
        self.engine.set_force_use(usage, config)?;
        let delay = if usage == ForceUse::System {
            self.tuning.touch_sound_delay_ms
        } else {
            0
        };
        self.check_a2dp_suspend();
        self.update_devices_and_outputs(delay);
        self.reroute_inputs();
        if self.engine.phone_state() == PhoneState::InCall {
            let rx_device = self
                .engine
                .device_for_strategy(Strategy::Phone, &self.availability());
            self.update_call_routing(rx_device, delay)?;
        }
        Ok(())
    }

    /// Rebuilds the voice call path towards `rx_device`. The downlink rides
    /// the primary output when that output can reach the device, and a
    /// device-to-device patch otherwise; the uplink always gets a patch.
    pub(crate) fn update_call_routing(
        &mut self,
        rx_device: DeviceMask,
        delay_ms: u32,
    ) -> Result<u32> {
        if rx_device.is_empty() {
            return Err(RoutingError::no_route(
                rx_device,
                "no device available for the voice path",
            ));
        }
        self.release_call_patches();

        let tx_device = self
            .engine
            .device_for_source(CaptureSource::VoiceCommunication, &self.availability());

        let primary = self
            .primary_output
            .ok_or_else(|| RoutingError::Init("primary output closed".into()))?;
        let primary_module = self
            .outputs
            .get(primary)
            .map(|d| d.module)
            .ok_or(RoutingError::StreamNotFound(primary))?;
        let primary_devices = self.available_outputs.types_on_module(primary_module);

        let mut wait = 0;
        let rx_on_primary = primary_devices.contains(rx_device)
            && self
                .outputs
                .get(primary)
                .is_some_and(|d| d.supported_devices.contains(rx_device));
        if rx_on_primary {
            wait = self.set_output_device(primary, rx_device, true, delay_ms);
        } else if self.available_inputs.types().contains(DeviceMask::TELEPHONY_RX) {
            let spec = PatchSpec::default()
                .with_source(PatchEndpoint::device(
                    DeviceMask::TELEPHONY_RX,
                    primary_module,
                ))
                .with_sink(PatchEndpoint::device(rx_device, primary_module));
            self.call_rx_patch = Some(self.install_call_patch(spec, delay_ms)?);
        } else {
            return Err(RoutingError::no_route(
                rx_device,
                "primary output cannot reach the device and no downlink source exists",
            ));
        }

        if !tx_device.is_empty()
            && self.available_outputs.types().contains(DeviceMask::TELEPHONY_TX)
        {
            // the uplink takes exclusive ownership of its module; running
            // captures there would steal the microphone from the call
            if let Some(tx_module) = self.module_for_input_device(tx_device) {
                let stranded: Vec<IoHandle> = self
                    .inputs
                    .iter()
                    .filter(|d| d.module == tx_module && d.is_active())
                    .map(|d| d.io)
                    .collect();
                for io in stranded {
                    warn!(?io, "closing capture preempted by the voice uplink");
                    self.close_input_internal(io);
                }
                let spec = PatchSpec::default()
                    .with_source(PatchEndpoint::device(tx_device, tx_module))
                    .with_sink(PatchEndpoint::device(DeviceMask::TELEPHONY_TX, primary_module));
                self.call_tx_patch = Some(self.install_call_patch(spec, delay_ms)?);
            }
        }
        Ok(wait)
    }

    fn install_call_patch(&mut self, spec: PatchSpec, delay_ms: u32) -> Result<PatchHandle> {
        spec.validate()?;
        let transport_handle = self
            .transport
            .create_patch(&spec, None, delay_ms)
            .map_err(RoutingError::from)?;
        let handle = self.patches.next_handle();
        self.patches.insert(AudioPatch {
            handle,
            transport_handle,
            owner: SYSTEM_UID,
            spec,
        });
        self.transport.on_patches_changed();
        Ok(handle)
    }

    pub(crate) fn release_call_patches(&mut self) {
        for handle in [self.call_rx_patch.take(), self.call_tx_patch.take()]
            .into_iter()
            .flatten()
        {
            if let Some(patch) = self.patches.remove(handle) {
                if self.transport.release_patch(patch.transport_handle).is_err() {
                    warn!(?handle, "transport refused call patch release");
                }
                self.transport.on_patches_changed();
            }
        }
    }

    /// Installs a patch on behalf of an external owner. A patch whose source
    /// is an output stream pins that output's routing; a patch whose sink is
    /// an input stream pins that input's capture device; a device-to-device
    /// patch goes straight to the transport.
    ///
    /// # Errors
    /// Rejects malformed specs, unknown streams and unreachable devices.
    #[instrument(skip(self, spec))]
    pub fn create_external_patch(&mut self, spec: &PatchSpec, owner: Uid) -> Result<PatchHandle> {
        spec.validate()?;
        match &spec.sources[0] {
            PatchEndpoint::Stream { io, .. } => {
                let io = *io;
                let device = spec
                    .sinks
                    .iter()
                    .filter_map(PatchEndpoint::device_kind)
                    .fold(DeviceMask::empty(), |acc, d| acc | d);
                let desc = self
                    .outputs
                    .get(io)
                    .ok_or(RoutingError::StreamNotFound(io))?;
                if (device & desc.supported_devices).is_empty() {
                    return Err(RoutingError::no_route(device, "output cannot reach sinks"));
                }
                self.set_output_device(io, device, true, 0);
                let handle = self
                    .outputs
                    .get(io)
                    .and_then(|d| d.patch())
                    .ok_or(RoutingError::StreamNotFound(io))?;
                if let Some(patch) = self.patches.get_mut(handle) {
                    patch.owner = owner;
                }
                Ok(handle)
            }
            PatchEndpoint::Device { device, .. } => {
                let source_device = *device;
                match spec.sinks.first() {
                    Some(PatchEndpoint::Stream { io, .. }) => {
                        let io = *io;
                        let desc = self
                            .inputs
                            .get(io)
                            .ok_or(RoutingError::StreamNotFound(io))?;
                        if (source_device & desc.supported_devices).is_empty() {
                            return Err(RoutingError::no_route(
                                source_device,
                                "input cannot reach source",
                            ));
                        }
                        self.set_input_device(io, source_device, true);
                        let handle = self
                            .inputs
                            .get(io)
                            .and_then(|d| d.patch())
                            .ok_or(RoutingError::StreamNotFound(io))?;
                        if let Some(patch) = self.patches.get_mut(handle) {
                            patch.owner = owner;
                        }
                        Ok(handle)
                    }
                    _ => {
                        let transport_handle = self
                            .transport
                            .create_patch(spec, None, 0)
                            .map_err(RoutingError::from)?;
                        let handle = self.patches.next_handle();
                        self.patches.insert(AudioPatch {
                            handle,
                            transport_handle,
                            owner,
                            spec: spec.clone(),
                        });
                        self.transport.on_patches_changed();
                        Ok(handle)
                    }
                }
            }
        }
    }

    /// Releases an externally installed patch and restores policy routing on
    /// the stream it was pinning.
    ///
    /// # Errors
    /// Returns [`RoutingError::PatchNotFound`] for an unknown handle.
    #[instrument(skip(self))]
    pub fn release_external_patch(&mut self, handle: PatchHandle) -> Result<()> {
        if self.patches.get(handle).is_none() {
            return Err(RoutingError::PatchNotFound(handle));
        }
        let pinned_output = self
            .outputs
            .iter()
            .find(|d| d.patch() == Some(handle))
            .map(|d| d.io);
        let pinned_input = self
            .inputs
            .iter()
            .find(|d| d.patch() == Some(handle))
            .map(|d| d.io);

        if let Some(io) = pinned_output {
            if let Some(patch) = self.patches.get_mut(handle) {
                patch.owner = SYSTEM_UID;
            }
            let device = self.new_output_device(io);
            if device.is_empty() {
                self.reset_output_device(io);
            } else {
                self.set_output_device(io, device, true, 0);
            }
        } else if let Some(io) = pinned_input {
            if let Some(patch) = self.patches.get_mut(handle) {
                patch.owner = SYSTEM_UID;
            }
            let device = self.new_input_device(io);
            if !device.is_empty() {
                self.set_input_device(io, device, true);
            }
        } else if let Some(patch) = self.patches.remove(handle) {
            self.transport
                .release_patch(patch.transport_handle)
                .map_err(RoutingError::from)?;
            self.transport.on_patches_changed();
        }
        Ok(())
    }

    /// Starts a device-to-device bridge (FM tuner into the media path, for
    /// example). The sink follows the strategy of `attributes`.
    ///
    /// # Errors
    /// Rejects bridges whose source or sink cannot be resolved.
    #[instrument(skip(self, attributes))]
    pub fn start_source(
        &mut self,
        source_device: DeviceMask,
        source_address: &str,
        attributes: AudioAttributes,
        uid: Uid,
    ) -> Result<PortId> {
        if !source_device.is_single() || !source_device.is_input() {
            return Err(RoutingError::invalid(
                "source_device",
                format!("expected a single input kind, got {source_device:?}"),
            ));
        }
        if !self.available_inputs.contains(source_device, source_address) {
            return Err(RoutingError::DeviceNotFound {
                device: source_device,
                address: source_address.to_owned(),
            });
        }
        let strategy = self.engine.strategy_for_attributes(&attributes);
        let sink = self.engine.device_for_strategy(strategy, &self.availability());
        if sink.is_empty() {
            return Err(RoutingError::no_route(sink, "no sink for bridge strategy"));
        }
        let module = self
            .module_for_input_device(source_device)
            .ok_or(RoutingError::DeviceNotFound {
                device: source_device,
                address: source_address.to_owned(),
            })?;
        let mut spec = PatchSpec::default().with_source(PatchEndpoint::Device {
            device: source_device,
            address: source_address.to_owned(),
            module,
        });
        spec.sinks = self.device_sinks(sink.for_volume());
        let handle = self.install_call_patch(spec, 0)?;
        if let Some(patch) = self.patches.get_mut(handle) {
            patch.owner = uid;
        }
        let port = self.allocate_port();
        let session = crate::client::SessionId(port.0);
        self.sources.insert(
            port,
            SourceClient {
                port,
                uid,
                session,
                source_device,
                source_address: source_address.to_owned(),
                attributes,
                patch: Some(handle),
            },
        );
        self.bump_port_generation();
        Ok(port)
    }

    /// Stops a device-to-device bridge.
    ///
    /// # Errors
    /// Returns [`RoutingError::PortNotFound`] for an unknown port.
    pub fn stop_source(&mut self, port: PortId) -> Result<()> {
        let client = self
            .sources
            .remove(&port)
            .ok_or(RoutingError::PortNotFound(port))?;
        if let Some(handle) = client.patch {
            if let Some(patch) = self.patches.remove(handle) {
                if self.transport.release_patch(patch.transport_handle).is_err() {
                    warn!(?handle, "transport refused bridge patch release");
                }
                self.transport.on_patches_changed();
            }
        }
        self.bump_port_generation();
        Ok(())
    }

    /// Tracks beacon playback against everything else: any other active
    /// stream mutes the beacon stream until it stops.
    pub(crate) fn handle_event_for_beacon(&mut self, stream: StreamType, starting: bool) {
        if stream == StreamType::Tts {
            if starting {
                self.beacon_playing += 1;
            } else {
                self.beacon_playing = self.beacon_playing.saturating_sub(1);
            }
        } else if starting {
            self.beacon_mute_refs += 1;
        } else {
            self.beacon_mute_refs = self.beacon_mute_refs.saturating_sub(1);
        }

        let should_mute = self.beacon_mute_refs > 0;
        if should_mute == self.beacon_muted || self.beacon_playing == 0 {
            self.beacon_muted = should_mute && self.beacon_playing > 0;
            return;
        }
        self.beacon_muted = should_mute;
        for io in self.outputs.handles() {
            let active = self
                .outputs
                .get(io)
                .is_some_and(|d| d.is_stream_active(StreamType::Tts, 0));
            if active {
                let device = self.outputs.get(io).map(|d| d.device()).unwrap_or_default();
                self.set_stream_mute(StreamType::Tts, should_mute, io, 0, device);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use crate::{
        client::Uid,
        device::DeviceMask,
        engine::{ForceUse, ForcedConfig, PhoneState},
        patch::{PatchEndpoint, PatchSpec},
        transport::TransportCommand,
    };

    #[test]
    fn phone_state_transitions_route_the_voice_path() {
        let mut m = manager();
        let wait = m.set_phone_state(PhoneState::InCall);
        assert!(wait.is_ok());
        // in a call the primary output follows the phone strategy
        let Some(primary) = m.primary_output() else {
            panic!("no primary");
        };
        let Some(desc) = m.outputs().get(primary) else {
            panic!("no descriptor");
        };
        assert_eq!(desc.device(), DeviceMask::EARPIECE);
        // redundant transition is rejected
        assert!(m.set_phone_state(PhoneState::InCall).is_err());
        assert!(m.set_phone_state(PhoneState::Normal).is_ok());
    }

    #[test]
    fn force_speaker_moves_the_call() {
        let mut m = manager();
        m.set_phone_state(PhoneState::InCall).ok();
        m.set_force_use(ForceUse::Communication, ForcedConfig::Speaker)
            .ok();
        let Some(primary) = m.primary_output() else {
            panic!("no primary");
        };
        let Some(desc) = m.outputs().get(primary) else {
            panic!("no descriptor");
        };
        assert_eq!(desc.device(), DeviceMask::SPEAKER);
    }

    #[test]
    fn external_patch_pins_output_routing() {
        let mut m = manager();
        let Some(primary) = m.primary_output() else {
            panic!("no primary");
        };
        let spec = PatchSpec::default()
            .with_source(PatchEndpoint::stream(primary, crate::client::StreamType::Patch))
            .with_sink(PatchEndpoint::device(
                DeviceMask::EARPIECE,
                crate::device::ModuleId(0),
            ));
        let handle = match m.create_external_patch(&spec, Uid(10_200)) {
            Ok(h) => h,
            Err(e) => panic!("patch failed: {e}"),
        };
        let Some(desc) = m.outputs().get(primary) else {
            panic!("no descriptor");
        };
        assert_eq!(desc.device(), DeviceMask::EARPIECE);
        // policy reselection keeps the externally pinned device
        assert_eq!(m.new_output_device(primary), DeviceMask::EARPIECE);

        assert!(m.release_external_patch(handle).is_ok());
        assert!(m
            .release_external_patch(crate::patch::PatchHandle(9999))
            .is_err());
    }

    #[test]
    fn telephony_suspends_the_a2dp_output() {
        let mut m = manager();
        m.set_device_connection_state(DeviceMask::BLUETOOTH_A2DP, "", true)
            .ok();
        m.set_phone_state(PhoneState::InCall).ok();
        let suspended = m.transport().commands.iter().any(|c| {
            matches!(
                c,
                TransportCommand::SetParameters { parameters, .. }
                    if parameters == "A2dpSuspended=true"
            )
        });
        assert!(suspended);

        m.set_phone_state(PhoneState::Normal).ok();
        let resumed = m.transport().commands.iter().any(|c| {
            matches!(
                c,
                TransportCommand::SetParameters { parameters, .. }
                    if parameters == "A2dpSuspended=false"
            )
        });
        assert!(resumed);
    }

    #[test]
    fn strategy_move_invalidates_streams() {
        let mut m = manager();
        m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
            .ok();
        let invalidated = m.transport().commands.iter().any(|c| {
            matches!(
                c,
                TransportCommand::InvalidateStream(crate::client::StreamType::Music)
            )
        });
        assert!(invalidated);
    }
}
