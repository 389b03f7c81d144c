//! Device connection lifecycle and the stream open/close plumbing.

use tracing::{debug, info, instrument, warn};

use super::RoutingManager;
use crate::{
    core::{Result, RoutingError},
    device::{DeviceDescriptor, DeviceMask},
    profile::OutputFlags,
    stream::{IoHandle, OutputDescriptor},
    transport::{OutputOpenRequest, Transport},
};

impl<T: Transport> RoutingManager<T> {
    /// Reports whether a device endpoint is currently available.
    pub fn device_connection_state(&self, kind: DeviceMask, address: &str) -> bool {
        if kind.is_output() {
            self.available_outputs.contains(kind, address)
        } else {
            self.available_inputs.contains(kind, address)
        }
    }

    /// Connects or disconnects a device endpoint, then reroutes every open
    /// stream affected by the change.
    ///
    /// # Errors
    /// Rejects masks that are not a single device kind, transitions that are
    /// already in effect, and devices no module can serve.
    #[instrument(skip(self), fields(kind = ?kind, address, connected))]
    pub fn set_device_connection_state(
        &mut self,
        kind: DeviceMask,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        if !kind.is_single() {
            return Err(RoutingError::invalid(
                "device",
                format!("expected a single device kind, got {kind:?}"),
            ));
        }
        if kind.distinguishes_on_address() && address.is_empty() {
            return Err(RoutingError::invalid(
                "address",
                format!("{kind:?} endpoints require an address"),
            ));
        }

        if kind.is_output() {
            self.set_output_device_connection(kind, address, connected)?;
        } else if kind.is_input() {
            self.set_input_device_connection(kind, address, connected)?;
        } else {
            return Err(RoutingError::invalid(
                "device",
                format!("{kind:?} is neither an output nor an input kind"),
            ));
        }
        self.bump_port_generation();
        Ok(())
    }

    fn set_output_device_connection(
        &mut self,
        kind: DeviceMask,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        if connected {
            if self.available_outputs.contains(kind, address) {
                return Err(RoutingError::AlreadyInState(format!(
                    "output device {kind:?} at '{address}' is connected"
                )));
            }
            let module = self.module_for_output_device(kind).ok_or_else(|| {
                RoutingError::DeviceNotFound {
                    device: kind,
                    address: address.to_owned(),
                }
            })?;
            self.available_outputs
                .add(DeviceDescriptor::with_address(kind, module, address));
            self.check_outputs_for_connected_device(kind)?;
            info!(?kind, address, "output device connected");
        } else {
            if !self.available_outputs.remove(kind, address) {
                return Err(RoutingError::AlreadyInState(format!(
                    "output device {kind:?} at '{address}' is not connected"
                )));
            }
            self.check_outputs_for_disconnected_device(kind);
            info!(?kind, address, "output device disconnected");
        }
        self.check_a2dp_suspend();
        self.update_devices_and_outputs(0);
        Ok(())
    }

    fn set_input_device_connection(
        &mut self,
        kind: DeviceMask,
        address: &str,
        connected: bool,
    ) -> Result<()> {
        if connected {
            if self.available_inputs.contains(kind, address) {
                return Err(RoutingError::AlreadyInState(format!(
                    "input device {kind:?} at '{address}' is connected"
                )));
            }
            let module = self.module_for_input_device(kind).ok_or_else(|| {
                RoutingError::DeviceNotFound {
                    device: kind,
                    address: address.to_owned(),
                }
            })?;
            self.available_inputs
                .add(DeviceDescriptor::with_address(kind, module, address));
            info!(?kind, address, "input device connected");
        } else {
            if !self.available_inputs.remove(kind, address) {
                return Err(RoutingError::AlreadyInState(format!(
                    "input device {kind:?} at '{address}' is not connected"
                )));
            }
            self.check_inputs_for_disconnected_device(kind);
            info!(?kind, address, "input device disconnected");
        }
        self.check_a2dp_suspend();
        self.reroute_inputs();
        Ok(())
    }

    /// Opens streams that become reachable when `kind` connects. Direct
    /// profiles stay closed; they open on demand.
    fn check_outputs_for_connected_device(&mut self, kind: DeviceMask) -> Result<()> {
        let already_reachable = self
            .outputs
            .iter()
            .any(|d| d.supported_devices.contains(kind));
        if already_reachable {
            return Ok(());
        }
        let mut opened = Vec::new();
        for module_index in 0..self.modules.len() {
            for profile_index in 0..self.modules[module_index].output_profiles.len() {
                let profile = &self.modules[module_index].output_profiles[profile_index];
                if !profile.supported_devices.contains(kind)
                    || profile.output_flags.contains(OutputFlags::DIRECT)
                    || !profile.can_open_new_stream()
                {
                    continue;
                }
                let io = self.open_output_from_profile(module_index, profile_index, kind)?;
                opened.push(io);
            }
        }
        // a new wearable sink gets a duplicating output with the primary so
        // sonification reaches both it and the speaker
        if DeviceMask::ALL_A2DP_OUT.contains(kind) {
            if let Some(primary) = self.primary_output {
                for io in opened {
                    if io != primary {
                        self.open_duplicating_output(primary, io)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Closes streams that can no longer reach any available device.
    fn check_outputs_for_disconnected_device(&mut self, kind: DeviceMask) {
        let available = self.available_outputs.types();
        let mut to_close = Vec::new();
        for desc in self.outputs.iter() {
            let stranded = (desc.supported_devices & available).is_empty();
            let direct_on_removed = desc.is_direct() && desc.device().contains(kind);
            if stranded || direct_on_removed {
                to_close.push(desc.io);
            }
        }
        for io in to_close {
            self.close_output_internal(io);
        }
    }

    fn check_inputs_for_disconnected_device(&mut self, kind: DeviceMask) {
        let available = self.available_inputs.types();
        let mut to_close = Vec::new();
        for desc in self.inputs.iter() {
            if (desc.supported_devices & available).is_empty() && desc.device().contains(kind) {
                to_close.push(desc.io);
            }
        }
        for io in to_close {
            warn!(?io, "closing input stranded by device disconnect");
            self.close_input_internal(io);
        }
    }

    /// Opens an output from a profile and routes it to the lowest-numbered
    /// kind in `devices`.
    pub(crate) fn open_output_from_profile(
        &mut self,
        module_index: usize,
        profile_index: usize,
        devices: DeviceMask,
    ) -> Result<IoHandle> {
        let module_id = self.modules[module_index].id;
        let profile = &self.modules[module_index].output_profiles[profile_index];
        let initial = devices.for_volume() & devices;
        let initial = if initial.is_empty() {
            DeviceMask::from_bits_truncate(1u64 << devices.bits().trailing_zeros())
        } else {
            initial
        };
        let request = OutputOpenRequest {
            module: module_id,
            profile: profile.name.clone(),
            device: initial,
            address: String::new(),
            format: profile
                .formats
                .first()
                .copied()
                .unwrap_or_else(crate::profile::StreamFormat::mixer_default),
            flags: profile.output_flags,
        };
        let profile_name = profile.name.clone();
        let supported = profile.supported_devices;
        let flags = profile.output_flags;
        let opened = self
            .transport
            .open_output(&request)
            .map_err(RoutingError::from)?;
        let mut desc = OutputDescriptor::new(
            opened.io,
            module_id,
            profile_name.clone(),
            flags,
            opened.format,
            opened.latency_ms.max(profile.latency_ms).max(1),
            supported,
        );
        desc.set_device(initial);
        self.outputs.add(desc);
        if let Some(profile) = self.output_profile_mut(module_id, &profile_name) {
            profile.open_count += 1;
        }
        self.set_output_device(opened.io, initial, true, 0);
        debug!(io = ?opened.io, profile = %profile_name, device = ?initial, "output opened");
        Ok(opened.io)
    }

    /// Opens a logical output duplicating to `left` and `right`.
    pub(crate) fn open_duplicating_output(
        &mut self,
        left: IoHandle,
        right: IoHandle,
    ) -> Result<IoHandle> {
        let opened = self
            .transport
            .open_duplicate_output(left, right)
            .map_err(RoutingError::from)?;
        let (Some(left_desc), Some(right_desc)) = (self.outputs.get(left), self.outputs.get(right))
        else {
            self.transport.close_output(opened.io);
            return Err(RoutingError::StreamNotFound(left));
        };
        let desc = OutputDescriptor::duplicated(opened.io, left_desc, right_desc);
        self.outputs.add(desc);
        debug!(io = ?opened.io, ?left, ?right, "duplicating output opened");
        Ok(opened.io)
    }

    /// Closes an output, tearing down its patch and any duplicating output
    /// built on top of it.
    pub(crate) fn close_output_internal(&mut self, io: IoHandle) {
        let parents: Vec<IoHandle> = self
            .outputs
            .iter()
            .filter(|d| {
                d.sub_outputs()
                    .is_some_and(|(left, right)| left == io || right == io)
            })
            .map(|d| d.io)
            .collect();
        for parent in parents {
            self.close_output_internal(parent);
        }

        let Some(desc) = self.outputs.remove(io) else {
            return;
        };
        if let Some(patch) = desc.patch() {
            if let Some(installed) = self.patches.remove(patch) {
                if self
                    .transport
                    .release_patch(installed.transport_handle)
                    .is_err()
                {
                    warn!(?patch, "transport refused patch release on close");
                }
            }
        }
        self.transport.close_output(io);
        if !desc.is_duplicated() {
            if let Some(profile) = self.output_profile_mut(desc.module, &desc.profile) {
                profile.open_count = profile.open_count.saturating_sub(1);
            }
        }
        if self.primary_output == Some(io) {
            self.primary_output = None;
        }
        debug!(?io, "output closed");
    }

    /// Closes an input, tearing down its patch.
    pub(crate) fn close_input_internal(&mut self, io: IoHandle) {
        let Some(desc) = self.inputs.remove(io) else {
            return;
        };
        if let Some(patch) = desc.patch() {
            if let Some(installed) = self.patches.remove(patch) {
                if self
                    .transport
                    .release_patch(installed.transport_handle)
                    .is_err()
                {
                    warn!(?patch, "transport refused patch release on close");
                }
            }
        }
        self.transport.close_input(io);
        if let Some(profile) = self.input_profile_mut(desc.module, &desc.profile) {
            profile.open_count = profile.open_count.saturating_sub(1);
        }
        debug!(?io, "input closed");
    }

    /// Re-resolves the device of every open input.
    pub(crate) fn reroute_inputs(&mut self) {
        for io in self.inputs.handles() {
            let device = self.new_input_device(io);
            if !device.is_empty() {
                self.set_input_device(io, device, false);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use crate::{
        client::{AudioAttributes, SessionId, Uid, Usage},
        device::DeviceMask,
        manager::OutputRequest,
        profile::OutputFlags,
    };

    #[test]
    fn connect_and_disconnect_round_trip() {
        let mut m = manager();
        assert!(!m.device_connection_state(DeviceMask::WIRED_HEADSET, ""));
        assert!(
            m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
                .is_ok()
        );
        assert!(m.device_connection_state(DeviceMask::WIRED_HEADSET, ""));
        // second connect is redundant
        assert!(
            m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
                .is_err()
        );
        assert!(
            m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", false)
                .is_ok()
        );
        assert!(!m.device_connection_state(DeviceMask::WIRED_HEADSET, ""));
    }

    #[test]
    fn connect_moves_active_media_to_headset() {
        let mut m = manager();
        let request = OutputRequest {
            attributes: AudioAttributes::for_usage(Usage::Media),
            session: SessionId(1),
            uid: Uid(10_100),
            format: None,
            flags: OutputFlags::empty(),
            preferred_device: None,
        };
        let Ok((io, port)) = m.get_output_for_attributes(&request) else {
            panic!("selection failed");
        };
        m.start_output(port).ok();

        m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
            .ok();
        assert_eq!(
            m.device_for_strategy(crate::engine::Strategy::Media),
            DeviceMask::WIRED_HEADSET
        );
        assert_eq!(
            m.outputs().get(io).map(|d| d.device()),
            Some(DeviceMask::WIRED_HEADSET)
        );
    }

    #[test]
    fn idle_output_keeps_its_route_on_connect() {
        let mut m = manager();
        let Some(primary) = m.primary_output() else {
            panic!("no primary output");
        };
        m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
            .ok();
        // nothing is playing, so the output is not rerouted yet
        assert_eq!(
            m.outputs().get(primary).map(|d| d.device()),
            Some(DeviceMask::SPEAKER)
        );
    }

    #[test]
    fn a2dp_connect_opens_a_duplicating_output() {
        let mut m = manager();
        m.set_device_connection_state(DeviceMask::BLUETOOTH_A2DP, "", true)
            .ok();
        assert!(m.outputs().iter().any(|d| d.is_duplicated()));
        // tearing the sink down removes the duplicate with its sub-output
        m.set_device_connection_state(DeviceMask::BLUETOOTH_A2DP, "", false)
            .ok();
        assert!(!m.outputs().iter().any(|d| d.is_duplicated()));
    }

    #[test]
    fn disconnect_falls_back_to_speaker() {
        let mut m = manager();
        m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
            .ok();
        m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", false)
            .ok();
        assert_eq!(
            m.device_for_strategy(crate::engine::Strategy::Media),
            DeviceMask::SPEAKER
        );
    }

    #[test]
    fn multi_bit_masks_are_rejected() {
        let mut m = manager();
        let result = m.set_device_connection_state(
            DeviceMask::WIRED_HEADSET | DeviceMask::HDMI,
            "",
            true,
        );
        assert!(result.is_err());
    }

    #[test]
    fn connection_changes_bump_the_generation() {
        let mut m = manager();
        let before = m.port_generation();
        m.set_device_connection_state(DeviceMask::WIRED_HEADSET_MIC, "", true)
            .ok();
        assert!(m.port_generation() > before);
    }
}
