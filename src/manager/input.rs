//! Capture stream selection, lifecycle and concurrency arbitration.

use tracing::{debug, info, instrument, warn};

use super::{ConcurrencyKind, RoutingManager};
use crate::{
    client::{CaptureSource, PortId, RecordClient, SessionId, Uid},
    core::{Result, RoutingError},
    device::DeviceMask,
    profile::{InputFlags, StreamFormat},
    stream::{InputDescriptor, IoHandle},
    transport::{InputOpenRequest, Transport},
};

/// Capture stream request.
#[derive(Debug, Clone)]
pub struct InputRequest {
    /// Capture source.
    pub source: CaptureSource,
    /// Client session.
    pub session: SessionId,
    /// Requesting process.
    pub uid: Uid,
    /// Requested format, if the client cares.
    pub format: Option<StreamFormat>,
    /// Requested flags.
    pub flags: InputFlags,
    /// Explicit routing request.
    pub preferred_device: Option<DeviceMask>,
}

impl<T: Transport> RoutingManager<T> {
    /// Selects (or opens) the input stream a capture request should use and
    /// registers the client on it.
    ///
    /// # Errors
    /// Returns [`RoutingError::NoRoute`] when no profile can capture from
    /// the resolved device with the requested parameters.
    #[instrument(skip(self, request), fields(uid = request.uid.0, session = request.session.0))]
    pub fn get_input_for_attributes(
        &mut self,
        request: &InputRequest,
    ) -> Result<(IoHandle, PortId)> {
        let device = match request.preferred_device {
            Some(preferred) => preferred & self.available_inputs.types(),
            None => self
                .engine
                .device_for_source(request.source, &self.availability()),
        };
        if device.is_empty() {
            return Err(RoutingError::no_route(device, "no device for source"));
        }

        let reusable = self.inputs.iter().find(|d| {
            d.supported_devices.intersects(device)
                && d.flags == request.flags
                && request.format.is_none_or(|f| d.format == f)
        });
        let io = match reusable {
            Some(desc) => desc.io,
            None => self.open_input_for_device(request, device)?,
        };

        let port = self.allocate_port();
        let desc = self
            .inputs
            .get_mut(io)
            .ok_or(RoutingError::StreamNotFound(io))?;
        desc.add_client(RecordClient {
            port,
            uid: request.uid,
            session: request.session,
            source: request.source,
            flags: request.flags,
            preferred_device: request.preferred_device,
            active: false,
            silenced: false,
        });
        self.bump_port_generation();
        debug!(?io, ?port, source = ?request.source, "capture client registered");
        Ok((io, port))
    }

    fn open_input_for_device(
        &mut self,
        request: &InputRequest,
        device: DeviceMask,
    ) -> Result<IoHandle> {
        for module_index in 0..self.modules.len() {
            for profile_index in 0..self.modules[module_index].input_profiles.len() {
                let profile = &self.modules[module_index].input_profiles[profile_index];
                if !profile.can_open_new_stream()
                    || !profile.is_compatible_input(device, request.format, request.flags)
                {
                    continue;
                }
                let module_id = self.modules[module_index].id;
                let initial = DeviceMask::from_bits_truncate(
                    1u64 << (profile.supported_devices & device).bits().trailing_zeros(),
                );
                let open_request = InputOpenRequest {
                    module: module_id,
                    profile: profile.name.clone(),
                    device: initial,
                    address: String::new(),
                    format: request
                        .format
                        .or_else(|| profile.formats.first().copied())
                        .unwrap_or_else(StreamFormat::mixer_default),
                    flags: request.flags,
                    source: request.source,
                };
                let profile_name = profile.name.clone();
                let supported = profile.supported_devices;
                let opened = self
                    .transport
                    .open_input(&open_request)
                    .map_err(RoutingError::from)?;
                let mut desc = InputDescriptor::new(
                    opened.io,
                    module_id,
                    profile_name.clone(),
                    request.flags,
                    opened.format,
                    supported,
                );
                desc.set_device(initial);
                self.inputs.add(desc);
                if let Some(profile) = self.input_profile_mut(module_id, &profile_name) {
                    profile.open_count += 1;
                }
                debug!(io = ?opened.io, profile = %profile_name, ?initial, "input opened");
                return Ok(opened.io);
            }
        }
        Err(RoutingError::no_route(device, "no input profile matches"))
    }

    /// Starts capture for a registered client, arbitrating against every
    /// other active capture first.
    ///
    /// Telephony owns the microphone path while the uplink patch is in
    /// place. Silenced background captures are stopped and released rather
    /// than blocking the start. An active hotword-only input is preempted
    /// by real capture; a hotword session preempted by a still-active
    /// hotword input is refused. Anything else is a plain capture
    /// conflict. With concurrent capture the conflicts and the hotword
    /// preemption are skipped; telephony and silenced eviction still
    /// apply.
    ///
    /// # Errors
    /// [`RoutingError::CaptureConflict`] when arbitration denies the start;
    /// unknown ports and double starts are rejected.
    #[instrument(skip(self))]
    pub fn start_input(&mut self, port: PortId) -> Result<()> {
        let io = self
            .inputs
            .input_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let (source, session, active, device, module) = {
            let desc = self
                .inputs
                .get(io)
                .ok_or(RoutingError::StreamNotFound(io))?;
            let client = desc.client(port).ok_or(RoutingError::PortNotFound(port))?;
            (
                client.source,
                client.session,
                client.active,
                desc.device(),
                desc.module,
            )
        };
        if active {
            return Err(RoutingError::AlreadyInState(format!(
                "client {port:?} already started"
            )));
        }

        if !device.is_virtual_input() {
            self.arbitrate_capture(io, source, session, module)?;
        }

        let first_active = self.inputs.get(io).is_some_and(|d| !d.is_active());
        if let Some(desc) = self.inputs.get_mut(io) {
            if let Some(client) = desc.client_mut(port) {
                client.active = true;
            }
        }
        let new_device = self.new_input_device(io);
        if !new_device.is_empty() {
            self.set_input_device(io, new_device, first_active);
        }
        debug!(?io, ?source, "capture started");
        Ok(())
    }

    fn arbitrate_capture(
        &mut self,
        io: IoHandle,
        source: CaptureSource,
        session: SessionId,
        module: crate::device::ModuleId,
    ) -> Result<()> {
        // the voice uplink owns the microphone path on its module
        if self.engine.phone_state().is_in_call()
            && self.call_tx_patch.is_some()
            && self
                .engine
                .device_for_source(CaptureSource::VoiceCommunication, &self.availability())
                .intersects(self.available_inputs.types_on_module(module))
            && source != CaptureSource::VoiceCall
        {
            return Err(RoutingError::CaptureConflict(ConcurrencyKind::Call));
        }
        let mut hotword_to_preempt = Vec::new();
        let mut silenced_to_evict: Vec<PortId> = Vec::new();
        for other in self.inputs.iter() {
            if other.io == io || !other.is_active() || other.device().is_virtual_input() {
                continue;
            }
            if other.is_hotword_only(true) {
                if self.tuning.concurrent_capture {
                    continue;
                }
                if source == CaptureSource::Hotword
                    && other.preempted_sessions.contains(&session)
                {
                    return Err(RoutingError::CaptureConflict(ConcurrencyKind::Hotword));
                }
                hotword_to_preempt.push(other.io);
                continue;
            }
            if other.clients(true).all(|c| c.silenced) {
                // background captures already receive silence; the
                // foreground start takes the microphone and they come down
                silenced_to_evict.extend(other.clients(true).map(|c| c.port));
                continue;
            }
            if self.tuning.concurrent_capture {
                continue;
            }
            return Err(RoutingError::CaptureConflict(ConcurrencyKind::Capture));
        }

        for port in silenced_to_evict {
            info!(?port, "silenced capture evicted by an unsilenced start");
            if self.stop_input(port).is_ok() {
                self.release_input(port).ok();
            }
        }
        for victim in hotword_to_preempt {
            let mut sessions = Vec::new();
            if let Some(desc) = self.inputs.get_mut(victim) {
                for client in desc.clients_mut() {
                    if client.active {
                        sessions.push(client.session);
                        client.active = false;
                    }
                }
            }
            info!(?victim, ?sessions, "hotword capture preempted");
            if let Some(desc) = self.inputs.get_mut(io) {
                for s in sessions {
                    if !desc.preempted_sessions.contains(&s) {
                        desc.preempted_sessions.push(s);
                    }
                }
            }
        }
        Ok(())
    }

    /// Stops capture for a registered client.
    ///
    /// # Errors
    /// Unknown ports and redundant stops are rejected.
    #[instrument(skip(self))]
    pub fn stop_input(&mut self, port: PortId) -> Result<()> {
        let io = self
            .inputs
            .input_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let active = self
            .inputs
            .get(io)
            .and_then(|d| d.client(port))
            .is_some_and(|c| c.active);
        if !active {
            return Err(RoutingError::AlreadyInState(format!(
                "client {port:?} already stopped"
            )));
        }
        if let Some(desc) = self.inputs.get_mut(io) {
            if let Some(client) = desc.client_mut(port) {
                client.active = false;
            }
        }
        let idle = self.inputs.get(io).is_some_and(|d| !d.is_active());
        if idle {
            if let Some(desc) = self.inputs.get_mut(io) {
                desc.preempted_sessions.clear();
            }
            self.reset_input_device(io);
        } else {
            // remaining captures may prefer a different device
            let device = self.new_input_device(io);
            if !device.is_empty() {
                self.set_input_device(io, device, false);
            }
        }
        debug!(?io, "capture stopped");
        Ok(())
    }

    /// Releases a capture client; the input closes with its last client.
    ///
    /// # Errors
    /// Returns [`RoutingError::PortNotFound`] for an unknown port.
    #[instrument(skip(self))]
    pub fn release_input(&mut self, port: PortId) -> Result<()> {
        let io = self
            .inputs
            .input_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let still_active = self
            .inputs
            .get(io)
            .and_then(|d| d.client(port))
            .is_some_and(|c| c.active);
        if still_active {
            warn!(?port, "released while started, stopping first");
            self.stop_input(port)?;
        }
        let remaining = {
            let desc = self
                .inputs
                .get_mut(io)
                .ok_or(RoutingError::StreamNotFound(io))?;
            desc.remove_client(port);
            desc.client_count()
        };
        if remaining == 0 {
            self.close_input_internal(io);
        }
        self.bump_port_generation();
        Ok(())
    }

    /// Marks a capture client as receiving silence. Silenced clients lose
    /// arbitration to unsilenced ones without being torn down.
    ///
    /// # Errors
    /// Returns [`RoutingError::PortNotFound`] for an unknown port.
    pub fn set_record_silenced(&mut self, port: PortId, silenced: bool) -> Result<()> {
        let io = self
            .inputs
            .input_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        if let Some(client) = self.inputs.get_mut(io).and_then(|d| d.client_mut(port)) {
            client.silenced = silenced;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use super::*;

    fn request(source: CaptureSource, session: u32) -> InputRequest {
        InputRequest {
            source,
            session: SessionId(session),
            uid: Uid(10_300),
            format: None,
            flags: InputFlags::empty(),
            preferred_device: None,
        }
    }

    #[test]
    fn capture_opens_and_routes_an_input() {
        let mut m = manager();
        let (io, port) = match m.get_input_for_attributes(&request(CaptureSource::Mic, 1)) {
            Ok(v) => v,
            Err(e) => panic!("selection failed: {e}"),
        };
        assert!(m.start_input(port).is_ok());
        assert_eq!(
            m.inputs().get(io).map(|d| d.device()),
            Some(DeviceMask::BUILTIN_MIC)
        );
        assert!(m.stop_input(port).is_ok());
        assert!(m.release_input(port).is_ok());
        // last client closes the input
        assert!(m.inputs().get(io).is_none());
    }

    #[test]
    fn second_capture_conflicts() {
        let mut m = manager();
        let Ok((_, first)) = m.get_input_for_attributes(&request(CaptureSource::Mic, 1)) else {
            panic!("selection failed");
        };
        m.start_input(first).ok();
        // a second input on another session
        let Ok((_, second)) =
            m.get_input_for_attributes(&request(CaptureSource::Camcorder, 2))
        else {
            panic!("selection failed");
        };
        // same input serves both; arbitration only fires across inputs
        let result = m.start_input(second);
        assert!(result.is_ok());
    }

    #[test]
    fn hotword_is_preempted_by_real_capture() {
        let mut m = manager();
        let mut hotword = request(CaptureSource::Hotword, 1);
        hotword.flags = InputFlags::HW_HOTWORD;
        let Ok((hotword_io, hotword_port)) = m.get_input_for_attributes(&hotword) else {
            panic!("selection failed");
        };
        m.start_input(hotword_port).ok();
        assert!(m.inputs().get(hotword_io).is_some_and(|d| d.is_active()));

        let Ok((mic_io, mic_port)) = m.get_input_for_attributes(&request(CaptureSource::Mic, 2))
        else {
            panic!("selection failed");
        };
        assert_ne!(hotword_io, mic_io);
        assert!(m.start_input(mic_port).is_ok());
        // the hotword capture lost the microphone
        assert!(m.inputs().get(hotword_io).is_some_and(|d| !d.is_active()));

        // restarting against the running real capture is a plain conflict;
        // the hotword naming is reserved for hotword-vs-hotword exclusion
        let result = m.start_input(hotword_port);
        assert!(matches!(
            result,
            Err(RoutingError::CaptureConflict(ConcurrencyKind::Capture))
        ));
    }

    #[test]
    fn unsilenced_start_evicts_silenced_capture() {
        let mut m = manager();
        let Ok((mic_io, mic_port)) = m.get_input_for_attributes(&request(CaptureSource::Mic, 1))
        else {
            panic!("selection failed");
        };
        m.start_input(mic_port).ok();
        m.set_record_silenced(mic_port, true).ok();

        let mut fast = request(CaptureSource::Camcorder, 2);
        fast.flags = InputFlags::FAST;
        let Ok((_, second)) = m.get_input_for_attributes(&fast) else {
            panic!("selection failed");
        };
        assert!(m.start_input(second).is_ok());
        // the silenced capture was stopped and released, not left running
        assert!(m.inputs().get(mic_io).is_none_or(|d| !d.is_active()));
        assert!(!m.is_source_active(CaptureSource::Mic));
    }

    #[test]
    fn stop_releases_the_capture_patch() {
        let mut m = manager();
        let Ok((io, port)) = m.get_input_for_attributes(&request(CaptureSource::Mic, 1)) else {
            panic!("selection failed");
        };
        m.start_input(port).ok();
        assert!(m.inputs().get(io).is_some_and(|d| d.patch().is_some()));
        m.stop_input(port).ok();
        // an idle input resolves to no device, so its patch comes down
        assert!(m.inputs().get(io).is_some_and(|d| d.patch().is_none()));
    }

    #[test]
    fn explicit_route_wins_capture_device_selection() {
        let mut m = manager();
        let mut routed = request(CaptureSource::Mic, 1);
        routed.preferred_device = Some(DeviceMask::BACK_MIC);
        let Ok((io, port)) = m.get_input_for_attributes(&routed) else {
            panic!("selection failed");
        };
        assert!(m.start_input(port).is_ok());
        assert_eq!(
            m.inputs().get(io).map(|d| d.device()),
            Some(DeviceMask::BACK_MIC)
        );
    }

    #[test]
    fn call_forces_the_voice_communication_device() {
        let mut m = manager();
        m.set_phone_state(crate::engine::PhoneState::InCall).ok();
        let Ok((io, port)) = m.get_input_for_attributes(&request(CaptureSource::Camcorder, 1))
        else {
            panic!("selection failed");
        };
        assert!(m.start_input(port).is_ok());
        // camcorder alone would take the back microphone
        assert_eq!(
            m.inputs().get(io).map(|d| d.device()),
            Some(DeviceMask::BUILTIN_MIC)
        );
    }

    #[test]
    fn concurrent_capture_disables_arbitration() {
        let mut m = manager();
        m.tuning.concurrent_capture = true;
        let Ok((_, first)) = m.get_input_for_attributes(&request(CaptureSource::Mic, 1)) else {
            panic!("selection failed");
        };
        m.start_input(first).ok();
        let mut fast = request(CaptureSource::VoiceRecognition, 2);
        fast.flags = InputFlags::FAST;
        let Ok((_, second)) = m.get_input_for_attributes(&fast) else {
            panic!("selection failed");
        };
        assert!(m.start_input(second).is_ok());
    }
}
