//! Playback stream selection, reuse and lifecycle.

use tracing::{debug, instrument, warn};

use super::RoutingManager;
use crate::{
    client::{AudioAttributes, PortId, SessionId, StreamType, TrackClient, Uid},
    core::{Result, RoutingError},
    device::DeviceMask,
    profile::{is_better_format_match, OutputFlags, StreamFormat},
    stream::IoHandle,
    transport::{OutputOpenRequest, Transport},
};

/// Flags that force a mixer-bypass stream.
const DIRECT_FLAGS: OutputFlags = OutputFlags::DIRECT
    .union(OutputFlags::COMPRESS_OFFLOAD)
    .union(OutputFlags::HW_AV_SYNC);

/// Playback stream request.
#[derive(Debug, Clone)]
pub struct OutputRequest {
    /// Request attributes.
    pub attributes: AudioAttributes,
    /// Client session.
    pub session: SessionId,
    /// Requesting process.
    pub uid: Uid,
    /// Requested format, if the client cares.
    pub format: Option<StreamFormat>,
    /// Requested flags.
    pub flags: OutputFlags,
    /// Explicit routing request.
    pub preferred_device: Option<DeviceMask>,
}

impl<T: Transport> RoutingManager<T> {
    /// Selects (or opens) the output stream a playback request should use
    /// and registers the client on it.
    ///
    /// Direct requests reuse an open direct stream when session and format
    /// match; otherwise a direct profile is opened. Linear PCM falls back
    /// to a mixed output when no direct path exists.
    ///
    /// # Errors
    /// Returns [`RoutingError::NoRoute`] when no stream can reach the
    /// resolved device with the requested parameters.
    #[instrument(skip(self, request), fields(uid = request.uid.0, session = request.session.0))]
    pub fn get_output_for_attributes(
        &mut self,
        request: &OutputRequest,
    ) -> Result<(IoHandle, PortId)> {
        let stream = request.attributes.stream_type();
        let strategy = self.engine.strategy_for_attributes(&request.attributes);
        let mut device = match request.preferred_device {
            Some(preferred) => preferred & self.available_outputs.types(),
            None => self.cached_devices[strategy.index()],
        };
        if device.is_empty() {
            device = self.engine.device_for_strategy(strategy, &self.availability());
        }
        if device.is_empty() {
            return Err(RoutingError::no_route(device, "no device for strategy"));
        }

        let wants_direct = request.flags.intersects(DIRECT_FLAGS)
            || request
                .format
                .is_some_and(|f| !f.sample_format.is_linear_pcm());
        if wants_direct {
            match self.get_direct_output(request, device) {
                Ok(found) => return self.register_track(found, stream, request),
                Err(e) => {
                    let pcm_fallback = request
                        .format
                        .is_none_or(|f| f.sample_format.is_linear_pcm())
                        && !request.flags.contains(OutputFlags::HW_AV_SYNC);
                    if !pcm_fallback {
                        return Err(e);
                    }
                    debug!(error = %e, "direct open failed, falling back to mixed");
                }
            }
        }

        let candidates = self.outputs.outputs_for_device(device);
        let io = self
            .select_output(&candidates, request.flags, request.format)
            .ok_or_else(|| {
                RoutingError::no_route(device, "no open output reaches the device")
            })?;
        self.register_track(io, stream, request)
    }

    fn register_track(
        &mut self,
        io: IoHandle,
        stream: StreamType,
        request: &OutputRequest,
    ) -> Result<(IoHandle, PortId)> {
        let port = self.allocate_port();
        let desc = self
            .outputs
            .get_mut(io)
            .ok_or(RoutingError::StreamNotFound(io))?;
        desc.add_client(TrackClient {
            port,
            uid: request.uid,
            session: request.session,
            attributes: request.attributes,
            stream,
            flags: request.flags,
            preferred_device: request.preferred_device,
            active: false,
        });
        self.bump_port_generation();
        debug!(?io, ?port, ?stream, "playback client registered");
        Ok((io, port))
    }

    /// Finds or opens a mixer-bypass stream for the request.
    fn get_direct_output(
        &mut self,
        request: &OutputRequest,
        device: DeviceMask,
    ) -> Result<IoHandle> {
        // reuse an open direct stream for the same session and format
        let reusable = self.outputs.iter().find(|d| {
            d.is_direct()
                && d.direct_session == Some(request.session)
                && request.format.is_none_or(|f| d.format == f)
                && d.supported_devices.intersects(device)
        });
        if let Some(desc) = reusable {
            let io = desc.io;
            if let Some(desc) = self.outputs.get_mut(io) {
                desc.direct_open_count += 1;
            }
            return Ok(io);
        }

        for module_index in 0..self.modules.len() {
            for profile_index in 0..self.modules[module_index].output_profiles.len() {
                let profile = &self.modules[module_index].output_profiles[profile_index];
                let direct = profile.output_flags.intersects(DIRECT_FLAGS);
                if !direct
                    || !profile.can_open_new_stream()
                    || !profile.is_compatible_output(device, request.format, request.flags)
                {
                    continue;
                }
                let module_id = self.modules[module_index].id;
                let open_request = OutputOpenRequest {
                    module: module_id,
                    profile: profile.name.clone(),
                    device: device.for_volume() & device,
                    address: String::new(),
                    format: request
                        .format
                        .or_else(|| profile.formats.first().copied())
                        .unwrap_or_else(StreamFormat::mixer_default),
                    flags: profile.output_flags | request.flags,
                };
                let profile_name = profile.name.clone();
                let supported = profile.supported_devices;
                let flags = profile.output_flags | request.flags;
                let latency = profile.latency_ms;
                let opened = self
                    .transport
                    .open_output(&open_request)
                    .map_err(RoutingError::from)?;
                let mut desc = crate::stream::OutputDescriptor::new(
                    opened.io,
                    module_id,
                    profile_name.clone(),
                    flags,
                    opened.format,
                    opened.latency_ms.max(latency).max(1),
                    supported,
                );
                desc.direct_open_count = 1;
                desc.direct_session = Some(request.session);
                self.outputs.add(desc);
                if let Some(profile) = self.output_profile_mut(module_id, &profile_name) {
                    profile.open_count += 1;
                }
                self.set_output_device(opened.io, device, true, 0);
                return Ok(opened.io);
            }
        }
        Err(RoutingError::no_route(device, "no direct profile matches"))
    }

    /// Picks the best open output among `candidates`: most requested flags
    /// honored, then closest format, then the primary output, then the
    /// first candidate.
    pub(crate) fn select_output(
        &self,
        candidates: &[IoHandle],
        flags: OutputFlags,
        format: Option<StreamFormat>,
    ) -> Option<IoHandle> {
        let mut best: Option<IoHandle> = None;
        let mut best_flags: i32 = -1;
        let mut best_format = None;
        for &io in candidates {
            let Some(desc) = self.outputs.get(io) else {
                continue;
            };
            if desc.is_direct() {
                continue;
            }
            let matched = (desc.flags & flags).bits().count_ones() as i32;
            let mut take = matched > best_flags;
            if !take && matched == best_flags {
                if let Some(requested) = format {
                    take = is_better_format_match(
                        desc.format.sample_format,
                        best_format,
                        requested.sample_format,
                    );
                }
                if !take && Some(io) == self.primary_output {
                    take = best != self.primary_output;
                }
            }
            if take {
                best = Some(io);
                best_flags = matched;
                best_format = Some(desc.format.sample_format);
            }
        }
        best
    }

    /// Starts playback for a registered client. Returns the wait the caller
    /// should observe before writing audio, covering any routing mute.
    ///
    /// # Errors
    /// Unknown ports and double starts are rejected.
    #[instrument(skip(self))]
    pub fn start_output(&mut self, port: PortId) -> Result<u32> {
        let io = self
            .outputs
            .output_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let (stream, already_active, was_active) = {
            let desc = self
                .outputs
                .get(io)
                .ok_or(RoutingError::StreamNotFound(io))?;
            let client = desc.client(port).ok_or(RoutingError::PortNotFound(port))?;
            (client.stream, client.active, desc.is_active(0))
        };
        if already_active {
            return Err(RoutingError::AlreadyInState(format!(
                "client {port:?} already started"
            )));
        }

        let subs = self.outputs.get(io).and_then(|d| d.sub_outputs());
        if let Some(desc) = self.outputs.get_mut(io) {
            if let Some(client) = desc.client_mut(port) {
                client.active = true;
            }
            desc.change_stream_active(stream, true);
        }
        if let Some((left, right)) = subs {
            for sub in [left, right] {
                if let Some(desc) = self.outputs.get_mut(sub) {
                    desc.change_stream_active(stream, true);
                }
            }
        }

        let device = self.new_output_device(io);
        let wait = self.set_output_device(io, device, !was_active, 0);
        let routed = self.outputs.get(io).map(|d| d.device()).unwrap_or_default();
        let index = self.stream_volume_index(stream, routed);
        self.check_and_set_volume(stream, index, io, routed, 0, false);
        self.handle_event_for_beacon(stream, true);
        debug!(?io, ?stream, wait, "playback started");
        Ok(wait)
    }

    /// Stops playback for a registered client and re-resolves routing on
    /// every output, deferring device changes by twice the stream latency
    /// so the tail is not clipped.
    ///
    /// # Errors
    /// Unknown ports and redundant stops are rejected.
    #[instrument(skip(self))]
    pub fn stop_output(&mut self, port: PortId) -> Result<()> {
        let io = self
            .outputs
            .output_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let (stream, active, latency) = {
            let desc = self
                .outputs
                .get(io)
                .ok_or(RoutingError::StreamNotFound(io))?;
            let client = desc.client(port).ok_or(RoutingError::PortNotFound(port))?;
            (client.stream, client.active, desc.latency_ms)
        };
        if !active {
            return Err(RoutingError::AlreadyInState(format!(
                "client {port:?} already stopped"
            )));
        }

        let subs = self.outputs.get(io).and_then(|d| d.sub_outputs());
        if let Some(desc) = self.outputs.get_mut(io) {
            if let Some(client) = desc.client_mut(port) {
                client.active = false;
            }
            desc.change_stream_active(stream, false);
        }
        if let Some((left, right)) = subs {
            for sub in [left, right] {
                if let Some(desc) = self.outputs.get_mut(sub) {
                    desc.change_stream_active(stream, false);
                }
            }
        }
        self.handle_event_for_beacon(stream, false);

        let delay = latency * 2;
        let device = self.new_output_device(io);
        if !device.is_empty() {
            self.set_output_device(io, device, false, delay);
        }
        for other in self.outputs.handles() {
            if other == io
                || self.outputs.get(other).is_some_and(|d| d.is_duplicated())
            {
                continue;
            }
            let device = self.new_output_device(other);
            if !device.is_empty() {
                self.set_output_device(other, device, false, delay);
            }
        }
        debug!(?io, ?stream, "playback stopped");
        Ok(())
    }

    /// Releases a playback client. Direct streams close when their last
    /// opener releases; mixed streams stay open for reuse.
    ///
    /// # Errors
    /// Returns [`RoutingError::PortNotFound`] for an unknown port.
    #[instrument(skip(self))]
    pub fn release_output(&mut self, port: PortId) -> Result<()> {
        let io = self
            .outputs
            .output_for_client(port)
            .ok_or(RoutingError::PortNotFound(port))?;
        let still_active = self
            .outputs
            .get(io)
            .and_then(|d| d.client(port))
            .is_some_and(|c| c.active);
        if still_active {
            warn!(?port, "released while started, stopping first");
            self.stop_output(port)?;
        }
        let (is_direct, direct_count) = {
            let desc = self
                .outputs
                .get_mut(io)
                .ok_or(RoutingError::StreamNotFound(io))?;
            desc.remove_client(port);
            if desc.is_direct() {
                desc.direct_open_count = desc.direct_open_count.saturating_sub(1);
            }
            (desc.is_direct(), desc.direct_open_count)
        };
        if is_direct && direct_count == 0 {
            self.close_output_internal(io);
        }
        self.bump_port_generation();
        Ok(())
    }
}
