//! Volume computation, application and mute sequencing.

use tracing::{debug, instrument, warn};

use super::RoutingManager;
use crate::{
    client::StreamType,
    core::{Result, RoutingError},
    device::DeviceMask,
    engine::{ForceUse, ForcedConfig, PhoneState, Strategy},
    stream::IoHandle,
    transport::Transport,
    volume::DeviceCategory,
};

impl<T: Transport> RoutingManager<T> {
    /// Stored volume index for a stream on a device. Multi-device masks are
    /// keyed by their volume-defining device.
    pub fn stream_volume_index(&self, stream: StreamType, device: DeviceMask) -> u32 {
        let key = (stream.index(), device.for_volume().bits());
        match self.volume_indices.get(&key) {
            Some(index) => *index,
            None => {
                let (min, max) = self.curves.index_range(stream);
                (min + max + 1) / 2
            }
        }
    }

    /// Stores a volume index and applies it to every output currently
    /// routed to `device` (to every output when `device` is empty).
    ///
    /// # Errors
    /// Rejects indices outside the stream's range.
    #[instrument(skip(self))]
    pub fn set_stream_volume_index(
        &mut self,
        stream: StreamType,
        device: DeviceMask,
        index: u32,
    ) -> Result<()> {
        let (min, max) = self.curves.index_range(stream);
        if index < min || index > max {
            return Err(RoutingError::invalid(
                "index",
                format!("{index} outside {min}..={max} for {stream:?}"),
            ));
        }
        let key = (stream.index(), device.for_volume().bits());
        self.volume_indices.insert(key, index);

        for io in self.outputs.handles() {
            let Some(desc) = self.outputs.get(io) else {
                continue;
            };
            if desc.is_duplicated() {
                continue;
            }
            let routed = desc.device();
            let applies = device.is_empty()
                || routed.intersects(device)
                || routed.for_volume() == device.for_volume();
            if applies {
                self.check_and_set_volume(stream, index, io, routed, 0, false);
            }
        }
        Ok(())
    }

    /// Converts a volume index to dB attenuation, with the policy
    /// adjustments layered on top of the raw curve:
    /// ringing is kept 4 dB under accessibility prompts, sonification on a
    /// worn headset is attenuated while music plays, and everything is
    /// capped just above the voice volume during a call.
    pub(crate) fn compute_volume(&self, stream: StreamType, index: u32, device: DeviceMask) -> f32 {
        let category = DeviceCategory::from_device(device);
        let mut db = self.curves.volume_db(stream, category, index);

        if stream == StreamType::Ring
            && self.engine.phone_state() == PhoneState::Ringtone
            && self.outputs.is_stream_active(StreamType::Accessibility, 0)
        {
            db -= 4.0;
        }

        let strategy = self.engine.strategy_for_stream(stream);
        let sonification = matches!(
            strategy,
            Strategy::Sonification | Strategy::SonificationRespectful
        );
        if sonification
            && device.intersects(DeviceMask::HEADSET_CLASS)
            && self
                .outputs
                .is_stream_active(StreamType::Music, self.tuning.music_stop_window_ms)
        {
            db += self.tuning.headset_sonification_attenuation_db;
            let music_index = self.stream_volume_index(StreamType::Music, device);
            let music_db = self
                .curves
                .volume_db(StreamType::Music, category, music_index);
            let min_db = music_db.max(self.tuning.sonification_music_floor_db);
            if db > min_db {
                db = min_db;
            }
            if device.intersects(DeviceMask::ALL_A2DP_OUT) {
                db = db.max(music_db - self.tuning.a2dp_sonification_closeness_db);
            }
        }

        if self.engine.phone_state().is_in_call()
            && stream != StreamType::VoiceCall
            && stream != StreamType::BluetoothSco
        {
            let voice_index = self.stream_volume_index(StreamType::VoiceCall, device);
            let voice_db = self
                .curves
                .volume_db(StreamType::VoiceCall, category, voice_index);
            let cap = voice_db + self.tuning.in_call_headroom_db;
            if db > cap {
                db = cap;
            }
        }
        db
    }

    /// Applies a volume index on one output, honoring mutes and the
    /// telephony force rules, and forwarding the voice volume when the
    /// voice stream changes on the primary output.
    pub(crate) fn check_and_set_volume(
        &mut self,
        stream: StreamType,
        index: u32,
        io: IoHandle,
        device: DeviceMask,
        delay_ms: u32,
        force: bool,
    ) {
        let Some(desc) = self.outputs.get(io) else {
            return;
        };
        if desc.mute_count(stream) != 0 && !force {
            debug!(?stream, ?io, "volume change deferred while muted");
            return;
        }
        let comm = self.engine.force_use(ForceUse::Communication);
        if (stream == StreamType::VoiceCall && comm == ForcedConfig::BtSco)
            || (stream == StreamType::BluetoothSco && comm != ForcedConfig::BtSco)
        {
            debug!(?stream, ?comm, "volume withheld from inactive voice path");
            return;
        }

        let device = if device.is_empty() { desc.device() } else { device };
        let mut db = self.compute_volume(stream, index, device);
        // the SCO link applies its own gain on the peer
        if stream == StreamType::VoiceCall && device.intersects(DeviceMask::ALL_SCO_OUT) {
            db = 0.0;
        }
        let changed = self
            .outputs
            .get_mut(io)
            .is_some_and(|d| d.apply_volume(stream, db));
        if changed || force {
            self.transport.set_stream_volume(io, stream, db, delay_ms);
        }

        if stream == StreamType::VoiceCall || stream == StreamType::BluetoothSco {
            let (_, max) = self.curves.index_range(stream);
            let voice = if max == 0 { 0.0 } else { index as f32 / max as f32 };
            if (voice - self.last_voice_volume).abs() >= f32::EPSILON || force {
                if Some(io) == self.primary_output {
                    self.transport.set_voice_volume(voice, delay_ms);
                    self.last_voice_volume = voice;
                }
            }
        }
    }

    /// Re-applies the stored volume of every policy stream on one output.
    pub(crate) fn apply_stream_volumes(
        &mut self,
        io: IoHandle,
        device: DeviceMask,
        delay_ms: u32,
        force: bool,
    ) {
        for stream in StreamType::policy_streams() {
            let index = self.stream_volume_index(stream, device);
            self.check_and_set_volume(stream, index, io, device, delay_ms, force);
        }
    }

    /// Mutes or unmutes one stream on one output.
    ///
    /// The mute count makes mutes from independent callers stack: volume is
    /// driven to silence only on the 0 to 1 transition and restored only on
    /// the 1 to 0 transition. An unmatched unmute is a logged no-op.
    pub(crate) fn set_stream_mute(
        &mut self,
        stream: StreamType,
        mute: bool,
        io: IoHandle,
        delay_ms: u32,
        device: DeviceMask,
    ) {
        let Some(desc) = self.outputs.get(io) else {
            return;
        };
        let device = if device.is_empty() { desc.device() } else { device };
        let can_mute = self.curves.can_be_muted(stream);

        if mute {
            let first = desc.mute_count(stream) == 0;
            if first && can_mute {
                let (min, _) = self.curves.index_range(stream);
                self.check_and_set_volume(stream, min, io, device, delay_ms, false);
            }
            if let Some(desc) = self.outputs.get_mut(io) {
                desc.inc_mute(stream);
            }
        } else {
            let matched = self
                .outputs
                .get_mut(io)
                .is_some_and(|d| d.dec_mute(stream));
            if !matched {
                warn!(?stream, ?io, "unmute without matching mute");
                return;
            }
            let now_unmuted = self
                .outputs
                .get(io)
                .is_some_and(|d| d.mute_count(stream) == 0);
            if now_unmuted && can_mute {
                let index = self.stream_volume_index(stream, device);
                self.check_and_set_volume(stream, index, io, device, delay_ms, false);
            }
        }
    }

    /// Mutes or unmutes every stream governed by a strategy on one output.
    pub(crate) fn set_strategy_mute(
        &mut self,
        strategy: Strategy,
        mute: bool,
        io: IoHandle,
        delay_ms: u32,
        device: DeviceMask,
    ) {
        for stream in StreamType::policy_streams() {
            if self.engine.strategy_for_stream(stream) == strategy {
                self.set_stream_mute(stream, mute, io, delay_ms, device);
            }
        }
    }

    /// Mute sequencing around a routing change on `io`.
    ///
    /// Strategies whose device does not fully move with the output are
    /// muted across all outputs until the transition lands (and unmuted
    /// when the condition clears, tracked by a latch per strategy). When
    /// the output is active and changes device, everything active on it is
    /// blanket-muted for a few latencies. Returns the residual wait beyond
    /// `delay_ms` the caller should observe.
    pub(crate) fn check_device_mute_strategies(
        &mut self,
        io: IoHandle,
        device: DeviceMask,
        prev_device: DeviceMask,
        delay_ms: u32,
    ) -> u32 {
        let Some(desc) = self.outputs.get(io) else {
            return 0;
        };
        let latency = desc.latency_ms.max(1);
        let active = desc.is_active(0);
        let supported = desc.supported_devices;
        let should_mute = active && device.count() >= 2;

        let availability = self.availability();
        let mut transitions = Vec::new();
        for strategy in Strategy::ALL {
            let cur_device = self.engine.device_for_strategy(strategy, &availability) & supported;
            let mute = should_mute && cur_device.intersects(device) && cur_device != device;
            let latched = self
                .outputs
                .get(io)
                .is_some_and(|d| d.strategy_muted_by_device(strategy));
            if mute != latched {
                transitions.push((strategy, mute, cur_device));
            }
        }
        for (strategy, mute, cur_device) in transitions {
            if let Some(desc) = self.outputs.get_mut(io) {
                desc.set_strategy_muted_by_device(strategy, mute);
            }
            let unmute_delay = if mute { 0 } else { delay_ms };
            for other in self.outputs.handles() {
                let dup = self.outputs.get(other).is_some_and(|d| d.is_duplicated());
                if !dup {
                    self.set_strategy_mute(strategy, mute, other, unmute_delay, cur_device);
                }
            }
        }

        let mut mute_wait = 0;
        if active && device != prev_device && !device.is_empty() {
            mute_wait = latency * 2;
            let unmute_delay = latency * self.tuning.latency_mute_factor;
            for strategy in Strategy::ALL {
                if self.is_strategy_active_on(io, strategy, 0) {
                    self.set_strategy_mute(strategy, true, io, 0, device);
                    self.set_strategy_mute(strategy, false, io, unmute_delay, device);
                }
            }
        }
        mute_wait.saturating_sub(delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::manager;
    use crate::{
        client::StreamType,
        device::DeviceMask,
        engine::PhoneState,
        transport::TransportCommand,
        volume::MIN_VOLUME_DB,
    };

    #[test]
    fn volume_index_round_trip_and_validation() {
        let mut m = manager();
        assert!(
            m.set_stream_volume_index(StreamType::Music, DeviceMask::SPEAKER, 10)
                .is_ok()
        );
        assert_eq!(
            m.stream_volume_index(StreamType::Music, DeviceMask::SPEAKER),
            10
        );
        // out of range for music (0..=15)
        assert!(
            m.set_stream_volume_index(StreamType::Music, DeviceMask::SPEAKER, 99)
                .is_err()
        );
        // ranges are per volume-defining device
        assert!(
            m.set_stream_volume_index(StreamType::Music, DeviceMask::WIRED_HEADSET, 3)
                .is_ok()
        );
        assert_eq!(
            m.stream_volume_index(StreamType::Music, DeviceMask::SPEAKER),
            10
        );
    }

    #[test]
    fn mute_count_balances_volume_application() {
        let mut m = manager();
        let Some(io) = m.primary_output() else {
            panic!("no primary");
        };
        let device = DeviceMask::SPEAKER;
        m.set_stream_mute(StreamType::Music, true, io, 0, device);
        m.set_stream_mute(StreamType::Music, true, io, 0, device);
        let muted_db = m
            .outputs()
            .get(io)
            .map(|d| d.volume_db(StreamType::Music))
            .unwrap_or(0.0);
        assert_eq!(muted_db, MIN_VOLUME_DB);

        // first unmute keeps silence, second restores
        m.set_stream_mute(StreamType::Music, false, io, 0, device);
        let still_muted = m
            .outputs()
            .get(io)
            .map(|d| d.volume_db(StreamType::Music))
            .unwrap_or(0.0);
        assert_eq!(still_muted, MIN_VOLUME_DB);
        m.set_stream_mute(StreamType::Music, false, io, 0, device);
        let restored = m
            .outputs()
            .get(io)
            .map(|d| d.volume_db(StreamType::Music))
            .unwrap_or(MIN_VOLUME_DB);
        assert!(restored > MIN_VOLUME_DB);

        // unmatched unmute is a no-op
        m.set_stream_mute(StreamType::Music, false, io, 0, device);
        assert_eq!(
            m.outputs().get(io).map(|d| d.mute_count(StreamType::Music)),
            Some(0)
        );
    }

    #[test]
    fn in_call_volumes_are_capped_near_voice() {
        let mut m = manager();
        m.set_stream_volume_index(StreamType::VoiceCall, DeviceMask::EARPIECE, 1)
            .ok();
        m.set_phone_state(PhoneState::InCall).ok();
        let voice_db = m.compute_volume(StreamType::VoiceCall, 1, DeviceMask::EARPIECE);
        let music_db = m.compute_volume(StreamType::Music, 15, DeviceMask::EARPIECE);
        assert!(music_db <= voice_db + m.tuning.in_call_headroom_db + 0.001);
    }

    #[test]
    fn voice_volume_follows_voice_stream() {
        let mut m = manager();
        m.set_stream_volume_index(StreamType::VoiceCall, DeviceMask::SPEAKER, 7)
            .ok();
        let sent = m
            .transport()
            .commands
            .iter()
            .rev()
            .find_map(|c| match c {
                TransportCommand::SetVoiceVolume { volume, .. } => Some(*volume),
                _ => None,
            });
        assert_eq!(sent, Some(1.0));
    }

    #[test]
    fn sco_voice_volume_is_pinned_to_unity() {
        let mut m = manager();
        m.set_device_connection_state(DeviceMask::BLUETOOTH_SCO_HEADSET, "", true)
            .ok();
        let Some(io) = m.primary_output() else {
            panic!("no primary");
        };
        m.check_and_set_volume(
            StreamType::VoiceCall,
            3,
            io,
            DeviceMask::BLUETOOTH_SCO_HEADSET,
            0,
            true,
        );
        assert_eq!(
            m.outputs().get(io).map(|d| d.volume_db(StreamType::VoiceCall)),
            Some(0.0)
        );
    }
}
