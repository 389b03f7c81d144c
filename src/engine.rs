//! Strategy engine seam: routing intent resolution.
//!
//! The engine maps phone state, forced usages and request attributes to a
//! routing strategy, and a strategy to the device mask it should use given
//! current availability. The routing manager consumes it as a black box so
//! alternate policies can be substituted.

use crate::{
    client::{AudioAttributes, AttributeFlags, CaptureSource, StreamType, Usage},
    core::{Result, RoutingError},
    device::DeviceMask,
};

/// Routing intent classes, in cache order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    /// Music and media playback.
    Media,
    /// Voice call path.
    Phone,
    /// Ringtones and alarms; must be heard.
    Sonification,
    /// Notifications; audible but deferential to media.
    SonificationRespectful,
    /// Dialer key feedback.
    Dtmf,
    /// Sounds enforced audible by regulation.
    EnforcedAudible,
    /// Beacon announcements through the speaker.
    TransmittedThroughSpeaker,
    /// Accessibility prompts.
    Accessibility,
    /// Policy-driven rerouting.
    Rerouting,
}

impl Strategy {
    /// Number of strategies.
    pub const COUNT: usize = 9;

    /// All strategies, in cache order.
    pub const ALL: [Strategy; Self::COUNT] = [
        Strategy::Media,
        Strategy::Phone,
        Strategy::Sonification,
        Strategy::SonificationRespectful,
        Strategy::Dtmf,
        Strategy::EnforcedAudible,
        Strategy::TransmittedThroughSpeaker,
        Strategy::Accessibility,
        Strategy::Rerouting,
    ];

    /// Stable index for per-strategy bookkeeping arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Telephony state of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PhoneState {
    /// No call activity.
    #[default]
    Normal,
    /// Incoming call ringing.
    Ringtone,
    /// Circuit-switched call in progress.
    InCall,
    /// VoIP call in progress.
    InCommunication,
}

impl PhoneState {
    /// Whether a call (telephony or VoIP) is in progress.
    pub fn is_in_call(self) -> bool {
        matches!(self, PhoneState::InCall | PhoneState::InCommunication)
    }
}

/// Usage categories a forced configuration can be applied to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ForceUse {
    /// Voice communication routing.
    Communication,
    /// Media routing.
    Media,
    /// Capture routing.
    Record,
    /// System sounds.
    System,
}

/// Forced device configuration for a usage category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ForcedConfig {
    /// No override.
    #[default]
    None,
    /// Force the built-in speaker.
    Speaker,
    /// Force Bluetooth SCO.
    BtSco,
    /// Force Bluetooth A2DP.
    BtA2dp,
    /// Forbid Bluetooth A2DP.
    NoBtA2dp,
    /// Force wired accessory.
    WiredAccessory,
    /// System sounds enforced audible.
    SystemEnforced,
}

/// Currently available devices, queried by the engine when resolving a
/// strategy to a device mask.
#[derive(Debug, Clone, Copy, Default)]
pub struct Availability {
    /// Available output device kinds.
    pub output_devices: DeviceMask,
    /// Available input device kinds.
    pub input_devices: DeviceMask,
}

impl Availability {
    fn first_out(&self, wanted: DeviceMask) -> DeviceMask {
        let hit = self.output_devices & wanted;
        if hit.is_empty() {
            DeviceMask::empty()
        } else {
            DeviceMask::from_bits_truncate(1 << hit.bits().trailing_zeros())
        }
    }

    fn first_in(&self, wanted: DeviceMask) -> DeviceMask {
        let hit = self.input_devices & wanted;
        if hit.is_empty() {
            DeviceMask::empty()
        } else {
            DeviceMask::from_bits_truncate(1 << hit.bits().trailing_zeros())
        }
    }
}

/// Pluggable strategy engine.
///
/// Resolution methods are pure queries; phone state and forced usages are
/// the engine's own mutable state.
pub trait PolicyEngine {
    /// Strategy governing a stream type.
    fn strategy_for_stream(&self, stream: StreamType) -> Strategy;

    /// Strategy governing a set of request attributes.
    fn strategy_for_attributes(&self, attributes: &AudioAttributes) -> Strategy;

    /// Preferred device mask for a strategy under current availability.
    fn device_for_strategy(&self, strategy: Strategy, availability: &Availability) -> DeviceMask;

    /// Preferred device mask for a capture source under current availability.
    fn device_for_source(&self, source: CaptureSource, availability: &Availability) -> DeviceMask;

    /// Current telephony state.
    fn phone_state(&self) -> PhoneState;

    /// Updates the telephony state.
    ///
    /// # Errors
    /// Returns [`RoutingError::AlreadyInState`] when `state` is current.
    fn set_phone_state(&mut self, state: PhoneState) -> Result<()>;

    /// Forced configuration for a usage category.
    fn force_use(&self, usage: ForceUse) -> ForcedConfig;

    /// Updates the forced configuration for a usage category.
    ///
    /// # Errors
    /// Returns [`RoutingError::AlreadyInState`] when `config` is current.
    fn set_force_use(&mut self, usage: ForceUse, config: ForcedConfig) -> Result<()>;
}

/// Rule-based engine implementing the stock routing policy.
#[derive(Debug, Default)]
pub struct DefaultPolicyEngine {
    phone_state: PhoneState,
    force_communication: ForcedConfig,
    force_media: ForcedConfig,
    force_record: ForcedConfig,
    force_system: ForcedConfig,
}

impl DefaultPolicyEngine {
    /// Creates an engine with no call activity and no forced usages.
    pub fn new() -> Self {
        Self::default()
    }

    fn phone_device(&self, availability: &Availability) -> DeviceMask {
        if self.force_communication == ForcedConfig::BtSco {
            let sco = availability.first_out(DeviceMask::ALL_SCO_OUT);
            if !sco.is_empty() {
                return sco;
            }
        }
        if self.force_communication == ForcedConfig::Speaker {
            let speaker = availability.first_out(DeviceMask::SPEAKER);
            if !speaker.is_empty() {
                return speaker;
            }
        }
        for wanted in [
            DeviceMask::WIRED_HEADPHONE,
            DeviceMask::WIRED_HEADSET,
            DeviceMask::USB_HEADSET,
            DeviceMask::HEARING_AID,
            DeviceMask::EARPIECE,
            DeviceMask::SPEAKER,
        ] {
            let hit = availability.first_out(wanted);
            if !hit.is_empty() {
                return hit;
            }
        }
        DeviceMask::empty()
    }

    fn media_device(&self, availability: &Availability) -> DeviceMask {
        let a2dp_allowed = self.force_media != ForcedConfig::NoBtA2dp;
        if a2dp_allowed {
            let a2dp = availability.first_out(DeviceMask::ALL_A2DP_OUT);
            if !a2dp.is_empty() {
                return a2dp;
            }
        }
        for wanted in [
            DeviceMask::WIRED_HEADPHONE,
            DeviceMask::WIRED_HEADSET,
            DeviceMask::USB_HEADSET,
            DeviceMask::HEARING_AID,
            DeviceMask::HDMI,
            DeviceMask::SPEAKER,
            DeviceMask::STUB,
        ] {
            let hit = availability.first_out(wanted);
            if !hit.is_empty() {
                return hit;
            }
        }
        DeviceMask::empty()
    }

    fn sonification_device(&self, availability: &Availability) -> DeviceMask {
        if self.phone_state.is_in_call() {
            return self.phone_device(availability);
        }
        // ring on the speaker and on whatever media would use, so a worn
        // headset never masks an incoming call
        let speaker = availability.first_out(DeviceMask::SPEAKER);
        let media = self.media_device(availability);
        if DeviceMask::HEADSET_CLASS.intersects(media) {
            speaker | media
        } else {
            speaker
        }
    }
}

impl PolicyEngine for DefaultPolicyEngine {
    fn strategy_for_stream(&self, stream: StreamType) -> Strategy {
        match stream {
            StreamType::VoiceCall | StreamType::BluetoothSco => Strategy::Phone,
            StreamType::Ring | StreamType::Alarm => Strategy::Sonification,
            StreamType::Notification => Strategy::SonificationRespectful,
            StreamType::Dtmf => Strategy::Dtmf,
            StreamType::System | StreamType::Music => Strategy::Media,
            StreamType::EnforcedAudible => Strategy::EnforcedAudible,
            StreamType::Tts => Strategy::TransmittedThroughSpeaker,
            StreamType::Accessibility => Strategy::Accessibility,
            StreamType::Rerouting | StreamType::Patch => Strategy::Rerouting,
        }
    }

    fn strategy_for_attributes(&self, attributes: &AudioAttributes) -> Strategy {
        if attributes.flags.contains(AttributeFlags::AUDIBILITY_ENFORCED) {
            return Strategy::EnforcedAudible;
        }
        if attributes.flags.contains(AttributeFlags::BEACON) {
            return Strategy::TransmittedThroughSpeaker;
        }
        match attributes.usage {
            Usage::Media
            | Usage::Game
            | Usage::Assistant
            | Usage::AssistanceNavigationGuidance
            | Usage::AssistanceSonification
            | Usage::Unknown => Strategy::Media,
            Usage::VoiceCommunication => Strategy::Phone,
            Usage::VoiceCommunicationSignalling => Strategy::Dtmf,
            Usage::Alarm | Usage::NotificationRingtone => Strategy::Sonification,
            Usage::Notification | Usage::NotificationEvent => Strategy::SonificationRespectful,
            Usage::AssistanceAccessibility => Strategy::Accessibility,
            Usage::VirtualSource => Strategy::Rerouting,
        }
    }

    fn device_for_strategy(&self, strategy: Strategy, availability: &Availability) -> DeviceMask {
        match strategy {
            Strategy::Phone => self.phone_device(availability),
            Strategy::Media => self.media_device(availability),
            Strategy::Sonification => self.sonification_device(availability),
            Strategy::SonificationRespectful => self.sonification_device(availability),
            Strategy::Dtmf => {
                if self.phone_state.is_in_call() {
                    self.phone_device(availability)
                } else {
                    self.media_device(availability)
                }
            }
            Strategy::EnforcedAudible => {
                if self.force_system == ForcedConfig::SystemEnforced {
                    availability.first_out(DeviceMask::SPEAKER)
                } else {
                    self.sonification_device(availability)
                }
            }
            Strategy::TransmittedThroughSpeaker => availability.first_out(DeviceMask::SPEAKER),
            Strategy::Accessibility => {
                if self.phone_state.is_in_call() || self.phone_state == PhoneState::Ringtone {
                    self.phone_device(availability)
                } else {
                    self.media_device(availability)
                }
            }
            Strategy::Rerouting => {
                let submix = availability.first_out(DeviceMask::REMOTE_SUBMIX);
                if submix.is_empty() {
                    self.media_device(availability)
                } else {
                    submix
                }
            }
        }
    }

    fn device_for_source(&self, source: CaptureSource, availability: &Availability) -> DeviceMask {
        match source {
            CaptureSource::VoiceCall => availability.first_in(DeviceMask::TELEPHONY_RX),
            CaptureSource::FmTuner => availability.first_in(DeviceMask::FM_TUNER),
            CaptureSource::VoiceCommunication => {
                if self.force_communication == ForcedConfig::BtSco {
                    let sco = availability.first_in(DeviceMask::BLUETOOTH_SCO_MIC);
                    if !sco.is_empty() {
                        return sco;
                    }
                }
                for wanted in [
                    DeviceMask::WIRED_HEADSET_MIC,
                    DeviceMask::USB_MIC,
                    DeviceMask::BUILTIN_MIC,
                ] {
                    let hit = availability.first_in(wanted);
                    if !hit.is_empty() {
                        return hit;
                    }
                }
                DeviceMask::empty()
            }
            CaptureSource::Camcorder => {
                let back = availability.first_in(DeviceMask::BACK_MIC);
                if back.is_empty() {
                    availability.first_in(DeviceMask::BUILTIN_MIC)
                } else {
                    back
                }
            }
            CaptureSource::Default
            | CaptureSource::Mic
            | CaptureSource::VoiceRecognition
            | CaptureSource::Hotword => {
                if self.force_record == ForcedConfig::BtSco {
                    let sco = availability.first_in(DeviceMask::BLUETOOTH_SCO_MIC);
                    if !sco.is_empty() {
                        return sco;
                    }
                }
                for wanted in [
                    DeviceMask::WIRED_HEADSET_MIC,
                    DeviceMask::USB_MIC,
                    DeviceMask::BUILTIN_MIC,
                ] {
                    let hit = availability.first_in(wanted);
                    if !hit.is_empty() {
                        return hit;
                    }
                }
                DeviceMask::empty()
            }
        }
    }

    fn phone_state(&self) -> PhoneState {
        self.phone_state
    }

    fn set_phone_state(&mut self, state: PhoneState) -> Result<()> {
        if state == self.phone_state {
            return Err(RoutingError::AlreadyInState(format!(
                "phone state {state:?}"
            )));
        }
        self.phone_state = state;
        Ok(())
    }

    fn force_use(&self, usage: ForceUse) -> ForcedConfig {
        match usage {
            ForceUse::Communication => self.force_communication,
            ForceUse::Media => self.force_media,
            ForceUse::Record => self.force_record,
            ForceUse::System => self.force_system,
        }
    }

    fn set_force_use(&mut self, usage: ForceUse, config: ForcedConfig) -> Result<()> {
        let slot = match usage {
            ForceUse::Communication => &mut self.force_communication,
            ForceUse::Media => &mut self.force_media,
            ForceUse::Record => &mut self.force_record,
            ForceUse::System => &mut self.force_system,
        };
        if *slot == config {
            return Err(RoutingError::AlreadyInState(format!(
                "force use {usage:?} = {config:?}"
            )));
        }
        *slot = config;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn avail(out: DeviceMask, input: DeviceMask) -> Availability {
        Availability {
            output_devices: out,
            input_devices: input,
        }
    }

    #[test]
    fn media_prefers_a2dp_over_speaker() {
        let engine = DefaultPolicyEngine::new();
        let a = avail(
            DeviceMask::SPEAKER | DeviceMask::BLUETOOTH_A2DP,
            DeviceMask::empty(),
        );
        assert_eq!(
            engine.device_for_strategy(Strategy::Media, &a),
            DeviceMask::BLUETOOTH_A2DP
        );
    }

    #[test]
    fn force_no_a2dp_falls_back() {
        let mut engine = DefaultPolicyEngine::new();
        engine
            .set_force_use(ForceUse::Media, ForcedConfig::NoBtA2dp)
            .ok();
        let a = avail(
            DeviceMask::SPEAKER | DeviceMask::BLUETOOTH_A2DP,
            DeviceMask::empty(),
        );
        assert_eq!(
            engine.device_for_strategy(Strategy::Media, &a),
            DeviceMask::SPEAKER
        );
    }

    #[test]
    fn sonification_rings_speaker_and_headset() {
        let engine = DefaultPolicyEngine::new();
        let a = avail(
            DeviceMask::SPEAKER | DeviceMask::WIRED_HEADSET,
            DeviceMask::empty(),
        );
        assert_eq!(
            engine.device_for_strategy(Strategy::Sonification, &a),
            DeviceMask::SPEAKER | DeviceMask::WIRED_HEADSET
        );
    }

    #[test]
    fn in_call_sonification_follows_phone() {
        let mut engine = DefaultPolicyEngine::new();
        engine.set_phone_state(PhoneState::InCall).ok();
        let a = avail(
            DeviceMask::SPEAKER | DeviceMask::EARPIECE,
            DeviceMask::empty(),
        );
        assert_eq!(
            engine.device_for_strategy(Strategy::Sonification, &a),
            DeviceMask::EARPIECE
        );
    }

    #[test]
    fn redundant_state_changes_are_rejected() {
        let mut engine = DefaultPolicyEngine::new();
        assert!(engine.set_phone_state(PhoneState::Normal).is_err());
        assert!(engine.set_phone_state(PhoneState::InCall).is_ok());
        assert!(
            engine
                .set_force_use(ForceUse::Media, ForcedConfig::None)
                .is_err()
        );
    }

    #[test]
    fn hotword_routes_like_mic() {
        let engine = DefaultPolicyEngine::new();
        let a = avail(DeviceMask::empty(), DeviceMask::BUILTIN_MIC);
        assert_eq!(
            engine.device_for_source(CaptureSource::Hotword, &a),
            DeviceMask::BUILTIN_MIC
        );
    }
}
