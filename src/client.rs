//! Per-request session and client model.

use bitflags::bitflags;

use crate::{
    device::DeviceMask,
    profile::{InputFlags, OutputFlags},
};

/// Unique client port identifier, monotonically assigned by the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(pub u32);

/// Client session identifier, shared by requests of one logical session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u32);

/// Owning process identity of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(pub u32);

/// Stream types carrying playback volume and mute policy.
///
/// The first [`StreamType::POLICY_COUNT`] variants participate in volume
/// and mute bookkeeping; the trailing ones are internal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamType {
    /// Telephony voice path.
    VoiceCall,
    /// System sounds.
    System,
    /// Ringtone.
    Ring,
    /// Media and music playback.
    Music,
    /// Alarm clock.
    Alarm,
    /// Notifications.
    Notification,
    /// Bluetooth SCO voice path.
    BluetoothSco,
    /// Sounds that must stay audible (camera shutter in some regions).
    EnforcedAudible,
    /// Dialer key feedback.
    Dtmf,
    /// Transmitted-through-speaker announcements (beacon).
    Tts,
    /// Accessibility prompts.
    Accessibility,
    /// Rerouted (policy mix) playback.
    Rerouting,
    /// Internal stream backing a software patch.
    Patch,
}

impl StreamType {
    /// Number of stream types subject to volume/mute policy.
    pub const POLICY_COUNT: usize = 11;
    /// Total number of stream types.
    pub const COUNT: usize = 13;

    /// All stream types, in policy order.
    pub const ALL: [StreamType; Self::COUNT] = [
        StreamType::VoiceCall,
        StreamType::System,
        StreamType::Ring,
        StreamType::Music,
        StreamType::Alarm,
        StreamType::Notification,
        StreamType::BluetoothSco,
        StreamType::EnforcedAudible,
        StreamType::Dtmf,
        StreamType::Tts,
        StreamType::Accessibility,
        StreamType::Rerouting,
        StreamType::Patch,
    ];

    /// The stream types subject to volume/mute policy.
    pub fn policy_streams() -> impl Iterator<Item = StreamType> {
        Self::ALL.into_iter().take(Self::POLICY_COUNT)
    }

    /// Stable index for per-stream bookkeeping arrays.
    pub fn index(self) -> usize {
        self as usize
    }
}

/// Capture sources, ordered by routing intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CaptureSource {
    /// No explicit source; resolved like [`CaptureSource::Mic`].
    Default,
    /// Primary microphone capture.
    Mic,
    /// Uplink+downlink voice call capture.
    VoiceCall,
    /// Two-way communication (VoIP).
    VoiceCommunication,
    /// Speech recognition.
    VoiceRecognition,
    /// Camcorder microphone.
    Camcorder,
    /// Always-on keyphrase detection.
    Hotword,
    /// FM tuner capture.
    FmTuner,
}

impl CaptureSource {
    /// Arbitration priority; higher wins device selection on a shared input.
    pub fn priority(self) -> u8 {
        match self {
            CaptureSource::VoiceCommunication => 7,
            CaptureSource::VoiceCall => 6,
            CaptureSource::Camcorder => 5,
            CaptureSource::VoiceRecognition => 4,
            CaptureSource::Mic => 3,
            CaptureSource::FmTuner => 2,
            CaptureSource::Hotword => 1,
            CaptureSource::Default => 0,
        }
    }
}

bitflags! {
    /// Behavioral flags carried by audio attributes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AttributeFlags: u32 {
        /// Playback must not be muted by policy.
        const AUDIBILITY_ENFORCED = 1 << 0;
        /// Beacon / transmitted-through-speaker announcement.
        const BEACON = 1 << 1;
        /// Routed over Bluetooth SCO.
        const SCO = 1 << 2;
        /// Hardware A/V sync required.
        const HW_AV_SYNC = 1 << 3;
        /// Low latency requested.
        const LOW_LATENCY = 1 << 4;
    }
}

/// Intended use of a playback request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    /// Unspecified; treated as media.
    Unknown,
    /// Music and media.
    Media,
    /// Two-way voice communication.
    VoiceCommunication,
    /// In-band signalling for communication (DTMF).
    VoiceCommunicationSignalling,
    /// Alarm clock.
    Alarm,
    /// Generic notification.
    Notification,
    /// Incoming call ringtone.
    NotificationRingtone,
    /// Notification for a communication event.
    NotificationEvent,
    /// Accessibility prompts.
    AssistanceAccessibility,
    /// Navigation guidance prompts.
    AssistanceNavigationGuidance,
    /// UI sonification (touch sounds).
    AssistanceSonification,
    /// Game audio.
    Game,
    /// Virtual source for policy rerouting.
    VirtualSource,
    /// Voice assistant responses.
    Assistant,
}

/// Request attributes carried by a playback client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioAttributes {
    /// Intended use.
    pub usage: Usage,
    /// Behavioral flags.
    pub flags: AttributeFlags,
}

impl AudioAttributes {
    /// Attributes for a plain usage with no flags.
    pub fn for_usage(usage: Usage) -> Self {
        Self {
            usage,
            flags: AttributeFlags::empty(),
        }
    }

    /// Stream type implied by these attributes. Flags take precedence over
    /// usage so enforced/beacon/SCO requests land on their dedicated streams.
    pub fn stream_type(&self) -> StreamType {
        if self.flags.contains(AttributeFlags::AUDIBILITY_ENFORCED) {
            return StreamType::EnforcedAudible;
        }
        if self.flags.contains(AttributeFlags::SCO) {
            return StreamType::BluetoothSco;
        }
        if self.flags.contains(AttributeFlags::BEACON) {
            return StreamType::Tts;
        }
        match self.usage {
            Usage::Media | Usage::Game | Usage::Assistant | Usage::Unknown => StreamType::Music,
            Usage::VoiceCommunication => StreamType::VoiceCall,
            Usage::VoiceCommunicationSignalling => StreamType::Dtmf,
            Usage::Alarm => StreamType::Alarm,
            Usage::NotificationRingtone => StreamType::Ring,
            Usage::Notification | Usage::NotificationEvent => StreamType::Notification,
            Usage::AssistanceAccessibility => StreamType::Accessibility,
            Usage::AssistanceNavigationGuidance => StreamType::Music,
            Usage::AssistanceSonification => StreamType::System,
            Usage::VirtualSource => StreamType::Rerouting,
        }
    }
}

/// Playback client attached to one output descriptor.
#[derive(Debug, Clone)]
pub struct TrackClient {
    /// Unique port id.
    pub port: PortId,
    /// Owning process.
    pub uid: Uid,
    /// Session this request belongs to.
    pub session: SessionId,
    /// Request attributes.
    pub attributes: AudioAttributes,
    /// Stream type derived from the attributes.
    pub stream: StreamType,
    /// Output flags granted at stream selection.
    pub flags: OutputFlags,
    /// Explicit routing request, if any.
    pub preferred_device: Option<DeviceMask>,
    /// Whether playback is started.
    pub active: bool,
}

/// Capture client attached to one input descriptor.
#[derive(Debug, Clone)]
pub struct RecordClient {
    /// Unique port id.
    pub port: PortId,
    /// Owning process.
    pub uid: Uid,
    /// Session this request belongs to.
    pub session: SessionId,
    /// Capture source.
    pub source: CaptureSource,
    /// Input flags granted at stream selection.
    pub flags: InputFlags,
    /// Explicit routing request, if any.
    pub preferred_device: Option<DeviceMask>,
    /// Whether capture is started.
    pub active: bool,
    /// Whether the client receives silence (background capture).
    pub silenced: bool,
}

/// Client driving a device-to-device software bridge.
#[derive(Debug, Clone)]
pub struct SourceClient {
    /// Unique port id.
    pub port: PortId,
    /// Owning process.
    pub uid: Uid,
    /// Session this request belongs to.
    pub session: SessionId,
    /// Source device of the bridge.
    pub source_device: DeviceMask,
    /// Source device address.
    pub source_address: String,
    /// Attributes deciding the sink-side routing.
    pub attributes: AudioAttributes,
    /// Patch currently realizing the bridge, if connected.
    pub patch: Option<crate::patch::PatchHandle>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_usage_for_stream_type() {
        let attr = AudioAttributes {
            usage: Usage::Media,
            flags: AttributeFlags::AUDIBILITY_ENFORCED,
        };
        assert_eq!(attr.stream_type(), StreamType::EnforcedAudible);

        let attr = AudioAttributes {
            usage: Usage::Media,
            flags: AttributeFlags::BEACON,
        };
        assert_eq!(attr.stream_type(), StreamType::Tts);
    }

    #[test]
    fn usage_maps_to_expected_streams() {
        assert_eq!(
            AudioAttributes::for_usage(Usage::NotificationRingtone).stream_type(),
            StreamType::Ring
        );
        assert_eq!(
            AudioAttributes::for_usage(Usage::VoiceCommunication).stream_type(),
            StreamType::VoiceCall
        );
        assert_eq!(
            AudioAttributes::for_usage(Usage::Game).stream_type(),
            StreamType::Music
        );
    }

    #[test]
    fn voice_communication_outranks_hotword() {
        assert!(CaptureSource::VoiceCommunication.priority() > CaptureSource::Mic.priority());
        assert!(CaptureSource::Mic.priority() > CaptureSource::Hotword.priority());
    }
}
