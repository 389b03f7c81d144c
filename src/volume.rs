//! Volume curves: index-to-dB conversion per stream type and device class.

use crate::{client::StreamType, device::DeviceMask};

/// Attenuation applied when a stream is fully silent.
pub const MIN_VOLUME_DB: f32 = -96.0;

/// Device classes sharing one volume curve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCategory {
    /// Wired or wireless headsets and headphones.
    Headset,
    /// Built-in loudspeaker.
    Speaker,
    /// Handset earpiece.
    Earpiece,
    /// Externally amplified sinks (HDMI, submix, telephony).
    ExtMedia,
    /// Hearing aid sinks with their own gain stage.
    HearingAid,
}

impl DeviceCategory {
    /// Curve category for a device mask; multi-device masks are reduced to
    /// their volume-defining device first.
    pub fn from_device(device: DeviceMask) -> Self {
        let device = device.for_volume();
        if DeviceMask::HEADSET_CLASS.contains(device) {
            DeviceCategory::Headset
        } else if device == DeviceMask::EARPIECE {
            DeviceCategory::Earpiece
        } else if device == DeviceMask::HEARING_AID {
            DeviceCategory::HearingAid
        } else if (DeviceMask::HDMI | DeviceMask::REMOTE_SUBMIX | DeviceMask::TELEPHONY_TX)
            .contains(device)
        {
            DeviceCategory::ExtMedia
        } else {
            DeviceCategory::Speaker
        }
    }
}

/// Per-stream volume curves.
pub trait VolumeCurves {
    /// Attenuation in dB for a volume index on a device class. Index zero is
    /// full silence when the stream's minimum index is zero.
    fn volume_db(&self, stream: StreamType, category: DeviceCategory, index: u32) -> f32;

    /// Inclusive index range of a stream's volume slider.
    fn index_range(&self, stream: StreamType) -> (u32, u32);

    /// Whether policy may mute the stream at all.
    fn can_be_muted(&self, stream: StreamType) -> bool;

    /// Clamps an index into the stream's range.
    fn clamp_index(&self, stream: StreamType, index: u32) -> u32 {
        let (min, max) = self.index_range(stream);
        index.clamp(min, max)
    }
}

/// Translates a volume index between the ranges of two streams, preserving
/// the relative position on the slider.
pub fn rescale_volume_index(
    curves: &dyn VolumeCurves,
    index: u32,
    from: StreamType,
    to: StreamType,
) -> u32 {
    let (src_min, src_max) = curves.index_range(from);
    let (dst_min, dst_max) = curves.index_range(to);
    if index <= src_min {
        return dst_min;
    }
    if index >= src_max {
        return dst_max;
    }
    let src_span = src_max - src_min;
    let dst_span = dst_max - dst_min;
    if src_span == 0 {
        return dst_min;
    }
    dst_min + ((index - src_min) * dst_span + src_span / 2) / src_span
}

/// Straight-line curves: 0 dB at the top of the slider, a per-category floor
/// at the bottom, interpolated linearly in between.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearVolumeCurves;

impl LinearVolumeCurves {
    fn floor_db(category: DeviceCategory) -> f32 {
        match category {
            DeviceCategory::Headset => -60.0,
            DeviceCategory::Speaker | DeviceCategory::Earpiece => -48.0,
            DeviceCategory::ExtMedia => -36.0,
            DeviceCategory::HearingAid => -24.0,
        }
    }
}

impl VolumeCurves for LinearVolumeCurves {
    fn volume_db(&self, stream: StreamType, category: DeviceCategory, index: u32) -> f32 {
        let (min, max) = self.index_range(stream);
        if index == 0 && min == 0 {
            return MIN_VOLUME_DB;
        }
        let index = index.clamp(min.max(1), max);
        let floor = Self::floor_db(category);
        let span = max.saturating_sub(min.max(1));
        if span == 0 {
            return 0.0;
        }
        floor + (index - min.max(1)) as f32 * (0.0 - floor) / span as f32
    }

    fn index_range(&self, stream: StreamType) -> (u32, u32) {
        match stream {
            StreamType::VoiceCall | StreamType::BluetoothSco => (1, 7),
            StreamType::Ring
            | StreamType::System
            | StreamType::Notification
            | StreamType::EnforcedAudible => (0, 7),
            StreamType::Alarm => (1, 7),
            _ => (0, 15),
        }
    }

    fn can_be_muted(&self, stream: StreamType) -> bool {
        stream != StreamType::EnforcedAudible
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categories_follow_volume_defining_device() {
        assert_eq!(
            DeviceCategory::from_device(DeviceMask::WIRED_HEADSET),
            DeviceCategory::Headset
        );
        assert_eq!(
            DeviceCategory::from_device(DeviceMask::SPEAKER | DeviceMask::HDMI),
            DeviceCategory::Speaker
        );
        assert_eq!(
            DeviceCategory::from_device(DeviceMask::HDMI),
            DeviceCategory::ExtMedia
        );
        assert_eq!(
            DeviceCategory::from_device(DeviceMask::empty()),
            DeviceCategory::Speaker
        );
    }

    #[test]
    fn curve_endpoints() {
        let curves = LinearVolumeCurves;
        let (min, max) = curves.index_range(StreamType::Music);
        assert_eq!(min, 0);
        assert_eq!(
            curves.volume_db(StreamType::Music, DeviceCategory::Speaker, max),
            0.0
        );
        assert_eq!(
            curves.volume_db(StreamType::Music, DeviceCategory::Speaker, 0),
            MIN_VOLUME_DB
        );
        // voice call never reaches full silence through its curve
        let db = curves.volume_db(StreamType::VoiceCall, DeviceCategory::Earpiece, 1);
        assert!(db > MIN_VOLUME_DB);
    }

    #[test]
    fn rescale_preserves_slider_position() {
        let curves = LinearVolumeCurves;
        // music 0..15 onto ring 0..7 and back
        let down = rescale_volume_index(&curves, 15, StreamType::Music, StreamType::Ring);
        assert_eq!(down, 7);
        let up = rescale_volume_index(&curves, 7, StreamType::Ring, StreamType::Music);
        assert_eq!(up, 15);
        let mid = rescale_volume_index(&curves, 8, StreamType::Music, StreamType::Ring);
        assert!((3..=4).contains(&mid));
    }

    #[test]
    fn enforced_audible_cannot_be_muted() {
        let curves = LinearVolumeCurves;
        assert!(!curves.can_be_muted(StreamType::EnforcedAudible));
        assert!(curves.can_be_muted(StreamType::Music));
    }
}
