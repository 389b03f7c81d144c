//! Hardware stream profiles and format descriptions.

use bitflags::bitflags;

use crate::device::DeviceMask;

bitflags! {
    /// Flags qualifying an output stream or output profile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputFlags: u32 {
        /// Mixer-bypass stream; limited in concurrent instances.
        const DIRECT = 1 << 0;
        /// The module's primary output; exactly one exists per engine.
        const PRIMARY = 1 << 1;
        /// Low-latency fast path.
        const FAST = 1 << 2;
        /// Large buffers traded for power.
        const DEEP_BUFFER = 1 << 3;
        /// Compressed offload; implies DIRECT.
        const COMPRESS_OFFLOAD = 1 << 4;
        /// Hardware A/V sync; implies DIRECT, cannot fall back to mixed.
        const HW_AV_SYNC = 1 << 5;
        /// Beacon/system-announcement path.
        const TTS = 1 << 6;
        /// Memory-mapped no-IRQ stream.
        const MMAP_NOIRQ = 1 << 7;
        /// Downlink path for voice over IP.
        const VOIP_RX = 1 << 8;
        /// Music injected into an active call.
        const INCALL_MUSIC = 1 << 9;
    }

    /// Flags qualifying an input stream or input profile.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputFlags: u32 {
        /// Low-latency fast path.
        const FAST = 1 << 0;
        /// Hardware hotword detection path.
        const HW_HOTWORD = 1 << 1;
        /// Memory-mapped no-IRQ stream.
        const MMAP_NOIRQ = 1 << 2;
        /// Uplink path for voice over IP.
        const VOIP_TX = 1 << 3;
    }
}

/// Audio sample format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleFormat {
    /// 16-bit signed PCM.
    Pcm16,
    /// 24-bit signed PCM.
    Pcm24,
    /// 32-bit signed PCM.
    Pcm32,
    /// 32-bit float PCM.
    PcmFloat,
    /// Compressed MP3.
    Mp3,
    /// Compressed AAC.
    Aac,
}

impl SampleFormat {
    /// Whether the format is linear PCM (mixable).
    pub fn is_linear_pcm(self) -> bool {
        matches!(
            self,
            SampleFormat::Pcm16 | SampleFormat::Pcm24 | SampleFormat::Pcm32 | SampleFormat::PcmFloat
        )
    }

    fn depth(self) -> u32 {
        match self {
            SampleFormat::Pcm16 => 16,
            SampleFormat::Pcm24 => 24,
            SampleFormat::Pcm32 | SampleFormat::PcmFloat => 32,
            SampleFormat::Mp3 | SampleFormat::Aac => 0,
        }
    }
}

/// Stream format negotiated with the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    /// Sample rate in Hz.
    pub sample_rate: u32,
    /// Number of channels.
    pub channels: u8,
    /// Sample format.
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    /// Stereo 48 kHz 16-bit PCM, the mixer's native format.
    pub fn mixer_default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            sample_format: SampleFormat::Pcm16,
        }
    }
}

/// Whether `candidate` is a closer match to `requested` than `best`.
///
/// Exact format wins outright; otherwise PCM candidates are ranked by bit
/// depth, preferring the smallest depth that still covers the request.
pub fn is_better_format_match(
    candidate: SampleFormat,
    best: Option<SampleFormat>,
    requested: SampleFormat,
) -> bool {
    if candidate == requested {
        return true;
    }
    let Some(best) = best else {
        return candidate.is_linear_pcm();
    };
    if best == requested || !candidate.is_linear_pcm() {
        return false;
    }
    let wanted = requested.depth();
    let rank = |f: SampleFormat| {
        let d = f.depth();
        if d >= wanted { d - wanted } else { 100 + (wanted - d) }
    };
    rank(candidate) < rank(best)
}

/// Capability description of one openable hardware stream.
///
/// Built by the external catalog loader; the engine only matches against it.
#[derive(Debug, Clone)]
pub struct IoProfile {
    /// Profile name, unique within its module.
    pub name: String,
    /// Devices reachable through streams opened from this profile.
    pub supported_devices: DeviceMask,
    /// Output flags (empty for input profiles).
    pub output_flags: OutputFlags,
    /// Input flags (empty for output profiles).
    pub input_flags: InputFlags,
    /// Formats the hardware accepts.
    pub formats: Vec<StreamFormat>,
    /// Reported stream latency.
    pub latency_ms: u32,
    /// Maximum concurrently open streams (0 = unlimited).
    pub max_open_count: u32,
    /// Streams currently open from this profile.
    pub open_count: u32,
}

impl IoProfile {
    /// Whether another stream may be opened from this profile.
    pub fn can_open_new_stream(&self) -> bool {
        self.max_open_count == 0 || self.open_count < self.max_open_count
    }

    /// Whether the profile can serve `device` with `format` and all
    /// requested output `flags`.
    pub fn is_compatible_output(
        &self,
        device: DeviceMask,
        format: Option<StreamFormat>,
        flags: OutputFlags,
    ) -> bool {
        if !self.supported_devices.intersects(device) {
            return false;
        }
        if !self.output_flags.contains(flags) {
            return false;
        }
        match format {
            Some(f) => self.formats.iter().any(|have| *have == f),
            None => true,
        }
    }

    /// Whether the profile can serve capture from `device` with `format`.
    pub fn is_compatible_input(
        &self,
        device: DeviceMask,
        format: Option<StreamFormat>,
        flags: InputFlags,
    ) -> bool {
        if !self.supported_devices.intersects(device) {
            return false;
        }
        if !self.input_flags.contains(flags) {
            return false;
        }
        match format {
            Some(f) => self.formats.iter().any(|have| *have == f),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile(devices: DeviceMask, flags: OutputFlags) -> IoProfile {
        IoProfile {
            name: "test".into(),
            supported_devices: devices,
            output_flags: flags,
            input_flags: InputFlags::empty(),
            formats: vec![StreamFormat::mixer_default()],
            latency_ms: 20,
            max_open_count: 1,
            open_count: 0,
        }
    }

    #[test]
    fn compatibility_requires_device_and_flags() {
        let p = profile(DeviceMask::SPEAKER, OutputFlags::PRIMARY);
        assert!(p.is_compatible_output(DeviceMask::SPEAKER, None, OutputFlags::empty()));
        assert!(!p.is_compatible_output(DeviceMask::HDMI, None, OutputFlags::empty()));
        assert!(!p.is_compatible_output(DeviceMask::SPEAKER, None, OutputFlags::DIRECT));
    }

    #[test]
    fn open_count_limits() {
        let mut p = profile(DeviceMask::SPEAKER, OutputFlags::DIRECT);
        assert!(p.can_open_new_stream());
        p.open_count = 1;
        assert!(!p.can_open_new_stream());
        p.max_open_count = 0;
        assert!(p.can_open_new_stream());
    }

    #[test]
    fn format_match_prefers_exact_then_closest_depth() {
        let req = SampleFormat::Pcm24;
        assert!(is_better_format_match(SampleFormat::Pcm24, Some(SampleFormat::Pcm32), req));
        assert!(is_better_format_match(SampleFormat::Pcm32, Some(SampleFormat::Pcm16), req));
        assert!(!is_better_format_match(SampleFormat::Pcm16, Some(SampleFormat::Pcm32), req));
        assert!(!is_better_format_match(SampleFormat::Mp3, Some(SampleFormat::Pcm16), req));
    }
}
