//! On-disk configuration: tuning constants and the hardware catalog.

use std::{fs, path::Path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    device::DeviceMask,
    profile::{InputFlags, IoProfile, OutputFlags, SampleFormat, StreamFormat},
};

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        /// Path that failed.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The file is not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A device name is not recognized.
    #[error("unknown device name: {0}")]
    UnknownDevice(String),
    /// A stream flag name is not recognized.
    #[error("unknown flag name: {0}")]
    UnknownFlag(String),
    /// A sample format name is not recognized.
    #[error("unknown sample format: {0}")]
    UnknownFormat(String),
}

/// Policy tuning constants. Every field has a default matching stock
/// behavior, so a partial file only overrides what it names.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Tuning {
    /// Attenuation applied to notifications and system sounds while music
    /// plays on a headset-class device.
    pub headset_sonification_attenuation_db: f32,
    /// Sonification volume never drops below music volume plus this floor.
    pub sonification_music_floor_db: f32,
    /// On A2DP sinks, sonification stays within this many dB of music.
    pub a2dp_sonification_closeness_db: f32,
    /// In-call cap: streams stay within this headroom above voice volume.
    pub in_call_headroom_db: f32,
    /// Music counts as recently active for this long after it stops.
    pub music_stop_window_ms: u32,
    /// Duration of the blanket mute applied around a device change.
    pub temp_mute_duration_ms: u32,
    /// Deferral applied to touch sound volume changes.
    pub touch_sound_delay_ms: u32,
    /// The blanket mute waits this many output latencies before rerouting.
    pub latency_mute_factor: u32,
    /// Whether the platform supports concurrent capture without preemption.
    pub concurrent_capture: bool,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            headset_sonification_attenuation_db: -6.0,
            sonification_music_floor_db: -36.0,
            a2dp_sonification_closeness_db: 12.0,
            in_call_headroom_db: 3.0,
            music_stop_window_ms: 5000,
            temp_mute_duration_ms: 2000,
            touch_sound_delay_ms: 100,
            latency_mute_factor: 4,
            concurrent_capture: false,
        }
    }
}

/// One stream profile within a module.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProfileConfig {
    /// Profile name, unique within the module.
    pub name: String,
    /// Names of devices reachable from this profile.
    pub devices: Vec<String>,
    /// Stream flag names.
    pub flags: Vec<String>,
    /// Supported sample format names; empty means the mixer default.
    pub formats: Vec<String>,
    /// Supported sample rates; empty means the mixer default.
    pub sample_rates: Vec<u32>,
    /// Reported latency for outputs.
    pub latency_ms: u32,
    /// Maximum concurrently open streams; zero means unlimited.
    pub max_open_count: u32,
}

impl Default for ProfileConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            devices: Vec::new(),
            flags: Vec::new(),
            formats: Vec::new(),
            sample_rates: Vec::new(),
            latency_ms: 20,
            max_open_count: 0,
        }
    }
}

impl ProfileConfig {
    /// Resolves names into a runtime profile.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on an unknown device, flag, or format name.
    pub fn to_output_profile(&self) -> Result<IoProfile, ConfigError> {
        let mut flags = OutputFlags::empty();
        for name in &self.flags {
            flags |= output_flag_from_name(name)?;
        }
        Ok(IoProfile {
            name: self.name.clone(),
            supported_devices: parse_devices(&self.devices)?,
            output_flags: flags,
            input_flags: InputFlags::empty(),
            formats: self.stream_formats()?,
            latency_ms: self.latency_ms,
            max_open_count: self.max_open_count,
            open_count: 0,
        })
    }

    /// Resolves names into a runtime capture profile.
    ///
    /// # Errors
    /// Returns [`ConfigError`] on an unknown device, flag, or format name.
    pub fn to_input_profile(&self) -> Result<IoProfile, ConfigError> {
        let mut flags = InputFlags::empty();
        for name in &self.flags {
            flags |= input_flag_from_name(name)?;
        }
        Ok(IoProfile {
            name: self.name.clone(),
            supported_devices: parse_devices(&self.devices)?,
            output_flags: OutputFlags::empty(),
            input_flags: flags,
            formats: self.stream_formats()?,
            latency_ms: 0,
            max_open_count: self.max_open_count,
            open_count: 0,
        })
    }

    fn stream_formats(&self) -> Result<Vec<StreamFormat>, ConfigError> {
        if self.formats.is_empty() && self.sample_rates.is_empty() {
            return Ok(vec![StreamFormat::mixer_default()]);
        }
        let formats = if self.formats.is_empty() {
            vec![SampleFormat::Pcm16]
        } else {
            self.formats
                .iter()
                .map(|n| sample_format_from_name(n))
                .collect::<Result<Vec<_>, _>>()?
        };
        let rates = if self.sample_rates.is_empty() {
            vec![StreamFormat::mixer_default().sample_rate]
        } else {
            self.sample_rates.clone()
        };
        let mut out = Vec::new();
        for format in &formats {
            for &rate in &rates {
                out.push(StreamFormat {
                    sample_rate: rate,
                    channels: 2,
                    sample_format: *format,
                });
            }
        }
        Ok(out)
    }
}

/// One hardware module and its profiles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModuleConfig {
    /// Module name; "primary" marks the module holding the primary output.
    pub name: String,
    /// Output profiles.
    pub outputs: Vec<ProfileConfig>,
    /// Input profiles.
    pub inputs: Vec<ProfileConfig>,
    /// Output devices present from boot.
    pub attached_output_devices: Vec<String>,
    /// Input devices present from boot.
    pub attached_input_devices: Vec<String>,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Policy tuning constants.
    pub tuning: Tuning,
    /// Hardware catalog.
    #[serde(rename = "module")]
    pub modules: Vec<ModuleConfig>,
}

impl Config {
    /// Loads and parses a TOML configuration file.
    ///
    /// # Errors
    /// Returns [`ConfigError`] when the file cannot be read or parsed.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(toml::from_str(&text)?)
    }

    /// Built-in catalog for a phone-shaped device: a primary module with
    /// speaker, earpiece, and wired outputs plus a built-in microphone, and
    /// an A2DP module whose output opens on demand when a sink connects.
    pub fn default_catalog() -> Self {
        Self {
            tuning: Tuning::default(),
            modules: vec![
                ModuleConfig {
                    name: "primary".into(),
                    outputs: vec![
                        ProfileConfig {
                            name: "primary output".into(),
                            devices: vec![
                                "speaker".into(),
                                "earpiece".into(),
                                "wired_headset".into(),
                                "wired_headphone".into(),
                                "bluetooth_sco".into(),
                                "bluetooth_sco_headset".into(),
                                "telephony_tx".into(),
                            ],
                            flags: vec!["primary".into()],
                            ..ProfileConfig::default()
                        },
                        ProfileConfig {
                            name: "deep buffer".into(),
                            devices: vec![
                                "speaker".into(),
                                "wired_headset".into(),
                                "wired_headphone".into(),
                            ],
                            flags: vec!["deep_buffer".into()],
                            latency_ms: 40,
                            ..ProfileConfig::default()
                        },
                    ],
                    inputs: vec![
                        ProfileConfig {
                            name: "primary input".into(),
                            devices: vec![
                                "builtin_mic".into(),
                                "back_mic".into(),
                                "wired_headset_mic".into(),
                                "bluetooth_sco_mic".into(),
                                "telephony_rx".into(),
                            ],
                            flags: vec!["fast".into()],
                            latency_ms: 0,
                            ..ProfileConfig::default()
                        },
                        ProfileConfig {
                            name: "hotword input".into(),
                            devices: vec!["builtin_mic".into()],
                            flags: vec!["hw_hotword".into()],
                            latency_ms: 0,
                            ..ProfileConfig::default()
                        },
                    ],
                    attached_output_devices: vec!["speaker".into(), "earpiece".into()],
                    attached_input_devices: vec!["builtin_mic".into(), "back_mic".into()],
                },
                ModuleConfig {
                    name: "a2dp".into(),
                    outputs: vec![ProfileConfig {
                        name: "a2dp output".into(),
                        devices: vec![
                            "bluetooth_a2dp".into(),
                            "bluetooth_a2dp_headphones".into(),
                            "bluetooth_a2dp_speaker".into(),
                        ],
                        latency_ms: 100,
                        ..ProfileConfig::default()
                    }],
                    ..ModuleConfig::default()
                },
            ],
        }
    }
}

/// Resolves a list of device names into a mask.
///
/// # Errors
/// Returns [`ConfigError::UnknownDevice`] on the first unknown name.
pub fn parse_devices(names: &[String]) -> Result<DeviceMask, ConfigError> {
    let mut mask = DeviceMask::empty();
    for name in names {
        mask |= device_from_name(name)?;
    }
    Ok(mask)
}

fn device_from_name(name: &str) -> Result<DeviceMask, ConfigError> {
    let device = match name {
        "earpiece" => DeviceMask::EARPIECE,
        "speaker" => DeviceMask::SPEAKER,
        "wired_headset" => DeviceMask::WIRED_HEADSET,
        "wired_headphone" => DeviceMask::WIRED_HEADPHONE,
        "bluetooth_sco" => DeviceMask::BLUETOOTH_SCO,
        "bluetooth_sco_headset" => DeviceMask::BLUETOOTH_SCO_HEADSET,
        "bluetooth_sco_carkit" => DeviceMask::BLUETOOTH_SCO_CARKIT,
        "bluetooth_a2dp" => DeviceMask::BLUETOOTH_A2DP,
        "bluetooth_a2dp_headphones" => DeviceMask::BLUETOOTH_A2DP_HEADPHONES,
        "bluetooth_a2dp_speaker" => DeviceMask::BLUETOOTH_A2DP_SPEAKER,
        "hdmi" => DeviceMask::HDMI,
        "usb_headset" => DeviceMask::USB_HEADSET,
        "hearing_aid" => DeviceMask::HEARING_AID,
        "remote_submix" => DeviceMask::REMOTE_SUBMIX,
        "telephony_tx" => DeviceMask::TELEPHONY_TX,
        "stub" => DeviceMask::STUB,
        "builtin_mic" => DeviceMask::BUILTIN_MIC,
        "back_mic" => DeviceMask::BACK_MIC,
        "wired_headset_mic" => DeviceMask::WIRED_HEADSET_MIC,
        "bluetooth_sco_mic" => DeviceMask::BLUETOOTH_SCO_MIC,
        "usb_mic" => DeviceMask::USB_MIC,
        "remote_submix_capture" => DeviceMask::REMOTE_SUBMIX_CAPTURE,
        "telephony_rx" => DeviceMask::TELEPHONY_RX,
        "fm_tuner" => DeviceMask::FM_TUNER,
        other => return Err(ConfigError::UnknownDevice(other.to_owned())),
    };
    Ok(device)
}

fn output_flag_from_name(name: &str) -> Result<OutputFlags, ConfigError> {
    let flag = match name {
        "direct" => OutputFlags::DIRECT,
        "primary" => OutputFlags::PRIMARY,
        "fast" => OutputFlags::FAST,
        "deep_buffer" => OutputFlags::DEEP_BUFFER,
        "compress_offload" => OutputFlags::COMPRESS_OFFLOAD,
        "hw_av_sync" => OutputFlags::HW_AV_SYNC,
        "tts" => OutputFlags::TTS,
        "mmap_noirq" => OutputFlags::MMAP_NOIRQ,
        "voip_rx" => OutputFlags::VOIP_RX,
        "incall_music" => OutputFlags::INCALL_MUSIC,
        other => return Err(ConfigError::UnknownFlag(other.to_owned())),
    };
    Ok(flag)
}

fn input_flag_from_name(name: &str) -> Result<InputFlags, ConfigError> {
    let flag = match name {
        "fast" => InputFlags::FAST,
        "hw_hotword" => InputFlags::HW_HOTWORD,
        "mmap_noirq" => InputFlags::MMAP_NOIRQ,
        "voip_tx" => InputFlags::VOIP_TX,
        other => return Err(ConfigError::UnknownFlag(other.to_owned())),
    };
    Ok(flag)
}

fn sample_format_from_name(name: &str) -> Result<SampleFormat, ConfigError> {
    let format = match name {
        "pcm16" => SampleFormat::Pcm16,
        "pcm24" => SampleFormat::Pcm24,
        "pcm32" => SampleFormat::Pcm32,
        "pcm_float" => SampleFormat::PcmFloat,
        "mp3" => SampleFormat::Mp3,
        "aac" => SampleFormat::Aac,
        other => return Err(ConfigError::UnknownFormat(other.to_owned())),
    };
    Ok(format)
}
