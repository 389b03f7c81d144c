//! End-to-end routing scenarios against the recording transport.

use std::io::Write;

use soundpath::{
    client::{AudioAttributes, SessionId, Uid, Usage},
    config::{Config, ProfileConfig},
    engine::{ForceUse, ForcedConfig, PhoneState, Strategy},
    manager::{ConcurrencyKind, InputRequest, OutputRequest, RoutingManager},
    patch::{PatchEndpoint, PatchSpec},
    profile::{InputFlags, OutputFlags, SampleFormat, StreamFormat},
    transport::TransportCommand,
    volume::{rescale_volume_index, LinearVolumeCurves, VolumeCurves},
    CaptureSource, DefaultPolicyEngine, DeviceMask, FakeTransport, RoutingError, StreamType,
};

fn manager() -> RoutingManager<FakeTransport> {
    match RoutingManager::new(
        Config::default_catalog(),
        Box::new(DefaultPolicyEngine::new()),
        Box::new(LinearVolumeCurves),
        FakeTransport::new(),
    ) {
        Ok(m) => m,
        Err(e) => panic!("manager construction failed: {e}"),
    }
}

fn media_request(session: u32) -> OutputRequest {
    OutputRequest {
        attributes: AudioAttributes::for_usage(Usage::Media),
        session: SessionId(session),
        uid: Uid(10_100),
        format: None,
        flags: OutputFlags::empty(),
        preferred_device: None,
    }
}

#[test]
fn routed_device_always_within_supported_set() {
    let mut m = manager();
    let Ok((_, port)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(port).ok();
    for device in [
        DeviceMask::WIRED_HEADSET,
        DeviceMask::WIRED_HEADPHONE,
        DeviceMask::BLUETOOTH_SCO_HEADSET,
    ] {
        m.set_device_connection_state(device, "", true).ok();
        for desc in m.outputs().iter() {
            assert!(
                desc.supported_devices.contains(desc.device()),
                "output {:?} routed outside its reachable set",
                desc.io
            );
        }
    }
}

#[test]
fn headset_connect_moves_active_music_with_one_patch() {
    let mut m = manager();
    let Ok((io, port)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(port).ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::SPEAKER)
    );

    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::WIRED_HEADSET)
    );

    // rerouting superseded the old connection in place instead of stacking
    // a second patch on the stream
    let updated_in_place = m
        .transport()
        .filter(|c| matches!(c, TransportCommand::CreatePatch { existing: Some(_), .. }))
        .count();
    assert!(updated_in_place > 0);
    let patches_on_stream = m
        .outputs()
        .iter()
        .filter(|d| d.io == io)
        .filter_map(|d| d.patch())
        .count();
    assert_eq!(patches_on_stream, 1);
}

#[test]
fn device_change_while_active_mutes_across_the_transition() {
    let mut m = manager();
    let Ok((_, port)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(port).ok();
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();

    // the blanket mute drives music to silence immediately and schedules
    // the restore behind a deferral
    let mut saw_mute = false;
    let mut saw_deferred_restore = false;
    for command in &m.transport().commands {
        if let TransportCommand::SetStreamVolume {
            stream: StreamType::Music,
            volume_db,
            delay_ms,
            ..
        } = command
        {
            if *volume_db <= -90.0 && *delay_ms == 0 {
                saw_mute = true;
            }
            if saw_mute && *volume_db > -90.0 && *delay_ms > 0 {
                saw_deferred_restore = true;
            }
        }
    }
    assert!(saw_mute);
    assert!(saw_deferred_restore);
}

#[test]
fn ringtone_reaches_speaker_and_worn_headset() {
    let mut m = manager();
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();
    let request = OutputRequest {
        attributes: AudioAttributes::for_usage(Usage::NotificationRingtone),
        session: SessionId(7),
        uid: Uid(1000),
        format: None,
        flags: OutputFlags::empty(),
        preferred_device: None,
    };
    let Ok((io, port)) = m.get_output_for_attributes(&request) else {
        panic!("selection failed");
    };
    m.start_output(port).ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::SPEAKER | DeviceMask::WIRED_HEADSET)
    );
}

#[test]
fn call_lifecycle_routes_voice_and_restores_media() {
    let mut m = manager();
    let Ok((io, port)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(port).ok();

    m.set_phone_state(PhoneState::InCall).ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::EARPIECE)
    );
    m.set_force_use(ForceUse::Communication, ForcedConfig::Speaker)
        .ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::SPEAKER)
    );

    m.set_force_use(ForceUse::Communication, ForcedConfig::None)
        .ok();
    m.set_phone_state(PhoneState::Normal).ok();
    assert_eq!(
        m.outputs().get(io).map(|d| d.device()),
        Some(DeviceMask::SPEAKER)
    );
    assert_eq!(m.device_for_strategy(Strategy::Media), DeviceMask::SPEAKER);
}

#[test]
fn external_patch_survives_policy_reselection() {
    let mut m = manager();
    let Ok((_, music)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(music).ok();
    let Some(primary) = m.primary_output() else {
        panic!("no primary output");
    };
    let spec = PatchSpec::default()
        .with_source(PatchEndpoint::stream(primary, StreamType::Patch))
        .with_sink(PatchEndpoint::device(
            DeviceMask::EARPIECE,
            soundpath::device::ModuleId(0),
        ));
    let handle = match m.create_external_patch(&spec, Uid(10_500)) {
        Ok(h) => h,
        Err(e) => panic!("external patch failed: {e}"),
    };
    assert_eq!(
        m.outputs().get(primary).map(|d| d.device()),
        Some(DeviceMask::EARPIECE)
    );

    // device churn does not steal an externally pinned output
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();
    assert_eq!(
        m.outputs().get(primary).map(|d| d.device()),
        Some(DeviceMask::EARPIECE)
    );

    m.release_external_patch(handle).ok();
    assert_eq!(
        m.outputs().get(primary).map(|d| d.device()),
        Some(DeviceMask::WIRED_HEADSET)
    );
}

#[test]
fn capture_conflict_and_recovery() {
    let mut m = manager();
    let mic = InputRequest {
        source: CaptureSource::Mic,
        session: SessionId(1),
        uid: Uid(10_200),
        format: None,
        flags: InputFlags::empty(),
        preferred_device: None,
    };
    let Ok((_, first)) = m.get_input_for_attributes(&mic) else {
        panic!("selection failed");
    };
    m.start_input(first).ok();

    let recognizer = InputRequest {
        source: CaptureSource::VoiceRecognition,
        session: SessionId(2),
        uid: Uid(10_201),
        format: None,
        flags: InputFlags::FAST,
        preferred_device: None,
    };
    let Ok((_, second)) = m.get_input_for_attributes(&recognizer) else {
        panic!("selection failed");
    };
    assert!(m.start_input(second).is_err());
    assert!(m.is_source_active(CaptureSource::Mic));

    // once the first capture stops, the second may start
    m.stop_input(first).ok();
    assert!(m.start_input(second).is_ok());
    assert!(m.is_source_active(CaptureSource::VoiceRecognition));
}

#[test]
fn repeated_volume_application_is_idempotent() {
    let mut m = manager();
    m.set_stream_volume_index(StreamType::Music, DeviceMask::SPEAKER, 12)
        .ok();
    m.transport_mut().clear();
    m.set_stream_volume_index(StreamType::Music, DeviceMask::SPEAKER, 12)
        .ok();
    let new_volume_commands = m
        .transport()
        .filter(|c| matches!(c, TransportCommand::SetStreamVolume { .. }))
        .count();
    assert_eq!(new_volume_commands, 0);
}

#[test]
fn volume_rescale_round_trips_at_the_extremes() {
    let curves = LinearVolumeCurves;
    for stream in [StreamType::Ring, StreamType::Alarm, StreamType::VoiceCall] {
        let (min, max) = curves.index_range(stream);
        let up = rescale_volume_index(&curves, max, stream, StreamType::Music);
        let back = rescale_volume_index(&curves, up, StreamType::Music, stream);
        assert_eq!(back, max);
        let down = rescale_volume_index(&curves, min, stream, StreamType::Music);
        let back = rescale_volume_index(&curves, down, StreamType::Music, stream);
        assert_eq!(back, min);
    }
}

#[test]
fn catalog_loads_from_toml_file() {
    let mut file = match tempfile::NamedTempFile::new() {
        Ok(f) => f,
        Err(e) => panic!("tempfile failed: {e}"),
    };
    let toml = r#"
        [tuning]
        concurrent_capture = true

        [[module]]
        name = "primary"
        attached_output_devices = ["speaker"]
        attached_input_devices = ["builtin_mic"]

        [[module.outputs]]
        name = "primary output"
        devices = ["speaker", "wired_headset"]
        flags = ["primary"]

        [[module.inputs]]
        name = "mic"
        devices = ["builtin_mic"]
    "#;
    if let Err(e) = file.write_all(toml.as_bytes()) {
        panic!("write failed: {e}");
    }
    let config = match Config::load(file.path()) {
        Ok(c) => c,
        Err(e) => panic!("load failed: {e}"),
    };
    assert!(config.tuning.concurrent_capture);

    let m = RoutingManager::new(
        config,
        Box::new(DefaultPolicyEngine::new()),
        Box::new(LinearVolumeCurves),
        FakeTransport::new(),
    );
    let Ok(m) = m else {
        panic!("manager from file config failed");
    };
    assert!(m.primary_output().is_some());
    assert_eq!(m.available_input_devices(), DeviceMask::BUILTIN_MIC);
}

#[test]
fn hotword_against_real_capture_is_a_plain_conflict() {
    let mut m = manager();
    let mic = InputRequest {
        source: CaptureSource::Mic,
        session: SessionId(1),
        uid: Uid(10_200),
        format: None,
        flags: InputFlags::empty(),
        preferred_device: None,
    };
    let Ok((_, mic_port)) = m.get_input_for_attributes(&mic) else {
        panic!("selection failed");
    };
    m.start_input(mic_port).ok();

    // the detector loses to an ordinary capture; it is not the hotword
    // exclusion, which only covers hotword-vs-hotword preemption
    let hotword = InputRequest {
        source: CaptureSource::Hotword,
        session: SessionId(2),
        uid: Uid(10_201),
        format: None,
        flags: InputFlags::HW_HOTWORD,
        preferred_device: None,
    };
    let Ok((_, hot_port)) = m.get_input_for_attributes(&hotword) else {
        panic!("selection failed");
    };
    assert!(matches!(
        m.start_input(hot_port),
        Err(RoutingError::CaptureConflict(ConcurrencyKind::Capture))
    ));
    assert!(m.is_source_active(CaptureSource::Mic));
}

fn catalog_with_offload() -> Config {
    let mut config = Config::default_catalog();
    config.modules[0].outputs.push(ProfileConfig {
        name: "offload".into(),
        devices: vec!["wired_headset".into(), "wired_headphone".into()],
        flags: vec!["direct".into(), "compress_offload".into()],
        formats: vec!["mp3".into()],
        latency_ms: 60,
        max_open_count: 1,
        ..ProfileConfig::default()
    });
    config
}

#[test]
fn direct_stream_is_shared_per_session_and_dies_with_its_device() {
    let mut m = match RoutingManager::new(
        catalog_with_offload(),
        Box::new(DefaultPolicyEngine::new()),
        Box::new(LinearVolumeCurves),
        FakeTransport::new(),
    ) {
        Ok(m) => m,
        Err(e) => panic!("manager construction failed: {e}"),
    };
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();

    let compressed = StreamFormat {
        sample_rate: 48_000,
        channels: 2,
        sample_format: SampleFormat::Mp3,
    };
    let mut request = media_request(9);
    request.flags = OutputFlags::COMPRESS_OFFLOAD;
    request.format = Some(compressed);
    let Ok((first, _)) = m.get_output_for_attributes(&request) else {
        panic!("direct open failed");
    };
    assert!(m.outputs().get(first).is_some_and(|d| d.is_direct()));
    assert_eq!(
        m.outputs().get(first).map(|d| d.device()),
        Some(DeviceMask::WIRED_HEADSET)
    );

    // a second track on the same session shares the open stream
    let Ok((second, _)) = m.get_output_for_attributes(&request) else {
        panic!("direct reuse failed");
    };
    assert_eq!(first, second);
    assert_eq!(
        m.outputs().get(first).map(|d| d.direct_open_count),
        Some(2)
    );

    // losing the only routed device closes the direct stream outright
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", false)
        .ok();
    assert!(m.outputs().get(first).is_none());
}

#[test]
fn start_after_device_change_reports_a_wait() {
    let mut m = manager();
    let Ok((_, music)) = m.get_output_for_attributes(&media_request(1)) else {
        panic!("selection failed");
    };
    m.start_output(music).ok();

    // a ringtone arriving while music plays forces the output onto the
    // speaker set; the caller gets the mute window as a wait
    m.set_phone_state(PhoneState::Ringtone).ok();
    let ring = OutputRequest {
        attributes: AudioAttributes::for_usage(Usage::NotificationRingtone),
        session: SessionId(2),
        uid: Uid(1000),
        format: None,
        flags: OutputFlags::empty(),
        preferred_device: None,
    };
    m.set_device_connection_state(DeviceMask::WIRED_HEADSET, "", true)
        .ok();
    let Ok((_, ring_port)) = m.get_output_for_attributes(&ring) else {
        panic!("selection failed");
    };
    let wait = match m.start_output(ring_port) {
        Ok(w) => w,
        Err(e) => panic!("start failed: {e}"),
    };
    assert!(wait > 0, "expected a mute wait around the device change");
}
