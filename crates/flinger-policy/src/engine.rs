//! Routing engine
//!
//! Maps stream types and usages to routing strategies, and strategies to a
//! set of output devices, given what is connected, the forced-use settings,
//! the phone state and what has been playing. Capture sources are mapped to
//! a single input device the same way.
//!
//! Device selection walks an ordered priority list per strategy. Some
//! strategies defer to another one depending on call state and on whether
//! music played within [`SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY`]. When
//! nothing matches, the configured default output device is returned, so a
//! non-empty set of available devices always yields a non-empty route.

use std::time::{Duration, Instant};

use flinger_core::devices::{InputDevices, OutputDevices};
use flinger_core::types::StreamType;

use crate::error::{PolicyError, PolicyResult};
use crate::outputs::{OutputCollection, SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY};
use crate::types::{AudioMode, AudioSource, AudioUsage, ForceUse, ForcedConfig, RoutingStrategy};
use crate::volume::VolumeCurves;

/// First candidate present in `available`
fn first_available(available: OutputDevices, candidates: &[OutputDevices]) -> OutputDevices {
    candidates
        .iter()
        .map(|&d| available & d)
        .find(|d| !d.is_empty())
        .unwrap_or_default()
}

fn first_input(available: InputDevices, candidates: &[InputDevices]) -> InputDevices {
    candidates
        .iter()
        .map(|&d| available & d)
        .find(|d| !d.is_empty())
        .unwrap_or_default()
}

/// Routing decisions for one audio system
#[derive(Debug, Clone)]
pub struct Engine {
    phone_state: AudioMode,
    force_use: [ForcedConfig; ForceUse::COUNT],
    available_outputs: OutputDevices,
    available_inputs: InputDevices,
    default_output_device: OutputDevices,
    outputs: OutputCollection,
    curves: VolumeCurves,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine {
    pub fn new() -> Self {
        Self {
            phone_state: AudioMode::Normal,
            force_use: [ForcedConfig::None; ForceUse::COUNT],
            available_outputs: OutputDevices::empty(),
            available_inputs: InputDevices::empty(),
            default_output_device: OutputDevices::SPEAKER,
            outputs: OutputCollection::new(),
            curves: VolumeCurves::default(),
        }
    }

    // ─────────────────────────────────────────────────────────────
    // State
    // ─────────────────────────────────────────────────────────────

    #[inline]
    pub fn phone_state(&self) -> AudioMode {
        self.phone_state
    }

    #[inline]
    fn is_in_call(&self) -> bool {
        self.phone_state.is_in_call()
    }

    /// Switch telephony mode
    ///
    /// Entering a call makes DTMF follow the voice-call volume curves;
    /// leaving it restores them.
    pub fn set_phone_state(&mut self, state: AudioMode) -> PolicyResult<()> {
        if !state.is_settable() {
            log::warn!("set_phone_state: invalid state {:?}", state);
            return Err(PolicyError::bad_value(format!("invalid phone state {:?}", state)));
        }
        if state == self.phone_state {
            log::warn!("set_phone_state: already in {:?}", state);
            return Ok(());
        }

        let old = self.phone_state;
        if state.is_in_call() {
            log::info!("set_phone_state: entering call ({:?})", state);
            self.curves.switch_curves(StreamType::Dtmf, StreamType::VoiceCall);
        } else if old.is_in_call() {
            log::info!("set_phone_state: leaving call ({:?})", state);
            self.curves.restore_curves(StreamType::Dtmf);
        }
        self.phone_state = state;
        Ok(())
    }

    #[inline]
    pub fn force_use(&self, usage: ForceUse) -> ForcedConfig {
        self.force_use[usage.index()]
    }

    /// Set a forced-use config; each usage accepts only its own configs
    pub fn set_force_use(&mut self, usage: ForceUse, config: ForcedConfig) -> PolicyResult<()> {
        if !usage.allowed().contains(&config) {
            log::warn!("set_force_use: invalid config {:?} for {:?}", config, usage);
            return Err(PolicyError::bad_value(format!("{:?} not allowed for {:?}", config, usage)));
        }
        log::debug!("set_force_use: {:?} -> {:?}", usage, config);
        self.force_use[usage.index()] = config;
        Ok(())
    }

    pub fn available_output_devices(&self) -> OutputDevices {
        self.available_outputs
    }

    pub fn set_available_output_devices(&mut self, devices: OutputDevices) {
        self.available_outputs = devices;
    }

    pub fn available_input_devices(&self) -> InputDevices {
        self.available_inputs
    }

    pub fn set_available_input_devices(&mut self, devices: InputDevices) {
        self.available_inputs = devices;
    }

    pub fn default_output_device(&self) -> OutputDevices {
        self.default_output_device
    }

    pub fn set_default_output_device(&mut self, device: OutputDevices) {
        self.default_output_device = device;
    }

    pub fn outputs(&self) -> &OutputCollection {
        &self.outputs
    }

    pub fn outputs_mut(&mut self) -> &mut OutputCollection {
        &mut self.outputs
    }

    pub fn volume_curves(&self) -> &VolumeCurves {
        &self.curves
    }

    pub fn volume_curves_mut(&mut self) -> &mut VolumeCurves {
        &mut self.curves
    }

    /// Linear gain for `stream` at UI `index` when routed to `device`
    pub fn stream_volume(&self, stream: StreamType, index: i32, device: OutputDevices) -> f32 {
        self.curves.volume_amplitude(stream, device, index)
    }

    // ─────────────────────────────────────────────────────────────
    // Strategies
    // ─────────────────────────────────────────────────────────────

    pub fn strategy_for_stream(&self, stream: StreamType) -> RoutingStrategy {
        match stream {
            StreamType::VoiceCall | StreamType::BluetoothSco => RoutingStrategy::Phone,
            StreamType::Ring | StreamType::Alarm => RoutingStrategy::Sonification,
            StreamType::Notification => RoutingStrategy::SonificationRespectful,
            StreamType::Dtmf => RoutingStrategy::Dtmf,
            StreamType::EnforcedAudible => RoutingStrategy::EnforcedAudible,
            StreamType::Tts => RoutingStrategy::TransmittedThroughSpeaker,
            StreamType::Accessibility => RoutingStrategy::Accessibility,
            StreamType::Rerouting => RoutingStrategy::Rerouting,
            // key clicks share media routing so they don't pull music off its output
            StreamType::System | StreamType::Music | StreamType::Patch => RoutingStrategy::Media,
        }
    }

    pub fn strategy_for_usage(&self, usage: AudioUsage) -> RoutingStrategy {
        match usage {
            AudioUsage::AssistanceAccessibility => RoutingStrategy::Accessibility,
            AudioUsage::Media
            | AudioUsage::Game
            | AudioUsage::AssistanceNavigationGuidance
            | AudioUsage::AssistanceSonification => RoutingStrategy::Media,
            AudioUsage::VoiceCommunication => RoutingStrategy::Phone,
            AudioUsage::VoiceCommunicationSignalling => RoutingStrategy::Dtmf,
            AudioUsage::Alarm | AudioUsage::NotificationTelephonyRingtone => RoutingStrategy::Sonification,
            AudioUsage::Notification
            | AudioUsage::NotificationCommunicationRequest
            | AudioUsage::NotificationCommunicationInstant
            | AudioUsage::NotificationCommunicationDelayed
            | AudioUsage::NotificationEvent => RoutingStrategy::SonificationRespectful,
            AudioUsage::Unknown | AudioUsage::VirtualSource => RoutingStrategy::Media,
        }
    }

    // ─────────────────────────────────────────────────────────────
    // Output devices
    // ─────────────────────────────────────────────────────────────

    /// Devices `stream` should play on now
    pub fn device_for_stream(&self, stream: StreamType) -> OutputDevices {
        self.device_for_strategy(self.strategy_for_stream(stream))
    }

    /// Devices `strategy` should play on now
    pub fn device_for_strategy(&self, strategy: RoutingStrategy) -> OutputDevices {
        self.device_for_strategy_at(strategy, Instant::now())
    }

    /// Devices `strategy` should play on, judging recent activity as of `now`
    pub fn device_for_strategy_at(&self, strategy: RoutingStrategy, now: Instant) -> OutputDevices {
        let available = self.available_outputs;
        let device = self.device_for_strategy_int(strategy, available, self.available_inputs, now);
        if !device.is_empty() {
            log::trace!("device_for_strategy: {:?} -> {:?}", strategy, device);
            return device;
        }

        let fallback = if self.default_output_device.is_empty() {
            available.lowest()
        } else {
            self.default_output_device
        };
        log::error!(
            "device_for_strategy: no device for {:?} in {:?}, falling back to {:?}",
            strategy,
            available,
            fallback
        );
        fallback
    }

    fn default_device(&self, strategy: RoutingStrategy) -> OutputDevices {
        if self.default_output_device.is_empty() {
            log::error!("device_for_strategy: no default device for {:?}", strategy);
        }
        self.default_output_device
    }

    fn device_for_strategy_int(
        &self,
        strategy: RoutingStrategy,
        available: OutputDevices,
        available_inputs: InputDevices,
        now: Instant,
    ) -> OutputDevices {
        use RoutingStrategy::*;

        match strategy {
            TransmittedThroughSpeaker => available & OutputDevices::SPEAKER,

            SonificationRespectful => {
                let delay = SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY;
                let follow_media = !self.is_in_call()
                    && !self.outputs.is_stream_active_remotely(StreamType::Music, delay, now)
                    && self.outputs.is_stream_active(StreamType::Music, delay, now);
                let target = if follow_media { Media } else { Sonification };
                self.device_for_strategy_int(target, available, available_inputs, now)
            }

            Dtmf if !self.is_in_call() => self.device_for_strategy_int(Media, available, available_inputs, now),

            Phone | Dtmf => self.phone_device(strategy, available, available_inputs),

            Sonification if self.is_in_call() => {
                self.device_for_strategy_int(Phone, available, available_inputs, now)
            }

            Sonification | EnforcedAudible => {
                let mut device = OutputDevices::empty();
                if strategy == Sonification || self.force_use(ForceUse::System) == ForcedConfig::SystemEnforced {
                    device = available & OutputDevices::SPEAKER;
                    if device.is_empty() {
                        log::error!("device_for_strategy: speaker not available for {:?}", strategy);
                    }
                }
                self.with_default(strategy, device | self.media_device(strategy, available))
            }

            Accessibility => {
                // compressed passthrough would not be mixed with the prompt
                let available = available - self.outputs.compressed_digital_devices();
                if self.outputs.is_stream_active(StreamType::Ring, Duration::ZERO, now)
                    || self.outputs.is_stream_active(StreamType::Alarm, Duration::ZERO, now)
                {
                    return self.device_for_strategy_int(Sonification, available, available_inputs, now);
                }
                if self.is_in_call() {
                    return self.device_for_strategy_int(Phone, available, available_inputs, now);
                }
                self.with_default(strategy, self.media_device(strategy, available))
            }

            Media if self.is_in_call() => self.device_for_strategy_int(Phone, available, available_inputs, now),

            Media | Rerouting => self.with_default(strategy, self.media_device(strategy, available)),
        }
    }

    fn with_default(&self, strategy: RoutingStrategy, device: OutputDevices) -> OutputDevices {
        if device.is_empty() {
            self.default_device(strategy)
        } else {
            device
        }
    }

    /// A2DP may carry this route
    fn a2dp_allowed(&self) -> bool {
        self.force_use(ForceUse::Media) != ForcedConfig::NoBtA2dp && self.outputs.a2dp_output().is_some()
    }

    fn phone_device(
        &self,
        strategy: RoutingStrategy,
        available: OutputDevices,
        available_inputs: InputDevices,
    ) -> OutputDevices {
        let in_call = self.is_in_call();
        let mut available = available;

        // without a voice-call RX path only the primary module can carry the call
        if self.phone_state == AudioMode::InCall && !available_inputs.contains(InputDevices::VOICE_CALL) {
            if let Some(primary) = self.outputs.primary_output() {
                available &= primary.supported;
            }
        }

        let mut candidates = Vec::with_capacity(12);
        match self.force_use(ForceUse::Communication) {
            ForcedConfig::Speaker => {
                if !in_call && self.a2dp_allowed() {
                    candidates.push(OutputDevices::BLUETOOTH_A2DP_SPEAKER);
                }
                if !in_call {
                    candidates.extend([
                        OutputDevices::USB_ACCESSORY,
                        OutputDevices::USB_DEVICE,
                        OutputDevices::DGTL_DOCK_HEADSET,
                        OutputDevices::AUX_DIGITAL,
                        OutputDevices::ANLG_DOCK_HEADSET,
                    ]);
                }
                candidates.push(OutputDevices::SPEAKER);
            }
            forced => {
                if forced == ForcedConfig::BtSco {
                    if !in_call || strategy != RoutingStrategy::Dtmf {
                        candidates.push(OutputDevices::BLUETOOTH_SCO_CARKIT);
                    }
                    candidates.extend([OutputDevices::BLUETOOTH_SCO_HEADSET, OutputDevices::BLUETOOTH_SCO]);
                }
                if !in_call && self.a2dp_allowed() {
                    candidates.extend([OutputDevices::BLUETOOTH_A2DP, OutputDevices::BLUETOOTH_A2DP_HEADPHONES]);
                }
                candidates.extend([
                    OutputDevices::WIRED_HEADPHONE,
                    OutputDevices::WIRED_HEADSET,
                    OutputDevices::USB_DEVICE,
                ]);
                if !in_call {
                    candidates.extend([
                        OutputDevices::USB_ACCESSORY,
                        OutputDevices::DGTL_DOCK_HEADSET,
                        OutputDevices::AUX_DIGITAL,
                        OutputDevices::ANLG_DOCK_HEADSET,
                    ]);
                }
                candidates.push(OutputDevices::EARPIECE);
            }
        }

        self.with_default(strategy, first_available(available, &candidates))
    }

    /// Media-style selection; also the second device of sonification
    fn media_device(&self, strategy: RoutingStrategy, available: OutputDevices) -> OutputDevices {
        let sonification = strategy == RoutingStrategy::Sonification;

        // no sonification on remote submix
        let mut device = if sonification {
            OutputDevices::empty()
        } else {
            available & OutputDevices::REMOTE_SUBMIX
        };

        if device.is_empty() && self.a2dp_allowed() {
            device = first_available(
                available,
                &[
                    OutputDevices::BLUETOOTH_A2DP,
                    OutputDevices::BLUETOOTH_A2DP_HEADPHONES,
                    OutputDevices::BLUETOOTH_A2DP_SPEAKER,
                ],
            );
        }
        if device.is_empty() && self.force_use(ForceUse::Media) == ForcedConfig::Speaker {
            device = available & OutputDevices::SPEAKER;
        }
        if device.is_empty() {
            let mut candidates = vec![
                OutputDevices::WIRED_HEADPHONE,
                OutputDevices::LINE,
                OutputDevices::WIRED_HEADSET,
                OutputDevices::USB_ACCESSORY,
                OutputDevices::USB_DEVICE,
                OutputDevices::DGTL_DOCK_HEADSET,
            ];
            // no sonification on HDMI
            if !sonification {
                candidates.push(OutputDevices::AUX_DIGITAL);
            }
            if self.force_use(ForceUse::Dock) == ForcedConfig::AnalogDock {
                candidates.push(OutputDevices::ANLG_DOCK_HEADSET);
            }
            candidates.push(OutputDevices::SPEAKER);
            device = first_available(available, &candidates);
        }

        if strategy == RoutingStrategy::Media {
            // these coexist with whatever else media plays on
            device |= available & (OutputDevices::HDMI_ARC | OutputDevices::SPDIF | OutputDevices::AUX_LINE);
            if self.force_use(ForceUse::HdmiSystemAudio) == ForcedConfig::HdmiSystemAudioEnforced {
                device -= OutputDevices::SPEAKER;
            }
        }
        device
    }

    // ─────────────────────────────────────────────────────────────
    // Input devices
    // ─────────────────────────────────────────────────────────────

    /// Input device a capture of `source` should use; empty when none fits
    pub fn device_for_input_source(&self, source: AudioSource) -> InputDevices {
        let mut available = self.available_inputs;
        let record_sco = self.force_use(ForceUse::Record) == ForcedConfig::BtSco;

        let device = match source {
            AudioSource::VoiceUplink | AudioSource::VoiceDownlink | AudioSource::VoiceCall => {
                available & InputDevices::VOICE_CALL
            }

            AudioSource::Default | AudioSource::Mic => {
                let mut candidates = vec![InputDevices::BLUETOOTH_A2DP];
                if record_sco {
                    candidates.push(InputDevices::BLUETOOTH_SCO_HEADSET);
                }
                candidates.extend([
                    InputDevices::WIRED_HEADSET,
                    InputDevices::USB_DEVICE,
                    InputDevices::BUILTIN_MIC,
                ]);
                first_input(available, &candidates)
            }

            AudioSource::VoiceCommunication => {
                // without a TX path to the modem only the primary module's inputs reach the call
                if self.phone_state == AudioMode::InCall
                    && !self.available_outputs.contains(OutputDevices::TELEPHONY_TX)
                {
                    if let Some(primary) = self.outputs.primary_output() {
                        available &= primary.module_inputs;
                    }
                }
                match self.force_use(ForceUse::Communication) {
                    ForcedConfig::Speaker => {
                        first_input(available, &[InputDevices::BACK_MIC, InputDevices::BUILTIN_MIC])
                    }
                    forced => {
                        let mut candidates = Vec::with_capacity(4);
                        if forced == ForcedConfig::BtSco {
                            candidates.push(InputDevices::BLUETOOTH_SCO_HEADSET);
                        }
                        candidates.extend([
                            InputDevices::WIRED_HEADSET,
                            InputDevices::USB_DEVICE,
                            InputDevices::BUILTIN_MIC,
                        ]);
                        first_input(available, &candidates)
                    }
                }
            }

            AudioSource::VoiceRecognition | AudioSource::Unprocessed | AudioSource::Hotword => {
                let mut candidates = Vec::with_capacity(4);
                if record_sco {
                    candidates.push(InputDevices::BLUETOOTH_SCO_HEADSET);
                }
                candidates.extend([
                    InputDevices::WIRED_HEADSET,
                    InputDevices::USB_DEVICE,
                    InputDevices::BUILTIN_MIC,
                ]);
                first_input(available, &candidates)
            }

            AudioSource::Camcorder => first_input(available, &[InputDevices::BACK_MIC, InputDevices::BUILTIN_MIC]),
            AudioSource::RemoteSubmix => available & InputDevices::REMOTE_SUBMIX,
            AudioSource::FmTuner => available & InputDevices::FM_TUNER,
        };

        if device.is_empty() {
            log::warn!("device_for_input_source: no device for {:?} in {:?}", source, available);
        }
        device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outputs::OutputDescriptor;
    use crate::types::DeviceCategory;
    use flinger_core::types::IoHandle;

    fn engine(available: OutputDevices) -> Engine {
        let mut engine = Engine::new();
        engine.set_available_output_devices(available);
        engine.outputs_mut().add(
            OutputDescriptor::new(IoHandle(1), OutputDevices::all() - OutputDevices::ALL_A2DP)
                .primary()
                .routed_to(OutputDevices::SPEAKER),
        );
        engine
    }

    fn with_a2dp(mut engine: Engine) -> Engine {
        engine
            .outputs_mut()
            .add(OutputDescriptor::new(IoHandle(2), OutputDevices::ALL_A2DP));
        engine
    }

    #[test]
    fn test_media_on_speaker_only() {
        let engine = engine(OutputDevices::SPEAKER);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::SPEAKER);
    }

    #[test]
    fn test_every_strategy_gets_a_device() {
        let engine = engine(OutputDevices::WIRED_HEADSET);
        for strategy in RoutingStrategy::ALL {
            assert!(!engine.device_for_strategy(strategy).is_empty(), "{:?}", strategy);
        }

        let mut engine = engine;
        engine.set_default_output_device(OutputDevices::empty());
        for strategy in RoutingStrategy::ALL {
            assert!(!engine.device_for_strategy(strategy).is_empty(), "{:?}", strategy);
        }
    }

    #[test]
    fn test_media_priority_chain() {
        let all = OutputDevices::SPEAKER
            | OutputDevices::EARPIECE
            | OutputDevices::WIRED_HEADSET
            | OutputDevices::USB_DEVICE
            | OutputDevices::BLUETOOTH_A2DP;

        // A2DP needs an output that can reach it
        let engine = engine(all);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::WIRED_HEADSET);

        let mut engine = with_a2dp(engine);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::BLUETOOTH_A2DP);

        engine.set_force_use(ForceUse::Media, ForcedConfig::NoBtA2dp).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::WIRED_HEADSET);

        // forced speaker still yields to A2DP
        engine.set_force_use(ForceUse::Media, ForcedConfig::Speaker).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::BLUETOOTH_A2DP);
        engine.set_available_output_devices(all - OutputDevices::ALL_A2DP);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::SPEAKER);

        engine.set_force_use(ForceUse::Media, ForcedConfig::None).unwrap();
        engine.set_available_output_devices(all - OutputDevices::ALL_A2DP - OutputDevices::WIRED_HEADSET);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::USB_DEVICE);
    }

    #[test]
    fn test_media_keeps_digital_sinks_alongside() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::HDMI_ARC);
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Media),
            OutputDevices::SPEAKER | OutputDevices::HDMI_ARC
        );
        engine
            .set_force_use(ForceUse::HdmiSystemAudio, ForcedConfig::HdmiSystemAudioEnforced)
            .unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::HDMI_ARC);
    }

    #[test]
    fn test_sonification_adds_speaker() {
        let engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Sonification),
            OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET
        );
        // enforced audible only forces the speaker when the system requires it
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::EnforcedAudible),
            OutputDevices::WIRED_HEADSET
        );
    }

    #[test]
    fn test_enforced_audible_with_system_enforced() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        engine.set_force_use(ForceUse::System, ForcedConfig::SystemEnforced).unwrap();
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::EnforcedAudible),
            OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET
        );
    }

    #[test]
    fn test_sonification_skips_hdmi() {
        let engine = engine(OutputDevices::AUX_DIGITAL);
        // speaker is missing and HDMI is excluded: falls back to the default
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Sonification), OutputDevices::SPEAKER);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::AUX_DIGITAL);
    }

    #[test]
    fn test_phone_priority_and_forced_use() {
        let available = OutputDevices::SPEAKER
            | OutputDevices::EARPIECE
            | OutputDevices::WIRED_HEADSET
            | OutputDevices::BLUETOOTH_SCO_HEADSET;
        let mut engine = engine(available);
        engine.set_phone_state(AudioMode::InCall).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Phone), OutputDevices::WIRED_HEADSET);

        engine.set_force_use(ForceUse::Communication, ForcedConfig::BtSco).unwrap();
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Phone),
            OutputDevices::BLUETOOTH_SCO_HEADSET
        );

        engine.set_force_use(ForceUse::Communication, ForcedConfig::Speaker).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Phone), OutputDevices::SPEAKER);

        engine.set_force_use(ForceUse::Communication, ForcedConfig::None).unwrap();
        engine.set_available_output_devices(OutputDevices::SPEAKER | OutputDevices::EARPIECE);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Phone), OutputDevices::EARPIECE);
    }

    #[test]
    fn test_sco_without_device_falls_through() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::EARPIECE);
        engine.set_force_use(ForceUse::Communication, ForcedConfig::BtSco).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Phone), OutputDevices::EARPIECE);
    }

    #[test]
    fn test_dtmf_follows_call_state() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::EARPIECE);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Dtmf), OutputDevices::SPEAKER);
        engine.set_phone_state(AudioMode::InCall).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Dtmf), OutputDevices::EARPIECE);
        // media and sonification go where the call goes
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Media), OutputDevices::EARPIECE);
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Sonification), OutputDevices::EARPIECE);
    }

    #[test]
    fn test_sonification_respectful_follows_recent_music() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        let t0 = Instant::now();
        let respectful = RoutingStrategy::SonificationRespectful;
        let both = OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET;

        assert_eq!(engine.device_for_strategy_at(respectful, t0), both);

        engine.outputs_mut().start_stream(IoHandle(1), StreamType::Music).unwrap();
        assert_eq!(engine.device_for_strategy_at(respectful, t0), OutputDevices::WIRED_HEADSET);

        engine.outputs_mut().stop_stream(IoHandle(1), StreamType::Music, t0).unwrap();
        let soon = t0 + Duration::from_millis(1000);
        assert_eq!(engine.device_for_strategy_at(respectful, soon), OutputDevices::WIRED_HEADSET);
        let later = t0 + SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY + Duration::from_millis(1);
        assert_eq!(engine.device_for_strategy_at(respectful, later), both);
    }

    #[test]
    fn test_remote_music_keeps_sonification() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        engine.outputs_mut().add(
            OutputDescriptor::new(IoHandle(3), OutputDevices::REMOTE_SUBMIX).routed_to(OutputDevices::REMOTE_SUBMIX),
        );
        engine.outputs_mut().start_stream(IoHandle(3), StreamType::Music).unwrap();
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::SonificationRespectful),
            OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET
        );
    }

    #[test]
    fn test_accessibility_defers_to_ringtone() {
        let mut engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Accessibility),
            OutputDevices::WIRED_HEADSET
        );
        engine.outputs_mut().start_stream(IoHandle(1), StreamType::Ring).unwrap();
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Accessibility),
            OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET
        );
    }

    #[test]
    fn test_tts_only_on_speaker() {
        let engine = engine(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET);
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::TransmittedThroughSpeaker),
            OutputDevices::SPEAKER
        );
    }

    #[test]
    fn test_in_call_restricted_to_primary_module() {
        let mut engine = engine(OutputDevices::EARPIECE | OutputDevices::BLUETOOTH_SCO_HEADSET);
        engine.outputs_mut().remove(IoHandle(1));
        engine
            .outputs_mut()
            .add(OutputDescriptor::new(IoHandle(1), OutputDevices::EARPIECE | OutputDevices::SPEAKER).primary());
        engine.set_force_use(ForceUse::Communication, ForcedConfig::BtSco).unwrap();
        engine.set_phone_state(AudioMode::InCall).unwrap();
        assert_eq!(engine.device_for_strategy(RoutingStrategy::Phone), OutputDevices::EARPIECE);

        // with a voice-call RX path any module may carry the call
        engine.set_available_input_devices(InputDevices::VOICE_CALL);
        assert_eq!(
            engine.device_for_strategy(RoutingStrategy::Phone),
            OutputDevices::BLUETOOTH_SCO_HEADSET
        );
    }

    #[test]
    fn test_strategy_mapping() {
        let engine = Engine::new();
        assert_eq!(engine.strategy_for_stream(StreamType::System), RoutingStrategy::Media);
        assert_eq!(engine.strategy_for_stream(StreamType::BluetoothSco), RoutingStrategy::Phone);
        assert_eq!(
            engine.strategy_for_stream(StreamType::Notification),
            RoutingStrategy::SonificationRespectful
        );
        assert_eq!(
            engine.strategy_for_usage(AudioUsage::VoiceCommunicationSignalling),
            RoutingStrategy::Dtmf
        );
        assert_eq!(
            engine.strategy_for_usage(AudioUsage::NotificationTelephonyRingtone),
            RoutingStrategy::Sonification
        );
        assert_eq!(engine.strategy_for_usage(AudioUsage::Game), RoutingStrategy::Media);
    }

    #[test]
    fn test_force_use_validation() {
        let mut engine = Engine::new();
        let err = engine
            .set_force_use(ForceUse::Communication, ForcedConfig::BtA2dp)
            .unwrap_err();
        assert!(matches!(err, PolicyError::BadValue(_)));
        assert_eq!(engine.force_use(ForceUse::Communication), ForcedConfig::None);

        engine.set_force_use(ForceUse::Dock, ForcedConfig::BtCarDock).unwrap();
        assert_eq!(engine.force_use(ForceUse::Dock), ForcedConfig::BtCarDock);
        assert!(engine.set_force_use(ForceUse::Record, ForcedConfig::Speaker).is_err());
    }

    #[test]
    fn test_phone_state_validation_and_dtmf_curves() {
        let mut engine = Engine::new();
        assert!(engine.set_phone_state(AudioMode::Invalid).is_err());
        assert!(engine.set_phone_state(AudioMode::Current).is_err());
        assert_eq!(engine.phone_state(), AudioMode::Normal);

        engine.set_phone_state(AudioMode::InCommunication).unwrap();
        assert_eq!(engine.volume_curves().curve_source(StreamType::Dtmf), StreamType::VoiceCall);
        assert_eq!(
            engine.volume_curves().curve(StreamType::Dtmf, DeviceCategory::Earpiece),
            engine.volume_curves().curve(StreamType::VoiceCall, DeviceCategory::Earpiece)
        );

        // call to call keeps the substitution
        engine.set_phone_state(AudioMode::InCall).unwrap();
        assert_eq!(engine.volume_curves().curve_source(StreamType::Dtmf), StreamType::VoiceCall);

        engine.set_phone_state(AudioMode::Normal).unwrap();
        assert_eq!(engine.volume_curves().curve_source(StreamType::Dtmf), StreamType::Dtmf);
    }

    #[test]
    fn test_input_sources() {
        let mut engine = Engine::new();
        engine.set_available_input_devices(
            InputDevices::BUILTIN_MIC
                | InputDevices::BACK_MIC
                | InputDevices::WIRED_HEADSET
                | InputDevices::BLUETOOTH_SCO_HEADSET,
        );
        assert_eq!(engine.device_for_input_source(AudioSource::Mic), InputDevices::WIRED_HEADSET);
        assert_eq!(engine.device_for_input_source(AudioSource::Camcorder), InputDevices::BACK_MIC);
        assert!(engine.device_for_input_source(AudioSource::VoiceCall).is_empty());
        assert!(engine.device_for_input_source(AudioSource::FmTuner).is_empty());

        engine.set_force_use(ForceUse::Record, ForcedConfig::BtSco).unwrap();
        assert_eq!(
            engine.device_for_input_source(AudioSource::VoiceRecognition),
            InputDevices::BLUETOOTH_SCO_HEADSET
        );

        engine.set_force_use(ForceUse::Communication, ForcedConfig::Speaker).unwrap();
        assert_eq!(
            engine.device_for_input_source(AudioSource::VoiceCommunication),
            InputDevices::BACK_MIC
        );
    }

    #[test]
    fn test_stream_volume_follows_route() {
        let engine = Engine::new();
        let speaker = engine.stream_volume(StreamType::Music, 15, OutputDevices::SPEAKER);
        let muted = engine.stream_volume(StreamType::Music, 0, OutputDevices::SPEAKER);
        assert!((speaker - 1.0).abs() < 1e-3);
        assert_eq!(muted, 0.0);
    }
}
