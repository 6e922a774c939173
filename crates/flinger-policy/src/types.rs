//! Policy-level vocabulary
//!
//! Strategies group stream types and usages that share device-selection
//! rules. Forced-use settings and the phone state are the knobs the policy
//! manager turns; input sources select capture devices.

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────
// Routing strategies
// ─────────────────────────────────────────────────────────────

/// Group of streams routed by the same rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RoutingStrategy {
    Media,
    Phone,
    Sonification,
    SonificationRespectful,
    Dtmf,
    EnforcedAudible,
    TransmittedThroughSpeaker,
    Accessibility,
    Rerouting,
}

impl RoutingStrategy {
    pub const COUNT: usize = 9;

    pub const ALL: [RoutingStrategy; RoutingStrategy::COUNT] = [
        RoutingStrategy::Media,
        RoutingStrategy::Phone,
        RoutingStrategy::Sonification,
        RoutingStrategy::SonificationRespectful,
        RoutingStrategy::Dtmf,
        RoutingStrategy::EnforcedAudible,
        RoutingStrategy::TransmittedThroughSpeaker,
        RoutingStrategy::Accessibility,
        RoutingStrategy::Rerouting,
    ];
}

// ─────────────────────────────────────────────────────────────
// Phone state
// ─────────────────────────────────────────────────────────────

/// Telephony mode of the device
///
/// `Invalid` and `Current` exist on the wire but are never a valid state to
/// switch to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioMode {
    Invalid,
    Current,
    #[default]
    Normal,
    Ringtone,
    InCall,
    InCommunication,
}

impl AudioMode {
    /// A voice or VoIP call is up
    #[inline]
    pub fn is_in_call(self) -> bool {
        matches!(self, AudioMode::InCall | AudioMode::InCommunication)
    }

    /// A concrete state the engine can be put in
    #[inline]
    pub fn is_settable(self) -> bool {
        !matches!(self, AudioMode::Invalid | AudioMode::Current)
    }
}

// ─────────────────────────────────────────────────────────────
// Forced use
// ─────────────────────────────────────────────────────────────

/// Which routing decision a forced config applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ForceUse {
    Communication,
    Media,
    Record,
    Dock,
    System,
    HdmiSystemAudio,
    EncodedSurround,
}

impl ForceUse {
    pub const COUNT: usize = 7;

    pub const ALL: [ForceUse; ForceUse::COUNT] = [
        ForceUse::Communication,
        ForceUse::Media,
        ForceUse::Record,
        ForceUse::Dock,
        ForceUse::System,
        ForceUse::HdmiSystemAudio,
        ForceUse::EncodedSurround,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }

    /// Configs accepted for this usage
    pub fn allowed(self) -> &'static [ForcedConfig] {
        use ForcedConfig::*;
        match self {
            ForceUse::Communication => &[None, Speaker, BtSco],
            ForceUse::Media => &[
                None,
                Headphones,
                BtA2dp,
                WiredAccessory,
                AnalogDock,
                DigitalDock,
                NoBtA2dp,
                Speaker,
            ],
            ForceUse::Record => &[None, BtSco, WiredAccessory],
            ForceUse::Dock => &[
                None,
                BtCarDock,
                BtDeskDock,
                WiredAccessory,
                AnalogDock,
                DigitalDock,
            ],
            ForceUse::System => &[None, SystemEnforced],
            ForceUse::HdmiSystemAudio => &[None, HdmiSystemAudioEnforced],
            ForceUse::EncodedSurround => &[None, EncodedSurroundNever, EncodedSurroundAlways],
        }
    }
}

/// Value of a forced-use setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ForcedConfig {
    #[default]
    None,
    Speaker,
    Headphones,
    BtSco,
    BtA2dp,
    WiredAccessory,
    BtCarDock,
    BtDeskDock,
    AnalogDock,
    DigitalDock,
    NoBtA2dp,
    SystemEnforced,
    HdmiSystemAudioEnforced,
    EncodedSurroundNever,
    EncodedSurroundAlways,
}

// ─────────────────────────────────────────────────────────────
// Usages and sources
// ─────────────────────────────────────────────────────────────

/// What a client says its playback is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioUsage {
    #[default]
    Unknown,
    Media,
    VoiceCommunication,
    VoiceCommunicationSignalling,
    Alarm,
    Notification,
    NotificationTelephonyRingtone,
    NotificationCommunicationRequest,
    NotificationCommunicationInstant,
    NotificationCommunicationDelayed,
    NotificationEvent,
    AssistanceAccessibility,
    AssistanceNavigationGuidance,
    AssistanceSonification,
    Game,
    VirtualSource,
}

/// What a capture client wants to record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioSource {
    #[default]
    Default,
    Mic,
    VoiceUplink,
    VoiceDownlink,
    VoiceCall,
    Camcorder,
    VoiceRecognition,
    VoiceCommunication,
    RemoteSubmix,
    Unprocessed,
    FmTuner,
    Hotword,
}

// ─────────────────────────────────────────────────────────────
// Device categories
// ─────────────────────────────────────────────────────────────

/// Coarse device class selecting a volume curve
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceCategory {
    Headset,
    Speaker,
    Earpiece,
    ExtMedia,
}

impl DeviceCategory {
    pub const COUNT: usize = 4;

    pub const ALL: [DeviceCategory; DeviceCategory::COUNT] = [
        DeviceCategory::Headset,
        DeviceCategory::Speaker,
        DeviceCategory::Earpiece,
        DeviceCategory::ExtMedia,
    ];

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_states() {
        assert!(AudioMode::InCall.is_in_call());
        assert!(AudioMode::InCommunication.is_in_call());
        assert!(!AudioMode::Ringtone.is_in_call());
        assert!(!AudioMode::Current.is_settable());
        assert!(AudioMode::Normal.is_settable());
    }

    #[test]
    fn test_every_usage_accepts_none() {
        for usage in ForceUse::ALL {
            assert!(usage.allowed().contains(&ForcedConfig::None), "{:?}", usage);
        }
        assert!(!ForceUse::Communication.allowed().contains(&ForcedConfig::BtA2dp));
        assert!(ForceUse::Media.allowed().contains(&ForcedConfig::NoBtA2dp));
    }

    #[test]
    fn test_index_order() {
        for (i, usage) in ForceUse::ALL.iter().enumerate() {
            assert_eq!(usage.index(), i);
        }
        for (i, category) in DeviceCategory::ALL.iter().enumerate() {
            assert_eq!(category.index(), i);
        }
    }
}
