//! Flinger Policy - audio routing decisions
//!
//! The [`Engine`] answers "which devices should this stream play on" and
//! "which input should this capture use". It owns the forced-use settings,
//! the phone state, an activity model of the open outputs and the per-stream
//! volume curves.

pub mod engine;
pub mod error;
pub mod outputs;
pub mod types;
pub mod volume;

pub use engine::Engine;
pub use error::{PolicyError, PolicyResult};
pub use outputs::{OutputCollection, OutputDescriptor, SONIFICATION_RESPECTFUL_AFTER_MUSIC_DELAY};
pub use types::{AudioMode, AudioSource, AudioUsage, DeviceCategory, ForceUse, ForcedConfig, RoutingStrategy};
pub use volume::{db_to_amplitude, device_category, CurvePoint, StreamCurves, VolumeCurve, VolumeCurves};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_yaml_round_trip() {
        let settings = vec![
            (ForceUse::Media, ForcedConfig::NoBtA2dp),
            (ForceUse::Communication, ForcedConfig::Speaker),
        ];
        let yaml = serde_yaml::to_string(&settings).unwrap();
        let back: Vec<(ForceUse, ForcedConfig)> = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, settings);
    }

    #[test]
    fn test_curve_rejected_on_load() {
        let yaml = "- index: 50\n  attenuation_db: -10.0\n- index: 10\n  attenuation_db: -30.0\n";
        assert!(serde_yaml::from_str::<VolumeCurve>(yaml).is_err());

        let yaml = "- index: 10\n  attenuation_db: -30.0\n- index: 50\n  attenuation_db: -10.0\n";
        let curve: VolumeCurve = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(curve.points().len(), 2);
    }
}
