//! Volume curves
//!
//! A UI volume index is mapped to an attenuation in dB through a piecewise
//! linear curve of up to a handful of points on a 0..=100 scale. Each stream
//! has one curve per [`DeviceCategory`] plus its own index range. While a
//! call is up the DTMF stream borrows the voice-call curves (see
//! [`VolumeCurves::switch_curves`]).

use serde::{Deserialize, Serialize};

use flinger_core::devices::OutputDevices;
use flinger_core::types::StreamType;

use crate::error::{PolicyError, PolicyResult};
use crate::types::DeviceCategory;

/// Attenuation treated as silence
pub const VOLUME_MIN_DB: f32 = -758.0;

/// Highest index on the curve scale
pub const CURVE_INDEX_MAX: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub index: u32,
    pub attenuation_db: f32,
}

/// Piecewise linear index-to-dB curve with strictly increasing indices
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CurvePoint>", into = "Vec<CurvePoint>")]
pub struct VolumeCurve {
    points: Vec<CurvePoint>,
}

impl VolumeCurve {
    pub fn new(points: Vec<CurvePoint>) -> PolicyResult<Self> {
        if points.is_empty() {
            return Err(PolicyError::bad_value("volume curve has no points"));
        }
        if points.iter().any(|p| p.index > CURVE_INDEX_MAX) {
            return Err(PolicyError::bad_value("volume curve index above 100"));
        }
        if points.windows(2).any(|w| w[0].index >= w[1].index) {
            return Err(PolicyError::bad_value("volume curve indices not increasing"));
        }
        Ok(Self { points })
    }

    fn table(points: &[(u32, f32)]) -> Self {
        Self {
            points: points
                .iter()
                .map(|&(index, attenuation_db)| CurvePoint { index, attenuation_db })
                .collect(),
        }
    }

    pub fn points(&self) -> &[CurvePoint] {
        &self.points
    }

    /// Attenuation for `index` within the stream range `index_min..=index_max`
    pub fn vol_index_to_db(&self, index: i32, index_min: i32, index_max: i32) -> f32 {
        let first = self.points[0];
        let last = self.points[self.points.len() - 1];
        if index_max <= index_min {
            return last.attenuation_db;
        }

        let steps = 1 + last.index as i32 - first.index as i32;
        let index = index.clamp(index_min, index_max);
        let vol_idx = steps * (index - index_min) / (index_max - index_min);

        let pos = match self.points.iter().position(|p| p.index as i32 >= vol_idx) {
            Some(pos) => pos,
            None => return last.attenuation_db,
        };
        if pos == 0 {
            if vol_idx < first.index as i32 {
                return VOLUME_MIN_DB;
            }
            return first.attenuation_db;
        }

        let lo = self.points[pos - 1];
        let hi = self.points[pos];
        lo.attenuation_db
            + (vol_idx - lo.index as i32) as f32 * (hi.attenuation_db - lo.attenuation_db)
                / (hi.index - lo.index) as f32
    }
}

impl TryFrom<Vec<CurvePoint>> for VolumeCurve {
    type Error = PolicyError;

    fn try_from(points: Vec<CurvePoint>) -> PolicyResult<Self> {
        Self::new(points)
    }
}

impl From<VolumeCurve> for Vec<CurvePoint> {
    fn from(curve: VolumeCurve) -> Self {
        curve.points
    }
}

/// Linear gain for an attenuation
pub fn db_to_amplitude(db: f32) -> f32 {
    if db <= VOLUME_MIN_DB {
        return 0.0;
    }
    10f32.powf(db / 20.0)
}

/// Single device whose category drives the volume of a multi-device route
fn device_for_volume(device: OutputDevices) -> OutputDevices {
    let device = if device.bits().count_ones() > 1 {
        [
            OutputDevices::SPEAKER,
            OutputDevices::SPEAKER_SAFE,
            OutputDevices::HDMI_ARC,
            OutputDevices::AUX_LINE,
            OutputDevices::SPDIF,
        ]
        .into_iter()
        .find(|&d| device.contains(d))
        .unwrap_or(device & OutputDevices::ALL_A2DP)
    } else {
        device
    };
    if device == OutputDevices::SPEAKER_SAFE {
        OutputDevices::SPEAKER
    } else {
        device
    }
}

/// Volume category of a route
pub fn device_category(device: OutputDevices) -> DeviceCategory {
    let device = device_for_volume(device);
    if device == OutputDevices::EARPIECE {
        DeviceCategory::Earpiece
    } else if [
        OutputDevices::WIRED_HEADSET,
        OutputDevices::WIRED_HEADPHONE,
        OutputDevices::BLUETOOTH_SCO,
        OutputDevices::BLUETOOTH_SCO_HEADSET,
        OutputDevices::BLUETOOTH_A2DP,
        OutputDevices::BLUETOOTH_A2DP_HEADPHONES,
    ]
    .contains(&device)
    {
        DeviceCategory::Headset
    } else if [OutputDevices::LINE, OutputDevices::AUX_DIGITAL, OutputDevices::USB_DEVICE].contains(&device) {
        DeviceCategory::ExtMedia
    } else {
        DeviceCategory::Speaker
    }
}

// ─────────────────────────────────────────────────────────────
// Default tables
// ─────────────────────────────────────────────────────────────

const DEFAULT_VOLUME: &[(u32, f32)] = &[(1, -49.5), (33, -33.5), (66, -17.0), (100, 0.0)];
const DEFAULT_MEDIA: &[(u32, f32)] = &[(1, -58.0), (20, -40.0), (60, -17.0), (100, 0.0)];
const EXT_MEDIA: &[(u32, f32)] = &[(1, -58.0), (20, -40.0), (60, -21.0), (100, -10.0)];
const SPEAKER_MEDIA: &[(u32, f32)] = &[(1, -56.0), (20, -34.0), (60, -11.0), (100, 0.0)];
const SPEAKER_SONIFICATION: &[(u32, f32)] = &[(1, -29.7), (33, -20.1), (66, -10.2), (100, 0.0)];
const DEFAULT_SYSTEM: &[(u32, f32)] = &[(1, -24.0), (33, -18.0), (66, -12.0), (100, -6.0)];
const HEADSET_SYSTEM: &[(u32, f32)] = &[(1, -30.0), (33, -26.0), (66, -22.0), (100, -18.0)];
const DEFAULT_VOICE: &[(u32, f32)] = &[(0, -42.0), (33, -28.0), (66, -14.0), (100, 0.0)];
const SPEAKER_VOICE: &[(u32, f32)] = &[(0, -24.0), (33, -16.0), (66, -8.0), (100, 0.0)];
const FULL_SCALE: &[(u32, f32)] = &[(0, 0.0), (100, 0.0)];
const SILENT: &[(u32, f32)] = &[(0, VOLUME_MIN_DB), (100, VOLUME_MIN_DB)];

/// Curves indexed by category: headset, speaker, earpiece, external media
fn default_tables(stream: StreamType) -> [&'static [(u32, f32)]; DeviceCategory::COUNT] {
    match stream {
        StreamType::VoiceCall | StreamType::BluetoothSco => {
            [DEFAULT_VOICE, SPEAKER_VOICE, SPEAKER_VOICE, DEFAULT_MEDIA]
        }
        StreamType::System | StreamType::EnforcedAudible | StreamType::Dtmf => {
            [HEADSET_SYSTEM, DEFAULT_SYSTEM, DEFAULT_SYSTEM, EXT_MEDIA]
        }
        StreamType::Ring | StreamType::Alarm | StreamType::Notification => {
            [DEFAULT_VOLUME, SPEAKER_SONIFICATION, DEFAULT_VOLUME, EXT_MEDIA]
        }
        StreamType::Music | StreamType::Accessibility => [DEFAULT_MEDIA, SPEAKER_MEDIA, DEFAULT_MEDIA, EXT_MEDIA],
        StreamType::Tts => [SILENT, FULL_SCALE, SILENT, SILENT],
        StreamType::Rerouting | StreamType::Patch => [FULL_SCALE; DeviceCategory::COUNT],
    }
}

/// UI index range a stream starts with
fn default_index_range(stream: StreamType) -> (i32, i32) {
    match stream {
        StreamType::VoiceCall => (1, 5),
        StreamType::Alarm => (1, 7),
        StreamType::System | StreamType::Ring | StreamType::Notification | StreamType::EnforcedAudible => (0, 7),
        StreamType::Rerouting | StreamType::Patch => (0, 1),
        _ => (0, 15),
    }
}

// ─────────────────────────────────────────────────────────────
// Per-stream tables
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamCurves {
    pub index_min: i32,
    pub index_max: i32,
    pub curves: [VolumeCurve; DeviceCategory::COUNT],
}

impl StreamCurves {
    fn defaults(stream: StreamType) -> Self {
        let (index_min, index_max) = default_index_range(stream);
        Self {
            index_min,
            index_max,
            curves: default_tables(stream).map(VolumeCurve::table),
        }
    }
}

/// Curves for every stream, with per-stream curve substitution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeCurves {
    streams: Vec<StreamCurves>,
    /// Stream whose curves each stream currently uses
    #[serde(skip, default = "identity_sources")]
    sources: [StreamType; StreamType::COUNT],
}

fn identity_sources() -> [StreamType; StreamType::COUNT] {
    StreamType::ALL
}

impl Default for VolumeCurves {
    fn default() -> Self {
        Self {
            streams: StreamType::ALL.iter().map(|&s| StreamCurves::defaults(s)).collect(),
            sources: identity_sources(),
        }
    }
}

impl VolumeCurves {
    pub fn stream(&self, stream: StreamType) -> &StreamCurves {
        &self.streams[stream.index()]
    }

    /// Set the UI index range of a stream
    pub fn init_stream_volume(&mut self, stream: StreamType, index_min: i32, index_max: i32) -> PolicyResult<()> {
        if index_min < 0 || index_min >= index_max {
            return Err(PolicyError::bad_value(format!(
                "invalid index range {}..={} for {:?}",
                index_min, index_max, stream
            )));
        }
        let s = &mut self.streams[stream.index()];
        s.index_min = index_min;
        s.index_max = index_max;
        Ok(())
    }

    pub fn set_curve(&mut self, stream: StreamType, category: DeviceCategory, curve: VolumeCurve) {
        self.streams[stream.index()].curves[category.index()] = curve;
    }

    /// Curve `stream` currently maps through for `category`
    pub fn curve(&self, stream: StreamType, category: DeviceCategory) -> &VolumeCurve {
        let source = self.sources[stream.index()];
        &self.streams[source.index()].curves[category.index()]
    }

    /// Make `stream` use the curves of `with` until restored
    pub fn switch_curves(&mut self, stream: StreamType, with: StreamType) {
        log::debug!("switch_curves: {:?} now uses {:?} curves", stream, with);
        self.sources[stream.index()] = with;
    }

    pub fn restore_curves(&mut self, stream: StreamType) {
        self.sources[stream.index()] = stream;
    }

    pub fn curve_source(&self, stream: StreamType) -> StreamType {
        self.sources[stream.index()]
    }

    /// Attenuation of `stream` at UI `index` on `device`
    pub fn volume_db(&self, stream: StreamType, device: OutputDevices, index: i32) -> f32 {
        let own = self.stream(stream);
        self.curve(stream, device_category(device))
            .vol_index_to_db(index, own.index_min, own.index_max)
    }

    /// Linear gain of `stream` at UI `index` on `device`
    pub fn volume_amplitude(&self, stream: StreamType, device: OutputDevices, index: i32) -> f32 {
        db_to_amplitude(self.volume_db(stream, device, index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f32, b: f32) -> bool {
        (a - b).abs() < 0.01
    }

    #[test]
    fn test_media_curve_interpolation() {
        let curve = VolumeCurve::table(DEFAULT_MEDIA);
        assert_eq!(curve.vol_index_to_db(0, 0, 15), VOLUME_MIN_DB);
        assert!(approx(curve.vol_index_to_db(15, 0, 15), 0.0));
        // 8/15 of the way is curve index 53: between (20, -40) and (60, -17)
        assert!(approx(curve.vol_index_to_db(8, 0, 15), -40.0 + 33.0 * 23.0 / 40.0));
        // clamped into range
        assert!(approx(curve.vol_index_to_db(99, 0, 15), 0.0));
    }

    #[test]
    fn test_curve_starting_at_zero_has_no_silence() {
        let curve = VolumeCurve::table(DEFAULT_VOICE);
        assert!(approx(curve.vol_index_to_db(1, 1, 5), -42.0));
    }

    #[test]
    fn test_invalid_curves_rejected() {
        assert!(VolumeCurve::new(vec![]).is_err());
        let unordered = vec![
            CurvePoint { index: 50, attenuation_db: -10.0 },
            CurvePoint { index: 20, attenuation_db: -30.0 },
        ];
        assert!(VolumeCurve::new(unordered).is_err());
        let past_end = vec![CurvePoint { index: 101, attenuation_db: 0.0 }];
        assert!(VolumeCurve::new(past_end).is_err());
    }

    #[test]
    fn test_amplitude() {
        assert_eq!(db_to_amplitude(VOLUME_MIN_DB), 0.0);
        assert!(approx(db_to_amplitude(0.0), 1.0));
        assert!(approx(db_to_amplitude(-6.0), 0.501));
    }

    #[test]
    fn test_device_categories() {
        assert_eq!(device_category(OutputDevices::EARPIECE), DeviceCategory::Earpiece);
        assert_eq!(device_category(OutputDevices::WIRED_HEADPHONE), DeviceCategory::Headset);
        assert_eq!(device_category(OutputDevices::USB_DEVICE), DeviceCategory::ExtMedia);
        assert_eq!(device_category(OutputDevices::SPEAKER_SAFE), DeviceCategory::Speaker);
        assert_eq!(
            device_category(OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET),
            DeviceCategory::Speaker
        );
        assert_eq!(
            device_category(OutputDevices::BLUETOOTH_A2DP | OutputDevices::HDMI_ARC),
            DeviceCategory::Speaker
        );
        assert_eq!(
            device_category(OutputDevices::BLUETOOTH_A2DP | OutputDevices::USB_DEVICE),
            DeviceCategory::Headset
        );
    }

    #[test]
    fn test_switch_and_restore() {
        let mut curves = VolumeCurves::default();
        let speaker = OutputDevices::SPEAKER;
        let own = curves.volume_db(StreamType::Dtmf, speaker, 15);
        curves.switch_curves(StreamType::Dtmf, StreamType::VoiceCall);
        assert_eq!(curves.curve_source(StreamType::Dtmf), StreamType::VoiceCall);
        assert_eq!(
            curves.curve(StreamType::Dtmf, DeviceCategory::Speaker),
            curves.curve(StreamType::VoiceCall, DeviceCategory::Speaker)
        );
        assert!(approx(curves.volume_db(StreamType::Dtmf, speaker, 15), 0.0));
        curves.restore_curves(StreamType::Dtmf);
        assert!(approx(curves.volume_db(StreamType::Dtmf, speaker, 15), own));
        assert!(approx(own, -6.0));
    }

    #[test]
    fn test_init_stream_volume() {
        let mut curves = VolumeCurves::default();
        assert!(curves.init_stream_volume(StreamType::Music, 5, 5).is_err());
        assert!(curves.init_stream_volume(StreamType::Music, -1, 5).is_err());
        curves.init_stream_volume(StreamType::Music, 0, 25).unwrap();
        assert_eq!(curves.stream(StreamType::Music).index_max, 25);
        assert!(approx(curves.volume_db(StreamType::Music, OutputDevices::SPEAKER, 25), 0.0));
    }

    #[test]
    fn test_tts_silent_off_speaker() {
        let curves = VolumeCurves::default();
        assert_eq!(curves.volume_amplitude(StreamType::Tts, OutputDevices::WIRED_HEADSET, 15), 0.0);
        assert!(approx(curves.volume_amplitude(StreamType::Tts, OutputDevices::SPEAKER, 15), 1.0));
    }
}
