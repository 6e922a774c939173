//! Audio device bitmasks
//!
//! Output and input devices are separate flag sets. A thread's current route
//! is a union of bits; the routing engine picks bits out of the set of
//! available devices.

use bitflags::bitflags;

bitflags! {
    /// Output device types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct OutputDevices: u32 {
        const EARPIECE = 0x1;
        const SPEAKER = 0x2;
        const WIRED_HEADSET = 0x4;
        const WIRED_HEADPHONE = 0x8;
        const BLUETOOTH_SCO = 0x10;
        const BLUETOOTH_SCO_HEADSET = 0x20;
        const BLUETOOTH_SCO_CARKIT = 0x40;
        const BLUETOOTH_A2DP = 0x80;
        const BLUETOOTH_A2DP_HEADPHONES = 0x100;
        const BLUETOOTH_A2DP_SPEAKER = 0x200;
        const AUX_DIGITAL = 0x400;
        const ANLG_DOCK_HEADSET = 0x800;
        const DGTL_DOCK_HEADSET = 0x1000;
        const USB_ACCESSORY = 0x2000;
        const USB_DEVICE = 0x4000;
        const REMOTE_SUBMIX = 0x8000;
        const TELEPHONY_TX = 0x10000;
        const LINE = 0x20000;
        const HDMI_ARC = 0x40000;
        const SPDIF = 0x80000;
        const FM = 0x100000;
        const AUX_LINE = 0x200000;
        const SPEAKER_SAFE = 0x400000;
        const IP = 0x800000;

        const ALL_A2DP = Self::BLUETOOTH_A2DP.bits()
            | Self::BLUETOOTH_A2DP_HEADPHONES.bits()
            | Self::BLUETOOTH_A2DP_SPEAKER.bits();
        const ALL_SCO = Self::BLUETOOTH_SCO.bits()
            | Self::BLUETOOTH_SCO_HEADSET.bits()
            | Self::BLUETOOTH_SCO_CARKIT.bits();
        const ALL_USB = Self::USB_ACCESSORY.bits() | Self::USB_DEVICE.bits();
    }
}

bitflags! {
    /// Input device types
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct InputDevices: u32 {
        const COMMUNICATION = 0x1;
        const AMBIENT = 0x2;
        const BUILTIN_MIC = 0x4;
        const BLUETOOTH_SCO_HEADSET = 0x8;
        const WIRED_HEADSET = 0x10;
        const AUX_DIGITAL = 0x20;
        const VOICE_CALL = 0x40;
        const BACK_MIC = 0x80;
        const REMOTE_SUBMIX = 0x100;
        const ANLG_DOCK_HEADSET = 0x200;
        const DGTL_DOCK_HEADSET = 0x400;
        const USB_ACCESSORY = 0x800;
        const USB_DEVICE = 0x1000;
        const FM_TUNER = 0x2000;
        const TV_TUNER = 0x4000;
        const LINE = 0x8000;
        const SPDIF = 0x10000;
        const BLUETOOTH_A2DP = 0x20000;
        const LOOPBACK = 0x40000;
        const IP = 0x80000;
    }
}

impl OutputDevices {
    /// Lowest set bit, or empty
    pub fn lowest(self) -> OutputDevices {
        let bits = self.bits();
        OutputDevices::from_bits_truncate(bits & bits.wrapping_neg())
    }
}

impl InputDevices {
    /// Lowest set bit, or empty
    pub fn lowest(self) -> InputDevices {
        let bits = self.bits();
        InputDevices::from_bits_truncate(bits & bits.wrapping_neg())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowest_bit() {
        let d = OutputDevices::SPEAKER | OutputDevices::WIRED_HEADSET;
        assert_eq!(d.lowest(), OutputDevices::SPEAKER);
        assert_eq!(OutputDevices::empty().lowest(), OutputDevices::empty());
        assert_eq!(
            (InputDevices::BACK_MIC | InputDevices::BUILTIN_MIC).lowest(),
            InputDevices::BUILTIN_MIC
        );
    }

    #[test]
    fn test_group_masks() {
        assert!(OutputDevices::ALL_A2DP.contains(OutputDevices::BLUETOOTH_A2DP_SPEAKER));
        assert!(!OutputDevices::ALL_SCO.intersects(OutputDevices::ALL_A2DP));
    }
}
