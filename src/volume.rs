//! Volume representation and conversions.
//!
//! Volume is kept internally as "dB * 100" in the range ±9600. Conversion
//! to and from the wire ranges (0..127 for A2DP/AVRCP, 0..15 for HSP/HFP)
//! uses a perceptual loudness curve, not a linear mapping, to match real
//! headset behaviour.

/// Lowest representable volume level, dB * 100.
pub const LEVEL_MIN: i32 = -9600;
/// Highest representable volume level, dB * 100.
pub const LEVEL_MAX: i32 = 9600;

/// AVRCP absolute volume maximum.
pub const RANGE_MAX_A2DP: i32 = 127;
/// HSP/HFP gain maximum.
pub const RANGE_MAX_SCO: i32 = 15;

/// Convert loudness (0.0 ..= 1.0) to decibels.
pub fn loudness_to_decibel(loudness: f64) -> f64 {
    10.0 * loudness.log2()
}

/// Convert decibels to loudness (0.0 ..= 1.0 for non-positive dB).
pub fn decibel_to_loudness(decibel: f64) -> f64 {
    (decibel / 10.0).exp2()
}

/// Convert an internal level (dB * 100) to a wire range value (0 ..= max).
pub fn level_to_range(level: i32, max: i32) -> i32 {
    let level = level.clamp(LEVEL_MIN, LEVEL_MAX);
    let loudness = decibel_to_loudness(level as f64 / 100.0);
    ((max as f64 * loudness).round() as i32).clamp(0, max)
}

/// Convert a wire range value (0 ..= max) to an internal level (dB * 100).
pub fn range_to_level(value: i32, max: i32) -> i32 {
    let value = value.clamp(0, max);
    if value == 0 {
        return LEVEL_MIN;
    }
    let loudness = value as f64 / max as f64;
    ((loudness_to_decibel(loudness) * 100.0).round() as i32).clamp(LEVEL_MIN, LEVEL_MAX)
}

/// Per-channel volume record.
#[derive(Debug, Clone, Copy)]
pub struct ChannelVolume {
    level: i32,
    /// Mute requested by the local client.
    pub soft_mute: bool,
    /// Mute reported by the remote device.
    pub hard_mute: bool,
    scale: f64,
}

impl Default for ChannelVolume {
    fn default() -> Self {
        let mut v = Self { level: 0, soft_mute: false, hard_mute: false, scale: 0.0 };
        v.update_scale();
        v
    }
}

impl ChannelVolume {
    /// Current level, dB * 100.
    pub fn level(&self) -> i32 {
        self.level
    }

    /// Effective linear amplitude scale; zero when muted.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Whether either mute flag is set.
    pub fn is_muted(&self) -> bool {
        self.soft_mute || self.hard_mute
    }

    /// Set the level (dB * 100) and refresh the cached scale.
    pub fn set_level(&mut self, level: i32) {
        self.level = level.clamp(LEVEL_MIN, LEVEL_MAX);
        self.update_scale();
    }

    /// Set the mute flags and refresh the cached scale.
    pub fn set_mute(&mut self, soft: bool, hard: bool) {
        self.soft_mute = soft;
        self.hard_mute = hard;
        self.update_scale();
    }

    fn update_scale(&mut self) {
        self.scale = if self.is_muted() { 0.0 } else { 10f64.powf(self.level as f64 / 100.0 / 20.0) };
    }

    /// Encode as a wire byte: bit 7 carries the mute flag, the lower bits
    /// the range value.
    pub fn to_wire(self, max: i32) -> u8 {
        let value = level_to_range(self.level, max) as u8;
        if self.is_muted() {
            value | 0x80
        } else {
            value
        }
    }

    /// Decode from a wire byte.
    pub fn from_wire(byte: u8, max: i32) -> Self {
        let mut v = Self::default();
        v.set_level(range_to_level((byte & 0x7f) as i32, max));
        v.set_mute(byte & 0x80 != 0, false);
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_round_trip_is_stable() {
        for max in [RANGE_MAX_SCO, RANGE_MAX_A2DP] {
            for x in 0..=max {
                let level = range_to_level(x, max);
                let back = level_to_range(level, max);
                assert!((back - x).abs() <= 1, "max={max} x={x} level={level} back={back}");
            }
        }
    }

    #[test]
    fn zero_range_is_floor_level() {
        assert_eq!(range_to_level(0, RANGE_MAX_A2DP), LEVEL_MIN);
        assert_eq!(level_to_range(LEVEL_MIN, RANGE_MAX_A2DP), 0);
    }

    #[test]
    fn full_range_is_zero_decibel() {
        assert_eq!(range_to_level(RANGE_MAX_A2DP, RANGE_MAX_A2DP), 0);
        assert_eq!(level_to_range(0, RANGE_MAX_A2DP), RANGE_MAX_A2DP);
    }

    #[test]
    fn mute_zeroes_scale() {
        let mut v = ChannelVolume::default();
        assert!((v.scale() - 1.0).abs() < 1e-9);
        v.set_mute(true, false);
        assert_eq!(v.scale(), 0.0);
        v.set_mute(false, false);
        assert!((v.scale() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn wire_encoding_carries_mute() {
        let mut v = ChannelVolume::default();
        v.set_level(0);
        v.set_mute(true, false);
        let byte = v.to_wire(RANGE_MAX_A2DP);
        assert_eq!(byte, 0x80 | 127);
        let back = ChannelVolume::from_wire(byte, RANGE_MAX_A2DP);
        assert!(back.soft_mute);
        assert_eq!(back.level(), 0);
    }
}
