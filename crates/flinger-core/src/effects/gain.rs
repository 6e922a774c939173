//! Gain effect - linear volume scaling

use super::{AudioEffect, EffectDescriptor, EffectType};

/// Multiplies every sample by a fixed factor
///
/// Zero latency, no state.
pub struct GainEffect {
    descriptor: EffectDescriptor,
    gain: f32,
    bypassed: bool,
}

impl GainEffect {
    pub const TYPE: EffectType = EffectType(0x6761_696e);

    pub fn new(gain: f32) -> Self {
        Self {
            descriptor: EffectDescriptor::new("Gain", Self::TYPE),
            gain: gain.max(0.0),
            bypassed: false,
        }
    }

    pub fn set_gain(&mut self, gain: f32) {
        self.gain = gain.max(0.0);
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }
}

impl Default for GainEffect {
    fn default() -> Self {
        Self::new(1.0)
    }
}

impl AudioEffect for GainEffect {
    fn process(&mut self, buffer: &mut [f32], _channels: usize) {
        for s in buffer.iter_mut() {
            *s *= self.gain;
        }
    }

    fn descriptor(&self) -> &EffectDescriptor {
        &self.descriptor
    }

    fn set_bypass(&mut self, bypass: bool) {
        self.bypassed = bypass;
    }

    fn is_bypassed(&self) -> bool {
        self.bypassed
    }

    fn reset(&mut self) {}
}
