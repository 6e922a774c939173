//! Effect chains
//!
//! Effects are opaque processing stages applied in order to a session's mix
//! buffer. A thread keeps one [`EffectChain`] per session that has effects;
//! session [`SessionId::OUTPUT_MIX`] processes the thread's final mix.
//!
//! Chains are shared between the thread's locked state and its worker as
//! `Arc<Mutex<EffectChain>>`, so the worker can process them outside the
//! thread lock.

mod gain;

pub use gain::GainEffect;

use std::collections::HashSet;

use crate::types::SessionId;

/// Effect implementation type, used to suspend every effect of one kind at once
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectType(pub u128);

impl EffectType {
    /// Matches every effect type when suspending
    pub const ALL: EffectType = EffectType(0);
}

/// Static description of an effect
#[derive(Debug, Clone)]
pub struct EffectDescriptor {
    /// Display name
    pub name: String,
    pub effect_type: EffectType,
    /// Processing latency in frames
    pub latency_frames: u32,
}

impl EffectDescriptor {
    pub fn new(name: impl Into<String>, effect_type: EffectType) -> Self {
        Self {
            name: name.into(),
            effect_type,
            latency_frames: 0,
        }
    }
}

/// The effect contract seen by the engine
pub trait AudioEffect: Send {
    /// Process interleaved float frames in place
    fn process(&mut self, buffer: &mut [f32], channels: usize);

    fn descriptor(&self) -> &EffectDescriptor;

    fn set_bypass(&mut self, bypass: bool);

    fn is_bypassed(&self) -> bool;

    /// Clear internal state (delay lines, filters)
    fn reset(&mut self);
}

/// An effect instance inside a chain
pub struct EffectModule {
    id: u32,
    effect: Box<dyn AudioEffect>,
    suspended: bool,
}

impl EffectModule {
    pub fn new(id: u32, effect: Box<dyn AudioEffect>) -> Self {
        Self {
            id,
            effect,
            suspended: false,
        }
    }

    #[inline]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[inline]
    pub fn effect_type(&self) -> EffectType {
        self.effect.descriptor().effect_type
    }

    #[inline]
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn effect_mut(&mut self) -> &mut dyn AudioEffect {
        self.effect.as_mut()
    }
}

/// Ordered effects of one session
pub struct EffectChain {
    session: SessionId,
    effects: Vec<EffectModule>,
    suspended_types: HashSet<EffectType>,
}

impl EffectChain {
    pub fn new(session: SessionId) -> Self {
        Self {
            session,
            effects: Vec::new(),
            suspended_types: HashSet::new(),
        }
    }

    #[inline]
    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn has_effect(&self, id: u32) -> bool {
        self.effects.iter().any(|m| m.id == id)
    }

    /// Append an effect; it starts suspended if its type currently is
    pub fn add_effect(&mut self, mut module: EffectModule) {
        module.suspended = self.type_is_suspended(module.effect_type());
        log::debug!(
            "EffectChain {}: add effect {} ({})",
            self.session.0,
            module.id,
            module.effect.descriptor().name
        );
        self.effects.push(module);
    }

    /// Remove an effect; returns it if present
    pub fn remove_effect(&mut self, id: u32) -> Option<EffectModule> {
        let pos = self.effects.iter().position(|m| m.id == id)?;
        Some(self.effects.remove(pos))
    }

    /// Suspend or restore every effect of `effect_type` (or all, for [`EffectType::ALL`])
    pub fn set_effect_suspended(&mut self, effect_type: EffectType, suspend: bool) {
        if suspend {
            self.suspended_types.insert(effect_type);
        } else {
            self.suspended_types.remove(&effect_type);
        }
        for i in 0..self.effects.len() {
            let t = self.effects[i].effect_type();
            let suspended = self.type_is_suspended(t);
            let module = &mut self.effects[i];
            if module.suspended != suspended {
                module.suspended = suspended;
                if !suspended {
                    module.effect.reset();
                }
            }
        }
    }

    fn type_is_suspended(&self, effect_type: EffectType) -> bool {
        self.suspended_types.contains(&EffectType::ALL) || self.suspended_types.contains(&effect_type)
    }

    /// Run every live effect over `buffer`
    pub fn process(&mut self, buffer: &mut [f32], channels: usize) {
        for module in &mut self.effects {
            if module.suspended || module.effect.is_bypassed() {
                continue;
            }
            module.effect.process(buffer, channels);
        }
    }

    pub fn reset(&mut self) {
        for module in &mut self.effects {
            module.effect.reset();
        }
    }

    /// Ids of the effects in processing order
    pub fn effect_ids(&self) -> Vec<u32> {
        self.effects.iter().map(|m| m.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GAIN: EffectType = GainEffect::TYPE;
    const OTHER: EffectType = EffectType(0x42);

    struct Invert(EffectDescriptor, bool);

    impl AudioEffect for Invert {
        fn process(&mut self, buffer: &mut [f32], _channels: usize) {
            buffer.iter_mut().for_each(|s| *s = -*s);
        }
        fn descriptor(&self) -> &EffectDescriptor {
            &self.0
        }
        fn set_bypass(&mut self, bypass: bool) {
            self.1 = bypass;
        }
        fn is_bypassed(&self) -> bool {
            self.1
        }
        fn reset(&mut self) {}
    }

    fn invert() -> Box<dyn AudioEffect> {
        Box::new(Invert(EffectDescriptor::new("invert", OTHER), false))
    }

    #[test]
    fn test_effects_run_in_order() {
        let mut chain = EffectChain::new(SessionId(9));
        chain.add_effect(EffectModule::new(1, Box::new(GainEffect::new(0.5))));
        chain.add_effect(EffectModule::new(2, invert()));
        let mut buf = [1.0f32, -1.0];
        chain.process(&mut buf, 2);
        assert_eq!(buf, [-0.5, 0.5]);
        assert_eq!(chain.effect_ids(), vec![1, 2]);
    }

    #[test]
    fn test_suspend_by_type() {
        let mut chain = EffectChain::new(SessionId(9));
        chain.add_effect(EffectModule::new(1, Box::new(GainEffect::new(0.5))));
        chain.add_effect(EffectModule::new(2, invert()));
        chain.set_effect_suspended(GAIN, true);

        let mut buf = [1.0f32];
        chain.process(&mut buf, 1);
        assert_eq!(buf, [-1.0]);

        chain.set_effect_suspended(GAIN, false);
        let mut buf = [1.0f32];
        chain.process(&mut buf, 1);
        assert_eq!(buf, [-0.5]);
    }

    #[test]
    fn test_suspend_all_applies_to_new_effects() {
        let mut chain = EffectChain::new(SessionId(9));
        chain.set_effect_suspended(EffectType::ALL, true);
        chain.add_effect(EffectModule::new(3, invert()));
        let mut buf = [1.0f32];
        chain.process(&mut buf, 1);
        assert_eq!(buf, [1.0]);
    }

    #[test]
    fn test_remove_effect() {
        let mut chain = EffectChain::new(SessionId(1));
        chain.add_effect(EffectModule::new(5, invert()));
        assert!(chain.remove_effect(5).is_some());
        assert!(chain.remove_effect(5).is_none());
        assert!(chain.is_empty());
    }
}
