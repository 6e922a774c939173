//! Scaffolding shared by playback and record threads
//!
//! [`ThreadBase`] owns the thread lock and the condition variable the
//! worker sleeps on, the config-event queue, effect chains and the wake
//! lock. The state behind the lock is generic so each thread type can add
//! its own fields while reusing the queue and effect handling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Duration;

use crate::config::EngineConfig;
use crate::devices::{InputDevices, OutputDevices};
use crate::effects::{AudioEffect, EffectChain, EffectModule, EffectType};
use crate::error::{FlingerError, FlingerResult};
use crate::ids::IdAllocator;
use crate::params::AudioParameter;
use crate::types::{IoHandle, PatchHandle, SessionId};
use crate::wake_lock::{PowerManager, WakeLock};

use super::config_event::{
    AudioPatch, ConfigEvent, ConfigEventKind, ConfigReply, IoConfigEvent, IoDescriptor, IoEventKind, IoNotifier,
    SchedulingPolicy,
};

/// Attempts made by [`ThreadBase::dump`] to take a possibly stuck lock
pub const DUMP_LOCK_RETRIES: u32 = 50;
/// Pause between two dump lock attempts
pub const DUMP_LOCK_SLEEP: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadType {
    Mixer,
    Direct,
    Offload,
    Duplicating,
    Record,
}

impl ThreadType {
    pub fn name(self) -> &'static str {
        match self {
            ThreadType::Mixer => "MIXER",
            ThreadType::Direct => "DIRECT",
            ThreadType::Offload => "OFFLOAD",
            ThreadType::Duplicating => "DUPLICATING",
            ThreadType::Record => "RECORD",
        }
    }
}

/// Collaborators every thread receives at construction
#[derive(Clone)]
pub struct ThreadContext {
    pub config: EngineConfig,
    pub ids: Arc<IdAllocator>,
    pub io: IoNotifier,
    pub power: Option<Arc<dyn PowerManager>>,
    pub scheduler: Option<Arc<dyn SchedulingPolicy>>,
}

impl ThreadContext {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            ids: Arc::new(IdAllocator::new()),
            io: IoNotifier::new(),
            power: None,
            scheduler: None,
        }
    }
}

// ─────────────────────────────────────────────────────────────
// Locked state
// ─────────────────────────────────────────────────────────────

/// Fields every thread keeps behind its lock
pub struct BaseState {
    pub(crate) config_events: VecDeque<ConfigEvent>,
    /// Events ever queued; the next one gets this as its sequence number
    events_queued: u64,
    effect_chains: Vec<Arc<Mutex<EffectChain>>>,
    /// Suspend reference counts per session and effect type
    suspended_effects: HashMap<SessionId, HashMap<EffectType, u32>>,
    pub(crate) wake_lock: WakeLock,
    pub(crate) patch: Option<PatchHandle>,
    /// Key/value pairs last applied without error
    pub(crate) param_cache: AudioParameter,
}

impl BaseState {
    pub(crate) fn new(tag: String, power: Option<Arc<dyn PowerManager>>) -> Self {
        Self {
            config_events: VecDeque::new(),
            events_queued: 0,
            effect_chains: Vec::new(),
            suspended_effects: HashMap::new(),
            wake_lock: WakeLock::new(tag, power),
            patch: None,
            param_cache: AudioParameter::new(),
        }
    }

    /// Stamp the next sequence number and append to the queue
    pub(crate) fn enqueue_event(&mut self, mut event: ConfigEvent) -> u64 {
        let seq = self.events_queued;
        self.events_queued += 1;
        event.set_seq(seq);
        self.config_events.push_back(event);
        seq
    }

    pub fn effect_chain(&self, session: SessionId) -> Option<Arc<Mutex<EffectChain>>> {
        self.effect_chains
            .iter()
            .find(|c| crate::lock(c).session() == session)
            .cloned()
    }

    pub fn effect_chains(&self) -> &[Arc<Mutex<EffectChain>>] {
        &self.effect_chains
    }

    /// Add `module` to the chain of `session`, creating the chain if needed
    pub(crate) fn add_effect_l(&mut self, session: SessionId, module: EffectModule) -> FlingerResult<()> {
        let chain = match self.effect_chain(session) {
            Some(chain) => chain,
            None => {
                let mut chain = EffectChain::new(session);
                if let Some(types) = self.suspended_effects.get(&session) {
                    for t in types.keys() {
                        chain.set_effect_suspended(*t, true);
                    }
                }
                let chain = Arc::new(Mutex::new(chain));
                // the output mix chain runs last
                if session == SessionId::OUTPUT_MIX {
                    self.effect_chains.push(chain.clone());
                } else {
                    self.effect_chains.insert(0, chain.clone());
                }
                chain
            }
        };
        let mut chain = crate::lock(&chain);
        if chain.has_effect(module.id()) {
            return Err(FlingerError::AlreadyExists(format!("effect {}", module.id())));
        }
        chain.add_effect(module);
        Ok(())
    }

    /// Remove an effect; the chain goes away with its last effect
    pub(crate) fn remove_effect_l(&mut self, session: SessionId, id: u32) -> FlingerResult<EffectModule> {
        let chain = self
            .effect_chain(session)
            .ok_or_else(|| FlingerError::bad_value(format!("no effect chain for session {}", session.0)))?;
        let (module, empty) = {
            let mut chain = crate::lock(&chain);
            let module = chain
                .remove_effect(id)
                .ok_or_else(|| FlingerError::bad_value(format!("no effect {} in session {}", id, session.0)))?;
            (module, chain.is_empty())
        };
        if empty {
            self.effect_chains.retain(|c| !Arc::ptr_eq(c, &chain));
            log::debug!("effect chain of session {} removed", session.0);
        }
        Ok(module)
    }

    /// Reference-counted suspend of an effect type within a session
    ///
    /// Only the first suspend and the last restore reach the chain.
    pub(crate) fn set_effect_suspended_l(&mut self, session: SessionId, effect_type: EffectType, suspend: bool) {
        let types = self.suspended_effects.entry(session).or_default();
        let count = types.entry(effect_type).or_insert(0);
        let apply = if suspend {
            *count += 1;
            *count == 1
        } else if *count == 0 {
            false
        } else {
            *count -= 1;
            *count == 0
        };
        if !suspend && *count == 0 {
            types.remove(&effect_type);
            if types.is_empty() {
                self.suspended_effects.remove(&session);
            }
        }
        if apply {
            if let Some(chain) = self.effect_chain(session) {
                crate::lock(&chain).set_effect_suspended(effect_type, suspend);
            }
        }
    }

    pub fn effect_suspend_count(&self, session: SessionId, effect_type: EffectType) -> u32 {
        self.suspended_effects
            .get(&session)
            .and_then(|t| t.get(&effect_type))
            .copied()
            .unwrap_or(0)
    }

    /// Wake every blocked sender with `DeadObject`
    pub(crate) fn abort_config_events(&mut self) {
        for event in self.config_events.drain(..) {
            event.complete(Err(FlingerError::DeadObject("thread exited".into())));
        }
    }
}

/// Access to the common part of a thread's locked state
pub trait ThreadState: Send {
    fn base(&self) -> &BaseState;
    fn base_mut(&mut self) -> &mut BaseState;
    /// Stream parameters reported in I/O events
    fn io_descriptor(&self, io: IoHandle) -> IoDescriptor;
    /// Thread-specific lines for [`ThreadBase::dump`]
    fn dump(&self, out: &mut String);
}

// ─────────────────────────────────────────────────────────────
// ThreadBase
// ─────────────────────────────────────────────────────────────

pub struct ThreadBase<S> {
    id: IoHandle,
    thread_type: ThreadType,
    name: String,
    ctx: ThreadContext,
    state: Mutex<S>,
    wait_work: Condvar,
    exit_pending: AtomicBool,
    // advisory, written by the worker only
    standby: AtomicBool,
    out_device: AtomicU32,
    in_device: AtomicU32,
}

impl<S: ThreadState> ThreadBase<S> {
    pub(crate) fn new(id: IoHandle, thread_type: ThreadType, ctx: ThreadContext, state: S) -> Self {
        Self {
            id,
            thread_type,
            name: format!("{}_{}", thread_type.name(), id.0),
            ctx,
            state: Mutex::new(state),
            wait_work: Condvar::new(),
            exit_pending: AtomicBool::new(false),
            standby: AtomicBool::new(true),
            out_device: AtomicU32::new(0),
            in_device: AtomicU32::new(0),
        }
    }

    #[inline]
    pub fn id(&self) -> IoHandle {
        self.id
    }

    #[inline]
    pub fn thread_type(&self) -> ThreadType {
        self.thread_type
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn engine_config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    #[inline]
    pub(crate) fn ctx(&self) -> &ThreadContext {
        &self.ctx
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, S> {
        crate::lock(&self.state)
    }

    /// Wake the worker
    pub(crate) fn broadcast(&self) {
        self.wait_work.notify_all();
    }

    pub(crate) fn wait_work<'a>(&self, guard: MutexGuard<'a, S>) -> MutexGuard<'a, S> {
        self.wait_work.wait(guard).unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn wait_work_timeout<'a>(&self, guard: MutexGuard<'a, S>, timeout: Duration) -> MutexGuard<'a, S> {
        match self.wait_work.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    // ─────────────────────────────────────────────────────────
    // Config events
    // ─────────────────────────────────────────────────────────

    /// Queue an event and block until the worker has processed it
    ///
    /// There is no timeout: a stuck worker blocks the caller.
    pub fn send_config_event(&self, kind: ConfigEventKind) -> FlingerResult<ConfigReply> {
        let (event, rx) = ConfigEvent::with_reply(kind);
        {
            let mut st = self.lock();
            if self.exit_pending() {
                return Err(FlingerError::DeadObject(format!("{} is exiting", self.name)));
            }
            let name = event.kind.name();
            let seq = st.base_mut().enqueue_event(event);
            log::debug!("{}: queue #{} {} (blocking)", self.name, seq, name);
            self.broadcast();
        }
        rx.blocking_recv()
            .map_err(|_| FlingerError::DeadObject(format!("{} exited before replying", self.name)))?
    }

    /// Queue an event without waiting; lock held by the caller
    pub(crate) fn send_config_event_l(&self, st: &mut S, kind: ConfigEventKind) {
        let name = kind.name();
        let seq = st.base_mut().enqueue_event(ConfigEvent::new(kind));
        log::trace!("{}: queue #{} {}", self.name, seq, name);
        self.broadcast();
    }

    pub(crate) fn send_io_config_event_l(&self, st: &mut S, kind: IoEventKind) {
        self.send_config_event_l(st, ConfigEventKind::Io(kind));
    }

    pub(crate) fn send_prio_config_event_l(&self, st: &mut S, pid: u32, tid: u32, priority: u32) {
        self.send_config_event_l(st, ConfigEventKind::Prio { pid, tid, priority });
    }

    /// Worker side: next event in FIFO order
    pub(crate) fn pop_config_event_l(&self, st: &mut S) -> Option<ConfigEvent> {
        st.base_mut().config_events.pop_front()
    }

    /// Handle the event kinds that need no thread-specific knowledge
    pub(crate) fn process_common_event_l(&self, st: &S, kind: &ConfigEventKind) -> FlingerResult<ConfigReply> {
        match kind {
            ConfigEventKind::Io(event) => {
                self.ctx.io.publish(IoConfigEvent {
                    kind: *event,
                    desc: st.io_descriptor(self.id),
                });
                Ok(ConfigReply::Done)
            }
            ConfigEventKind::Prio { pid, tid, priority } => {
                if let Some(scheduler) = &self.ctx.scheduler {
                    if let Err(e) = scheduler.request_priority(*pid, *tid, *priority) {
                        log::warn!(
                            "{}: priority {} for pid {} tid {} refused: {}",
                            self.name,
                            priority,
                            pid,
                            tid,
                            e
                        );
                    }
                }
                Ok(ConfigReply::Done)
            }
            other => Err(FlingerError::invalid_operation(format!(
                "{} is not a common event",
                other.name()
            ))),
        }
    }

    pub fn set_parameters(&self, kv: &str) -> FlingerResult<()> {
        self.send_config_event(ConfigEventKind::SetParameter(kv.to_string()))
            .map(|_| ())
    }

    pub fn create_audio_patch(&self, patch: AudioPatch) -> FlingerResult<PatchHandle> {
        match self.send_config_event(ConfigEventKind::CreateAudioPatch(patch))? {
            ConfigReply::Patch(handle) => Ok(handle),
            _ => Err(FlingerError::invalid_operation("patch handler returned no handle")),
        }
    }

    /// Values of `keys` as reported by the stream
    pub fn get_parameters(&self, keys: &str) -> FlingerResult<String> {
        match self.send_config_event(ConfigEventKind::GetParameter(keys.to_string()))? {
            ConfigReply::Parameters(kv) => Ok(kv),
            _ => Ok(String::new()),
        }
    }

    pub fn release_audio_patch(&self, handle: PatchHandle) -> FlingerResult<()> {
        self.send_config_event(ConfigEventKind::ReleaseAudioPatch(handle))
            .map(|_| ())
    }

    // ─────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────

    /// Ask the worker to return at its next cycle boundary
    pub fn exit(&self) {
        log::debug!("{}: exit requested", self.name);
        let _st = self.lock();
        self.exit_pending.store(true, Ordering::Relaxed);
        self.broadcast();
    }

    #[inline]
    pub fn exit_pending(&self) -> bool {
        self.exit_pending.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn standby(&self) -> bool {
        self.standby.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn set_standby(&self, standby: bool) {
        self.standby.store(standby, Ordering::Relaxed);
    }

    #[inline]
    pub fn out_device(&self) -> OutputDevices {
        OutputDevices::from_bits_truncate(self.out_device.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_out_device(&self, device: OutputDevices) {
        self.out_device.store(device.bits(), Ordering::Relaxed);
    }

    #[inline]
    pub fn in_device(&self) -> InputDevices {
        InputDevices::from_bits_truncate(self.in_device.load(Ordering::Relaxed))
    }

    #[inline]
    pub(crate) fn set_in_device(&self, device: InputDevices) {
        self.in_device.store(device.bits(), Ordering::Relaxed);
    }

    // ─────────────────────────────────────────────────────────
    // Effects
    // ─────────────────────────────────────────────────────────

    /// Insert an effect into the chain of `session`; returns the effect id
    pub fn add_effect(&self, session: SessionId, effect: Box<dyn AudioEffect>) -> FlingerResult<u32> {
        let id = self.ctx.ids.new_effect();
        let mut st = self.lock();
        st.base_mut().add_effect_l(session, EffectModule::new(id, effect))?;
        Ok(id)
    }

    pub fn remove_effect(&self, session: SessionId, id: u32) -> FlingerResult<()> {
        let mut st = self.lock();
        st.base_mut().remove_effect_l(session, id).map(|_| ())
    }

    pub fn get_effect_chain(&self, session: SessionId) -> Option<Arc<Mutex<EffectChain>>> {
        self.lock().base().effect_chain(session)
    }

    pub fn set_effect_suspended(&self, session: SessionId, effect_type: EffectType, suspend: bool) {
        let mut st = self.lock();
        st.base_mut().set_effect_suspended_l(session, effect_type, suspend);
    }

    // ─────────────────────────────────────────────────────────
    // Diagnostics
    // ─────────────────────────────────────────────────────────

    /// Human-readable state; never blocks for long on a stuck worker
    pub fn dump(&self) -> String {
        let mut out = format!(
            "{} ({}): standby={} out_device={:#x} in_device={:#x}\n",
            self.name,
            self.thread_type.name(),
            self.standby(),
            self.out_device().bits(),
            self.in_device().bits()
        );
        match self.try_lock_for_dump() {
            Some(st) => {
                let base = st.base();
                out.push_str(&format!(
                    "  pending config events: {}\n  effect chains: {}\n  wake lock uids: {:?}\n  patch: {:?}\n",
                    base.config_events.len(),
                    base.effect_chains.len(),
                    base.wake_lock.uids(),
                    base.patch
                ));
                if !base.param_cache.is_empty() {
                    out.push_str(&format!("  parameters: {}\n", base.param_cache));
                }
                st.dump(&mut out);
            }
            None => out.push_str("  thread lock unavailable: possible deadlock\n"),
        }
        out
    }

    fn try_lock_for_dump(&self) -> Option<MutexGuard<'_, S>> {
        for attempt in 0..DUMP_LOCK_RETRIES {
            match self.state.try_lock() {
                Ok(guard) => return Some(guard),
                Err(TryLockError::Poisoned(poisoned)) => return Some(poisoned.into_inner()),
                Err(TryLockError::WouldBlock) => {
                    if attempt + 1 < DUMP_LOCK_RETRIES {
                        std::thread::sleep(DUMP_LOCK_SLEEP);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::GainEffect;
    use crate::types::{AudioFormat, ChannelMask};

    struct TestState {
        base: BaseState,
    }

    impl ThreadState for TestState {
        fn base(&self) -> &BaseState {
            &self.base
        }
        fn base_mut(&mut self) -> &mut BaseState {
            &mut self.base
        }
        fn io_descriptor(&self, io: IoHandle) -> IoDescriptor {
            IoDescriptor {
                io,
                sample_rate: 48000,
                format: AudioFormat::Pcm16,
                channel_mask: ChannelMask::OUT_STEREO,
                frame_count: 960,
                latency_ms: 20,
            }
        }
        fn dump(&self, out: &mut String) {
            out.push_str("  test state\n");
        }
    }

    fn thread() -> ThreadBase<TestState> {
        ThreadBase::new(
            IoHandle(3),
            ThreadType::Mixer,
            ThreadContext::new(EngineConfig::default()),
            TestState {
                base: BaseState::new("test".into(), None),
            },
        )
    }

    #[test]
    fn test_async_events_keep_fifo_order() {
        let t = thread();
        {
            let mut st = t.lock();
            for kv in ["a=1", "b=2", "c=3"] {
                t.send_config_event_l(&mut st, ConfigEventKind::SetParameter(kv.into()));
            }
        }
        let mut st = t.lock();
        let mut seen = Vec::new();
        while let Some(ev) = t.pop_config_event_l(&mut st) {
            if let ConfigEventKind::SetParameter(kv) = &ev.kind {
                seen.push(kv.clone());
            }
        }
        assert_eq!(seen, ["a=1", "b=2", "c=3"]);
    }

    #[test]
    fn test_concurrent_senders_processed_in_enqueue_order() {
        const CLIENTS: usize = 8;
        let t = Arc::new(thread());
        let barrier = Arc::new(std::sync::Barrier::new(CLIENTS));

        let worker = {
            let t = t.clone();
            std::thread::spawn(move || {
                let mut processed = Vec::new();
                let mut st = t.lock();
                while processed.len() < CLIENTS {
                    match t.pop_config_event_l(&mut st) {
                        Some(ev) => {
                            let ConfigEventKind::SetParameter(kv) = &ev.kind else {
                                panic!("unexpected event {:?}", ev);
                            };
                            processed.push((ev.seq(), kv.clone()));
                            let seq = ev.seq();
                            ev.complete(Ok(ConfigReply::Parameters(seq.to_string())));
                        }
                        None => st = t.wait_work_timeout(st, Duration::from_millis(5)),
                    }
                }
                processed
            })
        };

        let clients: Vec<_> = (0..CLIENTS)
            .map(|i| {
                let t = t.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    let kv = format!("client={}", i);
                    barrier.wait();
                    match t.send_config_event(ConfigEventKind::SetParameter(kv.clone())).unwrap() {
                        ConfigReply::Parameters(seq) => (seq.parse::<u64>().unwrap(), kv),
                        other => panic!("unexpected reply {:?}", other),
                    }
                })
            })
            .collect();
        let mut replies: Vec<(u64, String)> = clients.into_iter().map(|c| c.join().unwrap()).collect();
        let processed = worker.join().unwrap();

        let seqs: Vec<u64> = processed.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, (0..CLIENTS as u64).collect::<Vec<_>>());
        // every sender got the reply to its own event
        replies.sort();
        assert_eq!(replies, processed);
    }

    #[test]
    fn test_blocking_event_gets_worker_reply() {
        let t = Arc::new(thread());
        let worker = {
            let t = t.clone();
            std::thread::spawn(move || loop {
                let mut st = t.lock();
                if let Some(ev) = t.pop_config_event_l(&mut st) {
                    ev.complete(Ok(ConfigReply::Patch(PatchHandle(77))));
                    return;
                }
                drop(t.wait_work_timeout(st, Duration::from_millis(5)));
            })
        };
        let patch = AudioPatch::playback(IoHandle(3), OutputDevices::SPEAKER);
        assert_eq!(t.create_audio_patch(patch).unwrap(), PatchHandle(77));
        worker.join().unwrap();
    }

    #[test]
    fn test_send_after_exit_is_refused() {
        let t = thread();
        t.exit();
        assert!(matches!(t.set_parameters("a=1"), Err(FlingerError::DeadObject(_))));
    }

    #[test]
    fn test_aborted_events_report_dead_object() {
        let t = Arc::new(thread());
        let sender = {
            let t = t.clone();
            std::thread::spawn(move || t.set_parameters("x=1"))
        };
        // wait until the event is queued, then drop it like an exiting worker
        loop {
            let mut st = t.lock();
            if !st.base().config_events.is_empty() {
                st.base_mut().abort_config_events();
                break;
            }
            drop(st);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(matches!(sender.join().unwrap(), Err(FlingerError::DeadObject(_))));
    }

    #[test]
    fn test_io_event_published_with_descriptor() {
        let t = thread();
        let rx = t.ctx().io.subscribe();
        let st = t.lock();
        t.process_common_event_l(&st, &ConfigEventKind::Io(IoEventKind::OutputConfigChanged))
            .unwrap();
        let ev = rx.try_recv().unwrap();
        assert_eq!(ev.kind, IoEventKind::OutputConfigChanged);
        assert_eq!(ev.desc.io, IoHandle(3));
    }

    #[test]
    fn test_effect_chain_lifecycle() {
        let t = thread();
        let session = SessionId(41);
        let id = t.add_effect(session, Box::new(GainEffect::new(0.5))).unwrap();
        assert!(t.get_effect_chain(session).is_some());
        t.remove_effect(session, id).unwrap();
        assert!(t.get_effect_chain(session).is_none());
        assert!(t.remove_effect(session, id).is_err());
    }

    #[test]
    fn test_suspend_is_reference_counted() {
        let t = thread();
        let session = SessionId(8);
        let id = t.add_effect(session, Box::new(GainEffect::new(0.5))).unwrap();
        t.set_effect_suspended(session, GainEffect::TYPE, true);
        t.set_effect_suspended(session, GainEffect::TYPE, true);
        t.set_effect_suspended(session, GainEffect::TYPE, false);
        {
            let st = t.lock();
            assert_eq!(st.base().effect_suspend_count(session, GainEffect::TYPE), 1);
            let chain = st.base().effect_chain(session).unwrap();
            let mut buf = [1.0f32; 2];
            crate::lock(&chain).process(&mut buf, 2);
            assert_eq!(buf, [1.0, 1.0], "still suspended");
        }
        t.set_effect_suspended(session, GainEffect::TYPE, false);
        let chain = t.get_effect_chain(session).unwrap();
        let mut buf = [1.0f32; 2];
        crate::lock(&chain).process(&mut buf, 2);
        assert_eq!(buf, [0.5, 0.5]);
        assert!(t.remove_effect(session, id).is_ok());
    }

    #[test]
    fn test_new_chain_inherits_session_suspend() {
        let t = thread();
        let session = SessionId(12);
        t.set_effect_suspended(session, EffectType::ALL, true);
        t.add_effect(session, Box::new(GainEffect::new(0.0))).unwrap();
        let chain = t.get_effect_chain(session).unwrap();
        let mut buf = [1.0f32; 2];
        crate::lock(&chain).process(&mut buf, 2);
        assert_eq!(buf, [1.0, 1.0]);
    }

    #[test]
    fn test_dump_reports_possible_deadlock() {
        let t = Arc::new(thread());
        let held = t.lock();
        let t2 = t.clone();
        let dump = std::thread::spawn(move || t2.dump()).join().unwrap();
        drop(held);
        assert!(dump.contains("possible deadlock"));
        assert!(t.dump().contains("test state"));
    }
}
