//! Cross-session synchronisation events
//!
//! A sync event is raised by a playback track of the *trigger* session and
//! consumed by a listener in another session. The typical use is starting a
//! capture exactly when a prompt has finished playing: the record track arms
//! itself with a `PresentationComplete` event on the prompt's session.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use crate::types::SessionId;

/// Kind of sync event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEventType {
    /// All frames of the trigger track have been presented
    PresentationComplete,
}

/// Upper bound on how long an armed record track waits for its event
pub const SYNC_RECORD_START_TIMEOUT_MS: u64 = 30_000;

pub type SyncEventCallback = Box<dyn Fn(&SyncEvent) + Send + Sync>;

/// A one-shot event with a listener callback
pub struct SyncEvent {
    event_type: SyncEventType,
    trigger_session: SessionId,
    listener_session: SessionId,
    callback: Mutex<Option<SyncEventCallback>>,
    triggered: AtomicBool,
    cancelled: AtomicBool,
}

impl SyncEvent {
    pub fn new(
        event_type: SyncEventType,
        trigger_session: SessionId,
        listener_session: SessionId,
        callback: SyncEventCallback,
    ) -> Self {
        Self {
            event_type,
            trigger_session,
            listener_session,
            callback: Mutex::new(Some(callback)),
            triggered: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        }
    }

    #[inline]
    pub fn event_type(&self) -> SyncEventType {
        self.event_type
    }

    #[inline]
    pub fn trigger_session(&self) -> SessionId {
        self.trigger_session
    }

    #[inline]
    pub fn listener_session(&self) -> SessionId {
        self.listener_session
    }

    /// Run the callback; only the first trigger of a live event has an effect
    pub fn trigger(&self) {
        let callback = crate::lock(&self.callback).take();
        if let Some(cb) = callback {
            self.triggered.store(true, Ordering::Relaxed);
            cb(self);
        }
    }

    /// Drop the callback without running it
    pub fn cancel(&self) {
        if crate::lock(&self.callback).take().is_some() {
            self.cancelled.store(true, Ordering::Relaxed);
        }
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for SyncEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEvent")
            .field("type", &self.event_type)
            .field("trigger_session", &self.trigger_session)
            .field("listener_session", &self.listener_session)
            .field("triggered", &self.is_triggered())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    fn counting_event(counter: Arc<AtomicU32>) -> SyncEvent {
        SyncEvent::new(
            SyncEventType::PresentationComplete,
            SessionId(1),
            SessionId(2),
            Box::new(move |_| {
                counter.fetch_add(1, Ordering::Relaxed);
            }),
        )
    }

    #[test]
    fn test_trigger_runs_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let event = counting_event(counter.clone());
        event.trigger();
        event.trigger();
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(event.is_triggered());
        assert!(!event.is_cancelled());
    }

    #[test]
    fn test_cancelled_event_never_fires() {
        let counter = Arc::new(AtomicU32::new(0));
        let event = counting_event(counter.clone());
        event.cancel();
        event.trigger();
        assert_eq!(counter.load(Ordering::Relaxed), 0);
        assert!(event.is_cancelled());
    }

    #[test]
    fn test_cancel_after_trigger_is_noop() {
        let event = counting_event(Arc::new(AtomicU32::new(0)));
        event.trigger();
        event.cancel();
        assert!(!event.is_cancelled());
    }
}
