//! Completion thread for non-blocking output streams
//!
//! A non-blocking stream reports write and drain completion from whatever
//! thread its driver uses. Those notifications are parked here and replayed
//! into the playback thread from one dedicated thread, so the playback
//! state only ever sees them under its own lock.
//!
//! Sequence numbers are stored shifted left by one. Bit 1 means "the
//! playback thread is waiting for this sequence", bit 0 means "the stream
//! has completed it". Only a completion whose sequence still matches the
//! playback thread's current one is honoured; anything older was superseded
//! by a flush and is dropped.

use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};

use crate::error::{FlingerError, FlingerResult};
use crate::hal::{StreamCallback, StreamEvent};

/// Receiver of replayed completions
pub trait AsyncCallbackTarget: Send + Sync {
    fn reset_write_blocked(&self, sequence: u32);
    fn reset_draining(&self, sequence: u32);
    fn on_async_error(&self);
}

#[derive(Debug, Default)]
struct CallbackState {
    write_ack_sequence: u32,
    drain_sequence: u32,
    async_error: bool,
    exit_pending: bool,
}

impl CallbackState {
    fn has_work(&self) -> bool {
        self.write_ack_sequence & 1 != 0 || self.drain_sequence & 1 != 0 || self.async_error
    }
}

/// Completions taken from the state in one go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    write_ack_sequence: u32,
    drain_sequence: u32,
    async_error: bool,
}

pub struct AsyncCallbackThread {
    target: Weak<dyn AsyncCallbackTarget>,
    state: Mutex<CallbackState>,
    wake: Condvar,
}

impl AsyncCallbackThread {
    pub fn new(target: Weak<dyn AsyncCallbackTarget>) -> Arc<Self> {
        Arc::new(Self {
            target,
            state: Mutex::new(CallbackState::default()),
            wake: Condvar::new(),
        })
    }

    /// The closure handed to [`StreamOut::set_callback`](crate::hal::StreamOut::set_callback)
    pub fn stream_callback(self: &Arc<Self>) -> StreamCallback {
        let weak = Arc::downgrade(self);
        Arc::new(move |event| {
            let Some(cb) = weak.upgrade() else {
                return;
            };
            match event {
                StreamEvent::WriteReady => cb.reset_write_blocked(),
                StreamEvent::DrainReady => cb.reset_draining(),
                StreamEvent::Error => cb.set_async_error(),
            }
        })
    }

    /// Record the write the playback thread is about to wait for
    pub fn set_write_blocked(&self, sequence: u32) {
        crate::lock(&self.state).write_ack_sequence = sequence << 1;
    }

    /// The stream accepts data again
    pub fn reset_write_blocked(&self) {
        let mut st = crate::lock(&self.state);
        if st.write_ack_sequence & 2 != 0 {
            st.write_ack_sequence |= 1;
            self.wake.notify_one();
        }
    }

    pub fn set_draining(&self, sequence: u32) {
        crate::lock(&self.state).drain_sequence = sequence << 1;
    }

    /// The requested drain finished
    pub fn reset_draining(&self) {
        let mut st = crate::lock(&self.state);
        if st.drain_sequence & 2 != 0 {
            st.drain_sequence |= 1;
            self.wake.notify_one();
        }
    }

    pub fn set_async_error(&self) {
        let mut st = crate::lock(&self.state);
        st.async_error = true;
        self.wake.notify_one();
    }

    pub fn exit(&self) {
        let mut st = crate::lock(&self.state);
        st.exit_pending = true;
        self.wake.notify_one();
    }

    fn take_pending(st: &mut CallbackState) -> Pending {
        let pending = Pending {
            write_ack_sequence: st.write_ack_sequence,
            drain_sequence: st.drain_sequence,
            async_error: st.async_error,
        };
        st.write_ack_sequence &= !1;
        st.drain_sequence &= !1;
        st.async_error = false;
        pending
    }

    fn dispatch(&self, pending: Pending) {
        let Some(target) = self.target.upgrade() else {
            return;
        };
        if pending.write_ack_sequence & 1 != 0 {
            target.reset_write_blocked(pending.write_ack_sequence >> 1);
        }
        if pending.drain_sequence & 1 != 0 {
            target.reset_draining(pending.drain_sequence >> 1);
        }
        if pending.async_error {
            target.on_async_error();
        }
    }

    /// Replay whatever completed since the last call without blocking
    ///
    /// Returns true if anything was delivered.
    pub fn step(&self) -> bool {
        let pending = {
            let mut st = crate::lock(&self.state);
            if !st.has_work() {
                return false;
            }
            Self::take_pending(&mut st)
        };
        self.dispatch(pending);
        true
    }

    fn run(&self) {
        log::debug!("async callback thread started");
        loop {
            let pending = {
                let mut st = crate::lock(&self.state);
                while !st.has_work() && !st.exit_pending {
                    st = self.wake.wait(st).unwrap_or_else(PoisonError::into_inner);
                }
                if st.exit_pending {
                    break;
                }
                Self::take_pending(&mut st)
            };
            self.dispatch(pending);
        }
        log::debug!("async callback thread exiting");
    }

    pub fn spawn(self: &Arc<Self>, name: &str) -> FlingerResult<JoinHandle<()>> {
        let this = self.clone();
        thread::Builder::new()
            .name(format!("{}-callback", name))
            .spawn(move || this.run())
            .map_err(|e| FlingerError::NoInit(format!("cannot spawn callback thread: {}", e)))
    }
}
