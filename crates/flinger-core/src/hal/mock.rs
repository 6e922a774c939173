//! In-memory streams for worker-cycle tests
//!
//! Each mock shares its state through an `Arc<Mutex<_>>` handle returned by
//! the constructor so a test can inspect writes and inject failures while
//! the stream itself is owned by a worker.

use std::sync::{Arc, Mutex};

use crate::error::{FlingerError, FlingerResult};
use crate::params::AudioParameter;
use crate::types::StreamConfig;

use super::{apply_config_keys, DrainKind, StreamCallback, StreamEvent, StreamIn, StreamOut};

#[derive(Default)]
pub(crate) struct MockOutState {
    pub written: Vec<u8>,
    pub writes: usize,
    pub standby_count: usize,
    /// Number of upcoming writes that fail
    pub fail_writes: usize,
    /// Cap on bytes accepted per write
    pub accept_limit: Option<usize>,
    pub callback: Option<StreamCallback>,
    pub drains: Vec<DrainKind>,
    pub pauses: usize,
    pub resumes: usize,
    pub flushes: usize,
    pub volume: Option<(f32, f32)>,
    pub params: AudioParameter,
    /// Every `set_parameters` string in arrival order
    pub param_log: Vec<String>,
    /// Number of upcoming `set_parameters` calls refused with `InvalidOperation`
    pub refuse_params: usize,
    pub frames_rendered: u64,
}

pub(crate) type MockOutHandle = Arc<Mutex<MockOutState>>;

/// Invoke the registered stream callback outside the state lock
pub(crate) fn fire(handle: &MockOutHandle, event: StreamEvent) {
    let callback = handle.lock().unwrap().callback.clone();
    if let Some(cb) = callback {
        cb(event);
    }
}

pub(crate) struct MockStreamOut {
    config: StreamConfig,
    latency_ms: u32,
    offload: bool,
    state: MockOutHandle,
}

impl MockStreamOut {
    /// Blocking PCM stream with zero latency
    pub fn new(config: StreamConfig) -> (Self, MockOutHandle) {
        let state = Arc::new(Mutex::new(MockOutState::default()));
        (
            Self {
                config,
                latency_ms: 0,
                offload: false,
                state: state.clone(),
            },
            state,
        )
    }

    /// Non-blocking stream with drain, pause, flush and hardware volume
    pub fn offload(config: StreamConfig) -> (Self, MockOutHandle) {
        let (mut out, state) = Self::new(config);
        out.offload = true;
        (out, state)
    }

    pub fn with_latency(mut self, latency_ms: u32) -> Self {
        self.latency_ms = latency_ms;
        self
    }
}

impl StreamOut for MockStreamOut {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn latency_ms(&self) -> u32 {
        self.latency_ms
    }

    fn write(&mut self, data: &[u8]) -> FlingerResult<usize> {
        let mut st = self.state.lock().unwrap();
        if st.fail_writes > 0 {
            st.fail_writes -= 1;
            return Err(FlingerError::Hal("mock write failure".into()));
        }
        let accepted = st.accept_limit.map_or(data.len(), |limit| limit.min(data.len()));
        st.written.extend_from_slice(&data[..accepted]);
        st.writes += 1;
        st.frames_rendered += (accepted / self.config.frame_size().max(1)) as u64;
        Ok(accepted)
    }

    fn standby(&mut self) -> FlingerResult<()> {
        self.state.lock().unwrap().standby_count += 1;
        Ok(())
    }

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()> {
        let param = AudioParameter::parse(kv);
        {
            let mut st = self.state.lock().unwrap();
            st.param_log.push(kv.to_string());
            if st.refuse_params > 0 {
                st.refuse_params -= 1;
                return Err(FlingerError::invalid_operation("stream busy"));
            }
        }
        apply_config_keys(&mut self.config, &param)?;
        let mut st = self.state.lock().unwrap();
        for key in param.keys() {
            if let Some(v) = param.get(key) {
                st.params.add(key, v);
            }
        }
        Ok(())
    }

    fn get_parameters(&self, keys: &str) -> String {
        let st = self.state.lock().unwrap();
        let mut reply = AudioParameter::new();
        for key in AudioParameter::parse(keys).keys() {
            if let Some(v) = st.params.get(key) {
                reply.add(key, v);
            }
        }
        reply.to_string()
    }

    fn render_position(&self) -> FlingerResult<u64> {
        Ok(self.state.lock().unwrap().frames_rendered)
    }

    fn set_volume(&mut self, left: f32, right: f32) -> FlingerResult<()> {
        if !self.offload {
            return Err(FlingerError::invalid_operation("no hardware volume"));
        }
        self.state.lock().unwrap().volume = Some((left, right));
        Ok(())
    }

    fn set_callback(&mut self, callback: StreamCallback) -> bool {
        if !self.offload {
            return false;
        }
        self.state.lock().unwrap().callback = Some(callback);
        true
    }

    fn supports_drain(&self) -> bool {
        self.offload
    }

    fn drain(&mut self, kind: DrainKind) -> FlingerResult<()> {
        self.state.lock().unwrap().drains.push(kind);
        Ok(())
    }

    fn supports_pause(&self) -> bool {
        self.offload
    }

    fn pause(&mut self) -> FlingerResult<()> {
        self.state.lock().unwrap().pauses += 1;
        Ok(())
    }

    fn resume(&mut self) -> FlingerResult<()> {
        self.state.lock().unwrap().resumes += 1;
        Ok(())
    }

    fn flush(&mut self) -> FlingerResult<()> {
        self.state.lock().unwrap().flushes += 1;
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockInState {
    pub reads: usize,
    pub fail_reads: usize,
    pub standby_count: usize,
    pub lost_frames: u32,
    /// Value written into every sample of the next frame; increments per frame
    pub next_value: i16,
}

pub(crate) type MockInHandle = Arc<Mutex<MockInState>>;

/// PCM16 source producing a ramp: frame `n` has every sample equal to `n`
pub(crate) struct MockStreamIn {
    config: StreamConfig,
    state: MockInHandle,
}

impl MockStreamIn {
    pub fn new(config: StreamConfig) -> (Self, MockInHandle) {
        let state = Arc::new(Mutex::new(MockInState::default()));
        (
            Self {
                config,
                state: state.clone(),
            },
            state,
        )
    }
}

impl StreamIn for MockStreamIn {
    fn config(&self) -> StreamConfig {
        self.config
    }

    fn read(&mut self, buf: &mut [u8]) -> FlingerResult<usize> {
        let mut st = self.state.lock().unwrap();
        if st.fail_reads > 0 {
            st.fail_reads -= 1;
            return Err(FlingerError::Hal("mock read failure".into()));
        }
        let frame_size = self.config.frame_size();
        let frames = buf.len() / frame_size;
        for frame in buf[..frames * frame_size].chunks_exact_mut(frame_size) {
            let bytes = st.next_value.to_le_bytes();
            for sample in frame.chunks_exact_mut(2) {
                sample.copy_from_slice(&bytes);
            }
            st.next_value = st.next_value.wrapping_add(1);
        }
        st.reads += 1;
        Ok(frames * frame_size)
    }

    fn standby(&mut self) -> FlingerResult<()> {
        self.state.lock().unwrap().standby_count += 1;
        Ok(())
    }

    fn set_parameters(&mut self, kv: &str) -> FlingerResult<()> {
        apply_config_keys(&mut self.config, &AudioParameter::parse(kv))?;
        Ok(())
    }

    fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    fn input_frames_lost(&mut self) -> u32 {
        std::mem::take(&mut self.state.lock().unwrap().lost_frames)
    }
}
