//! Requests queued to a worker thread and notifications it publishes
//!
//! Config events are the only way a client thread can change state the
//! worker owns (the HAL stream, the device route). They are processed in
//! FIFO order at the top of every worker cycle. An event created with a
//! reply channel blocks its sender until the worker has handled it.

use std::sync::{Arc, Mutex};

use crossbeam::channel::{unbounded, Receiver, Sender};
use tokio::sync::oneshot;

use crate::devices::{InputDevices, OutputDevices};
use crate::error::{FlingerError, FlingerResult};
use crate::types::{AudioFormat, ChannelMask, IoHandle, PatchHandle};

// ─────────────────────────────────────────────────────────────
// Config events
// ─────────────────────────────────────────────────────────────

/// What a config event asks the worker to do
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigEventKind {
    /// Publish an I/O configuration notification with the thread's current format
    Io(IoEventKind),
    /// Raise a client thread to real-time priority
    Prio { pid: u32, tid: u32, priority: u32 },
    /// Apply `k=v;...` pairs to the thread and its stream
    SetParameter(String),
    /// Query keys from the stream; only the worker touches the stream
    GetParameter(String),
    CreateAudioPatch(AudioPatch),
    ReleaseAudioPatch(PatchHandle),
}

impl ConfigEventKind {
    pub fn name(&self) -> &'static str {
        match self {
            ConfigEventKind::Io(_) => "IO",
            ConfigEventKind::Prio { .. } => "PRIO",
            ConfigEventKind::SetParameter(_) => "SET_PARAMETER",
            ConfigEventKind::GetParameter(_) => "GET_PARAMETER",
            ConfigEventKind::CreateAudioPatch(_) => "CREATE_AUDIO_PATCH",
            ConfigEventKind::ReleaseAudioPatch(_) => "RELEASE_AUDIO_PATCH",
        }
    }
}

/// Status returned to a blocking sender
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigReply {
    Done,
    Patch(PatchHandle),
    Parameters(String),
}

pub(crate) type ReplySender = oneshot::Sender<FlingerResult<ConfigReply>>;

/// A queued request, with an optional reply channel
pub struct ConfigEvent {
    pub(crate) kind: ConfigEventKind,
    reply: Option<ReplySender>,
    /// Position in the thread's queue, stamped when enqueued
    seq: u64,
}

impl ConfigEvent {
    /// Fire-and-forget event
    pub(crate) fn new(kind: ConfigEventKind) -> Self {
        Self { kind, reply: None, seq: 0 }
    }

    /// Event whose sender waits on the returned receiver
    pub(crate) fn with_reply(kind: ConfigEventKind) -> (Self, oneshot::Receiver<FlingerResult<ConfigReply>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                kind,
                reply: Some(tx),
                seq: 0,
            },
            rx,
        )
    }

    #[inline]
    pub(crate) fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn set_seq(&mut self, seq: u64) {
        self.seq = seq;
    }

    #[inline]
    pub(crate) fn requires_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Hand the status back to the sender, if it is still waiting
    pub(crate) fn complete(self, result: FlingerResult<ConfigReply>) {
        if let Some(reply) = self.reply {
            if let Err(result) = reply.send(result) {
                log::debug!("config event reply {:?} dropped, sender gone", result);
            }
        }
    }
}

impl std::fmt::Debug for ConfigEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigEvent")
            .field("seq", &self.seq)
            .field("kind", &self.kind)
            .field("blocking", &self.requires_reply())
            .finish()
    }
}

// ─────────────────────────────────────────────────────────────
// Audio patches
// ─────────────────────────────────────────────────────────────

/// One side of an audio patch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchEndpoint {
    /// A playback or record thread
    Mix(IoHandle),
    OutputDevice(OutputDevices),
    InputDevice(InputDevices),
}

/// A connection between a thread and devices
///
/// Playback: source is the thread's mix, sinks are output devices.
/// Record: source is an input device, sink is the thread's mix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPatch {
    pub sources: Vec<PatchEndpoint>,
    pub sinks: Vec<PatchEndpoint>,
}

impl AudioPatch {
    /// Route the mix of `io` to `devices`
    pub fn playback(io: IoHandle, devices: OutputDevices) -> Self {
        Self {
            sources: vec![PatchEndpoint::Mix(io)],
            sinks: vec![PatchEndpoint::OutputDevice(devices)],
        }
    }

    /// Capture `device` into the mix of `io`
    pub fn record(device: InputDevices, io: IoHandle) -> Self {
        Self {
            sources: vec![PatchEndpoint::InputDevice(device)],
            sinks: vec![PatchEndpoint::Mix(io)],
        }
    }

    /// Union of the output devices among the sinks
    pub(crate) fn output_devices(&self) -> OutputDevices {
        self.sinks.iter().fold(OutputDevices::empty(), |acc, e| match e {
            PatchEndpoint::OutputDevice(d) => acc | *d,
            _ => acc,
        })
    }

    /// The input device among the sources
    pub(crate) fn input_device(&self) -> Option<InputDevices> {
        self.sources.iter().find_map(|e| match e {
            PatchEndpoint::InputDevice(d) => Some(*d),
            _ => None,
        })
    }

    pub(crate) fn validate_playback(&self, io: IoHandle) -> FlingerResult<OutputDevices> {
        let devices = self.output_devices();
        if self.sources != [PatchEndpoint::Mix(io)] || devices.is_empty() {
            return Err(FlingerError::bad_value(format!("patch {:?} does not start at mix {}", self, io.0)));
        }
        Ok(devices)
    }

    pub(crate) fn validate_record(&self, io: IoHandle) -> FlingerResult<InputDevices> {
        match self.input_device() {
            Some(device) if self.sinks == [PatchEndpoint::Mix(io)] && !device.is_empty() => Ok(device),
            _ => Err(FlingerError::bad_value(format!("patch {:?} does not end at mix {}", self, io.0))),
        }
    }
}

// ─────────────────────────────────────────────────────────────
// I/O configuration notifications
// ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoEventKind {
    OutputOpened,
    OutputConfigChanged,
    OutputClosed,
    InputOpened,
    InputConfigChanged,
    InputClosed,
}

/// Stream parameters of a thread at the time of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoDescriptor {
    pub io: IoHandle,
    pub sample_rate: u32,
    pub format: AudioFormat,
    pub channel_mask: ChannelMask,
    pub frame_count: usize,
    pub latency_ms: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoConfigEvent {
    pub kind: IoEventKind,
    pub desc: IoDescriptor,
}

/// Fan-out of I/O events to every registered client
#[derive(Clone, Default)]
pub struct IoNotifier {
    subscribers: Arc<Mutex<Vec<Sender<IoConfigEvent>>>>,
}

impl IoNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<IoConfigEvent> {
        let (tx, rx) = unbounded();
        crate::lock(&self.subscribers).push(tx);
        rx
    }

    /// Deliver to every live subscriber, forgetting the ones that hung up
    pub fn publish(&self, event: IoConfigEvent) {
        log::debug!("io event {:?} on {}", event.kind, event.desc.io.0);
        let mut subscribers = crate::lock(&self.subscribers);
        let before = subscribers.len();
        subscribers.retain(|tx| tx.send(event).is_ok());
        if subscribers.len() < before {
            log::debug!("io event listeners: {} hung up", before - subscribers.len());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        crate::lock(&self.subscribers).len()
    }
}

/// Grants real-time priority to client threads
pub trait SchedulingPolicy: Send + Sync {
    fn request_priority(&self, pid: u32, tid: u32, priority: u32) -> FlingerResult<()>;
}
