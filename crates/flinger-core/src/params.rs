//! Key/value parameter strings
//!
//! Parameters travel between clients, threads and HAL streams as
//! `"key1=value1;key2=value2"`. [`AudioParameter`] parses and builds these
//! strings while keeping insertion order, so a re-serialized string reads
//! back the same way it was written.

use std::fmt;

use crate::error::{FlingerError, FlingerResult};

/// Output/input device selection (device bitmask as decimal)
pub const KEY_ROUTING: &str = "routing";
/// Sample rate in Hz
pub const KEY_SAMPLING_RATE: &str = "sampling_rate";
/// Format wire code, see [`AudioFormat::code`](crate::types::AudioFormat::code)
pub const KEY_FORMAT: &str = "format";
/// Channel mask as decimal
pub const KEY_CHANNELS: &str = "channels";
/// HAL buffer size in frames
pub const KEY_FRAME_COUNT: &str = "frame_count";
/// Capture source of an input stream
pub const KEY_INPUT_SOURCE: &str = "input_source";
/// Stream type index
pub const KEY_STREAM_TYPE: &str = "stream_type";

/// An ordered set of key/value pairs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioParameter {
    pairs: Vec<(String, String)>,
}

impl AudioParameter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse `"k=v;k2=v2"`. Empty segments are skipped; a key without `=` gets an empty value.
    pub fn parse(kv: &str) -> Self {
        let mut param = Self::new();
        for segment in kv.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((k, v)) => param.add(k.trim(), v.trim()),
                None => param.add(segment, ""),
            }
        }
        param
    }

    /// Set `key` to `value`, replacing any previous value
    pub fn add(&mut self, key: &str, value: &str) {
        match self.pairs.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.pairs.push((key.to_string(), value.to_string())),
        }
    }

    pub fn add_int(&mut self, key: &str, value: i64) {
        self.add(key, &value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Integer value for `key`; `Ok(None)` when absent, `BadValue` when not a number
    pub fn get_int(&self, key: &str) -> FlingerResult<Option<i64>> {
        match self.get(key) {
            None => Ok(None),
            Some(v) => v
                .parse::<i64>()
                .map(Some)
                .map_err(|_| FlingerError::bad_value(format!("{}={} is not an integer", key, v))),
        }
    }

    /// Remove `key`, returning its value
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let pos = self.pairs.iter().position(|(k, _)| k == key)?;
        Some(self.pairs.remove(pos).1)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(k, _)| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl fmt::Display for AudioParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.pairs.iter().enumerate() {
            if i > 0 {
                f.write_str(";")?;
            }
            write!(f, "{}={}", k, v)?;
        }
        Ok(())
    }
}
