//! Scriptable in-memory sessions for the unit tests.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;

use super::error::{AudioError, AudioResult};
use super::session::{SessionBackend, SessionInfo};

#[derive(Debug, Clone)]
struct Stream {
    name: String,
    volume: f32,
    peak: f32,
}

#[derive(Default)]
struct Inner {
    streams: Vec<Stream>,
    failing_writes: HashSet<String>,
    failing_reads: HashSet<String>,
    writes: Vec<(String, f32)>,
}

#[derive(Default)]
pub struct MemorySessions {
    inner: Mutex<Inner>,
}

impl MemorySessions {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds one stream owned by `name`.
    pub fn add_session(&self, name: &str, volume: f32) {
        self.lock().streams.push(Stream {
            name: name.to_lowercase(),
            volume,
            peak: 0.0,
        });
    }

    pub fn remove_session(&self, name: &str) {
        let name = name.to_lowercase();
        self.lock().streams.retain(|s| s.name != name);
    }

    pub fn set_peak(&self, name: &str, peak: f32) {
        let name = name.to_lowercase();
        for stream in self.lock().streams.iter_mut().filter(|s| s.name == name) {
            stream.peak = peak;
        }
    }

    pub fn fail_writes(&self, name: &str, fail: bool) {
        let name = name.to_lowercase();
        let mut inner = self.lock();
        if fail {
            inner.failing_writes.insert(name);
        } else {
            inner.failing_writes.remove(&name);
        }
    }

    pub fn fail_reads(&self, name: &str, fail: bool) {
        let name = name.to_lowercase();
        let mut inner = self.lock();
        if fail {
            inner.failing_reads.insert(name);
        } else {
            inner.failing_reads.remove(&name);
        }
    }

    pub fn volume_of(&self, name: &str) -> Option<f32> {
        let name = name.to_lowercase();
        self.lock()
            .streams
            .iter()
            .find(|s| s.name == name)
            .map(|s| s.volume)
    }

    /// Every successfully applied `(name, level)` in order.
    pub fn writes(&self) -> Vec<(String, f32)> {
        self.lock().writes.clone()
    }

    pub fn writes_for(&self, name: &str) -> Vec<f32> {
        let name = name.to_lowercase();
        self.lock()
            .writes
            .iter()
            .filter(|(n, _)| *n == name)
            .map(|(_, level)| *level)
            .collect()
    }

    pub fn clear_writes(&self) {
        self.lock().writes.clear();
    }
}

#[async_trait]
impl SessionBackend for MemorySessions {
    async fn sessions(&self) -> AudioResult<Vec<SessionInfo>> {
        Ok(self
            .lock()
            .streams
            .iter()
            .map(|s| SessionInfo {
                name: s.name.clone(),
                volume: s.volume,
            })
            .collect())
    }

    async fn peak_level(&self, name: &str) -> AudioResult<f32> {
        self.lock()
            .streams
            .iter()
            .filter(|s| s.name == name)
            .map(|s| s.peak)
            .reduce(f32::max)
            .ok_or_else(|| AudioError::SessionNotFound(name.to_string()))
    }

    async fn volume(&self, name: &str) -> AudioResult<f32> {
        if self.lock().failing_reads.contains(name) {
            return Err(AudioError::Unavailable(format!("reads from {} are failing", name)));
        }
        self.volume_of(name)
            .ok_or_else(|| AudioError::SessionNotFound(name.to_string()))
    }

    async fn set_volume(&self, name: &str, level: f32) -> AudioResult<()> {
        let mut inner = self.lock();
        if !inner.streams.iter().any(|s| s.name == name) {
            return Err(AudioError::SessionNotFound(name.to_string()));
        }
        if inner.failing_writes.contains(name) {
            return Err(AudioError::Unavailable(format!("writes to {} are failing", name)));
        }
        for stream in inner.streams.iter_mut().filter(|s| s.name == name) {
            stream.volume = level;
        }
        inner.writes.push((name.to_string(), level));
        Ok(())
    }
}
