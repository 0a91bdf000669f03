//! Per-stream peak metering via `parec --monitor-stream`.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::task::JoinHandle;

struct Monitor {
    // f32 bits; for non-negative floats the bit pattern orders like the value
    peak: Arc<AtomicU32>,
    task: JoinHandle<()>,
}

impl Drop for Monitor {
    fn drop(&mut self) {
        // Dropping the task drops the child, which is spawned with kill_on_drop.
        self.task.abort();
    }
}

pub struct PeakMeter {
    parec: String,
    rate: u32,
    latency_ms: u32,
    monitors: Mutex<HashMap<u32, Monitor>>,
    spawn_warned: Arc<AtomicBool>,
}

impl PeakMeter {
    pub fn new(parec: &str, rate: u32, latency_ms: u32) -> Self {
        Self {
            parec: parec.to_string(),
            rate,
            latency_ms,
            monitors: Mutex::new(HashMap::new()),
            spawn_warned: Arc::new(AtomicBool::new(false)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<u32, Monitor>> {
        self.monitors.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Drops the monitors of streams that are no longer live.
    pub fn retain_streams(&self, live: &[u32]) {
        self.lock().retain(|index, _| live.contains(index));
    }

    /// Peak across `indices` since the last call, starting monitors on
    /// streams seen for the first time. A fresh monitor reports 0.0 until
    /// its first block arrives.
    pub fn take_peak(&self, indices: &[u32]) -> f32 {
        let mut monitors = self.lock();
        let mut peak = 0.0f32;
        for &index in indices {
            let restart = monitors.get(&index).is_none_or(|m| m.task.is_finished());
            if restart {
                monitors.insert(index, self.spawn_monitor(index));
                continue;
            }
            if let Some(monitor) = monitors.get(&index) {
                let bits = monitor.peak.swap(0, Ordering::AcqRel);
                peak = peak.max(f32::from_bits(bits));
            }
        }
        peak.min(1.0)
    }

    pub fn active_monitors(&self) -> usize {
        self.lock().len()
    }

    fn spawn_monitor(&self, index: u32) -> Monitor {
        let peak = Arc::new(AtomicU32::new(0));
        let task = tokio::spawn(run_monitor(
            self.parec.clone(),
            index,
            self.rate,
            self.latency_ms,
            peak.clone(),
            self.spawn_warned.clone(),
        ));
        log::debug!("Peak monitor started for sink input {}", index);
        Monitor { peak, task }
    }
}

async fn run_monitor(
    parec: String,
    index: u32,
    rate: u32,
    latency_ms: u32,
    peak: Arc<AtomicU32>,
    spawn_warned: Arc<AtomicBool>,
) {
    let mut child = match Command::new(&parec)
        .arg(format!("--monitor-stream={}", index))
        .arg("--raw")
        .arg("--format=float32le")
        .arg("--channels=1")
        .arg(format!("--rate={}", rate))
        .arg(format!("--latency-msec={}", latency_ms))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(child) => child,
        Err(e) => {
            if !spawn_warned.swap(true, Ordering::Relaxed) {
                log::warn!("Failed to spawn {} for peak metering: {}", parec, e);
            }
            return;
        }
    };

    let Some(mut stdout) = child.stdout.take() else {
        return;
    };

    let mut buf = vec![0u8; 4096];
    let mut pending: Vec<u8> = Vec::with_capacity(buf.len() + 4);
    loop {
        match stdout.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                pending.extend_from_slice(&buf[..n]);
                let whole = pending.len() / 4 * 4;
                let block = block_peak(&pending[..whole]);
                pending.drain(..whole);
                peak.fetch_max(block.to_bits(), Ordering::AcqRel);
            }
            Err(e) => {
                log::debug!("Peak monitor for sink input {} read error: {}", index, e);
                break;
            }
        }
    }

    let _ = child.kill().await;
    log::debug!("Peak monitor for sink input {} ended", index);
}

/// Absolute maximum of little-endian f32 samples, clamped to [0, 1].
pub(crate) fn block_peak(bytes: &[u8]) -> f32 {
    bytes
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]).abs())
        .filter(|s| s.is_finite())
        .fold(0.0f32, f32::max)
        .min(1.0)
}
