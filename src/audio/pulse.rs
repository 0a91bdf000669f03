//! PulseAudio / PipeWire-pulse sink inputs, keyed by process binary.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tokio::time::{Duration, Instant};

use super::error::{AudioError, AudioResult};
use super::meter::PeakMeter;
use super::session::{SessionBackend, SessionInfo};
use crate::config::Config;

/// PA_VOLUME_NORM: raw volume of 100%
const VOLUME_NORM: f32 = 65536.0;

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SinkInput {
    pub index: u32,
    pub name: String,
    pub volume: f32,
}

#[derive(Deserialize)]
struct RawSinkInput {
    index: u32,
    #[serde(default)]
    volume: HashMap<String, RawChannelVolume>,
    #[serde(default)]
    properties: HashMap<String, serde_json::Value>,
}

#[derive(Deserialize)]
struct RawChannelVolume {
    value: u32,
}

/// Parses `pactl -f json list sink-inputs`. Streams without a usable
/// process name are skipped.
pub(crate) fn parse_sink_inputs(json: &str) -> AudioResult<Vec<SinkInput>> {
    let raw: Vec<RawSinkInput> =
        serde_json::from_str(json).map_err(|e| AudioError::Parse(e.to_string()))?;

    Ok(raw
        .into_iter()
        .filter_map(|input| {
            let name = ["application.process.binary", "application.name"]
                .iter()
                .filter_map(|key| input.properties.get(*key).and_then(|v| v.as_str()))
                .map(|s| s.trim().to_lowercase())
                .find(|s| !s.is_empty())?;

            let volume = if input.volume.is_empty() {
                1.0
            } else {
                let sum: f32 = input.volume.values().map(|c| c.value as f32).sum();
                (sum / input.volume.len() as f32 / VOLUME_NORM).clamp(0.0, 1.0)
            };

            Some(SinkInput {
                index: input.index,
                name,
                volume,
            })
        })
        .collect())
}

pub struct PulseSessions {
    pactl: String,
    parec: String,
    cache_ttl: Duration,
    cache: Mutex<Option<(Instant, Vec<SinkInput>)>>,
    meter: PeakMeter,
}

impl PulseSessions {
    pub fn new(config: &Config) -> Self {
        Self {
            pactl: config.pactl.to_string(),
            parec: config.parec.to_string(),
            cache_ttl: Duration::from_millis(config.session_cache_ms),
            cache: Mutex::new(None),
            meter: PeakMeter::new(config.parec, config.meter_rate, config.meter_latency_ms),
        }
    }

    async fn run(&self, program: &str, args: &[&str]) -> AudioResult<String> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).to_string())
        } else {
            Err(AudioError::CommandFailed {
                command: format!("{} {}", program, args.join(" ")),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            })
        }
    }

    fn cached(&self) -> Option<Vec<SinkInput>> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .as_ref()
            .filter(|(at, _)| at.elapsed() < self.cache_ttl)
            .map(|(_, inputs)| inputs.clone())
    }

    fn invalidate(&self) {
        *self.cache.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }

    /// Records a volume we just applied, so the next fade step does not
    /// have to enumerate again.
    fn patch_cached(&self, indices: &[u32], volume: f32) {
        let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        if let Some((_, inputs)) = cache.as_mut() {
            for input in inputs.iter_mut().filter(|i| indices.contains(&i.index)) {
                input.volume = volume;
            }
        }
    }

    async fn sink_inputs(&self) -> AudioResult<Vec<SinkInput>> {
        if let Some(inputs) = self.cached() {
            return Ok(inputs);
        }

        let json = self.run(&self.pactl, &["-f", "json", "list", "sink-inputs"]).await?;
        let inputs = parse_sink_inputs(&json)?;

        let live: Vec<u32> = inputs.iter().map(|i| i.index).collect();
        self.meter.retain_streams(&live);
        log::debug!(
            "{} sink inputs, {} peak monitors",
            inputs.len(),
            self.meter.active_monitors()
        );

        *self.cache.lock().unwrap_or_else(|p| p.into_inner()) =
            Some((Instant::now(), inputs.clone()));
        Ok(inputs)
    }

    async fn streams_of(&self, name: &str) -> AudioResult<Vec<SinkInput>> {
        let streams: Vec<SinkInput> = self
            .sink_inputs()
            .await?
            .into_iter()
            .filter(|input| input.name == name)
            .collect();
        if streams.is_empty() {
            Err(AudioError::SessionNotFound(name.to_string()))
        } else {
            Ok(streams)
        }
    }
}

#[async_trait]
impl SessionBackend for PulseSessions {
    async fn initialize(&self) -> AudioResult<()> {
        self.run(&self.pactl, &["info"])
            .await
            .map_err(|e| AudioError::Unavailable(format!("pactl info: {}", e)))?;
        self.run(&self.parec, &["--version"])
            .await
            .map_err(|e| AudioError::Unavailable(format!("parec: {}", e)))?;
        log::info!("PulseAudio session backend ready ({}, {})", self.pactl, self.parec);
        Ok(())
    }

    async fn sessions(&self) -> AudioResult<Vec<SessionInfo>> {
        Ok(self
            .sink_inputs()
            .await?
            .into_iter()
            .map(|input| SessionInfo {
                name: input.name,
                volume: input.volume,
            })
            .collect())
    }

    async fn peak_level(&self, name: &str) -> AudioResult<f32> {
        let indices: Vec<u32> = self.streams_of(name).await?.iter().map(|s| s.index).collect();
        Ok(self.meter.take_peak(&indices))
    }

    async fn volume(&self, name: &str) -> AudioResult<f32> {
        let streams = self.streams_of(name).await?;
        Ok(streams.iter().map(|s| s.volume).fold(0.0, f32::max))
    }

    async fn set_volume(&self, name: &str, level: f32) -> AudioResult<()> {
        let streams = self.streams_of(name).await?;
        let level = level.clamp(0.0, 1.0);
        let raw = ((level * VOLUME_NORM).round() as u32).to_string();

        let mut applied = Vec::with_capacity(streams.len());
        let mut result = Ok(());
        for stream in &streams {
            let index = stream.index.to_string();
            match self
                .run(&self.pactl, &["set-sink-input-volume", &index, &raw])
                .await
            {
                Ok(_) => applied.push(stream.index),
                // The stream may have closed since enumeration; keep going.
                Err(e) => result = Err(e),
            }
        }
        if result.is_ok() {
            self.patch_cached(&applied, level);
        } else {
            self.invalidate();
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"[
        {
            "index": 42,
            "sink": 0,
            "mute": false,
            "volume": {
                "front-left": {"value": 65536, "value_percent": "100%", "db": "0.00 dB"},
                "front-right": {"value": 32768, "value_percent": "50%", "db": "-18.06 dB"}
            },
            "properties": {
                "application.name": "Spotify",
                "application.process.binary": "Spotify",
                "application.process.id": "4242"
            }
        },
        {
            "index": 43,
            "volume": {"mono": {"value": 13107, "value_percent": "20%", "db": "-41.94 dB"}},
            "properties": {"application.name": "Firefox"}
        },
        {
            "index": 44,
            "volume": {},
            "properties": {"media.name": "loopback"}
        }
    ]"#;

    #[test]
    fn parses_sink_inputs() {
        let inputs = parse_sink_inputs(SAMPLE).unwrap();
        assert_eq!(inputs.len(), 2);

        assert_eq!(inputs[0].index, 42);
        assert_eq!(inputs[0].name, "spotify");
        assert!((inputs[0].volume - 0.75).abs() < 1e-6);

        // falls back to application.name
        assert_eq!(inputs[1].name, "firefox");
        assert!((inputs[1].volume - 0.2).abs() < 1e-3);
    }

    #[test]
    fn rejects_malformed_output() {
        let err = parse_sink_inputs("Connection failure").unwrap_err();
        assert!(matches!(err, AudioError::Parse(_)));
    }

    #[test]
    fn empty_list_is_fine() {
        assert!(parse_sink_inputs("[]").unwrap().is_empty());
    }

    #[tokio::test]
    async fn applied_volume_patches_cache() {
        let backend = PulseSessions::new(&Config::new().unwrap());
        let inputs = parse_sink_inputs(SAMPLE).unwrap();
        *backend.cache.lock().unwrap() = Some((Instant::now(), inputs));

        backend.patch_cached(&[42], 0.3);

        let cached = backend.cached().unwrap();
        assert_eq!(cached[0].volume, 0.3);
        assert!((cached[1].volume - 0.2).abs() < 1e-3);
        // served from the cache, no pactl needed
        assert_eq!(backend.volume("spotify").await.unwrap(), 0.3);
    }

    #[tokio::test]
    async fn missing_pactl_is_unavailable() {
        let mut config = Config::new().unwrap();
        config.pactl = "/nonexistent/pactl";
        let backend = PulseSessions::new(&config);
        let err = backend.initialize().await.unwrap_err();
        assert!(matches!(err, AudioError::Unavailable(_)));
        assert!(backend.sessions().await.is_err());
    }
}
