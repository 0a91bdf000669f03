//! Per-process audio sessions. Backend failures never reach callers of the
//! accessor; they degrade to `0.0` / `false`.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use super::error::{AudioError, AudioResult};

/// One running process's audio stream as reported by the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Lower-cased process name
    pub name: String,
    /// Volume scalar in [0, 1]
    pub volume: f32,
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    /// One-time platform setup, run before the monitor loop starts.
    async fn initialize(&self) -> AudioResult<()> {
        Ok(())
    }

    /// All active sessions. A process may own several streams.
    async fn sessions(&self) -> AudioResult<Vec<SessionInfo>>;

    /// Instantaneous peak amplitude of the named process, in [0, 1].
    async fn peak_level(&self, name: &str) -> AudioResult<f32>;

    /// Current volume scalar of the named process, in [0, 1].
    async fn volume(&self, name: &str) -> AudioResult<f32>;

    /// Apply a volume scalar to every stream of the named process.
    async fn set_volume(&self, name: &str, level: f32) -> AudioResult<()>;
}

/// Best-effort front of a [`SessionBackend`]. Names are matched
/// case-insensitively.
#[derive(Clone)]
pub struct SessionAccessor {
    backend: Arc<dyn SessionBackend>,
}

impl SessionAccessor {
    pub fn new(backend: Arc<dyn SessionBackend>) -> Self {
        Self { backend }
    }

    pub async fn initialize(&self) -> AudioResult<()> {
        self.backend.initialize().await
    }

    /// Lower-cased, deduplicated names of every active session.
    pub async fn list_active_apps(&self) -> BTreeSet<String> {
        match self.backend.sessions().await {
            Ok(sessions) => sessions
                .into_iter()
                .map(|s| s.name.to_lowercase())
                .filter(|name| !name.is_empty())
                .collect(),
            Err(e) => {
                log::warn!("Failed to list audio sessions: {}", e);
                BTreeSet::new()
            }
        }
    }

    pub async fn peak_level(&self, name: &str) -> f32 {
        let name = name.to_lowercase();
        match self.backend.peak_level(&name).await {
            Ok(peak) => peak.clamp(0.0, 1.0),
            Err(e) => {
                report("read peak level", &name, &e);
                0.0
            }
        }
    }

    pub async fn current_volume(&self, name: &str) -> f32 {
        self.try_current_volume(name).await.unwrap_or_else(|e| {
            report("read volume", &name.to_lowercase(), &e);
            0.0
        })
    }

    /// Volume read that keeps "absent" apart from other failures.
    pub async fn try_current_volume(&self, name: &str) -> AudioResult<f32> {
        let name = name.to_lowercase();
        self.backend.volume(&name).await.map(|v| v.clamp(0.0, 1.0))
    }

    pub async fn set_volume(&self, name: &str, level: f32) -> bool {
        let name = name.to_lowercase();
        let level = if level.is_nan() { 0.0 } else { level.clamp(0.0, 1.0) };
        match self.backend.set_volume(&name, level).await {
            Ok(()) => true,
            Err(e) => {
                report("set volume", &name, &e);
                false
            }
        }
    }

    /// Number of apps whose volume was applied.
    pub async fn set_volume_for_many<S: AsRef<str>>(&self, names: &[S], level: f32) -> usize {
        let mut success_count = 0;
        for name in names {
            if self.set_volume(name.as_ref(), level).await {
                success_count += 1;
            }
        }
        success_count
    }
}

fn report(action: &str, name: &str, err: &AudioError) {
    // Absent sessions are routine: apps come and go all the time.
    if err.is_not_found() {
        log::debug!("Cannot {} for {}: {}", action, name, err);
    } else {
        log::warn!("Failed to {} for {}: {}", action, name, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySessions;

    fn accessor() -> (Arc<MemorySessions>, SessionAccessor) {
        let sessions = Arc::new(MemorySessions::new());
        let accessor = SessionAccessor::new(sessions.clone());
        (sessions, accessor)
    }

    #[tokio::test]
    async fn lists_lowercase_unique_names() {
        let (sessions, accessor) = accessor();
        sessions.add_session("Spotify", 1.0);
        sessions.add_session("spotify", 0.5);
        sessions.add_session("Game.exe", 1.0);

        let apps = accessor.list_active_apps().await;
        assert_eq!(
            apps.into_iter().collect::<Vec<_>>(),
            vec!["game.exe".to_string(), "spotify".to_string()]
        );
    }

    #[tokio::test]
    async fn absent_sessions_degrade_to_zero() {
        let (_, accessor) = accessor();
        assert_eq!(accessor.peak_level("ghost").await, 0.0);
        assert_eq!(accessor.current_volume("ghost").await, 0.0);
        assert!(!accessor.set_volume("ghost", 0.5).await);
        assert!(accessor.try_current_volume("ghost").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn names_are_case_insensitive() {
        let (sessions, accessor) = accessor();
        sessions.add_session("vlc", 0.8);
        sessions.set_peak("vlc", 0.4);

        assert_eq!(accessor.current_volume("VLC").await, 0.8);
        assert_eq!(accessor.peak_level("Vlc").await, 0.4);
        assert!(accessor.set_volume("VLC", 0.3).await);
        assert_eq!(sessions.volume_of("vlc"), Some(0.3));
    }

    #[tokio::test]
    async fn set_volume_clamps_level() {
        let (sessions, accessor) = accessor();
        sessions.add_session("vlc", 0.5);

        assert!(accessor.set_volume("vlc", 1.7).await);
        assert_eq!(sessions.volume_of("vlc"), Some(1.0));
        assert!(accessor.set_volume("vlc", -0.2).await);
        assert_eq!(sessions.volume_of("vlc"), Some(0.0));
    }

    #[tokio::test]
    async fn set_volume_for_many_counts_successes() {
        let (sessions, accessor) = accessor();
        sessions.add_session("vlc", 1.0);
        sessions.add_session("spotify", 1.0);
        sessions.fail_writes("spotify", true);

        let count = accessor
            .set_volume_for_many(&["vlc", "spotify", "missing"], 0.2)
            .await;
        assert_eq!(count, 1);
        assert_eq!(sessions.volume_of("vlc"), Some(0.2));
        assert_eq!(sessions.volume_of("spotify"), Some(1.0));
    }
}
