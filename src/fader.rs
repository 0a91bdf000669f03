//! Stepped volume fades, one tokio task per fade.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::AbortHandle;

use crate::audio::SessionAccessor;

/// One in-flight volume transition.
#[derive(Debug, Clone, PartialEq)]
pub struct FadeTask {
    pub target_app: String,
    pub start_volume: f32,
    pub end_volume: f32,
    pub duration: Duration,
}

impl FadeTask {
    /// Volume after step `i` of `steps`, clamped to [0, 1].
    pub fn level_at(&self, i: u32, steps: u32) -> f32 {
        if i >= steps {
            return self.end_volume.clamp(0.0, 1.0);
        }
        let t = i as f32 / steps as f32;
        (self.start_volume + (self.end_volume - self.start_volume) * t).clamp(0.0, 1.0)
    }
}

struct ActiveFade {
    id: u64,
    handle: AbortHandle,
}

#[derive(Clone)]
pub struct Fader {
    accessor: SessionAccessor,
    steps: u32,
    supersede: bool,
    registry: Arc<Mutex<HashMap<String, ActiveFade>>>,
    next_id: Arc<AtomicU64>,
}

impl Fader {
    pub fn new(accessor: SessionAccessor, steps: u32, supersede: bool) -> Self {
        Self {
            accessor,
            steps: steps.max(1),
            supersede,
            registry: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn accessor(&self) -> &SessionAccessor {
        &self.accessor
    }

    /// Schedules a fade and returns immediately.
    pub fn fade(&self, name: &str, start_volume: f32, end_volume: f32, duration: Duration) {
        let task = FadeTask {
            target_app: name.to_lowercase(),
            start_volume,
            end_volume,
            duration,
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        // Registry stays locked until the entry is in, so the task's own
        // cleanup can never run first.
        let mut registry = self.registry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(stale) = registry.get(&task.target_app) {
            if self.supersede && !stale.handle.is_finished() {
                log::debug!("Superseding in-flight fade for {}", task.target_app);
                stale.handle.abort();
            }
        }

        let key = task.target_app.clone();
        let accessor = self.accessor.clone();
        let steps = self.steps;
        let cleanup = self.registry.clone();
        let handle = tokio::spawn(async move {
            let app = task.target_app.clone();
            run_fade(&accessor, &task, steps).await;
            let mut registry = cleanup.lock().unwrap_or_else(|p| p.into_inner());
            if registry.get(&app).is_some_and(|active| active.id == id) {
                registry.remove(&app);
            }
        });

        registry.insert(
            key,
            ActiveFade {
                id,
                handle: handle.abort_handle(),
            },
        );
    }

    /// Starts a fade on every app that is present and returns how many were
    /// started. Each fade begins at the app's current volume, or at
    /// `assumed_start` when the volume cannot be read.
    pub async fn fade_many<S: AsRef<str>>(
        &self,
        names: &[S],
        assumed_start: f32,
        end_volume: f32,
        duration: Duration,
    ) -> usize {
        let mut started = 0;
        for name in names {
            let name = name.as_ref();
            if name.trim().is_empty() {
                continue;
            }
            let start_volume = match self.accessor.try_current_volume(name).await {
                Ok(current) => current,
                Err(e) if e.is_not_found() => {
                    log::debug!("Skipping fade for {}: not running", name);
                    continue;
                }
                Err(e) => {
                    log::warn!("Cannot read volume of {} ({}), assuming {}", name, e, assumed_start);
                    assumed_start
                }
            };
            self.fade(name, start_volume, end_volume, duration);
            started += 1;
        }
        started
    }

    pub fn active_fades(&self) -> usize {
        self.registry
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .filter(|active| !active.handle.is_finished())
            .count()
    }
}

/// Applies the steps of `task`; returns how many were applied. Stops at the
/// first step that cannot be applied.
async fn run_fade(accessor: &SessionAccessor, task: &FadeTask, steps: u32) -> u32 {
    if task.duration.is_zero() {
        return u32::from(accessor.set_volume(&task.target_app, task.level_at(1, 1)).await);
    }

    let interval = task.duration / steps;
    for i in 1..=steps {
        if !accessor.set_volume(&task.target_app, task.level_at(i, steps)).await {
            log::debug!(
                "Fade for {} stopped after {}/{} steps",
                task.target_app,
                i - 1,
                steps
            );
            return i - 1;
        }
        if i < steps {
            tokio::time::sleep(interval).await;
        }
    }
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::MemorySessions;

    fn fader(steps: u32, supersede: bool) -> (Arc<MemorySessions>, Fader) {
        let sessions = Arc::new(MemorySessions::new());
        let accessor = SessionAccessor::new(sessions.clone());
        (sessions, Fader::new(accessor, steps, supersede))
    }

    #[test]
    fn levels_interpolate_and_clamp() {
        let task = FadeTask {
            target_app: "vlc".into(),
            start_volume: 1.0,
            end_volume: 0.2,
            duration: Duration::from_millis(300),
        };
        assert!((task.level_at(10, 20) - 0.6).abs() < 1e-6);
        assert_eq!(task.level_at(20, 20), 0.2);

        let overshoot = FadeTask {
            start_volume: 0.5,
            end_volume: 1.5,
            ..task
        };
        assert_eq!(overshoot.level_at(20, 20), 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_steps_to_target() {
        let (sessions, fader) = fader(20, true);
        sessions.add_session("vlc", 1.0);

        fader.fade("vlc", 1.0, 0.2, Duration::from_millis(300));
        tokio::time::sleep(Duration::from_secs(1)).await;

        let writes = sessions.writes_for("vlc");
        assert_eq!(writes.len(), 20);
        assert!((writes[0] - 0.96).abs() < 1e-6);
        assert!(writes.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(sessions.volume_of("vlc"), Some(0.2));
        assert_eq!(fader.active_fades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_does_not_block_caller() {
        let (sessions, fader) = fader(20, true);
        sessions.add_session("vlc", 1.0);

        let before = tokio::time::Instant::now();
        fader.fade("vlc", 1.0, 0.0, Duration::from_secs(2));
        assert_eq!(tokio::time::Instant::now(), before);
        assert_eq!(fader.active_fades(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_aborts_fade() {
        let (sessions, fader) = fader(20, true);
        sessions.add_session("vlc", 1.0);

        // steps land every 20ms
        fader.fade("vlc", 1.0, 0.0, Duration::from_millis(400));
        tokio::time::sleep(Duration::from_millis(50)).await;
        sessions.fail_writes("vlc", true);
        tokio::time::sleep(Duration::from_millis(30)).await;
        sessions.fail_writes("vlc", false);
        let applied = sessions.writes_for("vlc").len();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert!(applied > 0 && applied < 20);
        // no retry once a step has failed
        assert_eq!(sessions.writes_for("vlc").len(), applied);
        assert_eq!(fader.active_fades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_duration_applies_end_volume_once() {
        let (sessions, fader) = fader(20, true);
        sessions.add_session("vlc", 1.0);

        fader.fade("vlc", 1.0, 0.3, Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(sessions.writes_for("vlc"), vec![0.3]);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_many_skips_absent_apps() {
        let (sessions, fader) = fader(20, true);
        sessions.add_session("vlc", 0.8);

        let started = fader
            .fade_many(
                &["vlc", "spotify", ""],
                1.0,
                0.2,
                Duration::from_millis(300),
            )
            .await;
        assert_eq!(started, 1);

        tokio::time::sleep(Duration::from_secs(1)).await;
        let writes = sessions.writes_for("vlc");
        // started from the measured 0.8, not the assumed 1.0
        assert!((writes[0] - 0.77).abs() < 1e-6);
        assert!(sessions.writes_for("spotify").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn fade_many_assumes_start_when_volume_unreadable() {
        let (sessions, fader) = fader(4, true);
        sessions.add_session("vlc", 0.9);
        sessions.add_session("mpv", 0.9);
        sessions.fail_reads("mpv", true);

        let started = fader
            .fade_many(&["vlc", "mpv"], 0.2, 1.0, Duration::from_millis(200))
            .await;
        assert_eq!(started, 2);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!((sessions.writes_for("vlc")[0] - 0.925).abs() < 1e-6);
        // unreadable volume: starts from the assumed 0.2
        let writes = sessions.writes_for("mpv");
        assert_eq!(writes.len(), 4);
        assert!((writes[0] - 0.4).abs() < 1e-6);
        assert_eq!(writes[3], 1.0);
    }

    #[tokio::test(start_paused = true)]
    async fn newer_fade_supersedes_stale_one() {
        let (sessions, fader) = fader(10, true);
        sessions.add_session("vlc", 1.0);

        fader.fade("vlc", 1.0, 0.0, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(500)).await;
        fader.fade("vlc", 0.5, 1.0, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(sessions.volume_of("vlc"), Some(1.0));
        assert_eq!(fader.active_fades(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn without_supersede_fades_race() {
        let (sessions, fader) = fader(10, false);
        sessions.add_session("vlc", 1.0);

        fader.fade("vlc", 1.0, 0.0, Duration::from_secs(2));
        tokio::time::sleep(Duration::from_millis(500)).await;
        fader.fade("vlc", 0.5, 1.0, Duration::from_millis(100));
        tokio::time::sleep(Duration::from_secs(3)).await;

        // the long fade outlives the short one and wins
        assert_eq!(sessions.volume_of("vlc"), Some(0.0));
    }
}
