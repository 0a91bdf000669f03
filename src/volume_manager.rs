//! Duck policy engine: samples priority apps every tick and ducks or
//! restores the music apps. Fades are never awaited by the loop.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures_util::FutureExt;
use serde::Serialize;
use tokio::sync::{oneshot, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::audio::{AudioResult, SessionAccessor};
use crate::config::Config;
use crate::fader::Fader;
use crate::policy::{ConfigProvider, DuckPolicy, PolicySettings};

/// Loop timing and fallbacks that do not change at runtime.
#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub tick_interval: Duration,
    /// Start volume for a duck fade when the app's volume cannot be read
    pub assumed_duck_start: f32,
    /// Start volume for a restore fade when the app's volume cannot be read
    pub assumed_restore_start: f32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_millis(500),
            assumed_duck_start: 1.0,
            assumed_restore_start: 0.2,
        }
    }
}

impl From<&Config> for MonitorSettings {
    fn from(config: &Config) -> Self {
        Self {
            tick_interval: Duration::from_millis(config.tick_interval_ms.max(1)),
            assumed_duck_start: config.assumed_duck_start,
            assumed_restore_start: config.assumed_restore_start,
        }
    }
}

/// Read-only snapshot for observers such as the UI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DuckStatus {
    pub is_ducked: bool,
    pub is_running: bool,
    /// Wall-clock time of the last priority activity, seconds since the epoch
    pub last_priority_epoch_secs: f64,
    pub seconds_since_last_priority: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppVolume {
    pub name: String,
    pub volume: f32,
}

/// What one tick decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Not ducked, no priority activity
    Idle,
    /// Ducked and staying ducked
    Holding,
    Ducked { fades_started: usize },
    Restored { fades_started: usize },
}

struct DuckState {
    is_ducked: bool,
    last_priority: Instant,
    last_priority_wall: SystemTime,
}

impl DuckState {
    fn new() -> Self {
        Self {
            is_ducked: false,
            last_priority: Instant::now(),
            last_priority_wall: SystemTime::now(),
        }
    }
}

struct Inner {
    fader: Fader,
    provider: Arc<dyn ConfigProvider>,
    settings: MonitorSettings,
    state: Mutex<DuckState>,
    running: AtomicBool,
    initialized: OnceCell<()>,
    last_policy: Mutex<Option<DuckPolicy>>,
    last_warnings: Mutex<Vec<String>>,
}

struct LoopHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Handle to the ducking engine. Cheap to clone; all clones drive the same
/// engine.
#[derive(Clone)]
pub struct VolumeManager {
    inner: Arc<Inner>,
    lifecycle: Arc<tokio::sync::Mutex<Option<LoopHandle>>>,
}

impl VolumeManager {
    pub fn new(fader: Fader, provider: Arc<dyn ConfigProvider>, settings: MonitorSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                fader,
                provider,
                settings,
                state: Mutex::new(DuckState::new()),
                running: AtomicBool::new(false),
                initialized: OnceCell::new(),
                last_policy: Mutex::new(None),
                last_warnings: Mutex::new(Vec::new()),
            }),
            lifecycle: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    pub fn accessor(&self) -> &SessionAccessor {
        self.inner.fader.accessor()
    }

    /// Raw settings as the provider currently reports them.
    pub fn settings(&self) -> PolicySettings {
        self.inner.provider.current()
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Starts the monitor loop. The session backend is initialised on the
    /// first start only; an initialisation failure is returned and the
    /// engine stays stopped. Starting a running engine does nothing.
    pub async fn start(&self) -> AudioResult<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        if lifecycle.as_ref().is_some_and(|h| !h.task.is_finished()) {
            log::info!("Volume manager already running");
            return Ok(());
        }

        let accessor = self.accessor().clone();
        self.inner
            .initialized
            .get_or_try_init(|| async move { accessor.initialize().await })
            .await?;

        *self.inner.lock_state() = DuckState::new();
        self.inner.running.store(true, Ordering::SeqCst);

        let (shutdown, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(self.inner.clone(), shutdown_rx));
        *lifecycle = Some(LoopHandle { shutdown, task });
        Ok(())
    }

    /// Halts the loop, waits for it to finish its current tick, then fades
    /// the music apps back to normal whatever the ducked state was. Only
    /// then does the engine report itself stopped.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        if let Some(handle) = lifecycle.take() {
            let _ = handle.shutdown.send(());
            if let Err(e) = handle.task.await {
                log::error!("Monitor loop task failed: {}", e);
            }
        }
        let policy = self.inner.policy();
        self.inner.finish(&policy).await;
    }

    /// Re-applies the ducked volume, e.g. after the user edited it. Does
    /// nothing unless currently ducked. Returns the number of fades started.
    pub async fn force_duck(&self) -> usize {
        if !self.inner.lock_state().is_ducked {
            return 0;
        }
        let policy = self.inner.policy();
        self.inner.duck(&policy).await
    }

    /// Re-applies the normal volume. Does nothing while ducked.
    pub async fn force_restore(&self) -> usize {
        if self.inner.lock_state().is_ducked {
            return 0;
        }
        let policy = self.inner.policy();
        self.inner.restore(&policy).await
    }

    pub fn status(&self) -> DuckStatus {
        let state = self.inner.lock_state();
        DuckStatus {
            is_ducked: state.is_ducked,
            is_running: self.is_running(),
            last_priority_epoch_secs: state
                .last_priority_wall
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
            seconds_since_last_priority: state.last_priority.elapsed().as_secs_f64(),
        }
    }

    #[cfg(test)]
    pub async fn tick(&self) -> TickOutcome {
        self.inner.tick().await
    }

    /// Waits until no fade is in flight. Returns false if some are still
    /// running after `timeout`.
    pub async fn wait_for_fades(&self, timeout: Duration) -> bool {
        let fader = &self.inner.fader;
        tokio::time::timeout(timeout, async {
            while fader.active_fades() > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .is_ok()
    }

    /// Puts every music app back to the normal volume in one step, without
    /// fading. Returns how many were set.
    pub async fn restore_immediately(&self) -> usize {
        let policy = self.inner.policy();
        self.accessor()
            .set_volume_for_many(&policy.music_apps, policy.volume_normal)
            .await
    }

    /// Active sessions minus the policy's ignored apps, with their volumes.
    pub async fn active_apps(&self) -> Vec<AppVolume> {
        let settings = self.settings();
        let accessor = self.accessor();
        let mut apps = Vec::new();
        for name in accessor.list_active_apps().await {
            if settings.ignored_apps.iter().any(|i| i.eq_ignore_ascii_case(&name)) {
                continue;
            }
            let volume = accessor.current_volume(&name).await;
            apps.push(AppVolume { name, volume });
        }
        apps
    }

    /// Diagnostics from the most recent policy evaluation.
    pub fn policy_warnings(&self) -> Vec<String> {
        self.inner
            .last_warnings
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl Inner {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, DuckState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Fresh, sanitised policy. New diagnostics are logged once, not on
    /// every tick.
    fn policy(&self) -> DuckPolicy {
        let (policy, warnings) = DuckPolicy::from_settings(&self.provider.current());
        let warnings: Vec<String> = warnings.iter().map(|w| w.to_string()).collect();

        let mut last = self.last_warnings.lock().unwrap_or_else(|p| p.into_inner());
        if *last != warnings {
            for warning in &warnings {
                log::warn!("{}", warning);
            }
            *last = warnings;
        }
        drop(last);

        *self.last_policy.lock().unwrap_or_else(|p| p.into_inner()) = Some(policy.clone());
        policy
    }

    fn cached_policy(&self) -> DuckPolicy {
        self.last_policy
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
            .unwrap_or_else(|| DuckPolicy::from_settings(&PolicySettings::default()).0)
    }

    async fn priority_active(&self, policy: &DuckPolicy) -> bool {
        let accessor = self.fader.accessor();
        for app in &policy.priority_apps {
            let peak = accessor.peak_level(app).await;
            if peak > policy.peak_threshold {
                log::debug!("Audio detected in {} (peak={:.2})", app, peak);
                return true;
            }
        }
        false
    }

    async fn tick(&self) -> TickOutcome {
        enum Transition {
            Duck,
            Restore,
        }

        let policy = self.policy();
        let active = self.priority_active(&policy).await;
        let now = Instant::now();

        let (transition, ducked) = {
            let mut state = self.lock_state();
            if active {
                state.last_priority = now;
                state.last_priority_wall = SystemTime::now();
                if state.is_ducked {
                    (None, true)
                } else {
                    state.is_ducked = true;
                    (Some(Transition::Duck), true)
                }
            } else if state.is_ducked
                && now.duration_since(state.last_priority) > policy.restore_delay
            {
                state.is_ducked = false;
                (Some(Transition::Restore), false)
            } else {
                (None, state.is_ducked)
            }
        };

        match transition {
            Some(Transition::Duck) => {
                log::info!("Ducking music");
                TickOutcome::Ducked {
                    fades_started: self.duck(&policy).await,
                }
            }
            Some(Transition::Restore) => {
                log::info!("Restoring music");
                TickOutcome::Restored {
                    fades_started: self.restore(&policy).await,
                }
            }
            None if ducked => TickOutcome::Holding,
            None => TickOutcome::Idle,
        }
    }

    async fn duck(&self, policy: &DuckPolicy) -> usize {
        let started = self
            .fader
            .fade_many(
                &policy.music_apps,
                self.settings.assumed_duck_start,
                policy.volume_ducked,
                policy.fade_out,
            )
            .await;
        if started > 0 {
            log::info!("Ducked {} music app(s)", started);
        } else if !policy.music_apps.is_empty() {
            log::warn!("Failed to duck any of {} music apps", policy.music_apps.len());
        }
        started
    }

    async fn restore(&self, policy: &DuckPolicy) -> usize {
        let started = self
            .fader
            .fade_many(
                &policy.music_apps,
                self.settings.assumed_restore_start,
                policy.volume_normal,
                policy.fade_in,
            )
            .await;
        if started > 0 {
            log::info!("Restored {} music app(s)", started);
        } else if !policy.music_apps.is_empty() {
            log::warn!("Failed to restore any of {} music apps", policy.music_apps.len());
        }
        started
    }

    /// Final restore and transition to stopped. Only the first caller after
    /// a start does anything.
    async fn finish(&self, policy: &DuckPolicy) {
        if !self.running.load(Ordering::SeqCst) {
            return;
        }
        log::info!("Restoring music before exit");
        self.restore(policy).await;
        self.lock_state().is_ducked = false;
        self.running.store(false, Ordering::SeqCst);
        log::info!("Volume manager stopped");
    }
}

async fn run_loop(inner: Arc<Inner>, mut shutdown: oneshot::Receiver<()>) {
    log::info!(
        "Starting monitor loop ({}ms tick)",
        inner.settings.tick_interval.as_millis()
    );
    let mut interval = tokio::time::interval(inner.settings.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = &mut shutdown => break,
            _ = interval.tick() => {
                if let Err(panic) = AssertUnwindSafe(inner.tick()).catch_unwind().await {
                    log::error!("Monitor loop error: {}", panic_message(&*panic));
                    // The provider may be what failed; fall back to the last good policy.
                    let policy = inner.cached_policy();
                    inner.finish(&policy).await;
                    break;
                }
            }
        }
    }
    log::info!("Monitor loop exited");
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
