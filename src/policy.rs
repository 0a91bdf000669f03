use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::Context;
use serde::{Deserialize, Serialize};

pub const DEFAULT_VOLUME_NORMAL: f32 = 1.0;
pub const DEFAULT_VOLUME_DUCKED: f32 = 0.15;
pub const DEFAULT_PEAK_THRESHOLD: f32 = 0.01;
pub const DEFAULT_RESTORE_DELAY: f32 = 1.0;
pub const DEFAULT_FADE_OUT: f32 = 0.3;
pub const DEFAULT_FADE_IN: f32 = 0.6;

const RESTORE_DELAY_MIN: f32 = 0.1;
const RESTORE_DELAY_MAX: f32 = 60.0;
const FADE_MIN: f32 = 0.1;
const FADE_MAX: f32 = 2.0;

/// Policy values as supplied by a provider, not yet validated.
///
/// Field names follow the persisted `config.json`; unknown keys (UI
/// preferences and the like) are ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    pub volume_normal: f32,
    pub volume_ducked: f32,
    pub peak_threshold: f32,
    /// Seconds of continuous priority silence before restoring
    #[serde(alias = "restore_delay_seconds")]
    pub restore_delay: f32,
    pub fade_out_seconds: f32,
    pub fade_in_seconds: f32,
    pub priority_apps: Vec<String>,
    pub music_apps: Vec<String>,
    /// Hidden from app listings, never consulted by the engine
    pub ignored_apps: Vec<String>,
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            volume_normal: DEFAULT_VOLUME_NORMAL,
            volume_ducked: DEFAULT_VOLUME_DUCKED,
            peak_threshold: DEFAULT_PEAK_THRESHOLD,
            restore_delay: DEFAULT_RESTORE_DELAY,
            fade_out_seconds: DEFAULT_FADE_OUT,
            fade_in_seconds: DEFAULT_FADE_IN,
            priority_apps: Vec::new(),
            music_apps: Vec::new(),
            ignored_apps: Vec::new(),
        }
    }
}

/// A value that was replaced by its default.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyWarning {
    pub field: &'static str,
    pub value: f32,
    pub replacement: f32,
}

impl fmt::Display for PolicyWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid {}: {}, using default {}",
            self.field, self.value, self.replacement
        )
    }
}

/// Validated policy snapshot used for one evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct DuckPolicy {
    pub volume_normal: f32,
    pub volume_ducked: f32,
    pub peak_threshold: f32,
    pub restore_delay: Duration,
    pub fade_out: Duration,
    pub fade_in: Duration,
    pub priority_apps: Vec<String>,
    pub music_apps: Vec<String>,
}

impl DuckPolicy {
    pub fn from_settings(settings: &PolicySettings) -> (Self, Vec<PolicyWarning>) {
        let mut warnings = Vec::new();
        let mut check = |field: &'static str, value: f32, valid: bool, default: f32| {
            if valid {
                value
            } else {
                warnings.push(PolicyWarning {
                    field,
                    value,
                    replacement: default,
                });
                default
            }
        };

        let volume_normal = check(
            "volume_normal",
            settings.volume_normal,
            (0.0..=1.0).contains(&settings.volume_normal),
            DEFAULT_VOLUME_NORMAL,
        );
        let volume_ducked = check(
            "volume_ducked",
            settings.volume_ducked,
            (0.0..=1.0).contains(&settings.volume_ducked),
            DEFAULT_VOLUME_DUCKED,
        );
        let peak_threshold = check(
            "peak_threshold",
            settings.peak_threshold,
            settings.peak_threshold > 0.0 && settings.peak_threshold <= 1.0,
            DEFAULT_PEAK_THRESHOLD,
        );
        let restore_delay = check(
            "restore_delay",
            settings.restore_delay,
            (RESTORE_DELAY_MIN..=RESTORE_DELAY_MAX).contains(&settings.restore_delay),
            DEFAULT_RESTORE_DELAY,
        );
        let fade_out = check(
            "fade_out_seconds",
            settings.fade_out_seconds,
            (FADE_MIN..=FADE_MAX).contains(&settings.fade_out_seconds),
            DEFAULT_FADE_OUT,
        );
        let fade_in = check(
            "fade_in_seconds",
            settings.fade_in_seconds,
            (FADE_MIN..=FADE_MAX).contains(&settings.fade_in_seconds),
            DEFAULT_FADE_IN,
        );

        let policy = Self {
            volume_normal,
            volume_ducked,
            peak_threshold,
            restore_delay: Duration::from_secs_f32(restore_delay),
            fade_out: Duration::from_secs_f32(fade_out),
            fade_in: Duration::from_secs_f32(fade_in),
            priority_apps: clean_names(&settings.priority_apps),
            music_apps: clean_names(&settings.music_apps),
        };
        (policy, warnings)
    }
}

/// Trimmed, lower-cased, deduplicated names with empties dropped. Order is
/// kept.
fn clean_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names
        .iter()
        .map(|n| n.trim().to_lowercase())
        .filter(|n| !n.is_empty())
        .filter(|n| seen.insert(n.clone()))
        .collect()
}

/// Supplies the current policy. Queried once per tick and once per
/// immediate-apply action; implementations must be cheap.
pub trait ConfigProvider: Send + Sync {
    fn current(&self) -> PolicySettings;
}

impl<F> ConfigProvider for F
where
    F: Fn() -> PolicySettings + Send + Sync,
{
    fn current(&self) -> PolicySettings {
        self()
    }
}

/// In-process policy the tests edit between ticks.
#[cfg(test)]
#[derive(Clone, Default)]
pub struct SharedPolicy {
    inner: std::sync::Arc<std::sync::RwLock<PolicySettings>>,
}

#[cfg(test)]
impl SharedPolicy {
    pub fn new(settings: PolicySettings) -> Self {
        Self {
            inner: std::sync::Arc::new(std::sync::RwLock::new(settings)),
        }
    }

    pub fn update(&self, edit: impl FnOnce(&mut PolicySettings)) {
        let mut settings = self.inner.write().unwrap_or_else(|p| p.into_inner());
        edit(&mut settings);
    }
}

#[cfg(test)]
impl ConfigProvider for SharedPolicy {
    fn current(&self) -> PolicySettings {
        self.inner.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

struct FileState {
    modified: Option<SystemTime>,
    settings: PolicySettings,
}

/// Policy backed by a JSON or TOML file (format picked from the extension).
///
/// The file is re-read whenever its modification time changes. A file that
/// fails to load leaves the last good settings in place; a missing file
/// yields the defaults, also when it is removed after a successful load.
/// This provider owns the app lists: names are normalised and an app listed as both priority and music stays priority
/// only.
pub struct FileConfigProvider {
    path: PathBuf,
    state: Mutex<FileState>,
}

impl FileConfigProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let provider = Self {
            path: path.into(),
            state: Mutex::new(FileState {
                modified: None,
                settings: PolicySettings::default(),
            }),
        };
        if !provider.path.exists() {
            log::info!(
                "Policy file {} not found, using defaults",
                provider.path.display()
            );
        }
        provider.refresh();
        provider
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn refresh(&self) {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if modified.is_none() && state.modified.is_some() {
            log::warn!("Policy file {} removed, using defaults", self.path.display());
            state.settings = PolicySettings::default();
            state.modified = None;
            return;
        }
        if modified.is_none() || modified == state.modified {
            return;
        }
        match load_policy_file(&self.path) {
            Ok(settings) => {
                log::info!("Loaded policy from {}", self.path.display());
                state.settings = settings;
            }
            Err(e) => {
                log::warn!("Error loading policy: {:#}. Keeping previous settings.", e);
            }
        }
        // Remember the failed version too, so it is not re-parsed every tick.
        state.modified = modified;
    }
}

impl ConfigProvider for FileConfigProvider {
    fn current(&self) -> PolicySettings {
        self.refresh();
        self.state
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .settings
            .clone()
    }
}

pub fn load_policy_file(path: &Path) -> anyhow::Result<PolicySettings> {
    let mut settings: PolicySettings = config::Config::builder()
        .add_source(config::File::from(path))
        .build()
        .with_context(|| format!("Failed to read {}", path.display()))?
        .try_deserialize()
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    normalize_app_lists(&mut settings);
    Ok(settings)
}

/// Enforces the list invariants owned by the configuration layer.
pub fn normalize_app_lists(settings: &mut PolicySettings) {
    settings.priority_apps = clean_names(&settings.priority_apps);
    settings.music_apps = clean_names(&settings.music_apps);
    settings.ignored_apps = clean_names(&settings.ignored_apps);

    let priority: HashSet<&String> = settings.priority_apps.iter().collect();
    let duplicates: Vec<String> = settings
        .music_apps
        .iter()
        .filter(|app| priority.contains(app))
        .cloned()
        .collect();
    if !duplicates.is_empty() {
        log::warn!(
            "Apps found in both priority and music lists: {:?}. Keeping them as priority.",
            duplicates
        );
        settings.music_apps.retain(|app| !duplicates.contains(app));
    }
}
