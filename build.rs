use std::fs;
use std::path::Path;
use serde::Deserialize;

#[derive(Deserialize)]
struct Config {
    application: Application,
    monitor: Monitor,
    backend: Backend,
    control: Control,
    policy: Policy,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Monitor {
    tick_interval_ms: u64,
    fade_steps: u32,
    supersede_fades: bool,
    assumed_duck_start: f32,
    assumed_restore_start: f32,
}

#[derive(Deserialize)]
struct Backend {
    kind: String,
    pactl: String,
    parec: String,
    session_cache_ms: u64,
    meter_rate: u32,
    meter_latency_ms: u32,
}

#[derive(Deserialize)]
struct Control {
    enabled: bool,
    local_ip: String,
    local_port: u16,
    buffer_size: usize,
}

#[derive(Deserialize)]
struct Policy {
    path: String,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    // 应用信息
    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // Monitor loop
    println!("cargo:rustc-env=MONITOR_TICK_INTERVAL_MS={}", config.monitor.tick_interval_ms);
    println!("cargo:rustc-env=MONITOR_FADE_STEPS={}", config.monitor.fade_steps);
    println!("cargo:rustc-env=MONITOR_SUPERSEDE_FADES={}", config.monitor.supersede_fades);
    println!("cargo:rustc-env=MONITOR_ASSUMED_DUCK_START={}", config.monitor.assumed_duck_start);
    println!("cargo:rustc-env=MONITOR_ASSUMED_RESTORE_START={}", config.monitor.assumed_restore_start);

    // Session backend
    println!("cargo:rustc-env=BACKEND_KIND={}", config.backend.kind);
    println!("cargo:rustc-env=BACKEND_PACTL={}", config.backend.pactl);
    println!("cargo:rustc-env=BACKEND_PAREC={}", config.backend.parec);
    println!("cargo:rustc-env=BACKEND_SESSION_CACHE_MS={}", config.backend.session_cache_ms);
    println!("cargo:rustc-env=BACKEND_METER_RATE={}", config.backend.meter_rate);
    println!("cargo:rustc-env=BACKEND_METER_LATENCY_MS={}", config.backend.meter_latency_ms);

    // Control bridge
    println!("cargo:rustc-env=CONTROL_ENABLED={}", config.control.enabled);
    println!("cargo:rustc-env=CONTROL_LOCAL_IP={}", config.control.local_ip);
    println!("cargo:rustc-env=CONTROL_LOCAL_PORT={}", config.control.local_port);
    println!("cargo:rustc-env=CONTROL_BUFFER_SIZE={}", config.control.buffer_size);

    // Policy file
    println!("cargo:rustc-env=POLICY_PATH={}", config.policy.path);
}
