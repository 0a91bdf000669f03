use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    // 监控循环配置
    pub tick_interval_ms: u64,
    pub fade_steps: u32,
    pub supersede_fades: bool,
    pub assumed_duck_start: f32,
    pub assumed_restore_start: f32,

    // 音频会话后端配置
    pub backend_kind: String,
    pub pactl: &'static str,
    pub parec: &'static str,
    pub session_cache_ms: u64,
    pub meter_rate: u32,
    pub meter_latency_ms: u32,

    // 控制桥配置
    pub control_enabled: bool,
    pub control_local_ip: &'static str,
    pub control_local_port: u16,
    pub control_buffer_size: usize,

    // 策略文件（运行时可修改）
    pub policy_path: String,
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    /// 所有参数都在编译时从 config.toml 中读取
    pub fn new() -> Result<Self, &'static str> {
        Ok(Self {
            tick_interval_ms: env!("MONITOR_TICK_INTERVAL_MS").parse()
                .map_err(|_| "Failed to parse MONITOR_TICK_INTERVAL_MS")?,
            fade_steps: env!("MONITOR_FADE_STEPS").parse()
                .map_err(|_| "Failed to parse MONITOR_FADE_STEPS")?,
            supersede_fades: env!("MONITOR_SUPERSEDE_FADES").parse()
                .map_err(|_| "Failed to parse MONITOR_SUPERSEDE_FADES")?,
            assumed_duck_start: env!("MONITOR_ASSUMED_DUCK_START").parse()
                .map_err(|_| "Failed to parse MONITOR_ASSUMED_DUCK_START")?,
            assumed_restore_start: env!("MONITOR_ASSUMED_RESTORE_START").parse()
                .map_err(|_| "Failed to parse MONITOR_ASSUMED_RESTORE_START")?,

            backend_kind: env!("BACKEND_KIND").to_string(),
            pactl: env!("BACKEND_PACTL"),
            parec: env!("BACKEND_PAREC"),
            session_cache_ms: env!("BACKEND_SESSION_CACHE_MS").parse()
                .map_err(|_| "Failed to parse BACKEND_SESSION_CACHE_MS")?,
            meter_rate: env!("BACKEND_METER_RATE").parse()
                .map_err(|_| "Failed to parse BACKEND_METER_RATE")?,
            meter_latency_ms: env!("BACKEND_METER_LATENCY_MS").parse()
                .map_err(|_| "Failed to parse BACKEND_METER_LATENCY_MS")?,

            control_enabled: env!("CONTROL_ENABLED").parse()
                .map_err(|_| "Failed to parse CONTROL_ENABLED")?,
            control_local_ip: env!("CONTROL_LOCAL_IP"),
            control_local_port: env!("CONTROL_LOCAL_PORT").parse()
                .map_err(|_| "Failed to parse CONTROL_LOCAL_PORT")?,
            control_buffer_size: env!("CONTROL_BUFFER_SIZE").parse()
                .map_err(|_| "Failed to parse CONTROL_BUFFER_SIZE")?,

            policy_path: env!("POLICY_PATH").to_string(),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new().expect("Failed to create default Config from build-time environment variables")
    }
}
