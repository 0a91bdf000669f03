mod audio;
mod config;
mod control_bridge;
mod fader;
mod policy;
mod protocol;
mod volume_manager;

use anyhow::{Context, bail};
use audio::{PulseSessions, SessionAccessor, SessionBackend};
use clap::Parser;
use config::Config;
use control_bridge::{ControlBridge, ControlEvent};
use fader::Fader;
use policy::FileConfigProvider;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use volume_manager::{MonitorSettings, VolumeManager};

#[derive(Parser, Debug)]
#[command(name = "autoduck")]
#[command(about = "Lowers music apps while priority apps are making sound")]
#[command(version)]
struct Args {
    /// Policy file (JSON or TOML), re-read when it changes
    #[arg(short, long, env = "AUTODUCK_POLICY")]
    policy: Option<PathBuf>,

    /// Session backend (only "pulse" is available)
    #[arg(short, long, env = "AUTODUCK_BACKEND")]
    backend: Option<String>,

    /// UDP port of the control bridge
    #[arg(long)]
    control_port: Option<u16>,

    /// Do not open the control bridge
    #[arg(long)]
    no_control: bool,

    /// Debug logging (RUST_LOG takes precedence)
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // 初始化日志
    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter))
        .init();

    // 加载配置，命令行参数优先
    let mut config = Config::new().map_err(anyhow::Error::msg)?;
    if let Some(path) = &args.policy {
        config.policy_path = path.to_string_lossy().into_owned();
    }
    if let Some(kind) = &args.backend {
        config.backend_kind = kind.clone();
    }
    if let Some(port) = args.control_port {
        config.control_local_port = port;
    }
    if args.no_control {
        config.control_enabled = false;
    }
    log::info!(
        "{} {} starting (backend: {})",
        env!("APP_NAME"),
        env!("APP_VERSION"),
        config.backend_kind
    );

    let backend: Arc<dyn SessionBackend> = match config.backend_kind.as_str() {
        "pulse" => Arc::new(PulseSessions::new(&config)),
        other => bail!("Unknown session backend: {}", other),
    };

    let fader = Fader::new(
        SessionAccessor::new(backend),
        config.fade_steps,
        config.supersede_fades,
    );
    let provider = Arc::new(FileConfigProvider::new(config.policy_path.clone()));
    log::info!("Policy file: {}", provider.path().display());
    let manager = VolumeManager::new(fader, provider, MonitorSettings::from(&config));
    manager
        .start()
        .await
        .context("Failed to start volume manager")?;

    // 控制桥，与UI进程通信
    let (tx_control, mut rx_control) = mpsc::channel::<ControlEvent>(32);
    let control_bridge = if config.control_enabled {
        let bridge = Arc::new(ControlBridge::new(&config, tx_control).await?);
        log::info!("Control bridge listening on {}", bridge.local_addr()?);
        let bridge_clone = bridge.clone();
        tokio::spawn(async move {
            if let Err(e) = bridge_clone.run().await {
                log::error!("ControlBridge error: {}", e);
            }
        });
        Some(bridge)
    } else {
        drop(tx_control);
        None
    };

    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())
        .context("Failed to install SIGTERM handler")?;

    loop {
        #[cfg(unix)]
        let terminated = terminate.recv();
        #[cfg(not(unix))]
        let terminated = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = signal::ctrl_c() => {
                log::info!("Received Ctrl+C, shutting down...");
                break;
            }
            _ = terminated => {
                log::info!("Received terminate signal, shutting down...");
                break;
            }
            Some(event) = rx_control.recv() => {
                match event {
                    ControlEvent::Request { text, from } => {
                        let response = control_bridge::handle_message(&manager, &text).await;
                        if let Some(bridge) = &control_bridge {
                            if let Err(e) = bridge.reply(from, &response).await {
                                log::warn!("Failed to answer {}: {}", from, e);
                            }
                        }
                    }
                }
            }
        }
    }

    manager.stop().await;
    // 退出前等待恢复音量的渐变完成，超时则直接设置
    if !manager.wait_for_fades(Duration::from_secs(3)).await {
        log::warn!("Fades still running at exit, restoring volumes directly");
        manager.restore_immediately().await;
    }
    Ok(())
}
