use crate::config::Config;
use crate::protocol::{ControlRequest, ControlResponse};
use crate::volume_manager::VolumeManager;
use anyhow::Context;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

pub enum ControlEvent {
    Request { text: String, from: SocketAddr },
}

/// Local UDP surface for the UI process. Every datagram is one JSON
/// request; the reply goes back to whoever sent it.
pub struct ControlBridge {
    socket: Arc<UdpSocket>,
    buffer_size: usize,
    tx: mpsc::Sender<ControlEvent>,
}

impl ControlBridge {
    pub async fn new(config: &Config, tx: mpsc::Sender<ControlEvent>) -> anyhow::Result<Self> {
        let addr = format!("{}:{}", config.control_local_ip, config.control_local_port);
        let socket = UdpSocket::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind control socket on {}", addr))?;

        Ok(Self {
            socket: Arc::new(socket),
            buffer_size: config.control_buffer_size.max(64),
            tx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        let mut buf = vec![0u8; self.buffer_size];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len == 0 {
                continue;
            }
            match std::str::from_utf8(&buf[..len]) {
                Ok(text) => {
                    let event = ControlEvent::Request {
                        text: text.to_string(),
                        from,
                    };
                    if self.tx.send(event).await.is_err() {
                        log::debug!("Control event receiver closed");
                        break;
                    }
                }
                Err(_) => log::warn!("Dropping non-UTF-8 control datagram from {}", from),
            }
        }
        Ok(())
    }

    pub async fn reply(&self, to: SocketAddr, response: &ControlResponse) -> anyhow::Result<()> {
        let payload = serde_json::to_string(response)?;
        self.socket.send_to(payload.as_bytes(), to).await?;
        Ok(())
    }
}

/// Parses one request and applies it to the engine.
pub async fn handle_message(manager: &VolumeManager, text: &str) -> ControlResponse {
    let request: ControlRequest = match serde_json::from_str(text) {
        Ok(request) => request,
        Err(e) => {
            log::warn!("Invalid control request {:?}: {}", text, e);
            return ControlResponse::failed("error", e.to_string());
        }
    };
    log::debug!("Control request: {}", request.name());

    match request {
        ControlRequest::Status => ControlResponse {
            warnings: Some(manager.policy_warnings()),
            ..ControlResponse::ok(&request).with_status(manager.status())
        },
        ControlRequest::Start => match manager.start().await {
            Ok(()) => ControlResponse::ok(&request).with_status(manager.status()),
            Err(e) => {
                log::error!("Failed to start volume manager: {}", e);
                ControlResponse::failed(request.name(), e.to_string())
                    .with_status(manager.status())
            }
        },
        ControlRequest::Stop => {
            manager.stop().await;
            ControlResponse::ok(&request).with_status(manager.status())
        }
        ControlRequest::ForceDuck => {
            let started = manager.force_duck().await;
            ControlResponse {
                fades_started: Some(started),
                ..ControlResponse::ok(&request).with_status(manager.status())
            }
        }
        ControlRequest::ForceRestore => {
            let started = manager.force_restore().await;
            ControlResponse {
                fades_started: Some(started),
                ..ControlResponse::ok(&request).with_status(manager.status())
            }
        }
        ControlRequest::ListApps => ControlResponse {
            apps: Some(manager.active_apps().await),
            ..ControlResponse::ok(&request)
        },
    }
}
