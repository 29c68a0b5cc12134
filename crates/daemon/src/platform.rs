// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 App Proxy Contributors

// App Proxy - Platform Integration
// TUN interface allocation through the `ip` tooling and the external
// packet-relay engine launched as a child process

use std::process::Stdio;
use std::sync::Mutex as StdMutex;

use anyhow::{bail, Context};
use async_trait::async_trait;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::session::{InterfaceRequest, TunnelAllocator, TunnelInterface, TunnelParameters};

/// Allocates a named TUN device with `ip tuntap`/`ip addr`/`ip link`.
///
/// Per-application scoping is advisory on this platform: the allow-list is
/// validated and recorded on the request, but traffic capture is per-device.
pub struct CommandTunAllocator {
    tun_name: String,
}

impl CommandTunAllocator {
    pub fn new(tun_name: String) -> Self {
        Self { tun_name }
    }

    async fn ip(&self, args: &[&str]) -> anyhow::Result<bool> {
        debug!(?args, "ip");
        let status = Command::new("ip")
            .args(args)
            .stdin(Stdio::null())
            .status()
            .await
            .context("failed to run the `ip` tool")?;
        Ok(status.success())
    }
}

struct CommandTunInterface {
    name: String,
    released: bool,
}

#[async_trait]
impl TunnelInterface for CommandTunInterface {
    fn descriptor(&self) -> String {
        format!("tun://{}", self.name)
    }

    async fn close(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let status = Command::new("ip")
            .args(["tuntap", "del", "dev", &self.name, "mode", "tun"])
            .stdin(Stdio::null())
            .status()
            .await;
        match status {
            Ok(s) if s.success() => info!(device = %self.name, "tunnel interface removed"),
            Ok(s) => warn!(device = %self.name, status = %s, "interface removal failed"),
            Err(e) => warn!(device = %self.name, error = %e, "interface removal failed"),
        }
    }
}

#[async_trait]
impl TunnelAllocator for CommandTunAllocator {
    async fn allow_app(
        &self,
        request: &mut InterfaceRequest,
        app_id: &str,
    ) -> anyhow::Result<()> {
        let app_id = app_id.trim();
        if app_id.is_empty() || app_id.chars().any(char::is_whitespace) {
            bail!("malformed application identifier: {app_id:?}");
        }
        request.allowed_apps.push(app_id.to_string());
        Ok(())
    }

    async fn establish(
        &self,
        request: InterfaceRequest,
    ) -> anyhow::Result<Option<Box<dyn TunnelInterface>>> {
        let name = &self.tun_name;
        info!(device = %name, label = %request.session_label, "allocating tunnel interface");

        // A failed `tuntap add` is the OS refusing the device, not an
        // allocator malfunction.
        if !self
            .ip(&["tuntap", "add", "dev", name, "mode", "tun"])
            .await?
        {
            return Ok(None);
        }

        let mut interface = CommandTunInterface {
            name: name.clone(),
            released: false,
        };

        let address = format!("{}/{}", request.address, request.prefix_len);
        let route = format!("{}/{}", request.route, request.route_prefix_len);
        let mtu = request.mtu.to_string();
        let configured = self.ip(&["addr", "add", &address, "dev", name]).await?
            && self
                .ip(&["link", "set", "dev", name, "mtu", &mtu, "up"])
                .await?
            && self.ip(&["route", "add", &route, "dev", name]).await?;

        if !configured {
            interface.close().await;
            return Ok(None);
        }

        Ok(Some(Box::new(interface)))
    }
}

/// Launches the packet-relay engine as a child process and kills it on stop.
pub struct CommandEngine {
    binary: String,
    params: StdMutex<Option<TunnelParameters>>,
    child: Mutex<Option<Child>>,
}

impl CommandEngine {
    pub fn new(binary: String) -> Self {
        Self {
            binary,
            params: StdMutex::new(None),
            child: Mutex::new(None),
        }
    }
}

/// Command-line arguments for one engine run.
fn engine_args(params: &TunnelParameters) -> Vec<String> {
    let mut args = vec![
        "-device".to_string(),
        params.device.clone(),
        "-mtu".to_string(),
        params.mtu.to_string(),
        "-proxy".to_string(),
        params.proxy_uri.clone(),
        "-loglevel".to_string(),
        params.log_level.clone(),
    ];
    if !params.admin_api.is_empty() {
        args.push("-restapi".to_string());
        args.push(params.admin_api.clone());
    }
    if !params.tcp_send_buffer_size.is_empty() {
        args.push("-tcp-sndbuf".to_string());
        args.push(params.tcp_send_buffer_size.clone());
    }
    if !params.tcp_receive_buffer_size.is_empty() {
        args.push("-tcp-rcvbuf".to_string());
        args.push(params.tcp_receive_buffer_size.clone());
    }
    if params.tcp_moderate_receive_buffer {
        args.push("-tcp-auto-tuning".to_string());
    }
    args
}

#[async_trait]
impl crate::session::ProxyEngine for CommandEngine {
    async fn configure(&self, params: TunnelParameters) -> anyhow::Result<()> {
        *self.params.lock().expect("params lock poisoned") = Some(params);
        Ok(())
    }

    async fn start(&self) -> anyhow::Result<()> {
        let Some(params) = self.params.lock().expect("params lock poisoned").take() else {
            bail!("engine started without configuration");
        };

        let args = engine_args(&params);
        info!(binary = %self.binary, device = %params.device, "starting relay engine");

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to launch relay engine {:?}", self.binary))?;

        // Catch an immediate crash (bad flags, missing device) here rather
        // than reporting a running session that relays nothing.
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        if let Some(status) = child.try_wait()? {
            bail!("relay engine exited at startup with {status}");
        }

        *self.child.lock().await = Some(child);
        Ok(())
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let Some(mut child) = self.child.lock().await.take() else {
            return Ok(());
        };
        debug!("stopping relay engine");
        child.kill().await.context("failed to kill relay engine")?;
        let status = child.wait().await?;
        info!(%status, "relay engine stopped");
        Ok(())
    }
}
