// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 App Proxy Contributors

// App Proxy - Session Controller
// Owns the tunnel lifecycle: permission grant, interface allocation,
// engine start/stop, and state publication

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};

use app_proxy_common::{uri, Error, FailureReason, Result, SessionState};

use crate::allowlist::AllowListStore;
use crate::state::{StateChannel, StateSubscription};
use crate::store::ConfigStore;

/// Fixed tunnel interface parameters, matching the engine's expectations.
pub const TUNNEL_ADDRESS: &str = "10.0.0.2";
pub const TUNNEL_PREFIX_LEN: u8 = 24;
pub const TUNNEL_ROUTE: &str = "0.0.0.0";
pub const TUNNEL_ROUTE_PREFIX_LEN: u8 = 0;
pub const TUNNEL_MTU: u16 = 1500;

const ENGINE_LOG_LEVEL: &str = "error";

/// Parameters for a tunnel interface allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceRequest {
    pub address: String,
    pub prefix_len: u8,
    pub route: String,
    pub route_prefix_len: u8,
    pub mtu: u16,
    pub session_label: String,
    pub allowed_apps: Vec<String>,
}

impl InterfaceRequest {
    fn new(session_label: String) -> Self {
        Self {
            address: TUNNEL_ADDRESS.to_string(),
            prefix_len: TUNNEL_PREFIX_LEN,
            route: TUNNEL_ROUTE.to_string(),
            route_prefix_len: TUNNEL_ROUTE_PREFIX_LEN,
            mtu: TUNNEL_MTU,
            session_label,
            allowed_apps: Vec::new(),
        }
    }
}

/// Engine start parameters, built fresh for every session and discarded
/// after hand-off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelParameters {
    pub device: String,
    pub mtu: u16,
    pub proxy_uri: String,
    pub log_level: String,
    pub admin_api: String,
    pub tcp_send_buffer_size: String,
    pub tcp_receive_buffer_size: String,
    pub tcp_moderate_receive_buffer: bool,
}

/// An allocated tunnel interface. `close` must be idempotent.
#[async_trait]
pub trait TunnelInterface: Send {
    /// Device descriptor handed to the engine, e.g. `fd://7` or `tun://app0`.
    fn descriptor(&self) -> String;
    async fn close(&mut self);
}

/// Allocates the OS tunnel interface. Allow-list entries are added one at a
/// time so a rejected entry can be skipped without aborting the allocation.
#[async_trait]
pub trait TunnelAllocator: Send + Sync {
    /// Add one application to the pending request's allow-list. An error is
    /// per-entry (unknown or malformed identifier) and never fatal.
    async fn allow_app(&self, request: &mut InterfaceRequest, app_id: &str)
        -> anyhow::Result<()>;

    /// Allocate the interface. `Ok(None)` means the OS refused.
    async fn establish(
        &self,
        request: InterfaceRequest,
    ) -> anyhow::Result<Option<Box<dyn TunnelInterface>>>;
}

/// Outcome of an interactive permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PermissionDecision {
    Granted,
    Denied,
}

/// One-time OS permission grant for creating a tunnel interface. `request`
/// suspends until the user answers; there is no timeout.
#[async_trait]
pub trait PermissionBroker: Send + Sync {
    async fn request(&self) -> PermissionDecision;
}

/// The external packet-relay engine.
#[async_trait]
pub trait ProxyEngine: Send + Sync {
    async fn configure(&self, params: TunnelParameters) -> anyhow::Result<()>;
    async fn start(&self) -> anyhow::Result<()>;
    async fn stop(&self) -> anyhow::Result<()>;
}

struct SessionInner {
    device: Option<Box<dyn TunnelInterface>>,
    /// Permission grants last for the process lifetime.
    permission_granted: bool,
}

impl SessionInner {
    /// Release the interface if held. Safe to call any number of times.
    async fn release_device(&mut self) {
        if let Some(mut device) = self.device.take() {
            debug!("releasing tunnel interface");
            device.close().await;
        }
    }
}

/// Drives the proxy session through its lifecycle.
///
/// `start`, `stop`, and `toggle` are serialized per controller: a call
/// arriving while another is in flight waits, then observes the settled
/// state and acts on it (start-while-running is absorbed as a no-op).
#[derive(Clone)]
pub struct SessionController {
    store: ConfigStore,
    allow_list: AllowListStore,
    allocator: Arc<dyn TunnelAllocator>,
    engine: Arc<dyn ProxyEngine>,
    permissions: Arc<dyn PermissionBroker>,
    channel: Arc<StateChannel>,
    inner: Arc<Mutex<SessionInner>>,
    /// Epoch bumped by `stop()`; interrupts a `start()` parked on the grant.
    teardown: Arc<watch::Sender<u64>>,
    session_label: String,
}

impl SessionController {
    pub fn new(
        store: ConfigStore,
        allow_list: AllowListStore,
        allocator: Arc<dyn TunnelAllocator>,
        engine: Arc<dyn ProxyEngine>,
        permissions: Arc<dyn PermissionBroker>,
        session_label: String,
    ) -> Self {
        Self {
            store,
            allow_list,
            allocator,
            engine,
            permissions,
            channel: Arc::new(StateChannel::new()),
            inner: Arc::new(Mutex::new(SessionInner {
                device: None,
                permission_granted: false,
            })),
            teardown: Arc::new(watch::channel(0).0),
            session_label,
        }
    }

    /// Read-only view of the current session state.
    pub fn state(&self) -> SessionState {
        self.channel.current()
    }

    /// Subscribe to session state transitions; the subscription carries the
    /// current state so late subscribers start from a known point.
    pub fn subscribe(&self) -> StateSubscription {
        self.channel.subscribe()
    }

    /// Start the tunnel from the currently selected configuration.
    ///
    /// No-op when already starting, running, or stopping. Refuses with
    /// `NoSelectedConfiguration` (state stays Stopped) when the store has no
    /// selection. Failures transition to `Failed` with the reason retained.
    /// A `stop()` issued while the permission grant is pending abandons the
    /// start; the abandoned start returns Ok with the session Stopped.
    pub async fn start(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if matches!(
            self.channel.current(),
            SessionState::Starting | SessionState::Running | SessionState::Stopping
        ) {
            debug!("start ignored, session already active");
            return Ok(());
        }

        let Some(config) = self.store.get_selected().await? else {
            warn!("start refused, no configuration is selected");
            return Err(Error::NoSelectedConfiguration);
        };

        let apps = self.allow_list.all().await?;

        self.channel.publish(SessionState::Starting);
        info!(config = %config.name, "starting proxy session");

        if !inner.permission_granted {
            // Park without the controller lock so stop() can get through.
            // The receiver is created while the lock is still held; stop()
            // bumps the epoch under the same lock, so no wakeup is missed.
            let mut teardown_rx = self.teardown.subscribe();
            drop(inner);
            let decision = tokio::select! {
                decision = self.permissions.request() => Some(decision),
                _ = teardown_rx.changed() => None,
            };
            inner = self.inner.lock().await;

            if !matches!(self.channel.current(), SessionState::Starting) {
                debug!("start abandoned, session was stopped during the permission wait");
                return Ok(());
            }

            match decision {
                Some(PermissionDecision::Granted) => inner.permission_granted = true,
                Some(PermissionDecision::Denied) => {
                    error!("tunnel permission denied by user");
                    self.channel.publish(SessionState::Failed {
                        reason: FailureReason::PermissionDenied,
                    });
                    return Err(Error::PermissionDenied);
                }
                // Teardown fired; stop() has already settled the state.
                None => return Ok(()),
            }
        }

        let mut request = InterfaceRequest::new(self.session_label.clone());
        for app in &apps {
            if let Err(e) = self.allocator.allow_app(&mut request, app).await {
                warn!(app = %app, error = %e, "allow-list entry rejected, skipping");
            }
        }

        let device = match self.allocator.establish(request).await {
            Ok(Some(device)) => device,
            Ok(None) => {
                error!("tunnel interface allocation refused");
                self.channel.publish(SessionState::Failed {
                    reason: FailureReason::InterfaceUnavailable,
                });
                return Err(Error::InterfaceUnavailable);
            }
            Err(e) => {
                error!(error = %e, "tunnel interface allocation failed");
                self.channel.publish(SessionState::Failed {
                    reason: FailureReason::InterfaceUnavailable,
                });
                return Err(Error::InterfaceUnavailable);
            }
        };
        let descriptor = device.descriptor();
        inner.device = Some(device);

        let proxy_uri = uri::to_uri(&config);
        debug!(proxy = %uri::to_display_uri(&config), device = %descriptor, "configuring engine");

        let params = TunnelParameters {
            device: descriptor,
            mtu: TUNNEL_MTU,
            proxy_uri,
            log_level: ENGINE_LOG_LEVEL.to_string(),
            admin_api: String::new(),
            tcp_send_buffer_size: String::new(),
            tcp_receive_buffer_size: String::new(),
            tcp_moderate_receive_buffer: false,
        };

        let engine_result = async {
            self.engine.configure(params).await?;
            self.engine.start().await
        }
        .await;

        if let Err(e) = engine_result {
            error!(error = %e, "engine start failed");
            // The interface must not outlive a failed start.
            inner.release_device().await;
            let message = e.to_string();
            self.channel.publish(SessionState::Failed {
                reason: FailureReason::EngineStart {
                    message: message.clone(),
                },
            });
            return Err(Error::EngineStart(message));
        }

        self.channel.publish(SessionState::Running);
        info!("proxy session running");
        Ok(())
    }

    /// Stop the tunnel. Unconditionally safe: stopping an already stopped
    /// session is a no-op, and the interface release is exactly-once.
    pub async fn stop(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;

        if matches!(self.channel.current(), SessionState::Stopped) {
            debug!("stop ignored, session already stopped");
            return Ok(());
        }

        // Interrupt a start() parked on the permission grant.
        self.teardown.send_modify(|epoch| *epoch += 1);

        self.channel.publish(SessionState::Stopping);
        info!("stopping proxy session");

        // Teardown failures are swallowed; the session still reaches Stopped.
        if let Err(e) = self.engine.stop().await {
            debug!(error = %e, "engine stop reported an error");
        }
        inner.release_device().await;

        self.channel.publish(SessionState::Stopped);
        info!("proxy session stopped");
        Ok(())
    }

    /// Stop when running, start otherwise (Stopped and Failed both retry).
    pub async fn toggle(&self) -> Result<()> {
        if self.channel.current().is_running() {
            self.stop().await
        } else {
            self.start().await
        }
    }

    /// Best-effort teardown on process shutdown.
    pub async fn shutdown(&self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "shutdown teardown failed");
        }
    }
}
