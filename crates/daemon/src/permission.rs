// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 App Proxy Contributors

// App Proxy - Permission Brokers
// Routes the one-time tunnel permission grant to an interactive answer
// (via the control API) or a static policy from the daemon config

use std::sync::Mutex;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::session::{PermissionBroker, PermissionDecision};

/// Holds at most one outstanding permission request. The session controller
/// parks in `request` until an operator answers through the control API;
/// a dropped sender (daemon shutdown, superseded request) reads as denial.
#[derive(Default)]
pub struct InteractivePermissionBroker {
    pending: Mutex<Option<oneshot::Sender<PermissionDecision>>>,
}

impl InteractivePermissionBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a request is waiting for an answer.
    pub fn is_pending(&self) -> bool {
        self.pending.lock().expect("pending lock poisoned").is_some()
    }

    /// Resolve the outstanding request. Returns false if nothing was pending.
    pub fn answer(&self, granted: bool) -> bool {
        let sender = self.pending.lock().expect("pending lock poisoned").take();
        match sender {
            Some(tx) => {
                let decision = if granted {
                    PermissionDecision::Granted
                } else {
                    PermissionDecision::Denied
                };
                info!(granted, "tunnel permission answered");
                // Receiver gone means the requester gave up; nothing to do.
                let _ = tx.send(decision);
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl PermissionBroker for InteractivePermissionBroker {
    async fn request(&self) -> PermissionDecision {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().expect("pending lock poisoned");
            if pending.is_some() {
                // A superseded requester reads the drop as denial.
                warn!("replacing an unanswered permission request");
            }
            *pending = Some(tx);
        }
        info!("tunnel permission requested, answer via the control API");

        match rx.await {
            Ok(decision) => decision,
            Err(_) => PermissionDecision::Denied,
        }
    }
}

/// Fixed-policy broker for headless deployments.
pub struct StaticPermissionBroker {
    decision: PermissionDecision,
}

impl StaticPermissionBroker {
    pub fn granted() -> Self {
        Self {
            decision: PermissionDecision::Granted,
        }
    }
}

#[async_trait]
impl PermissionBroker for StaticPermissionBroker {
    async fn request(&self) -> PermissionDecision {
        self.decision
    }
}
