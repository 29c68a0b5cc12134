// SPDX-License-Identifier: Apache-2.0
// Copyright 2026 App Proxy Contributors

// App Proxy - Common Library
// Shared types, errors, and the connection-URI builder

pub mod error;
pub mod types;
pub mod uri;

pub use error::{Error, Result};
pub use types::{
    FailureReason, ProxyConfig, ProxyConfigDraft, ProxyKind, SessionState,
};
pub use uri::{to_display_uri, to_uri};
