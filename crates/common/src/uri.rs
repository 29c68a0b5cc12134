//! Connection-URI construction for proxy configurations.
//!
//! Pure functions, no validation: a "required" field left empty never makes
//! these fail, the affected URI segment is simply omitted.

use crate::types::{ProxyConfig, ProxyKind};

/// Build the canonical connection URI handed to the relay engine.
///
/// Fields are interpolated verbatim; the auth segment is omitted when the
/// user is blank and the port segment when the port is 0. RAW configurations
/// pass the server field through untouched.
pub fn to_uri(config: &ProxyConfig) -> String {
    match config.kind {
        ProxyKind::Http => with_auth_and_port("http", config, true),
        ProxyKind::Socks4 => with_auth_and_port("socks4", config, false),
        ProxyKind::Socks5 => with_auth_and_port("socks5", config, true),
        ProxyKind::Direct => "direct://".to_string(),
        ProxyKind::Reject => "reject://".to_string(),
        ProxyKind::Raw => config.server.clone(),
    }
}

/// Credential-redacted URI for display: everything after the last `@`, or
/// the whole URI when no `@` is present. Not a URI parser; the split rule is
/// the contract.
pub fn to_display_uri(config: &ProxyConfig) -> String {
    let uri = to_uri(config);
    match uri.rfind('@') {
        Some(pos) => uri[pos + 1..].to_string(),
        None => uri,
    }
}

fn with_auth_and_port(scheme: &str, config: &ProxyConfig, with_pass: bool) -> String {
    let auth = if config.user.trim().is_empty() {
        String::new()
    } else if with_pass {
        format!("{}:{}@", config.user, config.pass)
    } else {
        format!("{}@", config.user)
    };
    let port = if config.port > 0 {
        format!(":{}", config.port)
    } else {
        String::new()
    };
    format!("{}://{}{}{}", scheme, auth, config.server, port)
}
