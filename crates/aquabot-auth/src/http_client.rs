//! HTTP plumbing shared by the executor and the provisioning backends.
//!
//! Set `AQUABOT_DISABLE_SYSTEM_PROXY` to bypass system proxy settings, e.g.
//! when a local mock server sits behind a corporate proxy configuration.

use reqwest::Client;

const DISABLE_SYSTEM_PROXY_ENV: &str = "AQUABOT_DISABLE_SYSTEM_PROXY";

/// Shared HTTP client constructor; honours the proxy opt-out variable.
pub fn build_http_client() -> Client {
    if should_disable_system_proxy() {
        Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| Client::new())
    } else {
        Client::new()
    }
}

fn should_disable_system_proxy() -> bool {
    if std::env::var_os(DISABLE_SYSTEM_PROXY_ENV).is_some() {
        return true;
    }

    cfg!(test)
}

const MAX_ERROR_BODY: usize = 512;

/// Cap an upstream error body so large or sensitive responses stay out of logs.
pub(crate) fn truncate_body(body: String) -> String {
    if body.len() <= MAX_ERROR_BODY {
        return body;
    }
    let mut end = MAX_ERROR_BODY;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}... [truncated]", &body[..end])
}
