// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! HTTP client construction.
//!
//! One `reqwest::Client` is built per sender and shared by the transport and the
//! filter poller. The client carries:
//! - connect and request timeouts from [`SenderConfig`]
//! - connection pooling with a 270s idle timeout
//! - TCP keep-alive (120s)
//! - an optional HTTPS proxy (`LOGZIO_PROXY_HTTPS` / `HTTPS_PROXY`)
//!
//! A proxy URL reqwest cannot parse is logged and ignored rather than failing
//! sender construction.

use std::error::Error;
use std::time::Duration;

use tracing::error;

use crate::config::SenderConfig;

/// Creates the HTTP client for a sender, falling back to a direct connection when
/// the proxy configuration is invalid.
#[must_use]
pub fn get_client(config: &SenderConfig) -> reqwest::Client {
    match build_client(config, true) {
        Ok(client) => client,
        Err(e) => {
            error!(
                "Unable to parse proxy configuration: {}, falling back to direct connection",
                e
            );
            match build_client(config, false) {
                Ok(client) => client,
                Err(inner) => {
                    error!(
                        "Failed to build HTTP client without proxy: {}, using reqwest defaults",
                        inner
                    );
                    reqwest::Client::new()
                }
            }
        }
    }
}

fn build_client(
    config: &SenderConfig,
    allow_proxy: bool,
) -> Result<reqwest::Client, Box<dyn Error>> {
    let mut client = reqwest::Client::builder()
        .connect_timeout(config.connect_timeout)
        .timeout(config.request_timeout)
        .pool_idle_timeout(Some(Duration::from_secs(270)))
        .tcp_keepalive(Some(Duration::from_secs(120)));

    if allow_proxy {
        if let Some(https_uri) = &config.https_proxy {
            let proxy = reqwest::Proxy::https(https_uri.clone())?;
            client = client.proxy(proxy);
        }
    }

    Ok(client.build()?)
}
