// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Delivery of one batch to the listener.
//!
//! A batch is encoded as newline-terminated records, optionally gzipped as a
//! whole, and sent with up to `max_retries` attempts. Between attempts the
//! transport sleeps, starting at `initial_backoff` and doubling each time.
//!
//! | Response                  | Outcome                                       |
//! |---------------------------|-----------------------------------------------|
//! | 200                       | [`Delivery::Accepted`]                        |
//! | 400                       | body reported as a warning, batch discarded   |
//! | 401                       | invalid token reported as an error, discarded |
//! | anything else, I/O errors | retried; [`SenderError::Server`] once exhausted |
//!
//! Both the request and the backoff sleep are abandoned as soon as the
//! cancellation token fires, returning [`SenderError::Cancelled`].

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, USER_AGENT};
use reqwest::{Method, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::SenderConfig;
use crate::error::{Result, SenderError};
use crate::reporter::StatusReporter;

/// Result of a batch the listener answered definitively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Accepted,
    /// Rejected with a non-retryable status; the batch must not be retried
    Discarded(StatusCode),
}

pub struct Transport {
    client: reqwest::Client,
    url: Url,
    method: Method,
    headers: HeaderMap,
    compress: bool,
    max_retries: u32,
    initial_backoff: Duration,
    reporter: Arc<dyn StatusReporter>,
}

impl Transport {
    pub fn new(
        config: &SenderConfig,
        client: reqwest::Client,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        let method = Method::from_bytes(config.http_method.as_bytes())
            .map_err(|e| SenderError::parameter("http_method", e.to_string()))?;

        Ok(Transport {
            client,
            url: config.delivery_url()?,
            method,
            headers: build_headers(config.compress),
            compress: config.compress,
            max_retries: config.max_retries.max(1),
            initial_backoff: config.initial_backoff,
            reporter,
        })
    }

    /// Sends `records` as one request, retrying transient failures.
    pub async fn send_batch(
        &self,
        records: &[Bytes],
        cancel: &CancellationToken,
    ) -> Result<Delivery> {
        let payload = Bytes::from(self.encode(records)?);
        let mut backoff = self.initial_backoff;
        let mut last_failure = String::new();

        for attempt in 1..=self.max_retries {
            if cancel.is_cancelled() {
                return Err(SenderError::Cancelled);
            }

            let request = self
                .client
                .request(self.method.clone(), self.url.clone())
                .headers(self.headers.clone())
                .body(payload.clone());

            let response = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SenderError::Cancelled),
                response = request.send() => response,
            };

            match response {
                Ok(response) => match response.status() {
                    StatusCode::OK => {
                        self.reporter.info(&format!(
                            "Successfully sent bulk to logz.io, size: {}",
                            payload.len()
                        ));
                        return Ok(Delivery::Accepted);
                    }
                    StatusCode::BAD_REQUEST => {
                        let body = response.text().await.unwrap_or_default();
                        self.reporter.warning(&format!(
                            "Got 400 from logz.io, dropping {} logs. Here is the output: {body}",
                            records.len()
                        ));
                        return Ok(Delivery::Discarded(StatusCode::BAD_REQUEST));
                    }
                    StatusCode::UNAUTHORIZED => {
                        self.reporter.error(&format!(
                            "Got 401 from logz.io, your token is not right. Unfortunately, dropping {} logs",
                            records.len()
                        ));
                        return Ok(Delivery::Discarded(StatusCode::UNAUTHORIZED));
                    }
                    status => {
                        last_failure = format!("Got HTTP {}", status.as_u16());
                    }
                },
                Err(e) => {
                    self.reporter
                        .error(&format!("Got IO error sending logs to logz.io - {e}"));
                    last_failure = e.to_string();
                }
            }

            if attempt == self.max_retries {
                break;
            }

            self.reporter.warning(&format!(
                "Could not send logs to logz.io, retry ({attempt}/{}). Sleeping for {} ms and will try again.",
                self.max_retries,
                backoff.as_millis()
            ));
            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(SenderError::Cancelled),
                () = tokio::time::sleep(backoff) => {}
            }
            backoff = backoff.saturating_mul(2);
        }

        Err(SenderError::Server(format!(
            "{last_failure} after {} attempts",
            self.max_retries
        )))
    }

    /// Newline-terminated records, gzipped when compression is enabled.
    pub fn encode(&self, records: &[Bytes]) -> Result<Vec<u8>> {
        let size: usize = records.iter().map(|record| record.len() + 1).sum();
        let mut body = Vec::with_capacity(size);
        for record in records {
            body.extend_from_slice(record);
            body.push(b'\n');
        }

        if !self.compress {
            return Ok(body);
        }

        let mut encoder = GzEncoder::new(Vec::with_capacity(size / 4), Compression::default());
        encoder.write_all(&body)?;
        let compressed = encoder.finish()?;
        debug!(
            "Compressed batch of {} bytes to {} bytes",
            body.len(),
            compressed.len()
        );
        Ok(compressed)
    }
}

fn build_headers(compress: bool) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    if let Ok(agent) = HeaderValue::from_str(&format!("rust/{}/logs", crate::SENDER_VERSION)) {
        headers.insert(USER_AGENT, agent);
    }
    if compress {
        headers.insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
    }
    headers
}
