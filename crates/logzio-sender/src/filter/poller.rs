// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Refreshes real-time filters from the filter registry.
//!
//! Each poll POSTs `{}` (or `{"hostname": "<host>"}`) with the `X-API-TOKEN`
//! header and expects a JSON array of queries:
//!
//! ```json
//! [{"id": 1, "title": "checkout errors", "query": "$[?(@.service == 'checkout')]",
//!   "hostname": ["web-01"], "tag": null, "startDate": 0, "endDate": 0}]
//! ```
//!
//! Only `query` is used. A successful poll replaces the real-time filters
//! wholesale (queries that do not parse are skipped with a warning). A failed
//! poll leaves the current filters in place.

use std::sync::Arc;

use reqwest::header::{HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

use crate::config::FilterConfig;
use crate::error::{Result, SenderError};
use crate::filter::{Filter, FilterSet, JsonPathFilter};
use crate::reporter::StatusReporter;

const API_TOKEN_HEADER: &str = "X-API-TOKEN";

#[derive(Debug, Deserialize)]
struct RealTimeQuery {
    query: String,
}

pub struct RealTimeFilterPoller {
    client: reqwest::Client,
    url: Url,
    api_token: HeaderValue,
    hostname: Option<String>,
    filters: Arc<FilterSet>,
    reporter: Arc<dyn StatusReporter>,
}

impl RealTimeFilterPoller {
    pub fn new(
        config: &FilterConfig,
        client: reqwest::Client,
        filters: Arc<FilterSet>,
        reporter: Arc<dyn StatusReporter>,
    ) -> Result<Self> {
        let url = Url::parse(&config.registry_url)
            .map_err(|e| SenderError::parameter("filter_registry_url", e.to_string()))?;
        let api_token = HeaderValue::from_str(&config.api_token)
            .map_err(|e| SenderError::parameter("filter_api_token", e.to_string()))?;
        let hostname = config.add_hostname.then(crate::hostname::get_hostname);

        Ok(RealTimeFilterPoller {
            client,
            url,
            api_token,
            hostname,
            filters,
            reporter,
        })
    }

    /// Polls once, reporting failures. Suitable as a scheduled job.
    pub async fn poll(&self, cancel: &CancellationToken) {
        let result = tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            result = self.poll_once() => result,
        };
        match result {
            Ok(count) => debug!("Loaded {} real-time filters", count),
            Err(e) => self.reporter.error(&format!(
                "Failed to refresh real-time filters, keeping the previous ones: {e}"
            )),
        }
    }

    /// Fetches the current queries and installs them. Returns how many filters
    /// are now active.
    pub async fn poll_once(&self) -> Result<usize> {
        let body = match &self.hostname {
            Some(hostname) => json!({ "hostname": hostname }),
            None => json!({}),
        };

        let response = self
            .client
            .post(self.url.clone())
            .header(API_TOKEN_HEADER, self.api_token.clone())
            .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .body(body.to_string())
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(SenderError::Server(format!(
                "filter registry answered HTTP {}",
                status.as_u16()
            )));
        }

        let queries: Vec<RealTimeQuery> = serde_json::from_slice(&response.bytes().await?)?;
        let mut filters: Vec<Box<dyn Filter>> = Vec::with_capacity(queries.len());
        for RealTimeQuery { query } in queries {
            match JsonPathFilter::parse(&query) {
                Ok(filter) => filters.push(Box::new(filter)),
                Err(e) => self.reporter.warning(&format!("Skipping real-time filter: {e}")),
            }
        }

        let count = filters.len();
        self.filters.replace_real_time(filters);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::filter_document;
    use crate::reporter::test_support::RecordingReporter;
    use mockito::Matcher;

    fn poller(
        url: &str,
        add_hostname: bool,
    ) -> (RealTimeFilterPoller, Arc<FilterSet>, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let filters = Arc::new(FilterSet::new(Vec::new()));
        let mut config = FilterConfig::new(url, "api-token");
        config.add_hostname = add_hostname;
        let poller = RealTimeFilterPoller::new(
            &config,
            reqwest::Client::new(),
            filters.clone(),
            reporter.clone(),
        )
        .unwrap();
        (poller, filters, reporter)
    }

    #[tokio::test]
    async fn test_poll_installs_filters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/filters")
            .match_header("x-api-token", "api-token")
            .match_body(Matcher::Json(json!({})))
            .with_status(200)
            .with_body(
                r#"[{"id": 1, "title": "checkout", "query": "$[?(@.service == 'checkout')]",
                     "hostname": null, "tag": null, "startDate": 0, "endDate": 0}]"#,
            )
            .expect(1)
            .create_async()
            .await;

        let (poller, filters, _) = poller(&format!("{}/filters", server.url()), false);
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(filters.real_time_count(), 1);
        assert!(filters.should_keep(&filter_document(json!({"service": "checkout"}))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_sends_hostname() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/filters")
            .match_body(Matcher::Regex(r#"^\{"hostname":".+"\}$"#.to_string()))
            .with_status(200)
            .with_body("[]")
            .expect(1)
            .create_async()
            .await;

        let (poller, _, _) = poller(&format!("{}/filters", server.url()), true);
        assert_eq!(poller.poll_once().await.unwrap(), 0);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_invalid_query_is_skipped() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/filters")
            .with_status(200)
            .with_body(r#"[{"query": "$[?(@.a == 1)]"}, {"query": "not a path"}]"#)
            .create_async()
            .await;

        let (poller, filters, reporter) = poller(&format!("{}/filters", server.url()), false);
        assert_eq!(poller.poll_once().await.unwrap(), 1);
        assert_eq!(filters.real_time_count(), 1);
        assert_eq!(reporter.warning_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_poll_keeps_previous_filters() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/filters")
            .with_status(500)
            .create_async()
            .await;

        let (poller, filters, reporter) = poller(&format!("{}/filters", server.url()), false);
        filters.replace_real_time(vec![Box::new(JsonPathFilter::parse("$[?(@.a == 1)]").unwrap())]);

        poller.poll(&CancellationToken::new()).await;
        assert_eq!(filters.real_time_count(), 1);
        assert_eq!(reporter.error_count(), 1);
    }

    #[tokio::test]
    async fn test_malformed_response_keeps_previous_filters() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/filters")
            .with_status(200)
            .with_body("{\"not\": \"an array\"}")
            .create_async()
            .await;

        let (poller, filters, _) = poller(&format!("{}/filters", server.url()), false);
        filters.replace_real_time(vec![Box::new(JsonPathFilter::parse("$[?(@.a == 1)]").unwrap())]);

        assert!(matches!(poller.poll_once().await, Err(SenderError::Json(_))));
        assert_eq!(filters.real_time_count(), 1);
    }
}
