// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sender configuration.
//!
//! [`SenderConfig`] is a flat struct with sensible defaults. It can be filled in
//! programmatically or read from `LOGZIO_*` environment variables with
//! [`SenderConfig::from_env`]. Either way, [`SenderConfig::validate`] runs before a
//! sender is built and every problem is reported as [`SenderError::Parameter`].
//!
//! Capacity-like settings use `None` for "unlimited"; in the environment the
//! same thing is spelled `-1`.

pub mod oversized_policy;

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::{Result, SenderError};
use crate::filter::JsonPathFilter;

pub use oversized_policy::OversizedPolicy;

pub const DEFAULT_LISTENER_URL: &str = "https://listener.logz.io:8071";
pub const DEFAULT_LOG_TYPE: &str = "rust";
pub const DEFAULT_MESSAGE_FIELD: &str = "message";
pub const DEFAULT_MEMORY_CAPACITY_BYTES: u64 = 100 * 1024 * 1024;
pub const DEFAULT_FS_PERCENT_THRESHOLD: u8 = 98;
pub const DEFAULT_PAGE_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_GC_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_FILTER_POLL_INTERVAL: Duration = Duration::from_secs(10);

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Which queue backend buffers records between `send` and delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueConfig {
    InMemory {
        /// Total record bytes the queue may hold, `None` for unlimited
        capacity_bytes: Option<u64>,
        /// Number of records the queue may hold, `None` for unlimited
        capacity_count: Option<usize>,
    },
    Disk {
        /// Directory exclusively owned by this queue
        dir: PathBuf,
        /// Stop accepting records once the filesystem is this full (percent)
        fs_percent_threshold: Option<u8>,
        gc_interval: Duration,
        probe_interval: Duration,
        /// Size at which the queue starts a new page file
        page_size: u64,
    },
}

impl Default for QueueConfig {
    fn default() -> Self {
        QueueConfig::InMemory {
            capacity_bytes: Some(DEFAULT_MEMORY_CAPACITY_BYTES),
            capacity_count: None,
        }
    }
}

impl QueueConfig {
    /// Disk queue in `dir` with default threshold, intervals and page size.
    pub fn disk(dir: impl Into<PathBuf>) -> Self {
        QueueConfig::Disk {
            dir: dir.into(),
            fs_percent_threshold: Some(DEFAULT_FS_PERCENT_THRESHOLD),
            gc_interval: DEFAULT_GC_INTERVAL,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }
}

/// Optional real-time filter registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterConfig {
    /// Endpoint returning the active real-time filters
    pub registry_url: String,
    /// Sent as `X-API-TOKEN`
    pub api_token: String,
    /// Report this host's name in the poll body
    pub add_hostname: bool,
    /// Records matching any of these (and no real-time filter) are dropped
    pub default_filters: Vec<String>,
    pub poll_interval: Duration,
}

impl FilterConfig {
    pub fn new(registry_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            registry_url: registry_url.into(),
            api_token: api_token.into(),
            add_hostname: false,
            default_filters: Vec::new(),
            poll_interval: DEFAULT_FILTER_POLL_INTERVAL,
        }
    }
}

/// Configuration for one sender instance.
#[derive(Debug, Clone)]
pub struct SenderConfig {
    /// Account shipping token, part of the destination identity
    pub token: String,
    /// Log type, part of the destination identity. Empty omits it from the URL.
    pub log_type: String,
    /// Listener base URL, e.g. `https://listener.logz.io:8071`
    pub listener_url: String,
    /// HTTP method used for delivery
    pub http_method: String,
    /// Gzip the whole batch body
    pub compress: bool,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    /// Delivery attempts per batch
    pub max_retries: u32,
    /// Sleep before the second attempt, doubled after each failure
    pub initial_backoff: Duration,
    /// Delay between scheduled drains
    pub drain_interval: Duration,
    /// Upper bound on the last drain performed by `stop`
    pub final_drain_timeout: Duration,
    /// Stop adding records to a batch once it reaches this size
    pub max_batch_bytes: usize,
    pub queue: QueueConfig,
    pub oversized_policy: OversizedPolicy,
    /// Field shortened by the `cut` policy
    pub message_field: String,
    pub filters: Option<FilterConfig>,
    /// HTTPS proxy URL
    pub https_proxy: Option<String>,
    /// Log level (e.g., trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self {
            token: String::new(),
            log_type: DEFAULT_LOG_TYPE.to_string(),
            listener_url: DEFAULT_LISTENER_URL.to_string(),
            http_method: "POST".to_string(),
            compress: false,
            connect_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(10),
            max_retries: crate::MAX_RETRIES,
            initial_backoff: Duration::from_millis(crate::INITIAL_BACKOFF_MS),
            drain_interval: DEFAULT_DRAIN_INTERVAL,
            final_drain_timeout: crate::FINAL_DRAIN_TIMEOUT,
            max_batch_bytes: crate::MAX_BATCH_BYTES,
            queue: QueueConfig::default(),
            oversized_policy: OversizedPolicy::default(),
            message_field: DEFAULT_MESSAGE_FIELD.to_string(),
            filters: None,
            https_proxy: None,
            log_level: "info".to_string(),
        }
    }
}

impl SenderConfig {
    /// Default configuration for `token`.
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            ..Default::default()
        }
    }

    /// Create configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let token = env::var("LOGZIO_TOKEN").unwrap_or_default();
        let log_type = env::var("LOGZIO_TYPE").unwrap_or(defaults.log_type);
        let listener_url = env::var("LOGZIO_LISTENER_URL").unwrap_or(defaults.listener_url);
        let http_method = env::var("LOGZIO_HTTP_METHOD")
            .map(|val| val.to_uppercase())
            .unwrap_or(defaults.http_method);
        let compress = env_parse("LOGZIO_COMPRESS", defaults.compress)?;
        let connect_timeout = env_millis("LOGZIO_CONNECT_TIMEOUT_MS", defaults.connect_timeout)?;
        let request_timeout = env_millis("LOGZIO_REQUEST_TIMEOUT_MS", defaults.request_timeout)?;
        let max_retries = env_parse("LOGZIO_MAX_RETRIES", defaults.max_retries)?;
        let initial_backoff = env_millis("LOGZIO_INITIAL_BACKOFF_MS", defaults.initial_backoff)?;
        let drain_interval = env_millis("LOGZIO_DRAIN_INTERVAL_MS", defaults.drain_interval)?;
        let final_drain_timeout =
            env_millis("LOGZIO_FINAL_DRAIN_TIMEOUT_MS", defaults.final_drain_timeout)?;
        let max_batch_bytes = env_parse("LOGZIO_MAX_BATCH_BYTES", defaults.max_batch_bytes)?;
        let oversized_policy = match env::var("LOGZIO_OVERSIZED_POLICY") {
            Ok(val) => OversizedPolicy::from_str(&val)
                .map_err(|reason| SenderError::parameter("LOGZIO_OVERSIZED_POLICY", reason))?,
            Err(_) => defaults.oversized_policy,
        };
        let message_field = env::var("LOGZIO_MESSAGE_FIELD").unwrap_or(defaults.message_field);
        let https_proxy = env::var("LOGZIO_PROXY_HTTPS")
            .or_else(|_| env::var("HTTPS_PROXY"))
            .ok();
        let log_level = env::var("LOGZIO_LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or(defaults.log_level);

        let queue = match env::var("LOGZIO_QUEUE_TYPE")
            .map(|val| val.to_lowercase())
            .as_deref()
        {
            Ok("disk") => QueueConfig::Disk {
                dir: env::var("LOGZIO_QUEUE_DIR").unwrap_or_default().into(),
                fs_percent_threshold: env_limit(
                    "LOGZIO_FS_PERCENT_THRESHOLD",
                    Some(DEFAULT_FS_PERCENT_THRESHOLD),
                )?,
                gc_interval: env_millis("LOGZIO_GC_INTERVAL_MS", DEFAULT_GC_INTERVAL)?,
                probe_interval: env_millis("LOGZIO_PROBE_INTERVAL_MS", DEFAULT_PROBE_INTERVAL)?,
                page_size: env_parse("LOGZIO_PAGE_SIZE", DEFAULT_PAGE_SIZE)?,
            },
            Ok("memory") | Err(_) => QueueConfig::InMemory {
                capacity_bytes: env_limit(
                    "LOGZIO_MEMORY_CAPACITY_BYTES",
                    Some(DEFAULT_MEMORY_CAPACITY_BYTES),
                )?,
                capacity_count: env_limit("LOGZIO_MEMORY_CAPACITY_COUNT", None)?,
            },
            Ok(other) => {
                return Err(SenderError::parameter(
                    "LOGZIO_QUEUE_TYPE",
                    format!("unknown queue type '{other}', expected memory or disk"),
                ))
            }
        };

        let filters = match env::var("LOGZIO_FILTER_URL") {
            Ok(registry_url) => Some(FilterConfig {
                registry_url,
                api_token: env::var("LOGZIO_FILTER_API_TOKEN").unwrap_or_default(),
                add_hostname: env_parse("LOGZIO_FILTER_ADD_HOSTNAME", false)?,
                default_filters: env::var("LOGZIO_DEFAULT_FILTERS")
                    .map(|val| split_filters(&val))
                    .unwrap_or_default(),
                poll_interval: env_millis(
                    "LOGZIO_FILTER_POLL_INTERVAL_MS",
                    DEFAULT_FILTER_POLL_INTERVAL,
                )?,
            }),
            Err(_) => None,
        };

        let config = Self {
            token,
            log_type,
            listener_url,
            http_method,
            compress,
            connect_timeout,
            request_timeout,
            max_retries,
            initial_backoff,
            drain_interval,
            final_drain_timeout,
            max_batch_bytes,
            queue,
            oversized_policy,
            message_field,
            filters,
            https_proxy,
            log_level,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.token.trim().is_empty() {
            return Err(SenderError::parameter("token", "value is empty"));
        }

        self.delivery_url()?;

        if reqwest::Method::from_bytes(self.http_method.as_bytes()).is_err() {
            return Err(SenderError::parameter(
                "http_method",
                format!("'{}' is not a valid HTTP method", self.http_method),
            ));
        }

        if self.max_retries == 0 {
            return Err(SenderError::parameter("max_retries", "must be at least 1"));
        }
        non_zero("drain_interval", self.drain_interval)?;
        non_zero("connect_timeout", self.connect_timeout)?;
        non_zero("request_timeout", self.request_timeout)?;
        if self.max_batch_bytes == 0 {
            return Err(SenderError::parameter("max_batch_bytes", "must be greater than 0"));
        }
        if self.message_field.is_empty() {
            return Err(SenderError::parameter("message_field", "value is empty"));
        }

        if let QueueConfig::Disk {
            dir,
            fs_percent_threshold,
            gc_interval,
            probe_interval,
            page_size,
        } = &self.queue
        {
            if dir.as_os_str().is_empty() {
                return Err(SenderError::parameter("queue_dir", "value is empty"));
            }
            if let Some(threshold) = fs_percent_threshold {
                if *threshold == 0 || *threshold > 100 {
                    return Err(SenderError::parameter(
                        "fs_percent_threshold",
                        format!("{threshold} is not between 1 and 100"),
                    ));
                }
            }
            non_zero("gc_interval", *gc_interval)?;
            non_zero("probe_interval", *probe_interval)?;
            if *page_size == 0 {
                return Err(SenderError::parameter("page_size", "must be greater than 0"));
            }
        }

        if let Some(filters) = &self.filters {
            parse_http_url("filter_registry_url", &filters.registry_url)?;
            non_zero("filter_poll_interval", filters.poll_interval)?;
            for query in &filters.default_filters {
                JsonPathFilter::parse(query).map_err(|e| {
                    SenderError::parameter("default_filters", e.to_string())
                })?;
            }
        }

        if !VALID_LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(SenderError::parameter(
                "log_level",
                format!(
                    "'{}' must be one of: trace, debug, info, warn, error",
                    self.log_level
                ),
            ));
        }

        Ok(())
    }

    /// Delivery endpoint: the listener URL with `token` and, when set, `type`.
    pub fn delivery_url(&self) -> Result<Url> {
        let mut url = parse_http_url("listener_url", &self.listener_url)?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("token", &self.token);
            if !self.log_type.is_empty() {
                query.append_pair("type", &self.log_type);
            }
        }
        Ok(url)
    }
}

fn parse_http_url(param: &str, value: &str) -> Result<Url> {
    let url = Url::parse(value)
        .map_err(|e| SenderError::parameter(param, format!("'{value}' is not a valid URL: {e}")))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(SenderError::parameter(
            param,
            format!("unsupported scheme '{scheme}'"),
        )),
    }
}

fn non_zero(param: &str, value: Duration) -> Result<()> {
    if value.is_zero() {
        return Err(SenderError::parameter(param, "must be greater than 0"));
    }
    Ok(())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) => val
            .trim()
            .to_lowercase()
            .parse::<T>()
            .map_err(|e| SenderError::parameter(name, format!("'{val}': {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_millis(name: &str, default: Duration) -> Result<Duration> {
    let millis = env_parse(name, u64::try_from(default.as_millis()).unwrap_or(u64::MAX))?;
    Ok(Duration::from_millis(millis))
}

/// Reads a limit where `-1` means unlimited.
fn env_limit<T: FromStr>(name: &str, default: Option<T>) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(val) if val.trim() == "-1" => Ok(None),
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| SenderError::parameter(name, format!("'{val}': {e}"))),
        Err(_) => Ok(default),
    }
}

/// Default filters are separated by `;;` since JSON-path expressions contain commas.
fn split_filters(value: &str) -> Vec<String> {
    value
        .split(";;")
        .map(str::trim)
        .filter(|query| !query.is_empty())
        .map(String::from)
        .collect()
}
