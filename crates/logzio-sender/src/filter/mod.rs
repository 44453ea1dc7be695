// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Record filters.
//!
//! A record is evaluated against two groups of filters:
//!
//! - **Real-time** filters, replaced wholesale by every successful poll of the
//!   filter registry. A match keeps the record.
//! - **Default** filters, fixed by configuration. A match (with no real-time
//!   match) drops the record.
//!
//! Records matching neither group are kept.
//!
//! Filters are JSON-path expressions (RFC 9535) evaluated against a document
//! holding the record as the only element of an array, so that a filter such as
//! `$[?(@.level == 'ERROR')]` selects the record when it matches.

pub mod poller;
pub mod stage;

use std::fmt;
use std::sync::{Arc, RwLock};

use serde_json::Value;
use serde_json_path::JsonPath;

use crate::error::{Result, SenderError};

/// Predicate over a parsed record.
pub trait Filter: Send + Sync + fmt::Debug {
    /// `document` is the record wrapped in a one-element array.
    fn matches(&self, document: &Value) -> bool;
}

/// Filter backed by a JSON-path expression: matches when the query selects at
/// least one node.
#[derive(Debug, Clone)]
pub struct JsonPathFilter {
    query: String,
    path: JsonPath,
}

impl JsonPathFilter {
    pub fn parse(query: &str) -> Result<Self> {
        let path = JsonPath::parse(query).map_err(|e| SenderError::Filter {
            query: query.to_string(),
            reason: e.to_string(),
        })?;
        Ok(JsonPathFilter {
            query: query.to_string(),
            path,
        })
    }

    pub fn query(&self) -> &str {
        &self.query
    }
}

impl Filter for JsonPathFilter {
    fn matches(&self, document: &Value) -> bool {
        !self.path.query(document).is_empty()
    }
}

/// Wraps a record into the document filters are evaluated against.
pub fn filter_document(record: Value) -> Value {
    Value::Array(vec![record])
}

type Filters = Arc<Vec<Box<dyn Filter>>>;

/// The filters currently in effect for one sender.
#[derive(Debug)]
pub struct FilterSet {
    real_time: RwLock<Filters>,
    defaults: Vec<Box<dyn Filter>>,
}

impl FilterSet {
    pub fn new(defaults: Vec<Box<dyn Filter>>) -> Self {
        FilterSet {
            real_time: RwLock::new(Arc::new(Vec::new())),
            defaults,
        }
    }

    /// Builds a set whose default filters are the given JSON-path queries.
    pub fn from_queries(queries: &[String]) -> Result<Self> {
        let defaults = queries
            .iter()
            .map(|query| JsonPathFilter::parse(query).map(|f| Box::new(f) as Box<dyn Filter>))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(defaults))
    }

    /// Replaces every real-time filter at once.
    pub fn replace_real_time(&self, filters: Vec<Box<dyn Filter>>) {
        let filters = Arc::new(filters);
        match self.real_time.write() {
            Ok(mut guard) => *guard = filters,
            Err(poisoned) => *poisoned.into_inner() = filters,
        }
    }

    pub fn real_time_count(&self) -> usize {
        self.real_time_snapshot().len()
    }

    /// Whether the record wrapped in `document` should be queued.
    pub fn should_keep(&self, document: &Value) -> bool {
        let real_time = self.real_time_snapshot();
        if real_time.iter().any(|filter| filter.matches(document)) {
            return true;
        }
        !self.defaults.iter().any(|filter| filter.matches(document))
    }

    fn real_time_snapshot(&self) -> Filters {
        match self.real_time.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }
}
