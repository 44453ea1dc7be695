// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! What to do with a record that exceeds the size limits.
//!
//! - **Cut** (default): shorten the message field and append a truncation marker
//! - **Drop**: discard the record
//!
//! Set through `LOGZIO_OVERSIZED_POLICY=cut|drop` (case-insensitive).

use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum OversizedPolicy {
    #[default]
    Cut,
    Drop,
}

impl AsRef<str> for OversizedPolicy {
    fn as_ref(&self) -> &str {
        match self {
            OversizedPolicy::Cut => "cut",
            OversizedPolicy::Drop => "drop",
        }
    }
}

impl fmt::Display for OversizedPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl FromStr for OversizedPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cut" => Ok(OversizedPolicy::Cut),
            "drop" => Ok(OversizedPolicy::Drop),
            _ => Err(format!(
                "Invalid oversized policy: '{s}'. Valid policies are: cut, drop",
            )),
        }
    }
}
