//! JSON payload of the streaming route.
//!
//! ```text
//! {
//!   "requestTimeout": 1000,         // ms before the first byte
//!   "size": 1048576,                // total body length
//!   "speed": 65536,                 // bytes per second
//!   "bodyTimeouts": [               // one-time stalls
//!     { "after": 500, "time": 5000 }
//!   ]
//! }
//! ```
//!
//! Every field is optional. The same type is used by the scenario client
//! to build the request it sends.

use crate::stream::{Stall, StreamConfig, DEFAULT_SIZE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A threshold stall as it appears on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BodyTimeout {
    /// Byte offset that arms the stall
    #[serde(default)]
    pub after: u64,
    /// Stall length in milliseconds
    #[serde(default)]
    pub time: u64,
}

/// Request body of `POST /:id`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub body_timeouts: Vec<BodyTimeout>,
}

impl StreamRequest {
    /// Parse a request body. An empty body means "all defaults".
    pub fn from_slice(body: &[u8]) -> Result<Self, PayloadError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::default());
        }
        serde_json::from_slice(body).map_err(PayloadError::Json)
    }

    /// Validate and convert into a stream configuration
    pub fn into_config(self) -> Result<StreamConfig, PayloadError> {
        let rate = match self.speed {
            Some(speed) if !speed.is_finite() || speed < 0.0 => {
                return Err(PayloadError::InvalidSpeed(speed))
            }
            Some(speed) if speed > 0.0 => Some(speed),
            _ => None,
        };

        Ok(StreamConfig {
            size: self.size.unwrap_or(DEFAULT_SIZE),
            rate,
            startup_delay: self
                .request_timeout
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis),
            stalls: self
                .body_timeouts
                .into_iter()
                .map(|t| Stall {
                    after: t.after,
                    time: Duration::from_millis(t.time),
                })
                .collect(),
        })
    }
}

/// Payload errors, reported to the client as 400 Bad Request
#[derive(Debug)]
pub enum PayloadError {
    Json(serde_json::Error),
    InvalidSpeed(f64),
}

impl std::fmt::Display for PayloadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PayloadError::Json(e) => write!(f, "Invalid JSON body: {}", e),
            PayloadError::InvalidSpeed(speed) => {
                write!(f, "speed must be a non-negative number, got {}", speed)
            }
        }
    }
}

impl std::error::Error for PayloadError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PayloadError::Json(e) => Some(e),
            PayloadError::InvalidSpeed(_) => None,
        }
    }
}
