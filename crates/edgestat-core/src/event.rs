//! Traffic event model
//!
//! `RawTrafficEvent` is the wire form produced by the gateway: every field
//! is optional because malformed or partial messages must still decode far
//! enough to be acknowledged and dropped. `TrafficEvent` is the validated
//! form used by storage and aggregation.

use serde::{Deserialize, Serialize};

use crate::error::{EventError, Result};
use crate::identity::{derive_idempotent_id, hash_actor};
use crate::time::{date_of, hour_bucket};

/// Actor hash used when the gateway supplied neither a hash nor an address
pub const ANONYMOUS_ACTOR: &str = "anonymous";

/// Wire representation of a traffic event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTrafficEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_decision: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl RawTrafficEvent {
    /// Fill in a missing idempotent ID and actor hash from the request
    /// attributes, when enough of them are present.
    ///
    /// Used at the ingest edge only. The queue consumer validates what it
    /// receives and never invents an ID.
    pub fn fill_identity(&mut self) {
        if self.id.is_none() {
            if let (Some(ts), Some(path), Some(correlation_id)) =
                (self.timestamp, self.path.as_deref(), self.correlation_id.as_deref())
            {
                let address = self.actor_address.as_deref().unwrap_or_default();
                self.id = Some(derive_idempotent_id(ts, address, path, correlation_id));
            }
        }

        if self.actor_hash.is_none() {
            if let Some(address) = self.actor_address.as_deref() {
                self.actor_hash = Some(hash_actor(address));
            }
        }
    }

    /// Validate into a `TrafficEvent`.
    ///
    /// Identity, path and timestamp are mandatory. A missing actor hash is
    /// derived from the raw address when present.
    pub fn validate(self) -> Result<TrafficEvent> {
        let id = non_empty(self.id).ok_or(EventError::MissingField("id"))?;
        let path = non_empty(self.path).ok_or(EventError::MissingField("path"))?;
        let timestamp = self.timestamp.ok_or(EventError::MissingField("timestamp"))?;
        let event_date = date_of(timestamp)?;

        let actor_hash = match non_empty(self.actor_hash) {
            Some(hash) => hash,
            None => self
                .actor_address
                .as_deref()
                .map(hash_actor)
                .unwrap_or_else(|| ANONYMOUS_ACTOR.to_string()),
        };

        let status = self.status.unwrap_or(0);
        let is_error = self.is_error.unwrap_or(status >= 400);

        Ok(TrafficEvent {
            id,
            path,
            method: non_empty(self.method).map(|m| m.to_ascii_uppercase()),
            status,
            response_time_ms: self.response_time_ms.unwrap_or(0.0).max(0.0),
            actor_hash,
            actor_address: non_empty(self.actor_address),
            timestamp,
            event_date,
            country: non_empty(self.country),
            city: non_empty(self.city),
            user_agent: non_empty(self.user_agent),
            edge_location: non_empty(self.edge_location),
            geo_decision: non_empty(self.geo_decision),
            is_error,
        })
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

/// Validated, immutable traffic event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficEvent {
    pub id: String,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    pub status: u16,
    pub response_time_ms: f64,
    pub actor_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_address: Option<String>,
    pub timestamp: i64,
    pub event_date: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edge_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geo_decision: Option<String>,
    pub is_error: bool,
}

impl TrafficEvent {
    /// Start of the hour this event falls into.
    pub fn hour_bucket(&self) -> i64 {
        hour_bucket(self.timestamp)
    }

    /// Request was denied by geo/IP rules.
    pub fn is_blocked(&self) -> bool {
        self.status == 403
            || matches!(
                self.geo_decision.as_deref().map(str::to_ascii_lowercase).as_deref(),
                Some("block") | Some("blocked")
            )
    }

    /// Request was rejected by the rate limiter.
    pub fn is_throttled(&self) -> bool {
        self.status == 429
    }
}
