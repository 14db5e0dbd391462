//! Header snapshot of a session record, with skew-tolerant change detection.

use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::source::SessionState;

/// Client metadata scraped from the request that triggered an examination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMeta {
    /// User-Agent header of the client, if any.
    pub user_agent: Option<String>,
    /// Remote address of the client.
    pub remote_addr: Option<String>,
    /// Remote host name of the client.
    pub remote_host: Option<String>,
    /// Remote port of the client.
    pub remote_port: Option<String>,
    /// Authenticated remote user, if any.
    pub remote_user: Option<String>,
}

impl RequestMeta {
    /// Create empty request metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the User-Agent header.
    pub fn with_user_agent(mut self, value: impl Into<String>) -> Self {
        self.user_agent = Some(value.into());
        self
    }

    /// Set the remote address.
    pub fn with_remote_addr(mut self, value: impl Into<String>) -> Self {
        self.remote_addr = Some(value.into());
        self
    }

    /// Set the remote host name.
    pub fn with_remote_host(mut self, value: impl Into<String>) -> Self {
        self.remote_host = Some(value.into());
        self
    }

    /// Set the remote port.
    pub fn with_remote_port(mut self, value: impl Into<String>) -> Self {
        self.remote_port = Some(value.into());
        self
    }

    /// Set the authenticated remote user.
    pub fn with_remote_user(mut self, value: impl Into<String>) -> Self {
        self.remote_user = Some(value.into());
        self
    }
}

/// Metadata persisted alongside a record's fields.
///
/// Captured on every examination. The activity timestamps change on every
/// request, so change detection compares them with a configurable skew
/// window rather than exactly: cosmetic drift must not force a persist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaderSnapshot {
    /// Node that captured this snapshot.
    pub node_id: String,
    /// Application the record belongs to.
    pub app: String,
    /// Authenticated principal, if any.
    pub principal: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last completed access.
    pub last_accessed_at: DateTime<Utc>,
    /// Access currently in progress.
    pub this_accessed_at: DateTime<Utc>,
    /// When the record expires if untouched.
    pub expires_at: DateTime<Utc>,
    /// Idle seconds after which the record expires.
    pub max_idle_secs: i64,
    /// Number of requests observed against the record.
    pub request_count: u32,
    /// Whether the record is newly created.
    pub is_new: bool,
    /// Whether the record is still valid.
    pub is_valid: bool,
    /// User-Agent of the last examining request.
    pub user_agent: Option<String>,
    /// Remote address of the last examining request.
    pub remote_addr: Option<String>,
    /// Remote host of the last examining request.
    pub remote_host: Option<String>,
    /// Remote port of the last examining request.
    pub remote_port: Option<String>,
    /// Remote user of the last examining request.
    pub remote_user: Option<String>,
}

impl HeaderSnapshot {
    /// Capture a snapshot from a session and the request examining it.
    pub fn capture(
        source: &dyn SessionState,
        request: Option<&RequestMeta>,
        node_id: &str,
        app: &str,
    ) -> Self {
        // millisecond precision, matching what survives a backend round trip
        let last_accessed_at = source.last_accessed_at().trunc_subsecs(3);
        let max_idle_secs = source.max_idle_secs();
        Self {
            node_id: node_id.to_string(),
            app: app.to_string(),
            principal: source.principal(),
            created_at: source.created_at().trunc_subsecs(3),
            last_accessed_at,
            this_accessed_at: source.this_accessed_at().trunc_subsecs(3),
            expires_at: last_accessed_at + chrono::Duration::seconds(max_idle_secs),
            max_idle_secs,
            request_count: source.request_count() + u32::from(request.is_some()),
            is_new: source.is_new(),
            is_valid: source.is_valid(),
            user_agent: request.and_then(|r| r.user_agent.clone()),
            remote_addr: request.and_then(|r| r.remote_addr.clone()),
            remote_host: request.and_then(|r| r.remote_host.clone()),
            remote_port: request.and_then(|r| r.remote_port.clone()),
            remote_user: request.and_then(|r| r.remote_user.clone()),
        }
    }

    /// Whether `other` represents a change worth persisting, given the skew
    /// window for the activity timestamps.
    ///
    /// `remote_port` is carried for persistence but excluded from the
    /// comparison: it changes on nearly every request without carrying any
    /// signal about the record itself.
    pub fn differs_from(&self, other: &HeaderSnapshot, skew: Duration) -> bool {
        self.node_id != other.node_id
            || self.app != other.app
            || self.principal != other.principal
            || self.created_at != other.created_at
            || self.max_idle_secs != other.max_idle_secs
            || self.request_count != other.request_count
            || self.is_new != other.is_new
            || self.is_valid != other.is_valid
            || self.user_agent != other.user_agent
            || self.remote_addr != other.remote_addr
            || self.remote_host != other.remote_host
            || self.remote_user != other.remote_user
            || time_differs(self.last_accessed_at, other.last_accessed_at, skew)
            || time_differs(self.this_accessed_at, other.this_accessed_at, skew)
            || time_differs(self.expires_at, other.expires_at, skew)
    }
}

fn time_differs(a: DateTime<Utc>, b: DateTime<Utc>, skew: Duration) -> bool {
    let delta = (b - a).num_milliseconds().unsigned_abs();
    delta > skew.as_millis() as u64
}
