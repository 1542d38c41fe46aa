//! Timer types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Opaque key/value payload attached to a timer.
///
/// The dispatch core passes this through unchanged; field meanings
/// (`author`, `channel`, `reminder_text`, `secret`, ...) belong to the
/// feature that scheduled the job and are never validated here.
pub type Payload = Map<String, Value>;

/// A pending job: fire `event` at `expiry`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Timer {
    /// Store-assigned row id. `None` for ephemeral timers that never
    /// touch the store.
    pub id: Option<i64>,
    /// Tag identifying what kind of job this is (e.g. "reminder"),
    /// used to route completion to the correct consumer.
    pub event: String,
    /// When the job was scheduled.
    pub created: DateTime<Utc>,
    /// When the job should fire. A past expiry fires immediately.
    pub expiry: DateTime<Utc>,
    /// Opaque payload carried through to completion consumers.
    pub payload: Payload,
}

impl Timer {
    /// Create a timer that has not been persisted yet.
    pub fn new(
        event: impl Into<String>,
        created: DateTime<Utc>,
        expiry: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        Self {
            id: None,
            event: event.into(),
            created,
            expiry,
            payload,
        }
    }

    /// Name of the completion event consumers match on.
    pub fn completion_event(&self) -> String {
        format!("{}_job_complete", self.event)
    }

    /// Scheduled duration of the timer.
    pub fn duration(&self) -> Duration {
        self.expiry - self.created
    }

    /// Time left until expiry, zero when already past due.
    pub fn remaining(&self, now: DateTime<Utc>) -> std::time::Duration {
        (self.expiry - now)
            .to_std()
            .unwrap_or(std::time::Duration::ZERO)
    }
}
