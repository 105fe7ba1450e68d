//! Calendar event entity and its wire schema.
//!
//! `Event` is the only entity the notification pipeline moves around. The
//! same serde representation is used for queue messages, so field names
//! follow the external schema (`id, title, startedAt, finishedAt,
//! description, userId, notifyInterval, sent`).

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque event identifier assigned by the store on insert.
///
/// An empty id means "not yet assigned".
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn is_assigned(&self) -> bool {
        !self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A scheduled calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    #[serde(default)]
    pub id: EventId,
    pub title: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub user_id: i64,
    /// How long before `started_at` the notification becomes due.
    #[serde(default, with = "duration_nanos")]
    pub notify_interval: Duration,
    /// Set once the notification has been published. Never reset.
    #[serde(default)]
    pub sent: bool,
}

impl Event {
    /// Create an unsaved event with no description and a zero notify interval.
    pub fn new(
        title: impl Into<String>,
        user_id: i64,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: EventId::default(),
            title: title.into(),
            started_at,
            finished_at,
            description: None,
            user_id,
            notify_interval: Duration::ZERO,
            sent: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<EventId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_notify_interval(mut self, interval: Duration) -> Self {
        self.notify_interval = interval;
        self
    }

    /// Moment at which the notification becomes due (`started_at - notify_interval`).
    ///
    /// Intervals too large to represent saturate to the minimum timestamp,
    /// which makes the event due immediately.
    pub fn notify_at(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.notify_interval)
            .ok()
            .and_then(|interval| self.started_at.checked_sub_signed(interval))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// `true` when the notification time has passed and it has not been sent.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.sent && self.notify_at() <= now
    }
}

/// Serialises a `Duration` as integer nanoseconds.
mod duration_nanos {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let nanos = u64::try_from(value.as_nanos()).unwrap_or(u64::MAX);
        serializer.serialize_u64(nanos)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_nanos)
    }
}
