//! Build lifecycle events and their routing.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Routing key for the notification service.
pub const NOTIFICATIONS_ROUTING_KEY: &str = "notifications";

/// Routing key for third-party integrations.
pub const INTEGRATIONS_ROUTING_KEY: &str = "integrations-notifications";

/// Every lifecycle event goes to both audiences.
pub const LIFECYCLE_ROUTING_KEYS: [&str; 2] = [NOTIFICATIONS_ROUTING_KEY, INTEGRATIONS_ROUTING_KEY];

/// Build lifecycle event types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LifecycleEvent {
    BuildAdded,
    BuildStarted,
    BuildFinished,
    BuildCancelled,
    StepStarted,
    StepFinished,
    BuildsetAdded,
    BuildsetStarted,
    BuildsetFinished,
}

impl LifecycleEvent {
    pub const ALL: [LifecycleEvent; 9] = [
        LifecycleEvent::BuildAdded,
        LifecycleEvent::BuildStarted,
        LifecycleEvent::BuildFinished,
        LifecycleEvent::BuildCancelled,
        LifecycleEvent::StepStarted,
        LifecycleEvent::StepFinished,
        LifecycleEvent::BuildsetAdded,
        LifecycleEvent::BuildsetStarted,
        LifecycleEvent::BuildsetFinished,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::BuildAdded => "build-added",
            LifecycleEvent::BuildStarted => "build-started",
            LifecycleEvent::BuildFinished => "build-finished",
            LifecycleEvent::BuildCancelled => "build-cancelled",
            LifecycleEvent::StepStarted => "step-started",
            LifecycleEvent::StepFinished => "step-finished",
            LifecycleEvent::BuildsetAdded => "buildset-added",
            LifecycleEvent::BuildsetStarted => "buildset-started",
            LifecycleEvent::BuildsetFinished => "buildset-finished",
        }
    }

    /// Build the event payload: `body` fields plus `event_type` and
    /// `repository_id`. A non-object body is kept under `data`.
    pub fn payload(&self, repository_id: &str, body: Value) -> Value {
        let mut map = match body {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("data".to_string(), other);
                map
            }
        };
        map.insert("event_type".to_string(), Value::String(self.as_str().to_string()));
        map.insert("repository_id".to_string(), Value::String(repository_id.to_string()));
        Value::Object(map)
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
