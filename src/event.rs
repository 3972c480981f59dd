use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Error;

/// Name of the field holding the event type
pub const TYPE_KEY: &str = "type";

/// Event delivered by a [Dispatcher](crate::Dispatcher). It's a JSON object which always carries
/// a string ```type``` field plus arbitrary named fields:
///
/// ```
/// use async_event_settlement::Event;
/// use serde_json::json;
///
/// let event = Event::new("progress").with("pct", 42).with("job", json!({ "id": 7 }));
/// assert_eq!(event.event_type(), "progress");
/// assert_eq!(event.get("pct"), Some(&json!(42)));
/// assert_eq!(event.resolve("job.id"), Some(&json!(7)));
///
/// let parsed = Event::from_value(json!({ "type": "done", "token": "abc" })).unwrap();
/// assert_eq!(parsed.get("token"), Some(&json!("abc")));
/// assert!(Event::from_value(json!({ "token": "abc" })).is_err());
/// ```
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Event {
    value: Value,
}

impl Event {
    pub fn new(event_type: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert(TYPE_KEY.to_owned(), Value::String(event_type.into()));
        Self {
            value: Value::Object(fields),
        }
    }

    /// Validate arbitrary JSON value as event
    pub fn from_value(value: Value) -> Result<Self, Error> {
        match &value {
            Value::Object(fields) => match fields.get(TYPE_KEY) {
                Some(Value::String(_)) => Ok(Self { value }),
                Some(other) => Err(Error::InvalidEvent(format!(
                    "`{}` field must be a string, got {}",
                    TYPE_KEY, other
                ))),
                None => Err(Error::InvalidEvent(format!("missing `{}` field", TYPE_KEY))),
            },
            other => Err(Error::InvalidEvent(format!("expected object, got {}", other))),
        }
    }

    /// Add or replace named field. The ```type``` field is fixed at construction, attempts to
    /// replace it are ignored.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        if key != TYPE_KEY {
            if let Value::Object(fields) = &mut self.value {
                fields.insert(key, value.into());
            }
        }
        self
    }

    pub fn event_type(&self) -> &str {
        self.value
            .get(TYPE_KEY)
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    /// Top-level field by name
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.value.get(key)
    }

    /// Nested field by dot-separated path, see [crate::property_path]
    pub fn resolve(&self, path: &str) -> Option<&Value> {
        crate::property_path::resolve(&self.value, path)
    }

    pub fn as_value(&self) -> &Value {
        &self.value
    }

    pub fn into_value(self) -> Value {
        self.value
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Event({})", self.value)
    }
}

impl TryFrom<Value> for Event {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Self::from_value(value)
    }
}

impl From<Event> for Value {
    fn from(event: Event) -> Self {
        event.value
    }
}
