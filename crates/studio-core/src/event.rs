use crate::error::{ErrorKind, StudioError};
use crate::flow::FlowId;
use crate::lines::StreamKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);

/// The unit an event is about
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Subject {
    Flow(FlowId),
    Inspector,
}

impl Subject {
    pub const INSPECTOR: &'static str = "inspector";

    pub fn as_str(&self) -> &str {
        match self {
            Subject::Flow(id) => id.as_str(),
            Subject::Inspector => Self::INSPECTOR,
        }
    }
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Subject {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Subject {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(if raw == Self::INSPECTOR {
            Subject::Inspector
        } else {
            Subject::Flow(FlowId::from(raw))
        })
    }
}

/// Which of a unit's processes produced a log line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogOrigin {
    Helper,
    Exposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Log,
    Started,
    Stopped,
    Exited,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    Log {
        origin: LogOrigin,
        stream: StreamKind,
        line: String,
    },
    Started {
        pid: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
        #[serde(skip_serializing_if = "Option::is_none")]
        helper_pid: Option<u32>,
        command: String,
    },
    /// Caller-initiated stop; `exit_code` is null when the process had to be killed
    Stopped { exit_code: Option<i32> },
    /// The process went away on its own
    Exited {
        pid: u32,
        exit_code: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        signal: Option<i32>,
    },
    Failed { error: ErrorKind, message: String },
}

impl EventPayload {
    pub fn kind(&self) -> EventKind {
        match self {
            EventPayload::Log { .. } => EventKind::Log,
            EventPayload::Started { .. } => EventKind::Started,
            EventPayload::Stopped { .. } => EventKind::Stopped,
            EventPayload::Exited { .. } => EventKind::Exited,
            EventPayload::Failed { .. } => EventKind::Failed,
        }
    }

    pub fn failed(error: &StudioError) -> Self {
        EventPayload::Failed {
            error: error.kind(),
            message: error.to_string(),
        }
    }
}

/// Immutable record of something that happened to a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Process-wide, strictly increasing
    pub seq: u64,
    pub subject: Subject,
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl Event {
    pub fn new(subject: Subject, payload: EventPayload) -> Self {
        Self {
            seq: NEXT_SEQ.fetch_add(1, Ordering::Relaxed),
            subject,
            at: Utc::now(),
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    /// `true` for the events that end a run
    pub fn is_terminal(&self) -> bool {
        matches!(self.kind(), EventKind::Stopped | EventKind::Exited)
    }

    /// Server-sent-events frame: `data: {json}\n\n`
    pub fn to_sse_frame(&self) -> String {
        match serde_json::to_string(self) {
            Ok(json) => format!("data: {json}\n\n"),
            Err(e) => format!("data: {{\"type\":\"error\",\"message\":\"{e}\"}}\n\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_monotonic() {
        let a = Event::new(Subject::Inspector, EventPayload::Stopped { exit_code: None });
        let b = Event::new(Subject::Inspector, EventPayload::Stopped { exit_code: None });
        assert!(b.seq > a.seq);
    }

    #[test]
    fn test_wire_shape() {
        let event = Event::new(
            Subject::Flow(FlowId::from("abc")),
            EventPayload::Started {
                pid: 10,
                port: Some(8002),
                helper_pid: None,
                command: "mcp-proxy -config x".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "started");
        assert_eq!(value["subject"], "abc");
        assert_eq!(value["port"], 8002);
        assert!(value.get("helper_pid").is_none());

        let back: Event = serde_json::from_value(value).unwrap();
        assert_eq!(back, event);
    }

    #[test]
    fn test_stopped_keeps_null_exit_code() {
        let event = Event::new(Subject::Inspector, EventPayload::Stopped { exit_code: None });
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("}\n\n"));
        assert!(frame.contains("\"exit_code\":null"));
        assert!(frame.contains("\"subject\":\"inspector\""));
        assert!(event.is_terminal());
    }

    #[test]
    fn test_failed_payload_from_error() {
        let payload = EventPayload::failed(&StudioError::Spawn("no such file".into()));
        assert_eq!(payload.kind(), EventKind::Failed);
        let value = serde_json::to_value(&payload).unwrap();
        assert_eq!(value["error"], "spawn_error");
    }
}
