use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single structured log event emitted by the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RbmLogEvent {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    pub context: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl RbmLogEvent {
    pub fn new(component: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        RbmLogEvent {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"timestamp":"{}","level":"{}","component":"{}","message":"{}"}}"#,
                self.timestamp.to_rfc3339(),
                self.level,
                self.component,
                self.message
            )
        })
    }

    pub fn to_text(&self) -> String {
        format!(
            "[{}] {} {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
            self.level,
            self.component,
            self.message
        )
    }
}

/// Bounded ring buffer of recent log events, for embedding diagnostic
/// history alongside the manager without depending on an external log
/// sink. Complements, rather than replaces, the `log` facade calls made
/// throughout the manager.
pub struct EventLog {
    events: Vec<RbmLogEvent>,
    max_size: usize,
    min_level: LogLevel,
}

impl EventLog {
    pub fn new(max_size: usize, min_level: LogLevel) -> Self {
        EventLog {
            events: Vec::new(),
            max_size,
            min_level,
        }
    }

    pub fn log(&mut self, event: RbmLogEvent) {
        if event.level >= self.min_level {
            self.events.push(event);
            if self.events.len() > self.max_size {
                self.events.remove(0);
            }
        }
    }

    pub fn events(&self) -> &[RbmLogEvent] {
        &self.events
    }

    pub fn export_jsonl(&self) -> String {
        self.events
            .iter()
            .map(|e| e.to_json())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_log_bounds_size() {
        let mut log = EventLog::new(2, LogLevel::Debug);
        log.log(RbmLogEvent::new("rbm", LogLevel::Info, "one"));
        log.log(RbmLogEvent::new("rbm", LogLevel::Info, "two"));
        log.log(RbmLogEvent::new("rbm", LogLevel::Info, "three"));
        assert_eq!(log.events().len(), 2);
        assert_eq!(log.events()[0].message, "two");
    }

    #[test]
    fn event_log_filters_by_level() {
        let mut log = EventLog::new(10, LogLevel::Warn);
        log.log(RbmLogEvent::new("rbm", LogLevel::Debug, "ignored"));
        log.log(RbmLogEvent::new("rbm", LogLevel::Error, "kept"));
        assert_eq!(log.events().len(), 1);
        assert_eq!(log.events()[0].message, "kept");
    }
}
