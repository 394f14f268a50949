//! Types shared between the capture layer, the queue and the handlers

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Scheduling priority. Lower numeric value is served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical = 1,
    High = 2,
    #[default]
    Medium = 3,
    Low = 4,
}

impl Priority {
    pub fn value(self) -> u8 {
        self as u8
    }

    pub fn from_value(value: u8) -> Option<Self> {
        match value {
            1 => Some(Priority::Critical),
            2 => Some(Priority::High),
            3 => Some(Priority::Medium),
            4 => Some(Priority::Low),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Medium => "medium",
            Priority::Low => "low",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "critical" | "1" => Ok(Priority::Critical),
            "high" | "2" => Ok(Priority::High),
            "medium" | "normal" | "3" => Ok(Priority::Medium),
            "low" | "4" => Ok(Priority::Low),
            other => Err(format!("unknown priority: '{}'", other)),
        }
    }
}

// Persisted files may carry either the name or the numeric value
impl<'de> Deserialize<'de> for Priority {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Num(u8),
            Name(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Num(n) => Priority::from_value(n)
                .ok_or_else(|| de::Error::custom(format!("priority out of range: {}", n))),
            Repr::Name(name) => name.parse().map_err(de::Error::custom),
        }
    }
}

/// Client-supplied context: a few well-known fields plus passthrough extras
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl UserContext {
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes = Some(note.into());
        self
    }
}

/// Kind of raw input accepted by the capture layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureType {
    Url,
    File,
    Text,
}

impl CaptureType {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureType::Url => "url",
            CaptureType::File => "file",
            CaptureType::Text => "text",
        }
    }
}

impl fmt::Display for CaptureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Lifecycle of a capture record as seen by the client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaptureStatus {
    Captured,
    Queued,
    Processing,
    Completed,
    Failed,
}

impl CaptureStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CaptureStatus::Captured => "captured",
            CaptureStatus::Queued => "queued",
            CaptureStatus::Processing => "processing",
            CaptureStatus::Completed => "completed",
            CaptureStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for CaptureStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_order() {
        let mut p = vec![Priority::Low, Priority::Critical, Priority::Medium, Priority::High];
        p.sort();
        assert_eq!(
            p,
            vec![Priority::Critical, Priority::High, Priority::Medium, Priority::Low]
        );
        assert_eq!(Priority::Critical.value(), 1);
        assert_eq!(Priority::Low.value(), 4);
    }

    #[test]
    fn test_priority_accepts_name_or_number() {
        let by_name: Priority = serde_json::from_str("\"high\"").unwrap();
        let by_value: Priority = serde_json::from_str("2").unwrap();
        assert_eq!(by_name, Priority::High);
        assert_eq!(by_value, Priority::High);
        assert!(serde_json::from_str::<Priority>("9").is_err());
        assert_eq!(serde_json::to_string(&Priority::Critical).unwrap(), "\"critical\"");
    }

    #[test]
    fn test_user_context_keeps_extras() {
        let json = r#"{"notes":"read later","priority":"low","battery":87,"app":"share-sheet"}"#;
        let ctx: UserContext = serde_json::from_str(json).unwrap();
        assert_eq!(ctx.notes.as_deref(), Some("read later"));
        assert_eq!(ctx.priority, Some(Priority::Low));
        assert_eq!(ctx.extra["battery"], 87);

        let back = serde_json::to_value(&ctx).unwrap();
        assert_eq!(back["app"], "share-sheet");
        assert!(back.get("device").is_none());
    }
}
