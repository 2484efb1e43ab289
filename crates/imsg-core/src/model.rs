use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Transport protocol a chat or message record belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ServiceKind {
    IMessage,
    Sms,
    Rcs,
    Other(String),
}

impl ServiceKind {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceKind::IMessage => "iMessage",
            ServiceKind::Sms => "SMS",
            ServiceKind::Rcs => "RCS",
            ServiceKind::Other(raw) => raw,
        }
    }

    pub fn is_native(&self) -> bool {
        matches!(self, ServiceKind::IMessage)
    }
}

impl From<&str> for ServiceKind {
    fn from(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "imessage" => ServiceKind::IMessage,
            "sms" | "mms" => ServiceKind::Sms,
            "rcs" => ServiceKind::Rcs,
            _ => ServiceKind::Other(value.to_string()),
        }
    }
}

impl FromStr for ServiceKind {
    type Err = std::convert::Infallible;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        Ok(ServiceKind::from(input))
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ServiceKind {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(ServiceKind::from(raw.as_str()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationType {
    Group,
    Individual,
}

impl ConversationType {
    pub fn from_participant_count(count: u32) -> Self {
        if count > 1 {
            ConversationType::Group
        } else {
            ConversationType::Individual
        }
    }
}

/// One logical conversation, possibly backed by several per-protocol records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationSummary {
    /// Record id of the representative duplicate.
    pub id: i64,
    pub record_ids: Vec<i64>,
    pub name: String,
    pub identifier: String,
    pub service: ServiceKind,
    #[serde(rename = "type")]
    pub kind: ConversationType,
    pub participant_count: u32,
    pub last_message_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMatch {
    #[serde(flatten)]
    pub summary: ConversationSummary,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineMessage {
    pub message_id: i64,
    pub date: Option<DateTime<Utc>>,
    pub sender: String,
    pub text: String,
    pub is_from_me: bool,
    pub service: Option<ServiceKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_kind_parses_known_and_keeps_unknown() {
        assert_eq!(ServiceKind::from("iMessage"), ServiceKind::IMessage);
        assert_eq!(ServiceKind::from("SMS"), ServiceKind::Sms);
        assert_eq!(ServiceKind::from("rcs"), ServiceKind::Rcs);
        assert_eq!(
            ServiceKind::from("iMessageLite"),
            ServiceKind::Other("iMessageLite".to_string())
        );
        assert!(ServiceKind::IMessage.is_native());
        assert!(!ServiceKind::Rcs.is_native());
    }

    #[test]
    fn summary_serializes_type_tag_and_service_string() {
        let summary = ConversationSummary {
            id: 7,
            record_ids: vec![7, 8],
            name: "Climbing crew".to_string(),
            identifier: "chat1234".to_string(),
            service: ServiceKind::IMessage,
            kind: ConversationType::from_participant_count(3),
            participant_count: 3,
            last_message_date: None,
        };
        let value = serde_json::to_value(&summary).expect("serialize");
        assert_eq!(value["type"], "group");
        assert_eq!(value["service"], "iMessage");
        assert!(value["last_message_date"].is_null());

        let matched = ConversationMatch {
            summary,
            participants: vec!["+15550001111".to_string()],
        };
        let value = serde_json::to_value(&matched).expect("serialize match");
        assert_eq!(value["id"], 7);
        assert_eq!(value["participants"][0], "+15550001111");
    }

    #[test]
    fn single_participant_is_individual() {
        assert_eq!(
            ConversationType::from_participant_count(0),
            ConversationType::Individual
        );
        assert_eq!(
            ConversationType::from_participant_count(1),
            ConversationType::Individual
        );
    }
}
