//! The four query operations, each run against its own read-only store handle.

use crate::directory::ConversationDirectory;
use crate::resolver::{IdentifierResolver, TargetKind};
use crate::timeline::{MessageTimeline, TimelineScope};
use crate::QueryError;
use imsg_core::{ConversationMatch, ConversationSummary, TimeCodec, TimelineMessage};
use imsg_storage::{ChatStore, StorageError};
use serde::{Deserialize, Deserializer, Serialize};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const MAX_LIMIT: usize = 1_000;

/// Hands out read-only store handles, one per operation.
pub trait StoreSource {
    fn acquire(&self) -> Result<ChatStore, StorageError>;

    /// Called once for every handle returned by `acquire`, right before it is closed.
    fn release(&self, _store: &ChatStore) {}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatDbSource {
    path: PathBuf,
}

impl ChatDbSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StoreSource for ChatDbSource {
    fn acquire(&self) -> Result<ChatStore, StorageError> {
        ChatStore::open_read_only(&self.path)
    }
}

/// A store handle scoped to one operation; released and closed on drop.
pub struct StoreLease<'a, S: StoreSource + ?Sized> {
    source: &'a S,
    store: ChatStore,
}

impl<'a, S: StoreSource + ?Sized> StoreLease<'a, S> {
    pub fn acquire(source: &'a S) -> Result<Self, StorageError> {
        let store = source.acquire()?;
        Ok(Self { source, store })
    }
}

impl<S: StoreSource + ?Sized> Deref for StoreLease<'_, S> {
    type Target = ChatStore;

    fn deref(&self) -> &ChatStore {
        &self.store
    }
}

impl<S: StoreSource + ?Sized> Drop for StoreLease<'_, S> {
    fn drop(&mut self) {
        self.source.release(&self.store);
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ListArgs {
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub limit: i64,
    #[serde(alias = "include_non_native")]
    pub include_sms: bool,
}

impl Default for ListArgs {
    fn default() -> Self {
        Self {
            limit: 50,
            include_sms: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SearchArgs {
    pub query: Option<String>,
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub limit: i64,
}

impl Default for SearchArgs {
    fn default() -> Self {
        Self {
            query: None,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ReadArgs {
    #[serde(deserialize_with = "deserialize_identifier")]
    pub identifier: Option<String>,
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub limit: i64,
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub days_back: i64,
}

impl Default for ReadArgs {
    fn default() -> Self {
        Self {
            identifier: None,
            limit: 50,
            days_back: 30,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RecentArgs {
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub limit: i64,
    #[serde(deserialize_with = "deserialize_lenient_i64")]
    pub hours_back: i64,
}

impl Default for RecentArgs {
    fn default() -> Self {
        Self {
            limit: 30,
            hours_back: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationList {
    pub count: usize,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResults {
    pub found: usize,
    pub query: String,
    pub conversations: Vec<ConversationMatch>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MessageHistory {
    pub identifier: String,
    pub kind: TargetKind,
    pub record_ids: Vec<i64>,
    pub days_back: i64,
    pub message_count: usize,
    pub messages: Vec<TimelineMessage>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentMessages {
    pub hours_back: i64,
    pub message_count: usize,
    pub messages: Vec<TimelineMessage>,
}

pub struct QueryFacade<S> {
    source: S,
    codec: TimeCodec,
    resolver: IdentifierResolver,
}

impl<S: StoreSource> QueryFacade<S> {
    pub fn new(source: S) -> Self {
        Self::with_codec(source, TimeCodec::default())
    }

    pub fn with_codec(source: S, codec: TimeCodec) -> Self {
        Self {
            source,
            codec,
            resolver: IdentifierResolver::new(),
        }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    fn lease(&self) -> Result<StoreLease<'_, S>, QueryError> {
        Ok(StoreLease::acquire(&self.source)?)
    }

    pub fn list_conversations(&self, args: ListArgs) -> Result<ConversationList, QueryError> {
        let limit = checked_limit(args.limit)?;
        let store = self.lease()?;
        let conversations = ConversationDirectory::new(&store).list(limit, args.include_sms)?;
        Ok(ConversationList {
            count: conversations.len(),
            conversations,
        })
    }

    pub fn search_conversations(&self, args: SearchArgs) -> Result<SearchResults, QueryError> {
        let query = required_text("query", args.query)?;
        let limit = checked_limit(args.limit)?;
        let store = self.lease()?;
        let conversations = ConversationDirectory::new(&store).search(&query, limit)?;
        Ok(SearchResults {
            found: conversations.len(),
            query,
            conversations,
        })
    }

    pub fn read_messages(&self, args: ReadArgs) -> Result<MessageHistory, QueryError> {
        let identifier = required_text("identifier", args.identifier)?;
        let limit = checked_limit(args.limit)?;
        let days_back = checked_window("days_back", args.days_back)?;
        let since = self.codec.now_minus_days(days_back as f64);

        let store = self.lease()?;
        let target = self.resolver.resolve(&store, &identifier)?;
        let messages =
            MessageTimeline::new(&store).fetch(&TimelineScope::from(&target), since, limit)?;
        debug!(
            event = "messages_read",
            identifier = %identifier,
            kind = ?target.kind(),
            returned = messages.len()
        );
        Ok(MessageHistory {
            identifier,
            kind: target.kind(),
            record_ids: target.record_ids().to_vec(),
            days_back,
            message_count: messages.len(),
            messages,
        })
    }

    pub fn get_recent_messages(&self, args: RecentArgs) -> Result<RecentMessages, QueryError> {
        let limit = checked_limit(args.limit)?;
        let hours_back = checked_window("hours_back", args.hours_back)?;
        let since = self.codec.now_minus_hours(hours_back as f64);

        let store = self.lease()?;
        let messages = MessageTimeline::new(&store).fetch(&TimelineScope::All, since, limit)?;
        Ok(RecentMessages {
            hours_back,
            message_count: messages.len(),
            messages,
        })
    }
}

fn checked_limit(limit: i64) -> Result<usize, QueryError> {
    if limit < 1 {
        return Err(QueryError::invalid(format!(
            "limit must be at least 1, got {limit}"
        )));
    }
    Ok((limit as usize).min(MAX_LIMIT))
}

fn checked_window(name: &str, value: i64) -> Result<i64, QueryError> {
    if value < 0 {
        return Err(QueryError::invalid(format!(
            "{name} must not be negative, got {value}"
        )));
    }
    Ok(value)
}

fn required_text(name: &str, value: Option<String>) -> Result<String, QueryError> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .ok_or_else(|| QueryError::invalid(format!("{name} is required")))
}

/// Accepts a JSON integer or a numeric string.
fn deserialize_lenient_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::String(s) => s.trim().parse::<i64>().map_err(serde::de::Error::custom),
        serde_json::Value::Number(n) => n
            .as_i64()
            .ok_or_else(|| serde::de::Error::custom(format!("expected an integer, got {n}"))),
        _ => Err(serde::de::Error::custom("expected an integer")),
    }
}

/// Conversation ids sometimes arrive as bare JSON numbers.
fn deserialize_identifier<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let val: serde_json::Value = serde_json::Value::deserialize(deserializer)?;
    match val {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::String(s) => Ok(Some(s)),
        serde_json::Value::Number(n) => Ok(Some(n.to_string())),
        _ => Err(serde::de::Error::custom(
            "expected string or number for identifier",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use imsg_core::time::from_datetime;
    use imsg_core::FixedClock;
    use imsg_storage::fixture::{ChatDbFixture, NewChat, NewMessage};
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use serde_json::json;
    use std::cell::Cell;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 10, 18, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    struct CountingSource<'f> {
        fixture: &'f ChatDbFixture,
        acquired: Cell<usize>,
        released: Cell<usize>,
    }

    impl<'f> CountingSource<'f> {
        fn new(fixture: &'f ChatDbFixture) -> Self {
            Self {
                fixture,
                acquired: Cell::new(0),
                released: Cell::new(0),
            }
        }
    }

    impl StoreSource for CountingSource<'_> {
        fn acquire(&self) -> Result<ChatStore, StorageError> {
            let store = self.fixture.open_read_only()?;
            self.acquired.set(self.acquired.get() + 1);
            Ok(store)
        }

        fn release(&self, _store: &ChatStore) {
            self.released.set(self.released.get() + 1);
        }
    }

    fn facade(fixture: &ChatDbFixture) -> QueryFacade<CountingSource<'_>> {
        QueryFacade::with_codec(CountingSource::new(fixture), TimeCodec::new(FixedClock::at(now())))
    }

    #[test]
    fn handle_is_released_on_success_and_failure() {
        let fixture = ChatDbFixture::new().expect("fixture");
        fixture
            .add_chat(NewChat::new("chat-1", "iMessage"))
            .expect("chat");
        let facade = facade(&fixture);

        facade
            .list_conversations(ListArgs::default())
            .expect("list");
        let err = facade
            .read_messages(ReadArgs {
                identifier: Some("404".to_string()),
                ..ReadArgs::default()
            })
            .expect_err("missing conversation");
        assert_eq!(err.kind(), ErrorKind::NotFound);

        assert_eq!(facade.source().acquired.get(), 2);
        assert_eq!(facade.source().released.get(), 2);
    }

    #[test]
    fn invalid_arguments_fail_before_touching_the_store() {
        let fixture = ChatDbFixture::new().expect("fixture");
        let facade = facade(&fixture);

        let err = facade
            .search_conversations(SearchArgs::default())
            .expect_err("missing query");
        assert_eq!(err.to_string(), "invalid argument: query is required");
        let err = facade
            .read_messages(ReadArgs {
                identifier: Some("  ".to_string()),
                ..ReadArgs::default()
            })
            .expect_err("blank identifier");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = facade
            .list_conversations(ListArgs {
                limit: 0,
                include_sms: true,
            })
            .expect_err("zero limit");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = facade
            .get_recent_messages(RecentArgs {
                limit: 5,
                hours_back: -1,
            })
            .expect_err("negative window");
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        assert_eq!(facade.source().acquired.get(), 0);
    }

    #[test]
    fn recent_window_excludes_older_messages() {
        let fixture = ChatDbFixture::new().expect("fixture");
        let ann = fixture.add_handle("ann@example.com").expect("ann");
        let chat = fixture
            .add_chat(NewChat::new("chat-ann", "iMessage"))
            .expect("chat");
        fixture
            .add_message(
                &[chat],
                NewMessage::incoming("yesterday-ish", from_datetime(now() - Duration::hours(25)), ann),
            )
            .expect("old");
        fixture
            .add_message(
                &[chat],
                NewMessage::incoming("just now", from_datetime(now() - Duration::hours(1)), ann),
            )
            .expect("new");
        let facade = facade(&fixture);

        let recent = facade
            .get_recent_messages(RecentArgs::default())
            .expect("recent");
        assert_eq!(recent.message_count, 1);
        assert_eq!(recent.messages[0].text, "just now");
        assert_eq!(recent.messages[0].conversation.as_deref(), Some("chat-ann"));
    }

    #[test]
    fn huge_windows_cover_the_whole_history() {
        let fixture = ChatDbFixture::new().expect("fixture");
        let ann = fixture.add_handle("ann@example.com").expect("ann");
        let chat = fixture
            .add_chat(NewChat::new("chat-ann", "iMessage").with_id(1))
            .expect("chat");
        fixture
            .add_message(&[chat], NewMessage::incoming("before the epoch", -5, ann))
            .expect("ancient");
        let facade = facade(&fixture);

        let history = facade
            .read_messages(ReadArgs {
                identifier: Some("1".to_string()),
                limit: 10,
                days_back: 1_000_000,
            })
            .expect("read");
        assert_eq!(history.message_count, 1);
        let recent = facade
            .get_recent_messages(RecentArgs {
                limit: 10,
                hours_back: i64::MAX,
            })
            .expect("recent");
        assert_eq!(recent.messages[0].text, "before the epoch");
    }

    #[test]
    fn placeholder_only_messages_do_not_take_limit_slots() {
        let fixture = ChatDbFixture::new().expect("fixture");
        let ann = fixture.add_handle("ann@example.com").expect("ann");
        let chat = fixture
            .add_chat(NewChat::new("chat-ann", "iMessage").with_id(1))
            .expect("chat");
        fixture
            .add_message(
                &[chat],
                NewMessage::incoming("real text", from_datetime(now() - Duration::hours(3)), ann),
            )
            .expect("real");
        fixture
            .add_message(
                &[chat],
                NewMessage::incoming("\u{FFFC}", from_datetime(now() - Duration::hours(1)), ann),
            )
            .expect("attachment");
        let facade = facade(&fixture);

        let history = facade
            .read_messages(ReadArgs {
                identifier: Some("1".to_string()),
                limit: 1,
                days_back: 30,
            })
            .expect("read");
        assert_eq!(history.message_count, 1);
        assert_eq!(history.messages[0].text, "real text");

        let recent = facade
            .get_recent_messages(RecentArgs {
                limit: 1,
                hours_back: 24,
            })
            .expect("recent");
        assert_eq!(recent.messages[0].text, "real text");
    }

    #[test]
    fn limits_are_clamped() {
        assert_eq!(checked_limit(5_000).expect("clamped"), MAX_LIMIT);
        assert_eq!(checked_limit(1).expect("one"), 1);
    }

    #[test]
    fn arguments_deserialize_with_defaults_and_lenient_numbers() {
        let args: ListArgs = serde_json::from_value(json!({})).expect("defaults");
        assert_eq!(args, ListArgs::default());

        let args: ListArgs =
            serde_json::from_value(json!({"limit": "5", "include_non_native": false}))
                .expect("aliases");
        assert_eq!(args.limit, 5);
        assert!(!args.include_sms);

        let args: ReadArgs =
            serde_json::from_value(json!({"identifier": 7, "days_back": 2})).expect("read");
        assert_eq!(args.identifier.as_deref(), Some("7"));
        assert_eq!(args.days_back, 2);
        assert_eq!(args.limit, 50);

        let err = serde_json::from_value::<RecentArgs>(json!({"limit": "many"}));
        assert!(err.is_err());
    }
}
