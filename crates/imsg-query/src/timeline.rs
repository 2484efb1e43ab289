use crate::resolver::ResolvedTarget;
use crate::QueryError;
use imsg_core::time::to_datetime;
use imsg_core::{NativeTimestamp, TimelineMessage};
use imsg_storage::{ChatStore, MessageRow, INVISIBLE_TEXT_CHARS};
use tracing::debug;

pub const SELF_SENDER: &str = "You";
pub const UNKNOWN_SENDER: &str = "Unknown";

/// Placeholder the store leaves in `text` where an attachment sat.
const OBJECT_REPLACEMENT: char = '\u{FFFC}';

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimelineScope {
    /// Messages joined to any of these conversation records.
    Conversations(Vec<i64>),
    /// Messages sent by any of these handles.
    Senders(Vec<i64>),
    All,
}

impl From<&ResolvedTarget> for TimelineScope {
    fn from(target: &ResolvedTarget) -> Self {
        match target {
            ResolvedTarget::Conversation { record_ids, .. } => {
                TimelineScope::Conversations(record_ids.clone())
            }
            ResolvedTarget::Contact { handle_ids, .. } => TimelineScope::Senders(handle_ids.clone()),
        }
    }
}

pub struct MessageTimeline<'s> {
    store: &'s ChatStore,
}

impl<'s> MessageTimeline<'s> {
    pub fn new(store: &'s ChatStore) -> Self {
        Self { store }
    }

    /// Newest-first messages after `since`, at most `limit` of them.
    pub fn fetch(
        &self,
        scope: &TimelineScope,
        since: NativeTimestamp,
        limit: usize,
    ) -> Result<Vec<TimelineMessage>, QueryError> {
        let rows = match scope {
            TimelineScope::Conversations(ids) if ids.is_empty() => Vec::new(),
            TimelineScope::Senders(ids) if ids.is_empty() => Vec::new(),
            TimelineScope::Conversations(ids) => {
                self.store.messages_in_conversations(ids, since, limit)?
            }
            TimelineScope::Senders(ids) => self.store.messages_from_handles(ids, since, limit)?,
            TimelineScope::All => self.store.recent_messages(since, limit)?,
        };
        let fetched = rows.len();
        let labelled = matches!(scope, TimelineScope::All);
        let messages = rows
            .into_iter()
            .filter_map(|row| render_row(row, labelled))
            .collect::<Vec<_>>();
        debug!(
            event = "timeline_fetched",
            fetched,
            returned = messages.len(),
            since
        );
        Ok(messages)
    }
}

fn render_row(row: MessageRow, labelled: bool) -> Option<TimelineMessage> {
    let text = visible_text(row.text.as_deref())?;
    let sender = sender_label(&row);
    let conversation = labelled.then(|| {
        row.chat_display_name
            .clone()
            .or_else(|| row.chat_identifier.clone())
            .unwrap_or_else(|| sender.clone())
    });
    Some(TimelineMessage {
        message_id: row.message_id,
        date: to_datetime(row.date),
        sender,
        text,
        is_from_me: row.is_from_me,
        service: row.service,
        conversation,
    })
}

/// Plain text with attachment placeholders removed, or `None` when nothing readable remains.
pub fn visible_text(raw: Option<&str>) -> Option<String> {
    let cleaned = raw?
        .chars()
        .filter(|ch| *ch != OBJECT_REPLACEMENT)
        .collect::<String>();
    let trimmed = cleaned.trim_matches(&INVISIBLE_TEXT_CHARS[..]);
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn sender_label(row: &MessageRow) -> String {
    if row.is_from_me {
        return SELF_SENDER.to_string();
    }
    row.sender_handle
        .clone()
        .unwrap_or_else(|| UNKNOWN_SENDER.to_string())
}
