//! Conversation listing and search, one entry per logical conversation.

use crate::QueryError;
use imsg_core::time::to_datetime;
use imsg_core::{ConversationMatch, ConversationSummary, ConversationType};
use imsg_storage::{ChatStore, ConversationRow};
use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum GroupKey {
    Shared(String),
    Record(i64),
}

impl GroupKey {
    fn of(row: &ConversationRow) -> Self {
        match &row.record.group_id {
            Some(group_id) => GroupKey::Shared(group_id.clone()),
            None => GroupKey::Record(row.record.id),
        }
    }
}

/// Per-protocol records that make up one logical conversation, ordered by record id.
#[derive(Debug, Clone)]
struct LogicalGroup {
    members: Vec<ConversationRow>,
    representative: usize,
}

impl LogicalGroup {
    /// Picks the member with the latest activity; ties go to the lowest record id.
    fn from_members(mut members: Vec<ConversationRow>) -> Option<Self> {
        members.sort_by_key(|row| row.record.id);
        let (representative, _) = members
            .iter()
            .enumerate()
            .max_by_key(|(_, row)| (row.last_activity, Reverse(row.record.id)))?;
        Some(Self {
            members,
            representative,
        })
    }

    fn representative(&self) -> &ConversationRow {
        &self.members[self.representative]
    }

    fn last_activity(&self) -> Option<i64> {
        self.members.iter().filter_map(|row| row.last_activity).max()
    }

    fn record_ids(&self) -> Vec<i64> {
        self.members.iter().map(|row| row.record.id).collect()
    }

    fn display_name(&self) -> String {
        let representative = self.representative();
        representative
            .record
            .display_name
            .clone()
            .or_else(|| {
                self.members
                    .iter()
                    .find_map(|row| row.record.display_name.clone())
            })
            .unwrap_or_else(|| representative.record.chat_identifier.clone())
    }

    fn summary(&self) -> ConversationSummary {
        let representative = self.representative();
        let participant_count = self
            .members
            .iter()
            .map(|row| row.participant_count)
            .max()
            .unwrap_or_default();
        ConversationSummary {
            id: representative.record.id,
            record_ids: self.record_ids(),
            name: self.display_name(),
            identifier: representative.record.chat_identifier.clone(),
            service: representative.record.service.clone(),
            kind: ConversationType::from_participant_count(participant_count),
            participant_count,
            last_message_date: self.last_activity().and_then(to_datetime),
        }
    }

    fn matches(&self, needle: &str, participants: &BTreeMap<i64, Vec<String>>) -> bool {
        self.members.iter().any(|row| {
            let record = &row.record;
            contains_folded(&record.chat_identifier, needle)
                || record
                    .display_name
                    .as_deref()
                    .is_some_and(|name| contains_folded(name, needle))
                || participants
                    .get(&record.id)
                    .is_some_and(|ids| ids.iter().any(|id| contains_folded(id, needle)))
        })
    }

    fn participants(&self, participants: &BTreeMap<i64, Vec<String>>) -> Vec<String> {
        self.members
            .iter()
            .filter_map(|row| participants.get(&row.record.id))
            .flatten()
            .cloned()
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect()
    }
}

pub struct ConversationDirectory<'s> {
    store: &'s ChatStore,
}

impl<'s> ConversationDirectory<'s> {
    pub fn new(store: &'s ChatStore) -> Self {
        Self { store }
    }

    pub fn list(
        &self,
        limit: usize,
        include_non_native: bool,
    ) -> Result<Vec<ConversationSummary>, QueryError> {
        let rows = self.store.conversation_rows(!include_non_native)?;
        let record_count = rows.len();
        let mut groups = group_rows(rows);
        order_groups(&mut groups);
        groups.truncate(limit);
        debug!(
            event = "conversations_listed",
            records = record_count,
            returned = groups.len(),
            include_non_native
        );
        Ok(groups.iter().map(LogicalGroup::summary).collect())
    }

    /// Case-insensitive substring search over names, chat identifiers and participants.
    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<ConversationMatch>, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::invalid("query must not be empty"));
        }
        let needle = query.to_lowercase();

        let participants = self.store.participants_by_conversation()?;
        let mut groups = group_rows(self.store.conversation_rows(false)?)
            .into_iter()
            .filter(|group| group.matches(&needle, &participants))
            .collect::<Vec<_>>();
        order_groups(&mut groups);
        groups.truncate(limit);
        debug!(event = "conversations_searched", query, returned = groups.len());

        Ok(groups
            .iter()
            .map(|group| ConversationMatch {
                summary: group.summary(),
                participants: group.participants(&participants),
            })
            .collect())
    }
}

fn group_rows(rows: Vec<ConversationRow>) -> Vec<LogicalGroup> {
    let mut grouped: BTreeMap<GroupKey, Vec<ConversationRow>> = BTreeMap::new();
    for row in rows {
        grouped.entry(GroupKey::of(&row)).or_default().push(row);
    }
    grouped
        .into_values()
        .filter_map(LogicalGroup::from_members)
        .collect()
}

/// Latest activity first, groups without messages last, then by representative id.
fn order_groups(groups: &mut [LogicalGroup]) {
    groups.sort_by(|left, right| {
        right
            .last_activity()
            .cmp(&left.last_activity())
            .then_with(|| left.representative().record.id.cmp(&right.representative().record.id))
    });
}

fn contains_folded(haystack: &str, folded_needle: &str) -> bool {
    haystack.to_lowercase().contains(folded_needle)
}
