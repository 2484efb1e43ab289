//! Turns a caller-supplied identifier into the store records it refers to.
//!
//! An all-digit identifier is a conversation record id and expands to every
//! per-protocol duplicate sharing its group key. Anything else is a contact key
//! matched against handle identifiers.

use crate::QueryError;
use imsg_storage::ChatStore;
use regex::Regex;
use serde::Serialize;
use tracing::debug;

/// Trailing digits kept as a fallback needle when a number carries a country code.
const NATIONAL_NUMBER_DIGITS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetKind {
    Conversation,
    Contact,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedTarget {
    Conversation {
        record_ids: Vec<i64>,
        group_key: Option<String>,
    },
    Contact {
        handle_ids: Vec<i64>,
        handles: Vec<String>,
    },
}

impl ResolvedTarget {
    pub fn kind(&self) -> TargetKind {
        match self {
            ResolvedTarget::Conversation { .. } => TargetKind::Conversation,
            ResolvedTarget::Contact { .. } => TargetKind::Contact,
        }
    }

    pub fn record_ids(&self) -> &[i64] {
        match self {
            ResolvedTarget::Conversation { record_ids, .. } => record_ids,
            ResolvedTarget::Contact { handle_ids, .. } => handle_ids,
        }
    }
}

pub struct IdentifierResolver {
    conversation_key: Regex,
}

impl Default for IdentifierResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentifierResolver {
    pub fn new() -> Self {
        Self {
            conversation_key: Regex::new(r"^[0-9]+$").expect("valid regex"),
        }
    }

    pub fn classify(&self, identifier: &str) -> TargetKind {
        if self.conversation_key.is_match(identifier.trim()) {
            TargetKind::Conversation
        } else {
            TargetKind::Contact
        }
    }

    pub fn resolve(
        &self,
        store: &ChatStore,
        identifier: &str,
    ) -> Result<ResolvedTarget, QueryError> {
        let identifier = identifier.trim();
        if identifier.is_empty() {
            return Err(QueryError::invalid("identifier must not be empty"));
        }

        let resolved = match self.classify(identifier) {
            TargetKind::Conversation => resolve_conversation(store, identifier)?,
            TargetKind::Contact => resolve_contact(store, identifier)?,
        };
        debug!(
            event = "identifier_resolved",
            identifier,
            kind = ?resolved.kind(),
            ids = ?resolved.record_ids()
        );
        Ok(resolved)
    }
}

fn resolve_conversation(store: &ChatStore, identifier: &str) -> Result<ResolvedTarget, QueryError> {
    let not_found = || QueryError::ConversationNotFound(identifier.to_string());
    let id = identifier.parse::<i64>().map_err(|_| not_found())?;
    let record = store.conversation(id)?.ok_or_else(not_found)?;

    let record_ids = match &record.group_id {
        Some(group_id) => {
            let mut ids = store.conversation_ids_in_group(group_id)?;
            if !ids.contains(&record.id) {
                ids.push(record.id);
                ids.sort_unstable();
            }
            ids
        }
        None => vec![record.id],
    };

    Ok(ResolvedTarget::Conversation {
        record_ids,
        group_key: record.group_id,
    })
}

fn resolve_contact(store: &ChatStore, identifier: &str) -> Result<ResolvedTarget, QueryError> {
    let needles = contact_needles(identifier);
    let handles = store.handles_containing(&needles)?;
    if handles.is_empty() {
        return Err(QueryError::ContactNotFound(identifier.to_string()));
    }

    Ok(ResolvedTarget::Contact {
        handle_ids: handles.iter().map(|handle| handle.id).collect(),
        handles: handles.into_iter().map(|handle| handle.identifier).collect(),
    })
}

/// Keeps ASCII digits plus a leading `+`.
pub fn normalize_phone(input: &str) -> String {
    let trimmed = input.trim();
    let mut normalized = String::with_capacity(trimmed.len());
    if trimmed.starts_with('+') {
        normalized.push('+');
    }
    normalized.extend(trimmed.chars().filter(|ch| ch.is_ascii_digit()));
    normalized
}

/// Substrings tried against handle identifiers, in order, without duplicates.
///
/// Email addresses only match on the raw input; phone-like input also tries the
/// bare digits, the digits with `+`, and the national number without country code.
pub fn contact_needles(identifier: &str) -> Vec<String> {
    let raw = identifier.trim().to_string();
    let mut needles = vec![raw.clone()];
    if raw.contains('@') {
        return needles;
    }

    let normalized = normalize_phone(&raw);
    let digits = normalized.trim_start_matches('+');
    if digits.is_empty() {
        return needles;
    }

    let mut candidates = vec![digits.to_string(), format!("+{digits}")];
    if digits.len() > NATIONAL_NUMBER_DIGITS {
        candidates.push(digits[digits.len() - NATIONAL_NUMBER_DIGITS..].to_string());
    }
    for candidate in candidates {
        if !needles.contains(&candidate) {
            needles.push(candidate);
        }
    }
    needles
}
