use imsg_core::{NativeTimestamp, ServiceKind};
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[cfg(feature = "fixtures")]
pub mod fixture;

/// Tables the queries below read from.
pub const REQUIRED_TABLES: [&str; 5] = [
    "chat",
    "message",
    "handle",
    "chat_message_join",
    "chat_handle_join",
];

/// Characters that carry no readable content at the edges of a message body.
/// U+FFFC marks where an attachment sat.
pub const INVISIBLE_TEXT_CHARS: [char; 8] = [
    ' ', '\t', '\n', '\u{0B}', '\u{0C}', '\r', '\u{A0}', '\u{FFFC}',
];

const MESSAGE_COLUMNS: &str = "
    m.ROWID, m.date, m.text, m.is_from_me, m.service, h.id";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("cannot open message store at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message store schema mismatch: missing table `{0}`")]
    MissingTable(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: i64,
    pub display_name: Option<String>,
    pub chat_identifier: String,
    pub service: ServiceKind,
    pub group_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRow {
    pub record: ConversationRecord,
    pub participant_count: u32,
    pub last_activity: Option<NativeTimestamp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleRecord {
    pub id: i64,
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRow {
    pub message_id: i64,
    pub date: NativeTimestamp,
    pub text: Option<String>,
    pub is_from_me: bool,
    pub service: Option<ServiceKind>,
    pub sender_handle: Option<String>,
    pub chat_display_name: Option<String>,
    pub chat_identifier: Option<String>,
}

/// Read-only handle over a `chat.db` message store.
pub struct ChatStore {
    conn: Connection,
    path: PathBuf,
}

impl ChatStore {
    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|source| StorageError::Open {
            path: path.clone(),
            source,
        })?;
        let store = Self { conn, path };
        store.verify_schema()?;
        debug!(event = "store_open", path = %store.path.display());
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verify_schema(&self) -> Result<(), StorageError> {
        for table in REQUIRED_TABLES {
            if !self.table_exists(table)? {
                return Err(StorageError::MissingTable(table.to_string()));
            }
        }
        Ok(())
    }

    pub fn table_exists(&self, table_name: &str) -> Result<bool, StorageError> {
        let exists = self
            .conn
            .query_row(
                "
                SELECT 1
                FROM sqlite_master
                WHERE type='table' AND name = ?1
                LIMIT 1
                ",
                [table_name],
                |_| Ok(()),
            )
            .optional()?;
        Ok(exists.is_some())
    }

    pub fn conversation(&self, id: i64) -> Result<Option<ConversationRecord>, StorageError> {
        let record = self
            .conn
            .query_row(
                "
                SELECT c.ROWID, c.display_name, c.chat_identifier, c.service_name, c.group_id
                FROM chat c
                WHERE c.ROWID = ?1
                ",
                [id],
                map_conversation_record,
            )
            .optional()?;
        Ok(record)
    }

    pub fn conversation_ids_in_group(&self, group_id: &str) -> Result<Vec<i64>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT ROWID
            FROM chat
            WHERE group_id = ?1
            ORDER BY ROWID ASC
            ",
        )?;
        let rows = statement.query_map([group_id], |row| row.get(0))?;
        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }

    /// Handles whose identifier contains any of `needles`, compared case-insensitively.
    pub fn handles_containing(&self, needles: &[String]) -> Result<Vec<HandleRecord>, StorageError> {
        if needles.is_empty() {
            return Ok(Vec::new());
        }
        let clauses = (1..=needles.len())
            .map(|index| format!("h.id LIKE ?{index} ESCAPE '\\'"))
            .collect::<Vec<_>>()
            .join(" OR ");
        let sql = format!(
            "
            SELECT h.ROWID, h.id
            FROM handle h
            WHERE {clauses}
            ORDER BY h.ROWID ASC
            "
        );
        let patterns = needles
            .iter()
            .map(|needle| format!("%{}%", escape_like(needle)))
            .collect::<Vec<_>>();

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(patterns.iter()), |row| {
            Ok(HandleRecord {
                id: row.get(0)?,
                identifier: row.get(1)?,
            })
        })?;
        let mut handles = Vec::new();
        for row in rows {
            handles.push(row?);
        }
        Ok(handles)
    }

    /// Every conversation record with its participant count and latest message date.
    pub fn conversation_rows(&self, native_only: bool) -> Result<Vec<ConversationRow>, StorageError> {
        let filter = if native_only {
            "WHERE c.service_name = 'iMessage'"
        } else {
            ""
        };
        let sql = format!(
            "
            SELECT c.ROWID, c.display_name, c.chat_identifier, c.service_name, c.group_id,
                   (SELECT COUNT(*) FROM chat_handle_join chj WHERE chj.chat_id = c.ROWID),
                   (SELECT MAX(m.date)
                    FROM chat_message_join cmj
                    JOIN message m ON m.ROWID = cmj.message_id
                    WHERE cmj.chat_id = c.ROWID)
            FROM chat c
            {filter}
            ORDER BY c.ROWID ASC
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map([], |row| {
            Ok(ConversationRow {
                record: map_conversation_record(row)?,
                participant_count: row.get::<_, i64>(5)?.max(0) as u32,
                last_activity: row.get(6)?,
            })
        })?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?);
        }
        Ok(conversations)
    }

    /// Participant identifiers keyed by conversation record id, sorted per record.
    pub fn participants_by_conversation(
        &self,
    ) -> Result<BTreeMap<i64, Vec<String>>, StorageError> {
        let mut statement = self.conn.prepare(
            "
            SELECT chj.chat_id, h.id
            FROM chat_handle_join chj
            JOIN handle h ON h.ROWID = chj.handle_id
            ORDER BY chj.chat_id ASC, h.id ASC
            ",
        )?;
        let rows = statement.query_map([], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut participants: BTreeMap<i64, Vec<String>> = BTreeMap::new();
        for row in rows {
            let (chat_id, identifier) = row?;
            participants.entry(chat_id).or_default().push(identifier);
        }
        Ok(participants)
    }

    /// Messages joined to any of `conversation_ids`, newest first, each message once.
    pub fn messages_in_conversations(
        &self,
        conversation_ids: &[i64],
        since: NativeTimestamp,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let filter = format!(
            "m.ROWID IN (
                SELECT cmj.message_id
                FROM chat_message_join cmj
                WHERE cmj.chat_id IN ({})
            )",
            placeholders(1, conversation_ids.len())
        );
        self.scoped_messages(&filter, conversation_ids, since, limit)
    }

    /// Messages whose sender handle is any of `handle_ids`, newest first.
    pub fn messages_from_handles(
        &self,
        handle_ids: &[i64],
        since: NativeTimestamp,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let filter = format!(
            "m.handle_id IN ({})",
            placeholders(1, handle_ids.len())
        );
        self.scoped_messages(&filter, handle_ids, since, limit)
    }

    /// Messages across the whole store, labelled with the lowest joined conversation.
    pub fn recent_messages(
        &self,
        since: NativeTimestamp,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StorageError> {
        let readable = readable_text_clause();
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS}, c.display_name, c.chat_identifier
            FROM message m
            LEFT JOIN handle h ON h.ROWID = m.handle_id
            LEFT JOIN chat c ON c.ROWID = (
                SELECT MIN(cmj.chat_id)
                FROM chat_message_join cmj
                WHERE cmj.message_id = m.ROWID
            )
            WHERE m.date > ?1
              AND {readable}
            ORDER BY m.date DESC, m.ROWID DESC
            LIMIT ?2
            "
        );
        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params![since, limit as i64], map_message_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }

    fn scoped_messages(
        &self,
        filter: &str,
        ids: &[i64],
        since: NativeTimestamp,
        limit: usize,
    ) -> Result<Vec<MessageRow>, StorageError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let readable = readable_text_clause();
        let since_index = ids.len() + 1;
        let limit_index = ids.len() + 2;
        let sql = format!(
            "
            SELECT {MESSAGE_COLUMNS}, NULL, NULL
            FROM message m
            LEFT JOIN handle h ON h.ROWID = m.handle_id
            WHERE {filter}
              AND m.date > ?{since_index}
              AND {readable}
            ORDER BY m.date DESC, m.ROWID DESC
            LIMIT ?{limit_index}
            "
        );
        let mut bound = ids.to_vec();
        bound.push(since);
        bound.push(limit as i64);

        let mut statement = self.conn.prepare(&sql)?;
        let rows = statement.query_map(params_from_iter(bound.iter()), map_message_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?);
        }
        Ok(messages)
    }
}

impl Drop for ChatStore {
    fn drop(&mut self) {
        debug!(event = "store_close", path = %self.path.display());
    }
}

fn map_conversation_record(row: &Row<'_>) -> rusqlite::Result<ConversationRecord> {
    let service = row
        .get::<_, Option<String>>(3)?
        .map(|value| ServiceKind::from(value.as_str()))
        .unwrap_or_else(|| ServiceKind::Other(String::new()));
    Ok(ConversationRecord {
        id: row.get(0)?,
        display_name: non_empty(row.get(1)?),
        chat_identifier: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
        service,
        group_id: non_empty(row.get(4)?),
    })
}

fn map_message_row(row: &Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        message_id: row.get(0)?,
        date: row.get::<_, Option<i64>>(1)?.unwrap_or_default(),
        text: row.get(2)?,
        is_from_me: row.get::<_, Option<i64>>(3)?.unwrap_or_default() != 0,
        service: non_empty(row.get(4)?).map(|value| ServiceKind::from(value.as_str())),
        sender_handle: non_empty(row.get(5)?),
        chat_display_name: non_empty(row.get(6)?),
        chat_identifier: non_empty(row.get(7)?),
    })
}

/// True when `m.text` holds something besides [`INVISIBLE_TEXT_CHARS`].
fn readable_text_clause() -> String {
    let codes = INVISIBLE_TEXT_CHARS
        .iter()
        .map(|ch| u32::from(*ch).to_string())
        .collect::<Vec<_>>()
        .join(", ");
    format!("m.text IS NOT NULL AND TRIM(REPLACE(m.text, char(65532), ''), char({codes})) != ''")
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|value| !value.trim().is_empty())
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|index| format!("?{index}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    const SCHEMA: &str = "
        CREATE TABLE handle (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, id TEXT NOT NULL, service TEXT);
        CREATE TABLE chat (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, chat_identifier TEXT,
                           service_name TEXT, display_name TEXT, group_id TEXT);
        CREATE TABLE message (ROWID INTEGER PRIMARY KEY AUTOINCREMENT, text TEXT,
                              handle_id INTEGER DEFAULT 0, service TEXT, date INTEGER,
                              is_from_me INTEGER DEFAULT 0);
        CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);
        CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
    ";

    fn seeded_store(extra_sql: &str) -> (NamedTempFile, ChatStore) {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open writable");
            conn.execute_batch(SCHEMA).expect("schema");
            conn.execute_batch(extra_sql).expect("seed");
        }
        let store = ChatStore::open_read_only(file.path()).expect("open read-only");
        (file, store)
    }

    #[test]
    fn open_rejects_store_without_message_tables() {
        let file = NamedTempFile::new().expect("temp db");
        {
            let conn = Connection::open(file.path()).expect("open writable");
            conn.execute_batch("CREATE TABLE chat (ROWID INTEGER PRIMARY KEY);")
                .expect("partial schema");
        }
        let err = ChatStore::open_read_only(file.path())
            .err()
            .expect("schema mismatch");
        assert!(matches!(err, StorageError::MissingTable(table) if table == "message"));
    }

    #[test]
    fn open_reports_path_for_missing_file() {
        let dir = tempfile::tempdir().expect("temp dir");
        let missing = dir.path().join("absent.db");
        let err = ChatStore::open_read_only(&missing)
            .err()
            .expect("missing file");
        match err {
            StorageError::Open { path, .. } => assert_eq!(path, missing),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn read_only_handle_refuses_writes() {
        let (_file, store) = seeded_store("");
        let result = store
            .conn
            .execute("INSERT INTO handle (id) VALUES ('x')", []);
        assert!(result.is_err());
    }

    #[test]
    fn conversation_record_normalizes_empty_strings() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name, display_name, group_id)
             VALUES (4, '+15550001111', 'SMS', '', '');",
        );
        let record = store
            .conversation(4)
            .expect("query")
            .expect("record present");
        assert_eq!(record.display_name, None);
        assert_eq!(record.group_id, None);
        assert_eq!(record.service, ServiceKind::Sms);
        assert!(store.conversation(5).expect("query").is_none());
    }

    #[test]
    fn group_lookup_returns_sorted_ids() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name, group_id) VALUES
                (9, 'a', 'SMS', 'G1'), (3, 'b', 'iMessage', 'G1'), (5, 'c', 'iMessage', 'G2');",
        );
        assert_eq!(
            store.conversation_ids_in_group("G1").expect("group ids"),
            vec![3, 9]
        );
    }

    #[test]
    fn handle_search_treats_wildcards_literally() {
        let (_file, store) = seeded_store(
            "INSERT INTO handle (ROWID, id) VALUES
                (1, 'Ann_Lee@Example.com'), (2, 'annxlee@example.com'), (3, '+15551234567');",
        );
        let found = store
            .handles_containing(&["ann_lee@example".to_string()])
            .expect("search");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, 1);

        let found = store
            .handles_containing(&["5551234567".to_string(), "nobody".to_string()])
            .expect("search");
        assert_eq!(found.iter().map(|h| h.id).collect::<Vec<_>>(), vec![3]);
        assert!(store.handles_containing(&[]).expect("empty").is_empty());
    }

    #[test]
    fn conversation_rows_carry_counts_and_latest_date() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name) VALUES
                (1, 'chat-a', 'iMessage'), (2, '+1555', 'SMS');
             INSERT INTO handle (ROWID, id) VALUES (1, 'a@x.com'), (2, 'b@x.com');
             INSERT INTO chat_handle_join VALUES (1, 1), (1, 2);
             INSERT INTO message (ROWID, text, date) VALUES (10, 'hi', 100), (11, 'yo', 300);
             INSERT INTO chat_message_join VALUES (1, 10), (1, 11);",
        );
        let rows = store.conversation_rows(false).expect("rows");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].participant_count, 2);
        assert_eq!(rows[0].last_activity, Some(300));
        assert_eq!(rows[1].participant_count, 0);
        assert_eq!(rows[1].last_activity, None);

        let native = store.conversation_rows(true).expect("native rows");
        assert_eq!(native.len(), 1);
        assert_eq!(native[0].record.id, 1);
    }

    #[test]
    fn conversation_messages_are_unique_even_when_joined_twice() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name) VALUES
                (7, 'g', 'iMessage'), (8, 'g', 'SMS');
             INSERT INTO message (ROWID, text, date) VALUES
                (1, 'shared', 500), (2, 'sms only', 600), (3, NULL, 700), (4, '', 800);
             INSERT INTO chat_message_join VALUES (7, 1), (8, 1), (8, 2), (7, 3), (8, 4);",
        );
        let messages = store
            .messages_in_conversations(&[7, 8], 0, 50)
            .expect("messages");
        assert_eq!(
            messages.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![2, 1]
        );
        let limited = store
            .messages_in_conversations(&[7, 8], 0, 1)
            .expect("limited");
        assert_eq!(limited.len(), 1);
        let windowed = store
            .messages_in_conversations(&[7, 8], 550, 50)
            .expect("windowed");
        assert_eq!(windowed.len(), 1);
        assert_eq!(windowed[0].message_id, 2);
    }

    #[test]
    fn placeholder_only_text_is_skipped_before_the_limit() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name) VALUES (1, 'c', 'iMessage');
             INSERT INTO message (ROWID, text, date) VALUES
                (1, 'real text', 500),
                (2, char(65532), 600),
                (3, ' ' || char(65532, 10, 65532) || char(9), 700),
                (4, 'look' || char(65532), 400);
             INSERT INTO chat_message_join VALUES (1, 1), (1, 2), (1, 3), (1, 4);",
        );
        let scoped = store
            .messages_in_conversations(&[1], 0, 2)
            .expect("scoped");
        assert_eq!(
            scoped.iter().map(|m| m.message_id).collect::<Vec<_>>(),
            vec![1, 4]
        );
        let recent = store.recent_messages(0, 1).expect("recent");
        assert_eq!(recent[0].text.as_deref(), Some("real text"));
    }

    #[test]
    fn recent_messages_pick_lowest_conversation_label() {
        let (_file, store) = seeded_store(
            "INSERT INTO chat (ROWID, chat_identifier, service_name, display_name) VALUES
                (2, 'chat-two', 'SMS', ''), (1, 'chat-one', 'iMessage', 'Family');
             INSERT INTO handle (ROWID, id) VALUES (5, '+15550005555');
             INSERT INTO message (ROWID, text, date, handle_id) VALUES
                (1, 'hello', 10, 5), (2, 'orphan', 20, 0);
             INSERT INTO chat_message_join VALUES (2, 1), (1, 1);",
        );
        let messages = store.recent_messages(0, 10).expect("recent");
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].message_id, 2);
        assert_eq!(messages[0].chat_display_name, None);
        assert_eq!(messages[0].sender_handle, None);
        assert_eq!(messages[1].chat_display_name.as_deref(), Some("Family"));
        assert_eq!(messages[1].sender_handle.as_deref(), Some("+15550005555"));
    }

    #[test]
    fn participants_grouped_per_conversation() {
        let (_file, store) = seeded_store(
            "INSERT INTO handle (ROWID, id) VALUES (1, 'z@x.com'), (2, 'a@x.com');
             INSERT INTO chat_handle_join VALUES (3, 1), (3, 2), (4, 1);",
        );
        let participants = store.participants_by_conversation().expect("participants");
        assert_eq!(
            participants.get(&3),
            Some(&vec!["a@x.com".to_string(), "z@x.com".to_string()])
        );
        assert_eq!(participants.get(&4), Some(&vec!["z@x.com".to_string()]));
    }
}
