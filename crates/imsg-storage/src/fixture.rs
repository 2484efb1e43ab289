//! On-disk `chat.db` builder for tests.

use crate::{ChatStore, StorageError};
use imsg_core::NativeTimestamp;
use rusqlite::{params, Connection};
use std::path::Path;
use tempfile::NamedTempFile;

const CHAT_DB_SCHEMA: &str = "
    CREATE TABLE handle (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT UNIQUE,
        id TEXT NOT NULL,
        country TEXT,
        service TEXT NOT NULL DEFAULT 'iMessage',
        uncanonicalized_id TEXT
    );
    CREATE TABLE chat (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE,
        style INTEGER,
        chat_identifier TEXT,
        service_name TEXT,
        display_name TEXT,
        group_id TEXT
    );
    CREATE TABLE message (
        ROWID INTEGER PRIMARY KEY AUTOINCREMENT,
        guid TEXT UNIQUE,
        text TEXT,
        handle_id INTEGER DEFAULT 0,
        service TEXT,
        date INTEGER,
        is_from_me INTEGER DEFAULT 0,
        attributedBody BLOB
    );
    CREATE TABLE chat_handle_join (
        chat_id INTEGER REFERENCES chat (ROWID) ON DELETE CASCADE,
        handle_id INTEGER REFERENCES handle (ROWID) ON DELETE CASCADE,
        UNIQUE(chat_id, handle_id)
    );
    CREATE TABLE chat_message_join (
        chat_id INTEGER REFERENCES chat (ROWID) ON DELETE CASCADE,
        message_id INTEGER REFERENCES message (ROWID) ON DELETE CASCADE,
        message_date INTEGER DEFAULT 0,
        PRIMARY KEY (chat_id, message_id)
    );
";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewChat<'a> {
    pub id: Option<i64>,
    pub chat_identifier: &'a str,
    pub service: &'a str,
    pub display_name: Option<&'a str>,
    pub group_id: Option<&'a str>,
}

impl<'a> NewChat<'a> {
    pub fn new(chat_identifier: &'a str, service: &'a str) -> Self {
        Self {
            id: None,
            chat_identifier,
            service,
            display_name: None,
            group_id: None,
        }
    }

    pub fn with_id(mut self, id: i64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn named(mut self, display_name: &'a str) -> Self {
        self.display_name = Some(display_name);
        self
    }

    pub fn in_group(mut self, group_id: &'a str) -> Self {
        self.group_id = Some(group_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage<'a> {
    pub text: Option<&'a str>,
    pub date: NativeTimestamp,
    pub is_from_me: bool,
    pub handle_id: Option<i64>,
    pub service: &'a str,
}

impl<'a> NewMessage<'a> {
    pub fn incoming(text: &'a str, date: NativeTimestamp, handle_id: i64) -> Self {
        Self {
            text: Some(text),
            date,
            is_from_me: false,
            handle_id: Some(handle_id),
            service: "iMessage",
        }
    }

    pub fn outgoing(text: &'a str, date: NativeTimestamp) -> Self {
        Self {
            text: Some(text),
            date,
            is_from_me: true,
            handle_id: None,
            service: "iMessage",
        }
    }

    pub fn without_text(date: NativeTimestamp, handle_id: i64) -> Self {
        Self {
            text: None,
            date,
            is_from_me: false,
            handle_id: Some(handle_id),
            service: "iMessage",
        }
    }

    pub fn via(mut self, service: &'a str) -> Self {
        self.service = service;
        self
    }
}

/// Writable temporary message store with the `chat.db` table layout.
pub struct ChatDbFixture {
    file: NamedTempFile,
    conn: Connection,
}

impl ChatDbFixture {
    pub fn new() -> Result<Self, StorageError> {
        let file = NamedTempFile::new()?;
        let conn = Connection::open(file.path())?;
        conn.execute_batch(CHAT_DB_SCHEMA)?;
        Ok(Self { file, conn })
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn open_read_only(&self) -> Result<ChatStore, StorageError> {
        ChatStore::open_read_only(self.path())
    }

    pub fn add_handle(&self, identifier: &str) -> Result<i64, StorageError> {
        self.conn
            .execute("INSERT INTO handle (id) VALUES (?1)", [identifier])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_chat(&self, chat: NewChat<'_>) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO chat (ROWID, chat_identifier, service_name, display_name, group_id)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                chat.id,
                chat.chat_identifier,
                chat.service,
                chat.display_name.unwrap_or(""),
                chat.group_id,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn add_participant(&self, chat_id: i64, handle_id: i64) -> Result<(), StorageError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO chat_handle_join (chat_id, handle_id) VALUES (?1, ?2)",
            params![chat_id, handle_id],
        )?;
        Ok(())
    }

    /// Inserts a message and joins it to every conversation in `chat_ids`.
    pub fn add_message(
        &self,
        chat_ids: &[i64],
        message: NewMessage<'_>,
    ) -> Result<i64, StorageError> {
        self.conn.execute(
            "
            INSERT INTO message (text, handle_id, service, date, is_from_me)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ",
            params![
                message.text,
                message.handle_id.unwrap_or(0),
                message.service,
                message.date,
                i64::from(message.is_from_me),
            ],
        )?;
        let message_id = self.conn.last_insert_rowid();
        for chat_id in chat_ids {
            self.join_message(*chat_id, message_id, message.date)?;
        }
        Ok(message_id)
    }

    pub fn join_message(
        &self,
        chat_id: i64,
        message_id: i64,
        date: NativeTimestamp,
    ) -> Result<(), StorageError> {
        self.conn.execute(
            "
            INSERT OR IGNORE INTO chat_message_join (chat_id, message_id, message_date)
            VALUES (?1, ?2, ?3)
            ",
            params![chat_id, message_id, date],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixture_schema_passes_store_verification() {
        let fixture = ChatDbFixture::new().expect("fixture");
        let handle = fixture.add_handle("+15550001111").expect("handle");
        let chat = fixture
            .add_chat(NewChat::new("+15550001111", "SMS").with_id(42))
            .expect("chat");
        assert_eq!(chat, 42);
        fixture.add_participant(chat, handle).expect("participant");
        fixture
            .add_message(&[chat], NewMessage::incoming("hey", 5, handle).via("SMS"))
            .expect("message");

        let store = fixture.open_read_only().expect("open");
        let rows = store.conversation_rows(false).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].participant_count, 1);
        assert_eq!(rows[0].last_activity, Some(5));
    }
}
