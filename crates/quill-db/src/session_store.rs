use chrono::{DateTime, Utc};
use quill_common::{ChatTurn, Error, Result};
use rusqlite::{params, Connection};
use std::path::Path;
use tracing::info;

/// Conversation row as shown in a picker list.
#[derive(Debug, Clone)]
pub struct ConversationSummary {
    pub id: String,
    pub title: Option<String>,
    pub turn_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// Persistent storage for conversations and their turns. Turns are stored
/// as JSON rows so assistant tool calls and tool-result pairing survive a
/// round trip unchanged.
pub struct SessionStore {
    conn: Connection,
}

impl SessionStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        info!("opening session store at {}", db_path.display());
        let conn = Connection::open(db_path)
            .map_err(|e| Error::Database(format!("failed to open database: {e}")))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .map_err(|e| Error::Database(format!("failed to set pragmas: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("failed to open in-memory database: {e}")))?;

        let store = Self { conn };
        store.run_migrations()?;
        Ok(store)
    }

    fn run_migrations(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS conversations (
                    id TEXT PRIMARY KEY,
                    title TEXT,
                    created_at TEXT NOT NULL DEFAULT (datetime('now')),
                    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE TABLE IF NOT EXISTS turns (
                    id TEXT PRIMARY KEY,
                    conversation_id TEXT NOT NULL REFERENCES conversations(id),
                    seq INTEGER NOT NULL,
                    body TEXT NOT NULL,
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );

                CREATE INDEX IF NOT EXISTS idx_turns_conversation
                    ON turns(conversation_id, seq);",
            )
            .map_err(|e| Error::Database(format!("migration failed: {e}")))?;
        Ok(())
    }

    pub fn create_conversation(&self, title: Option<&str>) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        self.conn
            .execute(
                "INSERT INTO conversations (id, title) VALUES (?1, ?2)",
                params![id, title],
            )
            .map_err(|e| Error::Database(format!("failed to create conversation: {e}")))?;
        Ok(id)
    }

    pub fn set_title(&self, conversation_id: &str, title: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET title = ?2, updated_at = datetime('now')
                 WHERE id = ?1",
                params![conversation_id, title],
            )
            .map_err(|e| Error::Database(format!("failed to set title: {e}")))?;
        Ok(())
    }

    /// Append one turn at the next sequence position.
    pub fn append_turn(&self, conversation_id: &str, turn: &ChatTurn) -> Result<()> {
        let body = serde_json::to_string(turn)
            .map_err(|e| Error::Database(format!("failed to serialize turn: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO turns (id, conversation_id, seq, body)
                 VALUES (?1, ?2,
                         (SELECT COALESCE(MAX(seq), -1) + 1 FROM turns WHERE conversation_id = ?2),
                         ?3)",
                params![uuid::Uuid::new_v4().to_string(), conversation_id, body],
            )
            .map_err(|e| Error::Database(format!("failed to append turn: {e}")))?;
        self.touch(conversation_id)
    }

    /// Replace the whole transcript, used after context compression rewrites
    /// history. Runs in a transaction so readers never see a partial state.
    pub fn replace_turns(&mut self, conversation_id: &str, turns: &[ChatTurn]) -> Result<()> {
        let tx = self
            .conn
            .transaction()
            .map_err(|e| Error::Database(format!("failed to begin transaction: {e}")))?;
        tx.execute(
            "DELETE FROM turns WHERE conversation_id = ?1",
            params![conversation_id],
        )
        .map_err(|e| Error::Database(format!("failed to clear turns: {e}")))?;
        for (seq, turn) in turns.iter().enumerate() {
            let body = serde_json::to_string(turn)
                .map_err(|e| Error::Database(format!("failed to serialize turn: {e}")))?;
            tx.execute(
                "INSERT INTO turns (id, conversation_id, seq, body) VALUES (?1, ?2, ?3, ?4)",
                params![
                    uuid::Uuid::new_v4().to_string(),
                    conversation_id,
                    seq as i64,
                    body
                ],
            )
            .map_err(|e| Error::Database(format!("failed to insert turn: {e}")))?;
        }
        tx.commit()
            .map_err(|e| Error::Database(format!("failed to commit transaction: {e}")))?;
        self.touch(conversation_id)
    }

    /// Load the full transcript in sequence order.
    pub fn load_turns(&self, conversation_id: &str) -> Result<Vec<ChatTurn>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT body FROM turns WHERE conversation_id = ?1 ORDER BY seq ASC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare turn query: {e}")))?;

        let rows = stmt
            .query_map(params![conversation_id], |row| row.get::<_, String>(0))
            .map_err(|e| Error::Database(format!("failed to load turns: {e}")))?;

        let mut turns = Vec::new();
        for row in rows {
            let body = row.map_err(|e| Error::Database(format!("failed to read turn row: {e}")))?;
            let turn: ChatTurn = serde_json::from_str(&body)
                .map_err(|e| Error::Database(format!("corrupt turn row: {e}")))?;
            turns.push(turn);
        }
        Ok(turns)
    }

    pub fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT c.id, c.title, c.updated_at,
                        (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id)
                 FROM conversations c
                 ORDER BY c.updated_at DESC",
            )
            .map_err(|e| Error::Database(format!("failed to prepare list query: {e}")))?;

        let rows = stmt
            .query_map([], |row| {
                let updated_raw: String = row.get(2)?;
                Ok(ConversationSummary {
                    id: row.get(0)?,
                    title: row.get(1)?,
                    updated_at: parse_timestamp(&updated_raw),
                    turn_count: row.get::<_, i64>(3)? as usize,
                })
            })
            .map_err(|e| Error::Database(format!("failed to list conversations: {e}")))?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row.map_err(|e| Error::Database(format!("failed to read row: {e}")))?);
        }
        Ok(out)
    }

    fn touch(&self, conversation_id: &str) -> Result<()> {
        self.conn
            .execute(
                "UPDATE conversations SET updated_at = datetime('now') WHERE id = ?1",
                params![conversation_id],
            )
            .map_err(|e| Error::Database(format!("failed to touch conversation: {e}")))?;
        Ok(())
    }
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S")
                .map(|naive| naive.and_utc())
        })
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use quill_common::ToolCall;

    #[test]
    fn turns_round_trip_with_tool_pairing_intact() {
        let store = SessionStore::in_memory().unwrap();
        let conv = store.create_conversation(None).unwrap();

        let turns = vec![
            ChatTurn::system("You are a coding assistant."),
            ChatTurn::user("list the files"),
            ChatTurn::assistant_with_tools(
                "",
                vec![ToolCall::new("call_0", "list_files_in_dir", r#"{"path":"."}"#)],
            ),
            ChatTurn::tool("call_0", "main.rs\nlib.rs"),
            ChatTurn::assistant("Two files: main.rs and lib.rs."),
        ];
        for turn in &turns {
            store.append_turn(&conv, turn).unwrap();
        }

        let loaded = store.load_turns(&conv).unwrap();
        assert_eq!(loaded.len(), 5);
        assert_eq!(loaded[2].tool_calls[0].id, "call_0");
        assert_eq!(loaded[2].tool_calls[0].arguments, r#"{"path":"."}"#);
        assert_eq!(loaded[3].tool_call_id.as_deref(), Some("call_0"));
        assert!(quill_common::chat::tool_pairing_holds(&loaded));
    }

    #[test]
    fn replace_turns_rewrites_the_transcript() {
        let mut store = SessionStore::in_memory().unwrap();
        let conv = store.create_conversation(Some("budget test")).unwrap();
        for i in 0..10 {
            store.append_turn(&conv, &ChatTurn::user(format!("msg {i}"))).unwrap();
        }

        let compressed = vec![
            ChatTurn::system("sys"),
            ChatTurn::user("[Previous conversation summary - 8 messages]..."),
            ChatTurn::user("msg 9"),
        ];
        store.replace_turns(&conv, &compressed).unwrap();

        let loaded = store.load_turns(&conv).unwrap();
        assert_eq!(loaded.len(), 3);
        assert_eq!(loaded[2].content, "msg 9");
    }

    #[test]
    fn list_conversations_reports_counts_and_titles() {
        let store = SessionStore::in_memory().unwrap();
        let conv = store.create_conversation(None).unwrap();
        store.append_turn(&conv, &ChatTurn::user("hi")).unwrap();
        store.set_title(&conv, "Greeting").unwrap();

        let list = store.list_conversations().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].title.as_deref(), Some("Greeting"));
        assert_eq!(list[0].turn_count, 1);
    }
}
