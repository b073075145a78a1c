//! SQLite persistence for identities, messages, and recent contacts.
//!
//! This is the persistence seam the write paths go through. Every
//! flag promotion is a conditional UPDATE ("set true only if currently
//! false") executed inside SQLite, never a read-modify-write in the
//! application layer, so concurrent promotion attempts from the push
//! channel and the request/response channel stay idempotent and never
//! regress a flag.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;

use parley_core::{Identity, IdentityId, Message, MessageId};

/// One entry of the recent-contacts read surface: the counterparty plus
/// the latest message exchanged with them.
#[derive(Debug, Clone, Serialize)]
pub struct ContactSummary {
    pub contact_id: IdentityId,
    pub contact: String,
    pub last_message: String,
    pub last_timestamp: u64,
}

/// Persistent storage backed by SQLite.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at the given path.
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        // WAL mode for concurrent read/write performance.
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn)
    }

    /// In-memory database, used by the component tests.
    pub fn open_in_memory() -> Result<Self, rusqlite::Error> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id        TEXT PRIMARY KEY,
                username  TEXT NOT NULL COLLATE NOCASE UNIQUE,
                online    INTEGER NOT NULL DEFAULT 0,
                last_seen INTEGER
            );

            CREATE TABLE IF NOT EXISTS messages (
                id           TEXT PRIMARY KEY,
                sender_id    TEXT NOT NULL,
                receiver_id  TEXT NOT NULL,
                content      TEXT NOT NULL,
                created_at   INTEGER NOT NULL,
                delivered    INTEGER NOT NULL DEFAULT 0,
                delivered_at INTEGER,
                read         INTEGER NOT NULL DEFAULT 0,
                read_at      INTEGER
            );

            CREATE INDEX IF NOT EXISTS idx_messages_pair
                ON messages(sender_id, receiver_id, created_at);
            CREATE INDEX IF NOT EXISTS idx_messages_receiver_read
                ON messages(receiver_id, read);
            CREATE INDEX IF NOT EXISTS idx_messages_receiver_delivered
                ON messages(receiver_id, delivered);

            -- Insertion-ordered de-duplicated counterparty set per
            -- identity. INSERT OR IGNORE gives append-to-set semantics.
            CREATE TABLE IF NOT EXISTS recent_contacts (
                identity_id TEXT NOT NULL,
                contact_id  TEXT NOT NULL,
                added_at    INTEGER NOT NULL,
                PRIMARY KEY (identity_id, contact_id)
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── Identities ──

    /// Create an identity record. Returns `None` when the username is
    /// already taken.
    pub fn create_identity(&self, username: &str) -> Result<Option<Identity>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let id = IdentityId::generate();
        let inserted = conn.execute(
            "INSERT INTO identities (id, username, online, last_seen)
             VALUES (?1, ?2, 0, NULL)
             ON CONFLICT(username) DO NOTHING",
            params![id.as_str(), username],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(Identity {
            id,
            username: username.to_string(),
            online: false,
            last_seen: None,
        }))
    }

    pub fn find_identity(&self, id: &IdentityId) -> Result<Option<Identity>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, online, last_seen FROM identities WHERE id = ?1",
            params![id.as_str()],
            row_to_identity,
        )
        .optional()
    }

    pub fn find_identity_by_username(
        &self,
        username: &str,
    ) -> Result<Option<Identity>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT id, username, online, last_seen FROM identities WHERE username = ?1",
            params![username],
            row_to_identity,
        )
        .optional()
    }

    /// Persist the online flag. `last_seen` stays untouched; it only
    /// moves on offline transitions.
    pub fn set_online(&self, id: &IdentityId) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities SET online = 1 WHERE id = ?1",
            params![id.as_str()],
        )?;
        Ok(n > 0)
    }

    /// Persist the offline flag together with the last-seen timestamp.
    pub fn set_offline(&self, id: &IdentityId, last_seen: u64) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE identities SET online = 0, last_seen = ?2 WHERE id = ?1",
            params![id.as_str(), last_seen as i64],
        )?;
        Ok(n > 0)
    }

    // ── Messages ──

    pub fn insert_message(&self, message: &Message) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO messages
                (id, sender_id, receiver_id, content, created_at,
                 delivered, delivered_at, read, read_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                message.id.as_str(),
                message.sender_id.as_str(),
                message.receiver_id.as_str(),
                message.content,
                message.created_at as i64,
                message.delivered as i32,
                message.delivered_at.map(|t| t as i64),
                message.read as i32,
                message.read_at.map(|t| t as i64),
            ],
        )?;
        Ok(())
    }

    pub fn find_message(&self, id: &MessageId) -> Result<Option<Message>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"),
            params![id.as_str()],
            row_to_message,
        )
        .optional()
    }

    /// Full history between two identities (either direction), sorted
    /// by creation time ascending.
    pub fn conversation_between(
        &self,
        a: &IdentityId,
        b: &IdentityId,
    ) -> Result<Vec<Message>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE (sender_id = ?1 AND receiver_id = ?2)
                OR (sender_id = ?2 AND receiver_id = ?1)
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let messages = stmt
            .query_map(params![a.as_str(), b.as_str()], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }

    /// Messages waiting for the receiver to come back: delivered flag
    /// still false.
    pub fn undelivered_for(
        &self,
        receiver: &IdentityId,
    ) -> Result<Vec<Message>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE receiver_id = ?1 AND delivered = 0
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let messages = stmt
            .query_map(params![receiver.as_str()], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }

    /// Unread messages from one sender to one receiver.
    pub fn unread_between(
        &self,
        sender: &IdentityId,
        receiver: &IdentityId,
    ) -> Result<Vec<Message>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sender_id = ?1 AND receiver_id = ?2 AND read = 0
             ORDER BY created_at ASC, rowid ASC"
        ))?;
        let messages = stmt
            .query_map(params![sender.as_str(), receiver.as_str()], row_to_message)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(messages)
    }

    /// Conditionally promote the delivered flag. Returns true only for
    /// the writer that actually flipped it; duplicates lose the guard
    /// and see false.
    pub fn promote_delivered(
        &self,
        id: &MessageId,
        delivered_at: u64,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE messages SET delivered = 1, delivered_at = ?2
             WHERE id = ?1 AND delivered = 0",
            params![id.as_str(), delivered_at as i64],
        )?;
        Ok(n > 0)
    }

    /// Conditionally promote the read flag. Also promotes delivered so
    /// `read = 1` always implies `delivered = 1`. Returns true only for
    /// the winning writer.
    pub fn promote_read(&self, id: &MessageId, read_at: u64) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE messages SET
                read = 1,
                read_at = ?2,
                delivered = 1,
                delivered_at = COALESCE(delivered_at, ?2)
             WHERE id = ?1 AND read = 0",
            params![id.as_str(), read_at as i64],
        )?;
        Ok(n > 0)
    }

    /// Unread message count per counterparty, keyed by the sender's
    /// username. Point-in-time snapshot.
    pub fn unread_counts(
        &self,
        receiver: &IdentityId,
    ) -> Result<HashMap<String, i64>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT i.username, COUNT(*) FROM messages m
             JOIN identities i ON i.id = m.sender_id
             WHERE m.receiver_id = ?1 AND m.read = 0
             GROUP BY m.sender_id",
        )?;
        let counts = stmt
            .query_map(params![receiver.as_str()], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(counts)
    }

    // ── Recent contacts ──

    /// Append a counterparty to an identity's recent-contacts set.
    /// No-op when already present. Returns true on a fresh insert.
    pub fn add_recent_contact(
        &self,
        identity_id: &IdentityId,
        contact_id: &IdentityId,
        added_at: u64,
    ) -> Result<bool, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "INSERT OR IGNORE INTO recent_contacts (identity_id, contact_id, added_at)
             VALUES (?1, ?2, ?3)",
            params![identity_id.as_str(), contact_id.as_str(), added_at as i64],
        )?;
        Ok(n > 0)
    }

    /// The membership of the recent-contacts set, in insertion order.
    pub fn recent_contact_ids(
        &self,
        identity_id: &IdentityId,
    ) -> Result<Vec<IdentityId>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT contact_id FROM recent_contacts
             WHERE identity_id = ?1 ORDER BY rowid ASC",
        )?;
        let ids = stmt
            .query_map(params![identity_id.as_str()], |row| {
                Ok(IdentityId::from(row.get::<_, String>(0)?))
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(ids)
    }

    /// Counterparties of every message the identity participates in,
    /// with the latest message per counterparty, ordered by
    /// most-recent-message-time descending. This query-derived recency
    /// ordering is the one ordering rule of the contact-list surface.
    pub fn contact_summaries(
        &self,
        identity_id: &IdentityId,
    ) -> Result<Vec<ContactSummary>, rusqlite::Error> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT partner_id, MAX(created_at) AS last_ts FROM (
                SELECT receiver_id AS partner_id, created_at FROM messages
                 WHERE sender_id = ?1
                UNION ALL
                SELECT sender_id AS partner_id, created_at FROM messages
                 WHERE receiver_id = ?1
             ) GROUP BY partner_id ORDER BY last_ts DESC",
        )?;
        let partners: Vec<(String, i64)> = stmt
            .query_map(params![identity_id.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .filter_map(|r| r.ok())
            .collect();

        let mut summaries = Vec::with_capacity(partners.len());
        for (partner_id, last_ts) in partners {
            let username: Option<String> = conn
                .query_row(
                    "SELECT username FROM identities WHERE id = ?1",
                    params![partner_id],
                    |row| row.get(0),
                )
                .optional()?;
            // An unresolvable partner means a dangling reference; skip it.
            let Some(username) = username else { continue };
            let last_message: String = conn.query_row(
                "SELECT content FROM messages
                 WHERE (sender_id = ?1 AND receiver_id = ?2)
                    OR (sender_id = ?2 AND receiver_id = ?1)
                 ORDER BY created_at DESC, rowid DESC LIMIT 1",
                params![identity_id.as_str(), partner_id],
                |row| row.get(0),
            )?;
            summaries.push(ContactSummary {
                contact_id: IdentityId::from(partner_id),
                contact: username,
                last_message,
                last_timestamp: last_ts as u64,
            });
        }
        Ok(summaries)
    }
}

const MESSAGE_COLUMNS: &str =
    "id, sender_id, receiver_id, content, created_at, delivered, delivered_at, read, read_at";

fn row_to_identity(row: &rusqlite::Row<'_>) -> Result<Identity, rusqlite::Error> {
    Ok(Identity {
        id: IdentityId::from(row.get::<_, String>(0)?),
        username: row.get(1)?,
        online: row.get::<_, i32>(2)? != 0,
        last_seen: row.get::<_, Option<i64>>(3)?.map(|t| t as u64),
    })
}

fn row_to_message(row: &rusqlite::Row<'_>) -> Result<Message, rusqlite::Error> {
    Ok(Message {
        id: MessageId::from(row.get::<_, String>(0)?),
        sender_id: IdentityId::from(row.get::<_, String>(1)?),
        receiver_id: IdentityId::from(row.get::<_, String>(2)?),
        content: row.get(3)?,
        created_at: row.get::<_, i64>(4)? as u64,
        delivered: row.get::<_, i32>(5)? != 0,
        delivered_at: row.get::<_, Option<i64>>(6)?.map(|t| t as u64),
        read: row.get::<_, i32>(7)? != 0,
        read_at: row.get::<_, Option<i64>>(8)?.map(|t| t as u64),
    })
}
