/*
 * mod.rs
 * Copyright (C) 2026 Chris Burdess
 *
 * This file is part of Portalettere, a self-hostable mail server.
 *
 * Portalettere is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * Portalettere is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with Portalettere.  If not, see <http://www.gnu.org/licenses/>.
 */

//! Message store: durable writes into SQLite, indexed for the read paths the
//! downstream protocol servers use (list by folder, retrieve by id, search).
//! Writers serialize on the connection mutex; each insert is one statement
//! and therefore atomic.

mod message;

pub use message::{detect_attachments, Flags, NewMessage, SearchOptions, SortBy, StoredMessage};

use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::error::Error;

const DEFAULT_FOLDER: &str = "INBOX";

/// Recipient list wire format inside one TEXT column. Addresses cannot
/// contain a newline, so the join is unambiguous.
fn join_recipients(recipients: &[String]) -> String {
    recipients.join("\n")
}

fn split_recipients(joined: &str) -> Vec<String> {
    joined.split('\n').map(|s| s.to_string()).collect()
}

/// Escape `%`, `_` and the escape char itself for a LIKE pattern.
fn escape_like(query: &str) -> String {
    let mut out = String::with_capacity(query.len());
    for c in query.chars() {
        if c == '%' || c == '_' || c == '\\' {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    pub fn open(path: &str) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| Error::FatalStorage(format!("cannot open message db {}: {}", path, e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::FatalStorage(format!("cannot open in-memory message db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                message_id TEXT NOT NULL,
                owner_email TEXT NOT NULL,
                sender TEXT NOT NULL,
                recipients TEXT NOT NULL,
                subject TEXT NOT NULL,
                headers TEXT NOT NULL,
                body BLOB NOT NULL,
                size INTEGER NOT NULL,
                received_at INTEGER NOT NULL,
                flags INTEGER NOT NULL DEFAULT 0,
                folder TEXT NOT NULL DEFAULT 'INBOX',
                has_attachments INTEGER NOT NULL DEFAULT 0,
                UNIQUE (owner_email, message_id)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_owner_received
                ON messages (owner_email, received_at);
            CREATE INDEX IF NOT EXISTS idx_messages_owner_folder
                ON messages (owner_email, folder);
            CREATE INDEX IF NOT EXISTS idx_messages_message_id
                ON messages (message_id);",
        )
        .map_err(|e| Error::FatalStorage(format!("cannot create messages table: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Durably write one message for one owner. Returns the row id.
    pub fn store(&self, msg: NewMessage) -> Result<i64, Error> {
        if msg.recipients.is_empty() {
            return Err(Error::protocol("message has no recipients"));
        }
        if msg.message_id.is_empty() {
            return Err(Error::protocol("message has no message id"));
        }
        let size = msg.body.len() as i64;
        let has_attachments = detect_attachments(&msg.headers, &msg.body);
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("message store lock");
        let result = conn.execute(
            "INSERT INTO messages
                (message_id, owner_email, sender, recipients, subject, headers,
                 body, size, received_at, flags, folder, has_attachments)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11)",
            params![
                msg.message_id,
                msg.owner_email,
                msg.sender,
                join_recipients(&msg.recipients),
                msg.subject,
                msg.headers,
                msg.body,
                size,
                now,
                DEFAULT_FOLDER,
                has_attachments,
            ],
        );
        match result {
            Ok(_) => {
                let id = conn.last_insert_rowid();
                debug!(owner = %msg.owner_email, message_id = %msg.message_id, size, "message stored");
                Ok(id)
            }
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(Error::TransientStorage(format!(
                    "duplicate message id {} for {}",
                    msg.message_id, msg.owner_email
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn row_to_message(row: &Row<'_>) -> rusqlite::Result<StoredMessage> {
        let recipients: String = row.get(4)?;
        let flags: u8 = row.get::<_, i64>(10)? as u8;
        Ok(StoredMessage {
            id: row.get(0)?,
            message_id: row.get(1)?,
            owner_email: row.get(2)?,
            sender: row.get(3)?,
            recipients: split_recipients(&recipients),
            subject: row.get(5)?,
            headers: row.get(6)?,
            body: row.get(7)?,
            size: row.get::<_, i64>(8)? as u64,
            received_at: row.get(9)?,
            flags: Flags::from_bits(flags),
            folder: row.get(11)?,
            has_attachments: row.get(12)?,
        })
    }

    const COLUMNS: &'static str = "id, message_id, owner_email, sender, recipients, subject, \
                                   headers, body, size, received_at, flags, folder, has_attachments";

    pub fn retrieve(&self, owner: &str, message_id: &str) -> Result<Option<StoredMessage>, Error> {
        let conn = self.conn.lock().expect("message store lock");
        let sql = format!(
            "SELECT {} FROM messages WHERE owner_email = ?1 AND message_id = ?2",
            Self::COLUMNS
        );
        Ok(conn
            .query_row(&sql, params![owner, message_id], Self::row_to_message)
            .optional()?)
    }

    /// List an owner's messages, newest first.
    pub fn list(
        &self,
        owner: &str,
        folder: Option<&str>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<StoredMessage>, Error> {
        let conn = self.conn.lock().expect("message store lock");
        let folder = folder.unwrap_or(DEFAULT_FOLDER);
        let sql = format!(
            "SELECT {} FROM messages
             WHERE owner_email = ?1 AND folder = ?2
             ORDER BY received_at DESC, id DESC LIMIT ?3 OFFSET ?4",
            Self::COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![owner, folder, limit as i64, offset as i64],
            Self::row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn set_flags(&self, owner: &str, message_id: &str, flags: Flags) -> Result<(), Error> {
        let conn = self.conn.lock().expect("message store lock");
        let n = conn.execute(
            "UPDATE messages SET flags = ?1 WHERE owner_email = ?2 AND message_id = ?3",
            params![flags.bits() as i64, owner, message_id],
        )?;
        if n == 0 {
            return Err(Error::protocol(format!("no such message {}", message_id)));
        }
        Ok(())
    }

    pub fn move_to_folder(&self, owner: &str, message_id: &str, folder: &str) -> Result<(), Error> {
        if folder.is_empty() {
            return Err(Error::protocol("empty folder name"));
        }
        let conn = self.conn.lock().expect("message store lock");
        let n = conn.execute(
            "UPDATE messages SET folder = ?1 WHERE owner_email = ?2 AND message_id = ?3",
            params![folder, owner, message_id],
        )?;
        if n == 0 {
            return Err(Error::protocol(format!("no such message {}", message_id)));
        }
        Ok(())
    }

    pub fn delete(&self, owner: &str, message_id: &str) -> Result<(), Error> {
        let conn = self.conn.lock().expect("message store lock");
        let n = conn.execute(
            "DELETE FROM messages WHERE owner_email = ?1 AND message_id = ?2",
            params![owner, message_id],
        )?;
        if n == 0 {
            return Err(Error::protocol(format!("no such message {}", message_id)));
        }
        Ok(())
    }

    /// Substring search over sender, subject and body. There is no full-text
    /// index, so `SortBy::Relevance` orders newest first.
    pub fn search(
        &self,
        owner: &str,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<StoredMessage>, Error> {
        let pattern = format!("%{}%", escape_like(query));
        let mut sql = format!(
            "SELECT {} FROM messages
             WHERE owner_email = ?1
               AND (sender LIKE ?2 ESCAPE '\\'
                    OR subject LIKE ?2 ESCAPE '\\'
                    OR body LIKE ?2 ESCAPE '\\')",
            Self::COLUMNS
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(owner.to_string()), Box::new(pattern)];
        if let Some(folder) = &opts.folder {
            args.push(Box::new(folder.clone()));
            sql.push_str(&format!(" AND folder = ?{}", args.len()));
        }
        if let Some(from) = opts.from_date {
            args.push(Box::new(from));
            sql.push_str(&format!(" AND received_at >= ?{}", args.len()));
        }
        if let Some(to) = opts.to_date {
            args.push(Box::new(to));
            sql.push_str(&format!(" AND received_at <= ?{}", args.len()));
        }
        if let Some(has) = opts.has_attachments {
            args.push(Box::new(has));
            sql.push_str(&format!(" AND has_attachments = ?{}", args.len()));
        }
        match opts.sort_by {
            SortBy::Relevance | SortBy::DateDesc => {
                sql.push_str(" ORDER BY received_at DESC, id DESC")
            }
            SortBy::DateAsc => sql.push_str(" ORDER BY received_at ASC, id ASC"),
        }
        args.push(Box::new(opts.limit as i64));
        sql.push_str(&format!(" LIMIT ?{}", args.len()));
        args.push(Box::new(opts.offset as i64));
        sql.push_str(&format!(" OFFSET ?{}", args.len()));

        let conn = self.conn.lock().expect("message store lock");
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(
            rusqlite::params_from_iter(args.iter().map(|a| a.as_ref())),
            Self::row_to_message,
        )?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn message_count(&self) -> u64 {
        let conn = self.conn.lock().expect("message store lock");
        conn.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get::<_, i64>(0))
            .map(|n| n as u64)
            .unwrap_or(0)
    }
}
