/*
 * queue.rs
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

//! Outbound delivery queue: a persistent FIFO with scheduled retries.
//! Relay workers live outside the core; they claim ready entries with
//! `dequeue_ready` and report the outcome with `mark_delivered`,
//! `mark_failed` or `requeue`. Terminal failures bounce back into the
//! message store.

use std::sync::{Arc, Mutex};

use chrono::Utc;
use rand::Rng;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::Error;
use crate::message_id::generate_message_id;
use crate::store::{MessageStore, NewMessage};

/// Entry lifecycle: pending → processing → {delivered | retry | failed};
/// retry → processing once `next_retry` passes. Delivered and failed are
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Pending,
    Processing,
    Retry,
    Delivered,
    Failed,
}

impl QueueStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Retry => "retry",
            QueueStatus::Delivered => "delivered",
            QueueStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(QueueStatus::Pending),
            "processing" => Some(QueueStatus::Processing),
            "retry" => Some(QueueStatus::Retry),
            "delivered" => Some(QueueStatus::Delivered),
            "failed" => Some(QueueStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub id: i64,
    pub from_addr: String,
    pub to_addr: String,
    pub message_data: Vec<u8>,
    pub status: QueueStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    pub next_retry: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStats {
    pub total: u64,
    pub pending: u64,
    pub processing: u64,
    pub retry: u64,
}

pub struct DeliveryQueue {
    base_delay: i64,
    max_backoff: i64,
    max_attempts: u32,
    hostname: String,
    bounce_store: Option<Arc<MessageStore>>,
    conn: Mutex<Connection>,
}

impl DeliveryQueue {
    pub fn open(
        path: &str,
        base_delay: u64,
        max_backoff: u64,
        max_attempts: u32,
        hostname: &str,
    ) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| Error::FatalStorage(format!("cannot open queue db {}: {}", path, e)))?;
        Self::init(conn, base_delay, max_backoff, max_attempts, hostname)
    }

    pub fn open_in_memory(
        base_delay: u64,
        max_backoff: u64,
        max_attempts: u32,
        hostname: &str,
    ) -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::FatalStorage(format!("cannot open in-memory queue: {}", e)))?;
        Self::init(conn, base_delay, max_backoff, max_attempts, hostname)
    }

    fn init(
        conn: Connection,
        base_delay: u64,
        max_backoff: u64,
        max_attempts: u32,
        hostname: &str,
    ) -> Result<Self, Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                from_addr TEXT NOT NULL,
                to_addr TEXT NOT NULL,
                message_data BLOB NOT NULL,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                next_retry INTEGER NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                error_message TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_queue_status_retry
                ON queue (status, next_retry);",
        )
        .map_err(|e| Error::FatalStorage(format!("cannot create queue table: {}", e)))?;
        Ok(Self {
            base_delay: base_delay as i64,
            max_backoff: max_backoff as i64,
            max_attempts,
            hostname: hostname.to_string(),
            bounce_store: None,
            conn: Mutex::new(conn),
        })
    }

    /// Wire the message store that receives bounce records on terminal
    /// failure.
    pub fn with_bounce_store(mut self, store: Arc<MessageStore>) -> Self {
        self.bounce_store = Some(store);
        self
    }

    /// Append one delivery unit. Ready immediately.
    pub fn enqueue(&self, from: &str, to: &str, message: &[u8]) -> Result<i64, Error> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("queue lock");
        conn.execute(
            "INSERT INTO queue (from_addr, to_addr, message_data, status, attempts,
                                max_attempts, next_retry, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?5, ?5)",
            params![from, to, message, self.max_attempts, now],
        )?;
        let id = conn.last_insert_rowid();
        debug!(id, from, to, size = message.len(), "queued for delivery");
        Ok(id)
    }

    fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<QueueEntry> {
        let status: String = row.get(4)?;
        Ok(QueueEntry {
            id: row.get(0)?,
            from_addr: row.get(1)?,
            to_addr: row.get(2)?,
            message_data: row.get(3)?,
            status: QueueStatus::from_str(&status).unwrap_or(QueueStatus::Pending),
            attempts: row.get::<_, i64>(5)? as u32,
            max_attempts: row.get::<_, i64>(6)? as u32,
            next_retry: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
            error_message: row.get(10)?,
        })
    }

    const COLUMNS: &'static str = "id, from_addr, to_addr, message_data, status, attempts, \
                                   max_attempts, next_retry, created_at, updated_at, error_message";

    /// Claim every entry due at `now`, oldest schedule first. Claimed entries
    /// move to `processing` with `attempts` already counting the new try; the
    /// conditional update keeps an entry from being claimed twice.
    pub fn dequeue_ready(&self, now: i64) -> Result<Vec<QueueEntry>, Error> {
        let conn = self.conn.lock().expect("queue lock");
        let ids: Vec<i64> = {
            let mut stmt = conn.prepare(
                "SELECT id FROM queue
                 WHERE status IN ('pending', 'retry') AND next_retry <= ?1
                 ORDER BY next_retry ASC, id ASC",
            )?;
            let rows = stmt.query_map(params![now], |r| r.get(0))?;
            let mut ids = Vec::new();
            for row in rows {
                ids.push(row?);
            }
            ids
        };

        let mut claimed = Vec::new();
        for id in ids {
            let n = conn.execute(
                "UPDATE queue SET status = 'processing', attempts = attempts + 1, updated_at = ?1
                 WHERE id = ?2 AND status IN ('pending', 'retry')",
                params![now, id],
            )?;
            if n == 1 {
                let sql = format!("SELECT {} FROM queue WHERE id = ?1", Self::COLUMNS);
                let entry = conn.query_row(&sql, params![id], Self::row_to_entry)?;
                claimed.push(entry);
            }
        }
        Ok(claimed)
    }

    pub fn mark_delivered(&self, id: i64) -> Result<(), Error> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("queue lock");
        let n = conn.execute(
            "UPDATE queue SET status = 'delivered', updated_at = ?1, error_message = NULL
             WHERE id = ?2 AND status = 'processing'",
            params![now, id],
        )?;
        if n == 0 {
            return Err(Error::TransientStorage(format!(
                "queue entry {} is not processing",
                id
            )));
        }
        debug!(id, "delivered");
        Ok(())
    }

    /// Exponential backoff with ±10% jitter, capped at `max_backoff`.
    fn backoff_delay(&self, attempts: u32) -> i64 {
        let exp = attempts.saturating_sub(1).min(20);
        let raw = self.base_delay.saturating_mul(1i64 << exp).min(self.max_backoff);
        let jitter: f64 = rand::thread_rng().gen_range(0.9..=1.1);
        (((raw as f64) * jitter) as i64).min(self.max_backoff).max(1)
    }

    /// Record a failed attempt. Schedules a retry, or turns the entry
    /// terminal (and bounces) once the attempt budget is spent.
    pub fn mark_failed(&self, id: i64, error: &str) -> Result<QueueStatus, Error> {
        let now = Utc::now().timestamp();
        let (attempts, from_addr, to_addr) = {
            let conn = self.conn.lock().expect("queue lock");
            let sql = format!("SELECT {} FROM queue WHERE id = ?1", Self::COLUMNS);
            let entry = conn.query_row(&sql, params![id], Self::row_to_entry)?;
            if entry.status != QueueStatus::Processing {
                return Err(Error::TransientStorage(format!(
                    "queue entry {} is not processing",
                    id
                )));
            }
            if entry.attempts >= entry.max_attempts {
                conn.execute(
                    "UPDATE queue SET status = 'failed', updated_at = ?1, error_message = ?2
                     WHERE id = ?3",
                    params![now, error, id],
                )?;
                (entry.attempts, entry.from_addr, entry.to_addr)
            } else {
                let next = now + self.backoff_delay(entry.attempts);
                conn.execute(
                    "UPDATE queue SET status = 'retry', next_retry = ?1, updated_at = ?2,
                                      error_message = ?3
                     WHERE id = ?4",
                    params![next, now, error, id],
                )?;
                debug!(id, attempts = entry.attempts, next_retry = next, "delivery retry scheduled");
                return Ok(QueueStatus::Retry);
            }
        };
        // Terminal: bounce outside the queue lock.
        warn!(id, to = %to_addr, attempts, "delivery failed permanently");
        self.emit_bounce(&from_addr, &to_addr, error, attempts);
        Ok(QueueStatus::Failed)
    }

    /// Explicitly reschedule a processing entry (e.g. remote 4xx with a
    /// Retry-After hint from the relay worker).
    pub fn requeue(&self, id: i64, next_retry: i64, error: &str) -> Result<(), Error> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("queue lock");
        let n = conn.execute(
            "UPDATE queue SET status = 'retry', next_retry = ?1, updated_at = ?2,
                              error_message = ?3
             WHERE id = ?4 AND status = 'processing'",
            params![next_retry, now, error, id],
        )?;
        if n == 0 {
            return Err(Error::TransientStorage(format!(
                "queue entry {} is not processing",
                id
            )));
        }
        Ok(())
    }

    /// Bounce to the originator, from the daemon mailbox. An empty
    /// reverse-path never bounces (that is what it is for).
    fn emit_bounce(&self, from_addr: &str, to_addr: &str, error: &str, attempts: u32) {
        if from_addr.is_empty() {
            return;
        }
        let store = match &self.bounce_store {
            Some(s) => s,
            None => return,
        };
        let daemon = format!("MAILER-DAEMON@{}", self.hostname);
        let subject = "Undelivered Mail Returned to Sender".to_string();
        let body = format!(
            "Your message to <{}> could not be delivered after {} attempts.\r\n\
             Last error: {}\r\n",
            to_addr, attempts, error
        );
        let bounce = NewMessage {
            owner_email: from_addr.to_string(),
            message_id: generate_message_id(&self.hostname),
            sender: daemon.clone(),
            recipients: vec![from_addr.to_string()],
            subject: subject.clone(),
            headers: format!("From: {}\r\nTo: {}\r\nSubject: {}\r\n", daemon, from_addr, subject),
            body: body.into_bytes(),
        };
        if let Err(e) = store.store(bounce) {
            warn!(error = %e, "could not store bounce record");
        }
    }

    /// ETRN: make every pending or scheduled entry for `domain` ready now.
    /// Returns how many entries were released.
    pub fn flush_domain(&self, domain: &str) -> Result<usize, Error> {
        let now = Utc::now().timestamp();
        let pattern = format!("%@{}", domain.to_ascii_lowercase());
        let conn = self.conn.lock().expect("queue lock");
        let n = conn.execute(
            "UPDATE queue SET next_retry = ?1, updated_at = ?1
             WHERE status IN ('pending', 'retry') AND lower(to_addr) LIKE ?2",
            params![now, pattern],
        )?;
        Ok(n)
    }

    pub fn stats(&self) -> Result<QueueStats, Error> {
        let conn = self.conn.lock().expect("queue lock");
        let count = |status: &str| -> Result<u64, rusqlite::Error> {
            conn.query_row(
                "SELECT COUNT(*) FROM queue WHERE status = ?1",
                params![status],
                |r| r.get::<_, i64>(0),
            )
            .map(|n| n as u64)
        };
        let total: u64 = conn
            .query_row("SELECT COUNT(*) FROM queue", [], |r| r.get::<_, i64>(0))
            .map(|n| n as u64)?;
        Ok(QueueStats {
            total,
            pending: count("pending")?,
            processing: count("processing")?,
            retry: count("retry")?,
        })
    }
}
