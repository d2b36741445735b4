/*
 * greylist.rs
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

//! Greylisting: defer the first delivery attempt for an unknown
//! (IP, sender, recipient) triplet and admit it on a retry after the initial
//! delay. The in-memory map is authoritative for live decisions; SQLite
//! mirrors it so state survives restarts. Persistence failures are logged
//! and never delay or change a verdict.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::Utc;
use rusqlite::{params, Connection};
use tracing::{debug, warn};

use crate::error::Error;

/// Entries newer than this many seconds are loaded back at startup.
const STARTUP_LOAD_HORIZON: i64 = 7 * 24 * 3600;

#[derive(Debug, Clone)]
struct Entry {
    first_seen: i64,
    last_seen: i64,
    allowed: bool,
    retry_count: u32,
}

struct GreylistState {
    entries: HashMap<String, Entry>,
    conn: Connection,
}

pub struct Greylist {
    initial_delay: i64,
    retry_window: i64,
    auto_whitelist_after: i64,
    inner: Mutex<GreylistState>,
}

impl Greylist {
    /// Open the greylist table at `path` and load the recent window of
    /// entries. Failure to open is fatal to startup.
    pub fn open(
        path: &str,
        initial_delay: u64,
        retry_window: u64,
        auto_whitelist_after: u64,
    ) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| Error::FatalStorage(format!("cannot open greylist db {}: {}", path, e)))?;
        Self::init(conn, initial_delay, retry_window, auto_whitelist_after)
    }

    pub fn open_in_memory(
        initial_delay: u64,
        retry_window: u64,
        auto_whitelist_after: u64,
    ) -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::FatalStorage(format!("cannot open in-memory greylist: {}", e)))?;
        Self::init(conn, initial_delay, retry_window, auto_whitelist_after)
    }

    fn init(
        conn: Connection,
        initial_delay: u64,
        retry_window: u64,
        auto_whitelist_after: u64,
    ) -> Result<Self, Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS greylist (
                key TEXT PRIMARY KEY,
                first_seen INTEGER NOT NULL,
                last_seen INTEGER NOT NULL,
                allowed INTEGER NOT NULL,
                retry_count INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_greylist_last_seen ON greylist (last_seen);",
        )
        .map_err(|e| Error::FatalStorage(format!("cannot create greylist table: {}", e)))?;

        let mut entries = HashMap::new();
        let horizon = Utc::now().timestamp() - STARTUP_LOAD_HORIZON;
        {
            let mut stmt = conn
                .prepare(
                    "SELECT key, first_seen, last_seen, allowed, retry_count
                     FROM greylist WHERE last_seen >= ?1",
                )
                .map_err(|e| Error::FatalStorage(format!("greylist load failed: {}", e)))?;
            let rows = stmt
                .query_map(params![horizon], |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        Entry {
                            first_seen: r.get(1)?,
                            last_seen: r.get(2)?,
                            allowed: r.get(3)?,
                            retry_count: r.get(4)?,
                        },
                    ))
                })
                .map_err(|e| Error::FatalStorage(format!("greylist load failed: {}", e)))?;
            for row in rows {
                let (key, entry) =
                    row.map_err(|e| Error::FatalStorage(format!("greylist load failed: {}", e)))?;
                entries.insert(key, entry);
            }
        }
        debug!(entries = entries.len(), "greylist loaded");

        Ok(Self {
            initial_delay: initial_delay as i64,
            retry_window: retry_window as i64,
            auto_whitelist_after: auto_whitelist_after as i64,
            inner: Mutex::new(GreylistState { entries, conn }),
        })
    }

    fn triplet_key(ip: IpAddr, mail_from: &str, rcpt_to: &str) -> String {
        format!("{}|{}|{}", ip, mail_from, rcpt_to)
    }

    /// Decide whether this triplet may proceed. False defers the transaction
    /// (the session replies 450, conforming senders retry).
    pub fn check_triplet(&self, ip: IpAddr, mail_from: &str, rcpt_to: &str) -> bool {
        self.check_triplet_at(
            Self::triplet_key(ip, mail_from, rcpt_to),
            Utc::now().timestamp(),
        )
    }

    fn check_triplet_at(&self, key: String, now: i64) -> bool {
        let mut state = self.inner.lock().expect("greylist lock");
        let verdict = match state.entries.get_mut(&key) {
            None => {
                let entry = Entry {
                    first_seen: now,
                    last_seen: now,
                    allowed: false,
                    retry_count: 1,
                };
                state.entries.insert(key.clone(), entry);
                false
            }
            Some(entry) => {
                let age = now - entry.first_seen;
                if age >= self.auto_whitelist_after {
                    // Old correspondent: permanently whitelisted.
                    entry.allowed = true;
                }
                if entry.allowed {
                    entry.last_seen = now;
                    true
                } else if age >= self.initial_delay {
                    entry.allowed = true;
                    entry.retry_count += 1;
                    entry.last_seen = now;
                    true
                } else {
                    entry.retry_count += 1;
                    entry.last_seen = now;
                    false
                }
            }
        };
        Self::persist_locked(&mut state, &key);
        verdict
    }

    /// Mirror one entry to SQLite. Best effort: the verdict above already
    /// stands, so errors are only logged.
    fn persist_locked(state: &mut GreylistState, key: &str) {
        let entry = match state.entries.get(key) {
            Some(e) => e.clone(),
            None => return,
        };
        let result = state.conn.execute(
            "INSERT INTO greylist (key, first_seen, last_seen, allowed, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(key) DO UPDATE SET
                 last_seen = excluded.last_seen,
                 allowed = excluded.allowed,
                 retry_count = excluded.retry_count",
            params![
                key,
                entry.first_seen,
                entry.last_seen,
                entry.allowed,
                entry.retry_count
            ],
        );
        if let Err(e) = result {
            warn!(key, error = %e, "greylist persist failed");
        }
    }

    /// Delete entries whose `last_seen` fell behind the retention horizon
    /// (`auto_whitelist_after + retry_window`). Returns how many went.
    pub fn sweep(&self) -> usize {
        let horizon = Utc::now().timestamp() - (self.auto_whitelist_after + self.retry_window);
        let mut state = self.inner.lock().expect("greylist lock");
        let before = state.entries.len();
        state.entries.retain(|_, e| e.last_seen >= horizon);
        let removed = before - state.entries.len();
        if let Err(e) = state
            .conn
            .execute("DELETE FROM greylist WHERE last_seen < ?1", params![horizon])
        {
            warn!(error = %e, "greylist sweep failed to touch disk");
        }
        if removed > 0 {
            debug!(removed, "greylist sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("greylist lock").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELAY: u64 = 300;
    const RETRY: u64 = 4 * 3600;
    const AUTO: u64 = 36 * 24 * 3600;

    fn greylist() -> Greylist {
        Greylist::open_in_memory(DELAY, RETRY, AUTO).expect("in-memory greylist")
    }

    #[test]
    fn first_contact_is_deferred_then_admitted() {
        let g = greylist();
        let t0 = 1_000_000i64;
        // First observation: deferred.
        assert!(!g.check_triplet_at("1.2.3.4|a@x|b@y".to_string(), t0));
        // Retry before the delay: still deferred.
        assert!(!g.check_triplet_at("1.2.3.4|a@x|b@y".to_string(), t0 + 60));
        // Retry after the delay: admitted, and stays admitted.
        assert!(g.check_triplet_at("1.2.3.4|a@x|b@y".to_string(), t0 + DELAY as i64));
        assert!(g.check_triplet_at("1.2.3.4|a@x|b@y".to_string(), t0 + DELAY as i64 + 1));
    }

    #[test]
    fn distinct_triplets_are_independent() {
        let g = greylist();
        let t0 = 1_000_000i64;
        assert!(!g.check_triplet_at("1.2.3.4|a@x|b@y".to_string(), t0));
        assert!(!g.check_triplet_at("1.2.3.4|a@x|c@y".to_string(), t0));
        assert!(!g.check_triplet_at("5.6.7.8|a@x|b@y".to_string(), t0));
        assert_eq!(g.len(), 3);
    }

    #[test]
    fn old_triplet_is_auto_whitelisted() {
        let g = greylist();
        let t0 = 1_000_000i64;
        assert!(!g.check_triplet_at("k".to_string(), t0));
        // Far past the auto-whitelist horizon: allowed even though the entry
        // was never flipped by a timely retry.
        assert!(g.check_triplet_at("k".to_string(), t0 + AUTO as i64 + 5));
    }

    #[test]
    fn sweep_removes_stale_entries() {
        let g = greylist();
        let now = Utc::now().timestamp();
        let stale = now - (AUTO + RETRY) as i64 - 100;
        assert!(!g.check_triplet_at("old".to_string(), stale));
        assert!(!g.check_triplet_at("new".to_string(), now));
        assert_eq!(g.sweep(), 1);
        assert_eq!(g.len(), 1);
    }

    #[test]
    fn state_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("greylist.db");
        let path = path.to_str().unwrap();
        let now = Utc::now().timestamp();
        {
            let g = Greylist::open(path, DELAY, RETRY, AUTO).unwrap();
            assert!(!g.check_triplet_at("persisted".to_string(), now - DELAY as i64));
            assert!(g.check_triplet_at("persisted".to_string(), now));
        }
        let g = Greylist::open(path, DELAY, RETRY, AUTO).unwrap();
        assert_eq!(g.len(), 1);
        // Reloaded as allowed: no new deferral.
        assert!(g.check_triplet_at("persisted".to_string(), now + 1));
    }

    #[test]
    fn check_triplet_builds_stable_keys() {
        let key = Greylist::triplet_key(
            "10.0.0.1".parse().unwrap(),
            "sender@example.com",
            "rcpt@local.test",
        );
        assert_eq!(key, "10.0.0.1|sender@example.com|rcpt@local.test");
    }
}
