/*
 * auth.rs
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

//! Credential store: user records in SQLite, passwords as Argon2id PHC
//! strings. Hashing and verification run outside the store mutex; the mutex
//! covers only row reads and writes.

use std::fmt;
use std::sync::Mutex;

use argon2::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, warn};

use crate::error::Error;

/// Argon2id cost parameters: t=3 passes, m=64 MiB, p=4 lanes.
const ARGON2_T_COST: u32 = 3;
const ARGON2_M_COST_KIB: u32 = 64 * 1024;
const ARGON2_P_COST: u32 = 4;

/// A parseable Argon2id hash that matches no password. Verified for unknown
/// users so lookups and misses take the same code path.
const DUMMY_HASH: &str = "$argon2id$v=19$m=65536,t=3,p=4$AAAAAAAAAAAAAAAAAAAAAA$AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// User record as handed to callers; the password hash never leaves the store.
#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub enabled: bool,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Errors from administrative user operations.
#[derive(Debug)]
pub enum UserError {
    AlreadyExists,
    InvalidInput(String),
    NotFound,
    Storage(String),
}

impl fmt::Display for UserError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserError::AlreadyExists => write!(f, "user or email already exists"),
            UserError::InvalidInput(m) => write!(f, "invalid input: {}", m),
            UserError::NotFound => write!(f, "no such user"),
            UserError::Storage(m) => write!(f, "storage error: {}", m),
        }
    }
}

impl std::error::Error for UserError {}

impl From<rusqlite::Error> for UserError {
    fn from(e: rusqlite::Error) -> Self {
        UserError::Storage(e.to_string())
    }
}

pub struct UserStore {
    conn: Mutex<Connection>,
}

impl UserStore {
    /// Open (or create) the user table at `path`. Failure here is fatal to
    /// startup.
    pub fn open(path: &str) -> Result<Self, Error> {
        let conn = Connection::open(path)
            .map_err(|e| Error::FatalStorage(format!("cannot open user db {}: {}", path, e)))?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, Error> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::FatalStorage(format!("cannot open in-memory user db: {}", e)))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, Error> {
        conn.execute_batch(
            "PRAGMA busy_timeout = 5000;
            CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                username TEXT NOT NULL UNIQUE,
                password_hash TEXT NOT NULL,
                email TEXT NOT NULL UNIQUE,
                enabled INTEGER NOT NULL DEFAULT 1,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );",
        )
        .map_err(|e| Error::FatalStorage(format!("cannot create users table: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn hasher() -> Argon2<'static> {
        // Params::new only fails on out-of-range values; ours are constants.
        let params = Params::new(ARGON2_M_COST_KIB, ARGON2_T_COST, ARGON2_P_COST, None)
            .unwrap_or_default();
        Argon2::new(Algorithm::Argon2id, Version::V0x13, params)
    }

    fn hash_password(password: &str) -> Result<String, UserError> {
        let salt = SaltString::generate(&mut OsRng);
        Self::hasher()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| UserError::Storage(format!("hash failure: {}", e)))
    }

    /// Create a user. The plaintext password is consumed here and never stored.
    pub fn create_user(&self, username: &str, email: &str, password: &str) -> Result<i64, UserError> {
        if username.is_empty() || username.contains(|c: char| c.is_whitespace() || c == '\0') {
            return Err(UserError::InvalidInput("bad username".to_string()));
        }
        if !email.contains('@') || email.contains(|c: char| c.is_whitespace()) {
            return Err(UserError::InvalidInput("bad email".to_string()));
        }
        if password.is_empty() {
            return Err(UserError::InvalidInput("empty password".to_string()));
        }
        let hash = Self::hash_password(password)?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("user store lock");
        let result = conn.execute(
            "INSERT INTO users (username, password_hash, email, enabled, created_at, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?4)",
            params![username, hash, email, now],
        );
        match result {
            Ok(_) => Ok(conn.last_insert_rowid()),
            Err(rusqlite::Error::SqliteFailure(e, _))
                if e.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                Err(UserError::AlreadyExists)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Verify a username/password pair. Unknown user, wrong password and
    /// disabled account all come back as plain `false`; the distinction is
    /// only logged.
    pub fn verify_credentials(&self, username: &str, password: &str) -> bool {
        let row: Option<(String, bool)> = {
            let conn = self.conn.lock().expect("user store lock");
            conn.query_row(
                "SELECT password_hash, enabled FROM users WHERE username = ?1",
                params![username],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!(error = %e, "user lookup failed");
                None
            })
        };
        match row {
            Some((hash, enabled)) => {
                let parsed = match PasswordHash::new(&hash) {
                    Ok(p) => p,
                    Err(e) => {
                        warn!(user = username, error = %e, "stored hash is unparseable");
                        return false;
                    }
                };
                let ok = Self::hasher()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok();
                if !ok {
                    debug!(user = username, "password mismatch");
                    return false;
                }
                if !enabled {
                    debug!(user = username, "login attempt for disabled user");
                    return false;
                }
                true
            }
            None => {
                if let Ok(dummy) = PasswordHash::new(DUMMY_HASH) {
                    let _ = Self::hasher().verify_password(password.as_bytes(), &dummy);
                }
                debug!(user = username, "login attempt for unknown user");
                false
            }
        }
    }

    pub fn change_password(&self, username: &str, new_password: &str) -> Result<(), UserError> {
        if new_password.is_empty() {
            return Err(UserError::InvalidInput("empty password".to_string()));
        }
        let hash = Self::hash_password(new_password)?;
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("user store lock");
        let n = conn.execute(
            "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE username = ?3",
            params![hash, now, username],
        )?;
        if n == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    pub fn set_enabled(&self, username: &str, enabled: bool) -> Result<(), UserError> {
        let now = Utc::now().timestamp();
        let conn = self.conn.lock().expect("user store lock");
        let n = conn.execute(
            "UPDATE users SET enabled = ?1, updated_at = ?2 WHERE username = ?3",
            params![enabled, now, username],
        )?;
        if n == 0 {
            return Err(UserError::NotFound);
        }
        Ok(())
    }

    /// Look up a user by mailbox address. Drives local-recipient routing.
    pub fn user_by_email(&self, email: &str) -> Option<User> {
        let conn = self.conn.lock().expect("user store lock");
        conn.query_row(
            "SELECT id, username, email, enabled, created_at, updated_at
             FROM users WHERE email = ?1",
            params![email],
            |r| {
                Ok(User {
                    id: r.get(0)?,
                    username: r.get(1)?,
                    email: r.get(2)?,
                    enabled: r.get(3)?,
                    created_at: r.get(4)?,
                    updated_at: r.get(5)?,
                })
            },
        )
        .optional()
        .unwrap_or_else(|e| {
            warn!(error = %e, "user lookup by email failed");
            None
        })
    }

    pub fn email_exists(&self, email: &str) -> bool {
        self.user_by_email(email).is_some()
    }

    pub fn user_count(&self) -> u64 {
        let conn = self.conn.lock().expect("user store lock");
        conn.query_row("SELECT COUNT(*) FROM users", [], |r| r.get::<_, i64>(0))
            .map(|n| n as u64)
            .unwrap_or(0)
    }
}
