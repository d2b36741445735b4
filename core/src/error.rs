/*
 * error.rs
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

//! Error taxonomy for the core. Sessions map each kind to an SMTP reply;
//! nothing session-local ever escapes the session.

use std::fmt;
use std::io;

/// Errors raised by the core components and the session engine.
#[derive(Debug)]
pub enum Error {
    /// Malformed command, bad sequence, invalid address. The session replies
    /// 5xx and continues.
    Protocol(String),
    /// A policy component rejected the transaction (rate limit, DNSBL,
    /// greylist, size, recipient count). The reply code travels with it.
    Policy { code: u16, message: String },
    /// Bad credentials. 535; the session escalates to 421 after repeats.
    Auth(String),
    /// The store or queue refused a valid message. 451; session continues.
    TransientStorage(String),
    /// Storage unusable at startup. The process must not start accepting.
    FatalStorage(String),
    /// Socket read/write or TLS handshake failure. Ends the session.
    Transport(io::Error),
    /// Shutdown was requested; unwinds like a transport error.
    Shutdown,
}

impl Error {
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    pub fn policy(code: u16, msg: impl Into<String>) -> Self {
        Error::Policy {
            code,
            message: msg.into(),
        }
    }

    /// True when the session can keep running after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(
            self,
            Error::Transport(_) | Error::Shutdown | Error::FatalStorage(_)
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Protocol(m) => write!(f, "protocol error: {}", m),
            Error::Policy { code, message } => write!(f, "policy reject ({}): {}", code, message),
            Error::Auth(m) => write!(f, "authentication failure: {}", m),
            Error::TransientStorage(m) => write!(f, "transient storage error: {}", m),
            Error::FatalStorage(m) => write!(f, "fatal storage error: {}", m),
            Error::Transport(e) => write!(f, "transport error: {}", e),
            Error::Shutdown => write!(f, "shutdown requested"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Transport(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Transport(e)
    }
}

/// Operational path: a database error mid-session is transient by default.
/// Startup code wraps open/migrate failures in `FatalStorage` explicitly.
impl From<rusqlite::Error> for Error {
    fn from(e: rusqlite::Error) -> Self {
        Error::TransientStorage(e.to_string())
    }
}
