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

//! SASL server helpers for the AUTH command: PLAIN and LOGIN only.
//!
//! The session drives the exchange (334 challenges, 235/535 outcomes); this
//! module owns the payload formats and the base64 framing.

mod mechanism;
mod plain;

pub use mechanism::SaslMechanism;
pub use plain::parse_plain_credentials;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// Base64 of "Username:" / "Password:", the classic LOGIN prompts.
pub const LOGIN_USERNAME_CHALLENGE: &str = "VXNlcm5hbWU6";
pub const LOGIN_PASSWORD_CHALLENGE: &str = "UGFzc3dvcmQ6";

#[derive(Debug)]
pub struct SaslError {
    pub message: String,
}

impl SaslError {
    pub fn invalid(msg: &str) -> Self {
        Self {
            message: msg.to_string(),
        }
    }

    pub fn plain_invalid() -> Self {
        Self::invalid("invalid PLAIN credentials format")
    }
}

impl std::fmt::Display for SaslError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for SaslError {}

/// Decode one base64 line from the client (whitespace trimmed).
pub fn decode_base64(encoded: &str) -> Result<Vec<u8>, SaslError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|_| SaslError::invalid("invalid base64"))
}

pub fn encode_base64(raw: &[u8]) -> String {
    BASE64.encode(raw)
}

/// Decode and parse an `AUTH PLAIN` initial response. The authzid, when
/// present, must name the authenticating user itself; acting on behalf of
/// another identity is not supported.
pub fn decode_plain(encoded: &str) -> Result<(String, String), SaslError> {
    let raw = decode_base64(encoded)?;
    let (authzid, authcid, password) = parse_plain_credentials(&raw)?;
    if !authzid.is_empty() && authzid != authcid {
        return Err(SaslError::invalid("authzid does not match authcid"));
    }
    Ok((authcid, password))
}

/// Decode one LOGIN challenge response (a bare base64 username or password).
pub fn decode_login_response(encoded: &str) -> Result<String, SaslError> {
    let raw = decode_base64(encoded)?;
    String::from_utf8(raw).map_err(|_| SaslError::invalid("LOGIN response not UTF-8"))
}
