/*
 * plain.rs
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

//! PLAIN SASL (RFC 4616), server side: parse the NUL-separated payload.

use super::SaslError;

/// Parse PLAIN credentials: `authzid NUL authcid NUL password`.
pub fn parse_plain_credentials(credentials: &[u8]) -> Result<(String, String, String), SaslError> {
    let mut first = None;
    let mut second = None;
    for (i, &b) in credentials.iter().enumerate() {
        if b == 0 {
            if first.is_none() {
                first = Some(i);
            } else if second.is_none() {
                second = Some(i);
            } else {
                return Err(SaslError::plain_invalid());
            }
        }
    }
    let (first, second) = match (first, second) {
        (Some(a), Some(b)) => (a, b),
        _ => return Err(SaslError::plain_invalid()),
    };
    let authzid = std::str::from_utf8(&credentials[..first])
        .map_err(|_| SaslError::plain_invalid())?
        .to_string();
    let authcid = std::str::from_utf8(&credentials[first + 1..second])
        .map_err(|_| SaslError::plain_invalid())?
        .to_string();
    let password = std::str::from_utf8(&credentials[second + 1..])
        .map_err(|_| SaslError::plain_invalid())?
        .to_string();
    if authcid.is_empty() {
        return Err(SaslError::plain_invalid());
    }
    Ok((authzid, authcid, password))
}
