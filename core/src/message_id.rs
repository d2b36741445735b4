/*
 * message_id.rs
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

//! Identifier generation: queue ids for accepted transactions (echoed in the
//! `250 OK <id>` reply) and RFC 5322 Message-IDs for messages that arrive
//! without one.

use std::time::{SystemTime, UNIX_EPOCH};

const HEX: &[u8] = b"0123456789ABCDEF";

fn hex_upper(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        s.push(HEX[(b >> 4) as usize] as char);
        s.push(HEX[(b & 15) as usize] as char);
    }
    s
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Generate a short queue id: millisecond timestamp plus 4 random bytes,
/// upper-case hex. Unique enough for log correlation and reply text.
pub fn generate_queue_id() -> String {
    let mut entropy = [0u8; 4];
    // Zeroed entropy on getrandom failure still yields a usable (timestamped) id.
    let _ = getrandom::getrandom(&mut entropy);
    format!("{:011X}{}", now_millis(), hex_upper(&entropy))
}

/// Synthesize an RFC 5322 Message-ID, `<timestamp.random@hostname>`, for
/// messages submitted without one.
pub fn generate_message_id(hostname: &str) -> String {
    let mut entropy = [0u8; 8];
    let _ = getrandom::getrandom(&mut entropy);
    format!("<{}.{}@{}>", now_millis(), hex_upper(&entropy), hostname)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_ids_are_distinct() {
        let a = generate_queue_id();
        let b = generate_queue_id();
        assert_ne!(a, b);
        assert!(a.len() >= 11);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn message_id_has_rfc5322_shape() {
        let id = generate_message_id("mail.example.com");
        assert!(id.starts_with('<'));
        assert!(id.ends_with("@mail.example.com>"));
        assert!(id.contains('.'));
    }
}
