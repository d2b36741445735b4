/*
 * message.rs
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

//! Stored message types: flags bitset, search options, message records.

use serde::{Deserialize, Serialize};

/// Message flags as a bitset. Char codes follow the Maildir convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Flags(u8);

impl Flags {
    pub const SEEN: Flags = Flags(1);
    pub const ANSWERED: Flags = Flags(1 << 1);
    pub const FLAGGED: Flags = Flags(1 << 2);
    pub const DELETED: Flags = Flags(1 << 3);
    pub const DRAFT: Flags = Flags(1 << 4);

    pub fn empty() -> Flags {
        Flags(0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Flags {
        Flags(bits & 0x1f)
    }

    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Flags) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Flags) {
        self.0 &= !other.0;
    }

    /// Maildir-style code string, e.g. "FS" for flagged+seen.
    pub fn codes(self) -> String {
        let mut s = String::new();
        if self.contains(Flags::DRAFT) {
            s.push('D');
        }
        if self.contains(Flags::FLAGGED) {
            s.push('F');
        }
        if self.contains(Flags::ANSWERED) {
            s.push('R');
        }
        if self.contains(Flags::SEEN) {
            s.push('S');
        }
        if self.contains(Flags::DELETED) {
            s.push('T');
        }
        s
    }

    pub fn from_codes(codes: &str) -> Flags {
        let mut f = Flags::empty();
        for c in codes.chars() {
            match c {
                'D' => f.insert(Flags::DRAFT),
                'F' => f.insert(Flags::FLAGGED),
                'R' => f.insert(Flags::ANSWERED),
                'S' => f.insert(Flags::SEEN),
                'T' => f.insert(Flags::DELETED),
                _ => {}
            }
        }
        f
    }
}

/// A message as handed to `MessageStore::store`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub owner_email: String,
    pub message_id: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub headers: String,
    pub body: Vec<u8>,
}

/// A message as read back from the store.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub id: i64,
    pub message_id: String,
    pub owner_email: String,
    pub sender: String,
    pub recipients: Vec<String>,
    pub subject: String,
    pub headers: String,
    pub body: Vec<u8>,
    pub size: u64,
    pub received_at: i64,
    pub flags: Flags,
    pub folder: String,
    pub has_attachments: bool,
}

/// Sort order for `search`. Without a full-text index, relevance degrades to
/// newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortBy {
    #[default]
    Relevance,
    DateDesc,
    DateAsc,
}

/// Options for `MessageStore::search`.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub folder: Option<String>,
    pub from_date: Option<i64>,
    pub to_date: Option<i64>,
    pub has_attachments: Option<bool>,
    pub limit: usize,
    pub offset: usize,
    pub sort_by: SortBy,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            folder: None,
            from_date: None,
            to_date: None,
            has_attachments: None,
            limit: 50,
            offset: 0,
            sort_by: SortBy::Relevance,
        }
    }
}

/// Case-insensitive ASCII substring scan over raw bytes.
fn contains_ignore_case(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|w| {
        w.iter()
            .zip(needle.iter())
            .all(|(a, b)| a.eq_ignore_ascii_case(b))
    })
}

/// Attachment heuristic applied once at insert: a disposition of
/// `attachment` in the headers or any MIME part, or a multipart/mixed
/// content type.
pub fn detect_attachments(headers: &str, body: &[u8]) -> bool {
    let h = headers.as_bytes();
    contains_ignore_case(h, b"multipart/mixed")
        || contains_ignore_case(h, b"content-disposition: attachment")
        || contains_ignore_case(body, b"content-disposition: attachment")
}
