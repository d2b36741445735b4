/*
 * data.rs
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

//! DATA ingestion (RFC 5321 §4.5.2): chunked line assembly, leading-dot
//! unstuffing, terminator detection and a hard size cap. Bare LF is accepted
//! on input; the assembled message is canonicalized to CRLF line endings.
//! An over-limit message keeps being consumed (the terminator must still be
//! found) but nothing further is buffered.

/// Chunk-feed receiver for the DATA phase.
pub struct DataReader {
    /// Current line, accumulated without its terminator.
    pending: Vec<u8>,
    body: Vec<u8>,
    limit: usize,
    oversized: bool,
    /// The current line alone blew the limit; its remaining bytes are
    /// swallowed unbuffered, and its tail must not look like a terminator.
    long_line: bool,
}

impl DataReader {
    pub fn new(limit: usize) -> Self {
        Self {
            pending: Vec::new(),
            body: Vec::new(),
            limit,
            oversized: false,
            long_line: false,
        }
    }

    /// Feed a chunk. Returns `Some(consumed)` when the terminating
    /// `CRLF.CRLF` was reached after `consumed` bytes of this chunk; bytes
    /// past that belong to the next command (pipelining). Returns `None`
    /// when more input is needed.
    pub fn push(&mut self, chunk: &[u8]) -> Option<usize> {
        for (i, &b) in chunk.iter().enumerate() {
            if b == b'\n' {
                if self.long_line {
                    self.long_line = false;
                } else if self.pending_is_terminator() {
                    self.pending.clear();
                    return Some(i + 1);
                } else {
                    self.commit_line();
                }
            } else if self.long_line {
                // Swallow without buffering.
            } else {
                self.pending.push(b);
                if self.pending.len() > self.limit.saturating_add(2) {
                    self.long_line = true;
                    self.oversized = true;
                    self.body.clear();
                    self.pending.clear();
                }
            }
        }
        None
    }

    /// A line containing only `.` (with or without the CR) ends the message.
    fn pending_is_terminator(&self) -> bool {
        self.pending == b"." || self.pending == b".\r"
    }

    fn commit_line(&mut self) {
        let mut line: &[u8] = &self.pending;
        if line.last() == Some(&b'\r') {
            line = &line[..line.len() - 1];
        }
        // Unstuff: a leading dot that survived to here was doubled by the
        // sender.
        if line.first() == Some(&b'.') {
            line = &line[1..];
        }
        if !self.oversized {
            if self.body.len() + line.len() + 2 > self.limit {
                self.oversized = true;
                self.body.clear();
            } else {
                self.body.extend_from_slice(line);
                self.body.extend_from_slice(b"\r\n");
            }
        }
        self.pending.clear();
    }

    pub fn is_oversized(&self) -> bool {
        self.oversized
    }

    pub fn size(&self) -> usize {
        self.body.len()
    }

    pub fn into_body(self) -> Vec<u8> {
        self.body
    }
}

/// Split a received message into its header block and body at the first
/// empty line. The header block keeps its trailing CRLF; a message without
/// an empty line is all headers.
pub fn split_message(data: &[u8]) -> (String, Vec<u8>) {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        let headers = String::from_utf8_lossy(&data[..pos + 2]).to_string();
        let body = data[pos + 4..].to_vec();
        (headers, body)
    } else {
        (String::from_utf8_lossy(data).to_string(), Vec::new())
    }
}

/// Fetch a header value by name (case-insensitive), unfolding continuation
/// lines.
pub fn header_value(headers: &str, name: &str) -> Option<String> {
    let mut value: Option<String> = None;
    for line in headers.lines() {
        if let Some(v) = &mut value {
            if line.starts_with(' ') || line.starts_with('\t') {
                v.push(' ');
                v.push_str(line.trim());
                continue;
            }
            break;
        }
        if line.len() > name.len()
            && line[..name.len()].eq_ignore_ascii_case(name)
            && line.as_bytes()[name.len()] == b':'
        {
            value = Some(line[name.len() + 1..].trim().to_string());
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed_all(reader: &mut DataReader, input: &[u8]) -> Option<usize> {
        reader.push(input)
    }

    #[test]
    fn simple_message_terminates() {
        let mut r = DataReader::new(1024);
        let consumed = feed_all(&mut r, b"hello\r\nworld\r\n.\r\nleftover");
        assert_eq!(consumed, Some(17));
        assert_eq!(r.into_body(), b"hello\r\nworld\r\n".to_vec());
    }

    #[test]
    fn terminator_split_across_chunks() {
        let mut r = DataReader::new(1024);
        assert_eq!(r.push(b"hi\r"), None);
        assert_eq!(r.push(b"\n."), None);
        assert_eq!(r.push(b"\r\n"), Some(2));
        assert_eq!(r.into_body(), b"hi\r\n".to_vec());
    }

    #[test]
    fn leading_dots_are_unstuffed() {
        let mut r = DataReader::new(1024);
        let consumed = r.push(b"..starts with dot\r\n...two dots\r\n.\r\n");
        assert!(consumed.is_some());
        assert_eq!(r.into_body(), b".starts with dot\r\n..two dots\r\n".to_vec());
    }

    #[test]
    fn bare_lf_is_tolerated_and_canonicalized() {
        let mut r = DataReader::new(1024);
        let consumed = r.push(b"unix line\nanother\n.\n");
        assert!(consumed.is_some());
        assert_eq!(r.into_body(), b"unix line\r\nanother\r\n".to_vec());
    }

    #[test]
    fn empty_message_is_fine() {
        let mut r = DataReader::new(1024);
        assert_eq!(r.push(b".\r\n"), Some(3));
        assert!(r.into_body().is_empty());
    }

    #[test]
    fn dot_in_middle_of_line_untouched() {
        let mut r = DataReader::new(1024);
        r.push(b"a.b.c\r\n.\r\n");
        assert_eq!(r.into_body(), b"a.b.c\r\n".to_vec());
    }

    #[test]
    fn oversized_message_is_discarded_but_fully_consumed() {
        let mut r = DataReader::new(10);
        let consumed = r.push(b"this line is far past ten bytes\r\nmore\r\n.\r\nNEXT");
        assert_eq!(consumed, Some(42));
        assert!(r.is_oversized());
        assert_eq!(r.size(), 0);
    }

    #[test]
    fn endless_line_is_swallowed_without_buffering() {
        let mut r = DataReader::new(16);
        // One line far past the limit, fed in chunks, with a ".\r" tail that
        // must not read as a terminator once truncation kicks in.
        assert_eq!(r.push(&[b'x'; 64]), None);
        assert_eq!(r.push(&[b'x'; 64]), None);
        assert_eq!(r.push(b"tail.\r"), None);
        assert!(r.is_oversized());
        // The real terminator still ends the message.
        let consumed = r.push(b"\n.\r\n");
        assert_eq!(consumed, Some(4));
        assert_eq!(r.size(), 0);
    }

    #[test]
    fn limit_counts_canonical_line_endings() {
        // "ab\r\n" is four bytes; a limit of 4 takes it, 3 does not.
        let mut r = DataReader::new(4);
        r.push(b"ab\n.\n");
        assert!(!r.is_oversized());
        let mut r = DataReader::new(3);
        r.push(b"ab\n.\n");
        assert!(r.is_oversized());
    }

    #[test]
    fn split_message_finds_header_boundary() {
        let (headers, body) = split_message(b"From: a@x\r\nSubject: hi\r\n\r\nbody text\r\n");
        assert_eq!(headers, "From: a@x\r\nSubject: hi\r\n");
        assert_eq!(body, b"body text\r\n".to_vec());
    }

    #[test]
    fn split_message_without_body() {
        let (headers, body) = split_message(b"From: a@x\r\n");
        assert_eq!(headers, "From: a@x\r\n");
        assert!(body.is_empty());
    }

    #[test]
    fn header_lookup_is_case_insensitive_and_unfolds() {
        let headers = "Subject: part one\r\n part two\r\nFrom: x@y\r\n";
        assert_eq!(header_value(headers, "subject").unwrap(), "part one part two");
        assert_eq!(header_value(headers, "FROM").unwrap(), "x@y");
        assert!(header_value(headers, "Message-ID").is_none());
    }
}
