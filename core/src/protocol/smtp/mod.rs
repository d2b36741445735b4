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

//! SMTP server protocol: reply formatting, command grammar, DATA ingestion
//! and the per-connection session state machine.

pub mod command;
pub mod data;
pub mod session;

use std::io;

use tokio::io::{AsyncWrite, AsyncWriteExt};

/// One SMTP reply: a code and one or more text lines. Multi-line replies put
/// `-` after the code on every line but the last (RFC 5321 §4.2.1). CRLF is
/// always emitted, never bare LF.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            lines: vec![text.into()],
        }
    }

    pub fn multi(code: u16, lines: Vec<String>) -> Self {
        debug_assert!(!lines.is_empty());
        Self { code, lines }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.code)
    }

    /// Render the reply exactly as sent on the wire.
    pub fn to_wire(&self) -> String {
        let mut out = String::new();
        let last = self.lines.len().saturating_sub(1);
        for (i, line) in self.lines.iter().enumerate() {
            let sep = if i == last { ' ' } else { '-' };
            out.push_str(&format!("{}{}{}\r\n", self.code, sep, line));
        }
        if self.lines.is_empty() {
            out.push_str(&format!("{} \r\n", self.code));
        }
        out
    }

    pub async fn write_to<S>(&self, stream: &mut S) -> io::Result<()>
    where
        S: AsyncWrite + Unpin,
    {
        stream.write_all(self.to_wire().as_bytes()).await?;
        stream.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_wire_format() {
        let r = Reply::new(250, "OK");
        assert_eq!(r.to_wire(), "250 OK\r\n");
        assert!(r.is_success());
    }

    #[test]
    fn multi_line_uses_dash_continuation() {
        let r = Reply::multi(
            250,
            vec!["mx.test".to_string(), "SIZE 1024".to_string(), "ETRN".to_string()],
        );
        assert_eq!(r.to_wire(), "250-mx.test\r\n250-SIZE 1024\r\n250 ETRN\r\n");
    }

    #[test]
    fn error_codes_are_not_success() {
        assert!(!Reply::new(554, "blocked").is_success());
        assert!(!Reply::new(421, "busy").is_success());
    }

    #[tokio::test]
    async fn writes_crlf_terminated_bytes() {
        let mut buf = Vec::new();
        Reply::new(221, "Bye").write_to(&mut buf).await.unwrap();
        assert_eq!(buf, b"221 Bye\r\n");
    }
}
