/*
 * mechanism.rs
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

//! SASL mechanism names and metadata.

/// Mechanisms the server accepts (and advertises in EHLO).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaslMechanism {
    /// PLAIN (RFC 4616) – single NUL-separated payload.
    Plain,
    /// Legacy LOGIN – username and password in separate challenges.
    Login,
}

impl SaslMechanism {
    pub fn name(&self) -> &'static str {
        match self {
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::Login => "LOGIN",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_uppercase().as_str() {
            "PLAIN" => Some(SaslMechanism::Plain),
            "LOGIN" => Some(SaslMechanism::Login),
            _ => None,
        }
    }

    pub fn is_challenge_response(&self) -> bool {
        matches!(self, SaslMechanism::Login)
    }
}

impl std::fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        assert_eq!(SaslMechanism::from_name("plain"), Some(SaslMechanism::Plain));
        assert_eq!(SaslMechanism::from_name(" LOGIN "), Some(SaslMechanism::Login));
        assert_eq!(SaslMechanism::from_name("SCRAM-SHA-256"), None);
        assert_eq!(SaslMechanism::Plain.name(), "PLAIN");
    }

    #[test]
    fn only_login_is_challenge_response() {
        assert!(!SaslMechanism::Plain.is_challenge_response());
        assert!(SaslMechanism::Login.is_challenge_response());
    }
}
