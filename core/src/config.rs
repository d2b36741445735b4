/*
 * config.rs
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

//! Server configuration. Plain struct with defaults; loading a config file and
//! argument parsing live in the frontends, not here.

use serde::{Deserialize, Serialize};

/// All recognized options for the SMTP core. `Default` gives a working
/// development setup (port 2525, no TLS, no policy components).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for the frontend's listener.
    pub host: String,
    /// Listen port. 2525 by default so a dev instance needs no privileges.
    pub port: u16,
    /// Hostname announced in the banner and EHLO reply.
    pub hostname: String,

    /// Concurrent session cap; connections beyond it get 421 and close.
    pub max_connections: usize,
    /// Hard cap on message size in bytes (SIZE is advertised with this value).
    pub max_message_size: usize,
    /// Maximum RCPT TO per transaction.
    pub max_recipients: usize,

    pub rate_limit_per_ip: u32,
    pub rate_limit_per_user: u32,
    /// Sliding window length in seconds for both rate limits.
    pub rate_window_seconds: u64,

    pub enable_tls: bool,
    pub tls_cert_path: String,
    pub tls_key_path: String,

    /// Require AUTH before MAIL FROM. True in production; dev setups may disable.
    pub enable_auth: bool,
    /// Consecutive AUTH failures on one connection before 421.
    pub max_auth_failures: u32,

    pub enable_dnsbl: bool,
    /// Blocklist zones, e.g. "zen.spamhaus.org".
    pub dnsbl_zones: Vec<String>,

    pub enable_greylist: bool,
    /// Seconds a new triplet is deferred before a retry is accepted.
    pub greylist_initial_delay: u64,
    /// Seconds past the auto-whitelist horizon before an entry is purgeable.
    pub greylist_retry_window: u64,
    /// Seconds after first_seen at which a triplet is permanently allowed.
    pub greylist_auto_whitelist_after: u64,

    /// Domains for which recipients are stored locally. A recipient whose
    /// exact address matches a user account is local regardless of this list.
    pub local_domains: Vec<String>,
    /// Domains that may be flushed with ETRN.
    pub etrn_allowed: Vec<String>,

    /// SQLite database holding users, messages and the greylist.
    pub db_path: String,
    /// SQLite database holding the delivery queue.
    pub queue_path: String,

    /// Seconds to wait for a command line (RFC 5321 §4.5.3.2: 5 minutes).
    pub command_timeout: u64,
    /// Seconds to wait for the DATA terminator (RFC 5321 §4.5.3.2: 10 minutes).
    pub data_timeout: u64,
    /// Seconds the frontend waits for sessions to drain on shutdown.
    pub shutdown_grace: u64,

    /// Base delay in seconds for queue retry backoff.
    pub queue_base_delay: u64,
    /// Ceiling in seconds for a single retry delay.
    pub queue_max_backoff: u64,
    /// Attempts before a queue entry turns terminal and bounces.
    pub queue_max_attempts: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 2525,
            hostname: "localhost".to_string(),
            max_connections: 100,
            max_message_size: 10 * 1024 * 1024,
            max_recipients: 100,
            rate_limit_per_ip: 100,
            rate_limit_per_user: 200,
            rate_window_seconds: 3600,
            enable_tls: false,
            tls_cert_path: String::new(),
            tls_key_path: String::new(),
            enable_auth: true,
            max_auth_failures: 3,
            enable_dnsbl: false,
            dnsbl_zones: Vec::new(),
            enable_greylist: false,
            greylist_initial_delay: 300,
            greylist_retry_window: 4 * 3600,
            greylist_auto_whitelist_after: 36 * 24 * 3600,
            local_domains: Vec::new(),
            etrn_allowed: Vec::new(),
            db_path: "portalettere.db".to_string(),
            queue_path: "portalettere-queue.db".to_string(),
            command_timeout: 300,
            data_timeout: 600,
            shutdown_grace: 30,
            queue_base_delay: 60,
            queue_max_backoff: 3600,
            queue_max_attempts: 5,
        }
    }
}

impl ServerConfig {
    /// True when `domain` (case-insensitive) is served locally.
    pub fn is_local_domain(&self, domain: &str) -> bool {
        self.local_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
    }

    /// True when `target` may be flushed via ETRN. The caller strips the
    /// `@node` / `#queue` prefix before matching.
    pub fn etrn_allows(&self, target: &str) -> bool {
        self.etrn_allowed
            .iter()
            .any(|d| d.eq_ignore_ascii_case(target))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let c = ServerConfig::default();
        assert_eq!(c.port, 2525);
        assert_eq!(c.max_connections, 100);
        assert_eq!(c.max_message_size, 10 * 1024 * 1024);
        assert_eq!(c.max_recipients, 100);
        assert_eq!(c.rate_limit_per_ip, 100);
        assert_eq!(c.rate_limit_per_user, 200);
        assert_eq!(c.rate_window_seconds, 3600);
        assert_eq!(c.greylist_initial_delay, 300);
        assert_eq!(c.queue_max_attempts, 5);
        assert!(c.enable_auth);
    }

    #[test]
    fn local_domain_match_is_case_insensitive() {
        let c = ServerConfig {
            local_domains: vec!["Example.com".to_string()],
            ..Default::default()
        };
        assert!(c.is_local_domain("example.COM"));
        assert!(!c.is_local_domain("example.org"));
    }
}
